//! Self-signed certificate generation for development and testing
//!
//! [`SelfSignedResolver`] mints a certificate for every server name it is
//! asked about, which makes a relay usable without any certificate store.
//! **DO NOT use in production** - clients cannot verify these certificates.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;

use crate::resolver::{CertificateResolver, ResolverError};
use crate::{CertError, CertificatePayload, CertificateRecord};

/// Name used when a client sends no SNI
const FALLBACK_NAME: &str = "localhost";

const VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Generate a self-signed certificate covering `names`
///
/// Each name becomes a subject alternative name (IP literals become IP SANs).
/// The first name is also the common name. Valid for 90 days with a random
/// serial number.
pub fn generate_self_signed(names: &[&str]) -> Result<SelfSignedCertificate, CertError> {
    let names: Vec<String> = if names.is_empty() {
        vec![FALLBACK_NAME.to_string()]
    } else {
        names.iter().map(|n| n.to_string()).collect()
    };

    let mut params = CertificateParams::new(names.clone())
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, names[0].as_str());
    dn.push(DnType::OrganizationName, "TLS Relay Dev");
    params.distinguished_name = dn;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp((now + VALIDITY).as_secs() as i64)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format (binary)
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (text)
    pub pem_key: String,
}

impl SelfSignedCertificate {
    pub fn to_record(&self) -> CertificateRecord {
        CertificateRecord::new(self.pem_cert.clone(), self.pem_key.clone())
    }

    pub fn to_payload(&self) -> CertificatePayload {
        CertificatePayload::new(self.pem_cert.clone(), self.pem_key.clone())
    }

    /// Save certificate and key as `<name>.crt` / `<name>.key` style files
    pub fn save_to_files(&self, cert_path: &str, key_path: &str) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Resolver that generates (and remembers) one certificate per server name
#[derive(Default)]
pub struct SelfSignedResolver {
    cache: Mutex<HashMap<String, CertificateRecord>>,
}

impl SelfSignedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl CertificateResolver for SelfSignedResolver {
    async fn resolve(&self, server_name: &str) -> Result<CertificatePayload, ResolverError> {
        let name = if server_name.is_empty() {
            FALLBACK_NAME.to_string()
        } else {
            server_name.to_ascii_lowercase()
        };

        if let Some(record) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
        {
            return Ok(record.clone().into());
        }

        // Two concurrent first handshakes for a name may both generate; the
        // second insert simply wins.
        let generated = generate_self_signed(&[name.as_str()])?;
        let record = generated.to_record();
        info!(server_name = %name, "Generated self-signed certificate");

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, record.clone());

        Ok(record.into())
    }
}
