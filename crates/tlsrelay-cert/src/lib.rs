//! Certificate material for the TLS relay
//!
//! A resolver maps the server name a client asked for (SNI) to certificate
//! material: a PEM certificate chain and a PEM private key. This crate defines
//! that boundary payload, turns it into a rustls server configuration, and
//! ships a few resolvers (static map, directory of files, self-signed).

pub mod directory;
pub mod resolver;
pub mod self_signed;
pub mod store;

pub use directory::DirectoryResolver;
pub use resolver::{CertificateResolver, ResolverError};
pub use self_signed::{generate_self_signed, SelfSignedCertificate, SelfSignedResolver};
pub use store::StaticResolver;

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate payload is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("Invalid certificate payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("No certificates found in PEM data")]
    NoCertificates,

    #[error("No private key found in PEM data")]
    NoPrivateKey,

    #[error("Failed to parse PEM data: {0}")]
    InvalidPem(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate generation failed: {0}")]
    Generation(String),
}

/// Resolver boundary object: `{"cert": "<PEM chain>", "key": "<PEM key>"}`
///
/// Both fields are optional at the serialization level so that a payload
/// missing one of them can still be decoded and rejected with a precise
/// error by [`CertificatePayload::into_record`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl CertificatePayload {
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: Some(cert.into()),
            key: Some(key.into()),
        }
    }

    /// Decode a payload from its JSON form
    pub fn from_json(data: &str) -> Result<Self, CertError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Validate that both fields are present and non-blank
    pub fn into_record(self) -> Result<CertificateRecord, CertError> {
        let certificate_pem = self
            .cert
            .filter(|c| !c.trim().is_empty())
            .ok_or(CertError::MissingField("cert"))?;
        let private_key_pem = self
            .key
            .filter(|k| !k.trim().is_empty())
            .ok_or(CertError::MissingField("key"))?;

        Ok(CertificateRecord {
            certificate_pem,
            private_key_pem,
        })
    }
}

impl From<CertificateRecord> for CertificatePayload {
    fn from(record: CertificateRecord) -> Self {
        Self::new(record.certificate_pem, record.private_key_pem)
    }
}

/// Validated PEM certificate chain and private key for one handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl CertificateRecord {
    pub fn new(certificate_pem: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }

    pub fn parse(&self) -> Result<Certificate, CertError> {
        Certificate::from_pem(&self.certificate_pem, &self.private_key_pem)
    }
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Parse a PEM certificate chain (leaf first) and a PEM private key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::InvalidPem(format!("certificate: {}", e)))?;

        if cert_chain.is_empty() {
            return Err(CertError::NoCertificates);
        }

        let private_key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| CertError::InvalidPem(format!("private key: {}", e)))?
            .ok_or(CertError::NoPrivateKey)?;

        Ok(Self::new(cert_chain, private_key))
    }

    /// The end-entity certificate, if the chain is non-empty
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }

    /// Build a server configuration presenting this certificate
    ///
    /// Uses the ring provider explicitly so the result does not depend on a
    /// process-wide default provider having been installed.
    pub fn into_server_config(self) -> Result<Arc<ServerConfig>, CertError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain, self.private_key)?;

        Ok(Arc::new(config))
    }
}
