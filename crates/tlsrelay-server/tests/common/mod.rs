//! Shared helpers for the end-to-end tests: a TLS client that accepts any
//! certificate, throwaway backends, and certificate fixtures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tlsrelay_cert::{generate_self_signed, CertificatePayload, CertificateRecord, ResolverError};
use tlsrelay_server::{ListenEndpoint, TlsListenerConfig};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tlsrelay_server=debug")
        .with_test_writer()
        .try_init();
}

pub fn local_config() -> TlsListenerConfig {
    TlsListenerConfig::new(ListenEndpoint::new("127.0.0.1", 0))
}

/// Accepts whatever the server presents; tests check identity by comparing
/// the leaf certificate themselves
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub fn connector(alpn: &[&str]) -> TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    TlsConnector::from(Arc::new(config))
}

/// Connect with SNI set to `server_name`
pub async fn connect(addr: SocketAddr, server_name: &str) -> std::io::Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let socket = TcpStream::connect(addr).await?;
    connector(&[]).connect(name, socket).await
}

/// Connect addressing the server by IP, which makes the client omit SNI
pub async fn connect_without_sni(addr: SocketAddr) -> std::io::Result<TlsStream<TcpStream>> {
    let name = ServerName::from(addr.ip());
    let socket = TcpStream::connect(addr).await?;
    connector(&[]).connect(name, socket).await
}

pub fn peer_leaf(stream: &TlsStream<TcpStream>) -> Option<CertificateDer<'static>> {
    stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.clone().into_owned())
}

/// Resolver that mints a certificate per name and remembers what it handed
/// out, so tests can check which certificate a client actually saw
#[derive(Clone, Default)]
pub struct RecordingResolver {
    issued: Arc<Mutex<HashMap<String, Vec<CertificateDer<'static>>>>>,
}

impl RecordingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued_for(&self, name: &str) -> Vec<CertificateDer<'static>> {
        self.issued
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.issued.lock().unwrap().values().map(Vec::len).sum()
    }
}

#[async_trait::async_trait]
impl tlsrelay_cert::CertificateResolver for RecordingResolver {
    async fn resolve(&self, server_name: &str) -> Result<CertificatePayload, ResolverError> {
        let subject = if server_name.is_empty() {
            "localhost"
        } else {
            server_name
        };
        let generated = generate_self_signed(&[subject])?;
        self.issued
            .lock()
            .unwrap()
            .entry(server_name.to_string())
            .or_default()
            .push(generated.cert_der.clone());
        Ok(generated.to_payload())
    }
}

pub fn self_signed_record(name: &str) -> (CertificateRecord, CertificateDer<'static>) {
    let generated = generate_self_signed(&[name]).unwrap();
    (generated.to_record(), generated.cert_der.clone())
}

/// Backend that echoes every connection until the client half-closes
pub async fn echo_backend() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    (addr, handle)
}

/// Backend that sends `greeting` and closes without reading anything
pub async fn closing_backend(greeting: &'static [u8]) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(greeting).await;
            drop(socket);
        }
    });

    (addr, handle)
}

/// Write `payload`, half-close, and read everything the server sends back
pub async fn exchange<S>(stream: S, payload: Vec<u8>) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let write = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
        writer
    });

    let mut received = Vec::new();
    reader.read_to_end(&mut received).await.unwrap();
    let _ = write.await.unwrap();
    received
}

/// Poll `condition` until it holds or the test timeout runs out
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
