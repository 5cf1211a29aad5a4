//! Server-side TLS handshake with per-connection certificate resolution
//!
//! The ClientHello is read first with a lazy acceptor, the requested server
//! name is handed to the resolver, and only then is a server configuration
//! built for the certificate it returned.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tlsrelay_cert::CertificateResolver;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

use crate::error::TlsRelayError;

/// Complete a handshake on an accepted socket
///
/// Returns the requested server name (empty when the client sent no SNI) and
/// the established stream. The whole exchange, including the resolver call,
/// is bounded by `timeout`.
pub(crate) async fn accept(
    socket: TcpStream,
    resolver: &dyn CertificateResolver,
    alpn_protocols: &[Vec<u8>],
    timeout: Option<Duration>,
) -> Result<(String, TlsStream<TcpStream>), TlsRelayError> {
    let handshake = handshake(socket, resolver, alpn_protocols);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| TlsRelayError::HandshakeTimeout)?,
        None => handshake.await,
    }
}

async fn handshake(
    socket: TcpStream,
    resolver: &dyn CertificateResolver,
    alpn_protocols: &[Vec<u8>],
) -> Result<(String, TlsStream<TcpStream>), TlsRelayError> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), socket);
    let start = acceptor.await.map_err(TlsRelayError::Handshake)?;

    let server_name = start
        .client_hello()
        .server_name()
        .map(|name| name.to_ascii_lowercase())
        .unwrap_or_default();
    debug!(server_name = %server_name, "Received ClientHello");

    let payload = resolver.resolve(&server_name).await?;
    let mut config = payload.into_record()?.parse()?.into_server_config()?;
    if !alpn_protocols.is_empty() {
        Arc::make_mut(&mut config).alpn_protocols = alpn_protocols.to_vec();
    }

    let stream = start
        .into_stream(config)
        .await
        .map_err(TlsRelayError::Handshake)?;

    Ok((server_name, stream))
}

/// Whether a handshake error is just a client that went away
pub(crate) fn is_client_gone(err: &TlsRelayError) -> bool {
    match err {
        TlsRelayError::Handshake(e) => matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
