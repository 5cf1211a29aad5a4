//! An established TLS connection handed to the session handler

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::debug;

use crate::backend::BackendTarget;
use crate::config::RelayConfig;
use crate::error::TlsRelayError;
use crate::proxy_protocol::RemoteEndpoint;
use crate::relay::{relay, RelayStats};

/// Bound on sending close_notify before the raw socket is shut down anyway
const TLS_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One client connection after a successful handshake
///
/// The session owns both the TLS stream and the raw socket beneath it.
/// Dropping it releases both; [`TlsSession::close`] does so gracefully.
pub struct TlsSession {
    server_name: String,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    stream: Option<TlsStream<TcpStream>>,
    relay_config: RelayConfig,
}

impl TlsSession {
    pub(crate) fn new(
        server_name: String,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        stream: TlsStream<TcpStream>,
        relay_config: RelayConfig,
    ) -> Self {
        Self {
            server_name,
            peer_addr,
            local_addr,
            stream: Some(stream),
            relay_config,
        }
    }

    /// Server name the client requested, empty if it sent none
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Negotiated ALPN protocol, if any
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.stream
            .as_ref()
            .and_then(|stream| stream.get_ref().1.alpn_protocol())
    }

    pub fn remote_endpoint(&self) -> RemoteEndpoint {
        RemoteEndpoint::new(self.peer_addr, self.local_addr)
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Direct access to the decrypted stream, `None` once closed
    pub fn get_mut(&mut self) -> Option<&mut TlsStream<TcpStream>> {
        self.stream.as_mut()
    }

    /// Forward the decrypted stream to `target` until both sides are done
    ///
    /// A failed backend connect leaves the session open so the caller can try
    /// another target or answer the client itself. Once the relay has run the
    /// session is closed, whatever the outcome.
    pub async fn relay_to(
        &mut self,
        target: &BackendTarget,
        include_remote_endpoint: bool,
    ) -> Result<RelayStats, TlsRelayError> {
        if self.stream.is_none() {
            return Err(TlsRelayError::SessionClosed);
        }

        let mut backend = target.connect(self.relay_config.connect_timeout).await?;
        let Some(mut stream) = self.stream.take() else {
            return Err(TlsRelayError::SessionClosed);
        };

        let result = async {
            if include_remote_endpoint {
                backend
                    .write_all(&self.remote_endpoint().to_proxy_v2())
                    .await
                    .map_err(TlsRelayError::Relay)?;
            }
            relay(&mut stream, &mut backend, &self.relay_config)
                .await
                .map_err(TlsRelayError::Relay)
        }
        .await;

        dispose(stream).await;
        let _ = backend.shutdown().await;

        match &result {
            Ok(stats) => debug!(
                server_name = %self.server_name,
                backend = %target,
                bytes_to_backend = stats.bytes_to_backend,
                bytes_to_client = stats.bytes_to_client,
                "Session relay finished"
            ),
            Err(e) => debug!(
                server_name = %self.server_name,
                backend = %target,
                error = %e,
                "Session relay failed"
            ),
        }
        result
    }

    /// Close the session, sending close_notify first when possible
    pub async fn close(mut self) {
        if let Some(stream) = self.stream.take() {
            dispose(stream).await;
        }
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("server_name", &self.server_name)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// TLS layer first, then the raw socket; failures are ignored
async fn dispose(mut stream: TlsStream<TcpStream>) {
    let _ = tokio::time::timeout(TLS_CLOSE_TIMEOUT, stream.shutdown()).await;
    let (mut socket, _) = stream.into_inner();
    let _ = socket.shutdown().await;
}
