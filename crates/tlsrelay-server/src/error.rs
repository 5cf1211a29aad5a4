use std::io;

use thiserror::Error;
use tlsrelay_cert::{CertError, ResolverError};

#[derive(Debug, Error)]
pub enum TlsRelayError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  - Check if another process is using this port: lsof -i :{port}\n  - Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    /// A single accept failed; the listener keeps going
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),

    /// The listening socket itself is unusable; the listener stops
    #[error("Listener failed: {0}")]
    ListenerFailed(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("Certificate resolver failed: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error("Failed to connect to backend {target}: {source}")]
    BackendConnect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to backend {0}")]
    BackendConnectTimeout(String),

    #[error("Relay error: {0}")]
    Relay(#[source] io::Error),

    #[error("Session is already closed")]
    SessionClosed,
}

impl TlsRelayError {
    /// Failures that happen before a session exists: the connection is
    /// dropped and nobody but the log hears about it
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::HandshakeTimeout | Self::Resolver(_) | Self::Certificate(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_failure_classification() {
        assert!(TlsRelayError::HandshakeTimeout.is_handshake_failure());
        assert!(TlsRelayError::Resolver(ResolverError::NotFound("x".into())).is_handshake_failure());
        assert!(TlsRelayError::Certificate(CertError::MissingField("key")).is_handshake_failure());
        assert!(!TlsRelayError::SessionClosed.is_handshake_failure());
        assert!(!TlsRelayError::Relay(io::ErrorKind::BrokenPipe.into()).is_handshake_failure());
    }

    #[test]
    fn test_bind_error_message() {
        let err = TlsRelayError::Bind {
            address: "0.0.0.0".to_string(),
            port: 443,
            reason: "Address in use".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("0.0.0.0"));
        assert!(message.contains("lsof -i :443"));
    }
}
