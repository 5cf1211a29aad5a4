//! Listener and relay configuration

use std::fmt;
use std::time::Duration;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 64;

/// Address the listener binds to
///
/// An absent or blank host means "any address".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub host: Option<String>,
    pub port: u16,
}

impl ListenEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            host: (!host.trim().is_empty()).then_some(host),
            port,
        }
    }

    pub fn any(port: u16) -> Self {
        Self { host: None, port }
    }

    /// The host to bind, `None` for the unspecified address
    ///
    /// IPv6 literals may be given with or without brackets.
    pub fn bind_host(&self) -> Option<&str> {
        self.host
            .as_deref()
            .map(|h| h.trim().trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bind_host() {
            Some(host) if host.contains(':') => write!(f, "[{}]:{}", host, self.port),
            Some(host) => write!(f, "{}:{}", host, self.port),
            None => write!(f, "*:{}", self.port),
        }
    }
}

/// Per-session relay behaviour
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deadline for establishing the backend connection
    pub connect_timeout: Option<Duration>,

    /// Abort the relay once neither direction has moved a byte for this long
    pub idle_timeout: Option<Duration>,

    /// Once one direction reaches EOF, how long the other may stay silent
    /// before it is cancelled; every byte it moves restarts the window
    pub half_close_timeout: Duration,

    /// Copy buffer size per direction
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            idle_timeout: None,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsListenerConfig {
    pub endpoint: ListenEndpoint,

    /// Deadline covering ClientHello, certificate resolution and handshake
    pub handshake_timeout: Option<Duration>,

    /// Pause after an accept error that is not a per-connection failure,
    /// resource exhaustion included
    pub accept_error_backoff: Duration,

    /// Unrecognised accept errors in a row before the listening socket is
    /// considered dead; exhaustion errors never count
    pub max_consecutive_accept_errors: u32,

    /// ALPN protocols offered to clients, in preference order
    pub alpn_protocols: Vec<Vec<u8>>,

    pub relay: RelayConfig,
}

impl TlsListenerConfig {
    pub fn new(endpoint: ListenEndpoint) -> Self {
        Self {
            endpoint,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            accept_error_backoff: DEFAULT_ACCEPT_ERROR_BACKOFF,
            max_consecutive_accept_errors: DEFAULT_MAX_CONSECUTIVE_ACCEPT_ERRORS,
            alpn_protocols: Vec::new(),
            relay: RelayConfig::default(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }
}

impl Default for TlsListenerConfig {
    fn default() -> Self {
        Self::new(ListenEndpoint::any(443))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_host_normalization() {
        assert_eq!(ListenEndpoint::new("", 8443).bind_host(), None);
        assert_eq!(ListenEndpoint::new("   ", 8443).bind_host(), None);
        assert_eq!(
            ListenEndpoint::new("127.0.0.1", 8443).bind_host(),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(ListenEndpoint::any(443).to_string(), "*:443");
        assert_eq!(ListenEndpoint::new("127.0.0.1", 443).to_string(), "127.0.0.1:443");
        assert_eq!(ListenEndpoint::new("::1", 443).to_string(), "[::1]:443");
        assert_eq!(ListenEndpoint::new("[::1]", 443).to_string(), "[::1]:443");
    }

    #[test]
    fn test_listener_config_default() {
        let config = TlsListenerConfig::default();
        assert_eq!(config.endpoint.port, 443);
        assert_eq!(config.handshake_timeout, Some(DEFAULT_HANDSHAKE_TIMEOUT));
        assert_eq!(config.relay.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.relay.idle_timeout.is_none());
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_listener_config_builders() {
        let config = TlsListenerConfig::new(ListenEndpoint::new("127.0.0.1", 8443))
            .with_handshake_timeout(None)
            .with_alpn_protocols(["h2", "http/1.1"]);
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
