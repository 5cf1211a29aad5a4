//! Backend targets and the raw transports that reach them
//!
//! The relay is protocol-agnostic past TLS, so a backend is just a stream
//! socket: TCP (IPv4 or IPv6, picked per resolved address) or a unix domain
//! socket.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::TlsRelayError;

#[derive(Debug, Error)]
#[error("Invalid backend target {input:?}: {reason}")]
pub struct InvalidBackendTarget {
    pub input: String,
    pub reason: &'static str,
}

/// Where decrypted traffic is forwarded
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendTarget {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl BackendTarget {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Open a raw connection to the target
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<BackendStream, TlsRelayError> {
        let connect = self.connect_raw();
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| TlsRelayError::BackendConnectTimeout(self.to_string()))?,
            None => connect.await,
        };

        let stream = result.map_err(|source| TlsRelayError::BackendConnect {
            target: self.to_string(),
            source,
        })?;
        debug!(backend = %self, "Connected to backend");
        Ok(stream)
    }

    async fn connect_raw(&self) -> io::Result<BackendStream> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(BackendStream::Tcp(stream))
            }
            Self::Unix { path } => connect_unix(path).await,
        }
    }
}

#[cfg(unix)]
async fn connect_unix(path: &Path) -> io::Result<BackendStream> {
    Ok(BackendStream::Unix(UnixStream::connect(path).await?))
}

#[cfg(not(unix))]
async fn connect_unix(path: &Path) -> io::Result<BackendStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!(
            "unix socket backends are not supported on this platform: {}",
            path.display()
        ),
    ))
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{}]:{}", host, port),
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for BackendTarget {
    type Err = InvalidBackendTarget;

    /// Accepts `tcp://host:port`, `host:port`, `[v6]:port`, `unix:/path`
    /// and `unix:///path`
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidBackendTarget {
            input: input.to_string(),
            reason,
        };
        let trimmed = input.trim();

        if let Some(rest) = trimmed.strip_prefix("unix:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(invalid("empty socket path"));
            }
            return Ok(Self::unix(path));
        }

        let addr = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        let host = match host.strip_prefix('[') {
            Some(bracketed) => bracketed
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated IPv6 bracket"))?,
            None if host.contains(':') => return Err(invalid("IPv6 hosts must be bracketed")),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self::tcp(host, port))
    }
}

/// Connected backend transport
#[derive(Debug)]
pub enum BackendStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
