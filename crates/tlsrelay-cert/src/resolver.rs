//! The certificate resolver capability
//!
//! The listener calls a resolver exactly once per handshake with the SNI value
//! the client sent (empty when absent). Resolvers are shared across every
//! connection task, so calls overlap freely and arrive in no particular order.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

use crate::{CertError, CertificatePayload};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("No certificate available for server name: {0:?}")]
    NotFound(String),

    #[error("Invalid server name: {0:?}")]
    InvalidName(String),

    #[error("Certificate resolver failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps a requested server name to certificate material
///
/// Implementations must tolerate concurrent, reentrant calls. Any caching is
/// the implementation's business; callers never cache.
#[async_trait]
pub trait CertificateResolver: Send + Sync {
    async fn resolve(&self, server_name: &str) -> Result<CertificatePayload, ResolverError>;
}

/// Async closures taking the server name are resolvers too
///
/// ```ignore
/// let resolver = |name: String| async move {
///     let record = fetch_from_vault(&name).await?;
///     Ok(CertificatePayload::from(record))
/// };
/// ```
#[async_trait]
impl<F, Fut> CertificateResolver for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CertificatePayload, ResolverError>> + Send + 'static,
{
    async fn resolve(&self, server_name: &str) -> Result<CertificatePayload, ResolverError> {
        (self)(server_name.to_string()).await
    }
}
