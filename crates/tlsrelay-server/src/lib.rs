//! SNI-routing TLS terminating relay
//!
//! [`TlsListener`] accepts TCP connections, completes a TLS handshake with a
//! certificate chosen per connection by a [`CertificateResolver`], and hands
//! each established [`TlsSession`] to a caller-supplied handler. The handler
//! typically picks a [`BackendTarget`] from [`TlsSession::server_name`] and
//! calls [`TlsSession::relay_to`], which pumps the decrypted bytes to the
//! backend until both sides are done.
//!
//! ```ignore
//! let resolver = StaticResolver::default().with_default(record);
//! let backend: BackendTarget = "127.0.0.1:8080".parse()?;
//!
//! let mut listener = TlsListener::bind(config, resolver, move |mut session| {
//!     let backend = backend.clone();
//!     async move {
//!         let _ = session.relay_to(&backend, false).await;
//!     }
//! })
//! .await?;
//! listener.wait().await?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
mod handshake;
pub mod listener;
pub mod proxy_protocol;
pub mod relay;
pub mod session;

pub use backend::{BackendStream, BackendTarget, InvalidBackendTarget};
pub use config::{ListenEndpoint, RelayConfig, TlsListenerConfig};
pub use error::TlsRelayError;
pub use listener::{ListenerState, ListenerStats, TlsListener};
pub use proxy_protocol::{parse_proxy_v2, RemoteEndpoint};
pub use relay::{relay, RelayStats};
pub use session::TlsSession;

pub use tlsrelay_cert::{
    CertificatePayload, CertificateRecord, CertificateResolver, ResolverError,
};
