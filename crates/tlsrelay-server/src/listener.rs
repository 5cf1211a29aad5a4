//! TLS listener and accept loop
//!
//! The listener binds the endpoint, then runs its accept loop as a background
//! task. Each accepted socket gets its own task for the handshake and the
//! session handler, so a slow client or a slow resolver never holds up the
//! loop.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tlsrelay_cert::CertificateResolver;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::TlsListenerConfig;
use crate::error::TlsRelayError;
use crate::handshake;
use crate::session::TlsSession;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type SessionHandler = Arc<dyn Fn(TlsSession) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    Stopped,
}

/// Counters for a listener
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Sockets accepted
    pub connections_accepted: AtomicU64,
    pub handshakes_completed: AtomicU64,
    /// Handshakes that failed, resolver failures included
    pub handshakes_failed: AtomicU64,
    /// Sessions currently inside the handler
    pub sessions_active: AtomicU64,
    pub accept_errors: AtomicU64,
}

/// Running TLS listener
///
/// Dropping the listener stops the accept loop. Sessions already handed to
/// the handler run to completion either way.
pub struct TlsListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    state: watch::Receiver<ListenerState>,
    stats: Arc<ListenerStats>,
    task: Option<JoinHandle<Result<(), TlsRelayError>>>,
}

impl TlsListener {
    /// Bind the endpoint and start accepting
    ///
    /// `resolver` is called once per handshake with the requested server name.
    /// `handler` receives every session whose handshake completed.
    pub async fn bind<R, H, Fut>(
        config: TlsListenerConfig,
        resolver: R,
        handler: H,
    ) -> Result<Self, TlsRelayError>
    where
        R: CertificateResolver + 'static,
        H: Fn(TlsSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = bind_endpoint(&config).await?;
        let local_addr = listener.local_addr().map_err(|e| TlsRelayError::Bind {
            address: config.endpoint.to_string(),
            port: config.endpoint.port,
            reason: e.to_string(),
        })?;

        info!(bind_addr = %local_addr, "TLS listener bound");

        Ok(Self::start(
            listener,
            local_addr,
            config,
            Arc::new(resolver),
            handler,
        ))
    }

    /// Run the accept loop over `source` in a background task
    pub(crate) fn start<A, H, Fut>(
        source: A,
        local_addr: SocketAddr,
        config: TlsListenerConfig,
        resolver: Arc<dyn CertificateResolver>,
        handler: H,
    ) -> Self
    where
        A: AcceptSource,
        H: Fn(TlsSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: SessionHandler =
            Arc::new(move |session: TlsSession| -> HandlerFuture { Box::pin(handler(session)) });
        let shutdown = CancellationToken::new();
        let (state_tx, state) = watch::channel(ListenerState::Listening);
        let stats = Arc::new(ListenerStats::default());

        let accept_loop = AcceptLoop {
            source,
            local_addr,
            config: Arc::new(config),
            resolver,
            handler,
            stats: stats.clone(),
            shutdown: shutdown.clone(),
        };

        let task = tokio::spawn(async move {
            let result = accept_loop.run().await;
            match &result {
                Ok(()) => info!(bind_addr = %local_addr, "TLS listener stopped"),
                Err(e) => error!(bind_addr = %local_addr, error = %e, "TLS listener failed"),
            }
            let _ = state_tx.send(ListenerState::Stopped);
            result
        });

        Self {
            local_addr,
            shutdown,
            state,
            stats,
            task: Some(task),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Ask the accept loop to exit; in-flight sessions are left alone
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the listener has reached [`ListenerState::Stopped`]
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ListenerState::Stopped).await;
    }

    /// Wait for the accept loop to end and return how it ended
    ///
    /// A listening socket failure is reported here. Later calls return `Ok`.
    pub async fn wait(&mut self) -> Result<(), TlsRelayError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TlsRelayError::ListenerFailed(io::Error::other(
                "accept loop panicked",
            ))),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind the configured host, or the IPv6 unspecified address falling back to
/// IPv4 when no host is given
async fn bind_endpoint(config: &TlsListenerConfig) -> Result<TcpListener, TlsRelayError> {
    let port = config.endpoint.port;
    let bind_error = |address: String, e: io::Error| TlsRelayError::Bind {
        address,
        port,
        reason: e.to_string(),
    };

    match config.endpoint.bind_host() {
        Some(host) => TcpListener::bind((host, port))
            .await
            .map_err(|e| bind_error(host.to_string(), e)),
        None => {
            let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
            match TcpListener::bind(v6).await {
                Ok(listener) => Ok(listener),
                Err(e) => {
                    debug!(error = %e, "IPv6 bind failed, falling back to IPv4");
                    let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                    TcpListener::bind(v4)
                        .await
                        .map_err(|e| bind_error(v4.ip().to_string(), e))
                }
            }
        }
    }
}

/// Where the accept loop gets its sockets from
#[async_trait]
pub(crate) trait AcceptSource: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl AcceptSource for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

struct AcceptLoop<A> {
    source: A,
    local_addr: SocketAddr,
    config: Arc<TlsListenerConfig>,
    resolver: Arc<dyn CertificateResolver>,
    handler: SessionHandler,
    stats: Arc<ListenerStats>,
    shutdown: CancellationToken,
}

impl<A: AcceptSource> AcceptLoop<A> {
    async fn run(self) -> Result<(), TlsRelayError> {
        let mut consecutive_errors = 0u32;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = self.source.accept() => accepted,
            };

            let e = match accepted {
                Ok((socket, peer_addr)) => {
                    consecutive_errors = 0;
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.spawn_session(socket, peer_addr);
                    continue;
                }
                Err(e) => e,
            };

            self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
            match classify_accept_error(&e) {
                AcceptErrorClass::Connection => {
                    let err = TlsRelayError::Accept(e);
                    debug!(error = %err, "Connection failed before accept completed");
                    continue;
                }
                AcceptErrorClass::SocketDead => return Err(TlsRelayError::ListenerFailed(e)),
                AcceptErrorClass::Exhausted => {
                    let err = TlsRelayError::Accept(e);
                    warn!(error = %err, "Out of resources while accepting, backing off");
                }
                AcceptErrorClass::Other => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.config.max_consecutive_accept_errors {
                        return Err(TlsRelayError::ListenerFailed(e));
                    }
                    let err = TlsRelayError::Accept(e);
                    warn!(error = %err, consecutive_errors, "Backing off");
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.accept_error_backoff) => {}
            }
        }
    }

    fn spawn_session(&self, socket: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let local_addr = socket.local_addr().unwrap_or(self.local_addr);
        let config = self.config.clone();
        let resolver = self.resolver.clone();
        let handler = self.handler.clone();
        let stats = self.stats.clone();

        tokio::spawn(
            async move {
                handle_connection(socket, peer_addr, local_addr, config, resolver, handler, stats)
                    .await
            }
            .instrument(info_span!("connection", peer = %peer_addr)),
        );
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: Arc<TlsListenerConfig>,
    resolver: Arc<dyn CertificateResolver>,
    handler: SessionHandler,
    stats: Arc<ListenerStats>,
) {
    let accepted = handshake::accept(
        socket,
        resolver.as_ref(),
        &config.alpn_protocols,
        config.handshake_timeout,
    )
    .await;

    let (server_name, stream) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            if handshake::is_client_gone(&e) {
                debug!(peer_addr = %peer_addr, error = %e, "Client left during TLS handshake");
            } else {
                warn!(peer_addr = %peer_addr, error = %e, "TLS handshake failed");
            }
            return;
        }
    };

    stats.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    debug!(server_name = %server_name, "TLS handshake completed");

    let session = TlsSession::new(
        server_name,
        peer_addr,
        local_addr,
        stream,
        config.relay.clone(),
    );

    let _active = ActiveSession::enter(&stats);

    // A panicking handler only takes down its own session
    let outcome = tokio::spawn(handler(session)).await;
    if let Err(e) = outcome {
        if e.is_panic() {
            error!(peer_addr = %peer_addr, "Session handler panicked");
        }
    }
}

/// Keeps `sessions_active` accurate however the handler exits
struct ActiveSession<'a> {
    stats: &'a ListenerStats,
}

impl<'a> ActiveSession<'a> {
    fn enter(stats: &'a ListenerStats) -> Self {
        stats.sessions_active.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptErrorClass {
    /// One connection failed before accept completed; retry at once
    Connection,
    /// Out of descriptors, buffers or memory; wait for them to free up
    Exhausted,
    /// The listening socket itself is unusable
    SocketDead,
    /// Anything else; back off, and give up after too many in a row
    Other,
}

fn classify_accept_error(e: &io::Error) -> AcceptErrorClass {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return AcceptErrorClass::Connection;
    }

    if let Some(class) = e.raw_os_error().and_then(classify_os_error) {
        return class;
    }

    if e.kind() == io::ErrorKind::OutOfMemory {
        return AcceptErrorClass::Exhausted;
    }
    AcceptErrorClass::Other
}

#[cfg(unix)]
fn classify_os_error(code: i32) -> Option<AcceptErrorClass> {
    match code {
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
            Some(AcceptErrorClass::Exhausted)
        }
        libc::EBADF | libc::ENOTSOCK | libc::EINVAL => Some(AcceptErrorClass::SocketDead),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_os_error(_code: i32) -> Option<AcceptErrorClass> {
    None
}
