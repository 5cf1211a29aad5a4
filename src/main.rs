//! tlsrelay - terminate TLS and forward decrypted traffic by server name
//!
//! Certificates come from a directory (or are minted on the fly for
//! development); backends are picked from `--route` entries by SNI, falling
//! back to `--backend`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tlsrelay_cert::{CertificateResolver, DirectoryResolver, SelfSignedResolver};
use tlsrelay_server::{
    BackendTarget, ListenEndpoint, RelayConfig, TlsListener, TlsListenerConfig, TlsSession,
};

/// TLS terminating relay with per-name certificates and backends
#[derive(Parser, Debug)]
#[command(name = "tlsrelay")]
#[command(about = "Terminate TLS and relay decrypted traffic to backends chosen by SNI")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(group(ArgGroup::new("certificates").required(true).args(["cert_dir", "self_signed"])))]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "TLSRELAY_PORT", default_value = "443")]
    port: u16,

    /// Address to bind (all interfaces when omitted)
    #[arg(long, env = "TLSRELAY_HOST")]
    host: Option<String>,

    /// Backend for server names without a route (e.g. 127.0.0.1:8080, unix:/run/app.sock)
    #[arg(short, long, env = "TLSRELAY_BACKEND")]
    backend: Option<BackendTarget>,

    /// Route a server name to a backend: NAME=TARGET (repeatable)
    #[arg(long = "route", value_parser = parse_route)]
    routes: Vec<(String, BackendTarget)>,

    /// Directory holding <name>.json or <name>.crt/<name>.key files
    #[arg(long, env = "TLSRELAY_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Certificate name to use when a server name has no files of its own
    #[arg(long, requires = "cert_dir")]
    default_cert: Option<String>,

    /// Generate self-signed certificates on demand (development only)
    #[arg(long)]
    self_signed: bool,

    /// Send a PROXY protocol v2 header to backends
    #[arg(long, env = "TLSRELAY_PROXY_PROTOCOL")]
    proxy_protocol: bool,

    /// ALPN protocols to offer, in preference order (repeatable)
    #[arg(long = "alpn")]
    alpn: Vec<String>,

    /// Handshake deadline in seconds, including certificate lookup (0 disables)
    #[arg(long, default_value = "10")]
    handshake_timeout: u64,

    /// Backend connect deadline in seconds (0 disables)
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Close relays idle for this many seconds (0 disables)
    #[arg(long, default_value = "0")]
    idle_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_route(value: &str) -> Result<(String, BackendTarget), String> {
    let (name, target) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=TARGET, got {:?}", value))?;
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(format!("empty server name in route {:?}", value));
    }
    let target = target.parse::<BackendTarget>().map_err(|e| e.to_string())?;
    Ok((name, target))
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Setup logging; `RUST_LOG` wins over `--verbose`
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Backend selection by server name
#[derive(Debug)]
struct Routes {
    by_name: HashMap<String, BackendTarget>,
    fallback: Option<BackendTarget>,
    proxy_protocol: bool,
}

impl Routes {
    fn select(&self, server_name: &str) -> Option<&BackendTarget> {
        self.by_name.get(server_name).or(self.fallback.as_ref())
    }

    async fn handle(&self, mut session: TlsSession) {
        let Some(target) = self.select(session.server_name()) else {
            warn!(
                server_name = %session.server_name(),
                peer_addr = %session.peer_addr(),
                "No backend for server name"
            );
            session.close().await;
            return;
        };

        match session.relay_to(target, self.proxy_protocol).await {
            Ok(stats) => debug!(
                server_name = %session.server_name(),
                bytes_to_backend = stats.bytes_to_backend,
                bytes_to_client = stats.bytes_to_client,
                "Session finished"
            ),
            Err(e) => {
                warn!(server_name = %session.server_name(), backend = %target, error = %e, "Relay failed");
                session.close().await;
            }
        }
    }
}

async fn serve<R>(config: TlsListenerConfig, resolver: R, routes: Routes) -> Result<()>
where
    R: CertificateResolver + 'static,
{
    let routes = Arc::new(routes);
    let mut listener = TlsListener::bind(config, resolver, move |session| {
        let routes = routes.clone();
        async move { routes.handle(session).await }
    })
    .await
    .context("Failed to start TLS listener")?;

    info!("tlsrelay listening on {}", listener.local_addr());

    let finished = tokio::select! {
        result = listener.wait() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match finished {
        Some(result) => {
            if let Err(e) = &result {
                error!("Listener stopped: {}", e);
            }
            result.context("TLS listener failed")
        }
        None => {
            info!("Received Ctrl+C, shutting down...");
            listener.stop();
            listener.wait().await.context("TLS listener failed")?;
            info!("tlsrelay stopped");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    anyhow::ensure!(
        cli.backend.is_some() || !cli.routes.is_empty(),
        "at least one of --backend or --route is required"
    );

    let endpoint = match cli.host {
        Some(ref host) => ListenEndpoint::new(host.clone(), cli.port),
        None => ListenEndpoint::any(cli.port),
    };
    let config = TlsListenerConfig::new(endpoint)
        .with_handshake_timeout(seconds(cli.handshake_timeout))
        .with_alpn_protocols(cli.alpn.iter().map(String::as_str))
        .with_relay(RelayConfig {
            connect_timeout: seconds(cli.connect_timeout),
            idle_timeout: seconds(cli.idle_timeout),
            ..RelayConfig::default()
        });

    for (name, target) in &cli.routes {
        info!("Route: {} -> {}", name, target);
    }
    if let Some(ref backend) = cli.backend {
        info!("Default backend: {}", backend);
    }
    if cli.proxy_protocol {
        info!("PROXY protocol v2 enabled");
    }

    let routes = Routes {
        by_name: cli.routes.into_iter().collect(),
        fallback: cli.backend,
        proxy_protocol: cli.proxy_protocol,
    };

    match cli.cert_dir {
        Some(dir) => {
            info!("Loading certificates from {}", dir.display());
            let mut resolver = DirectoryResolver::new(dir);
            if let Some(name) = cli.default_cert {
                resolver = resolver.with_default(name);
            }
            serve(config, resolver, routes).await
        }
        None => {
            warn!("⚠️  Using self-signed certificates (development only)");
            serve(config, SelfSignedResolver::new(), routes).await
        }
    }
}
