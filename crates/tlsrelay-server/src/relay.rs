//! Full-duplex byte pump between a client stream and a backend stream
//!
//! Both directions run concurrently on the calling task. The pair finishes as
//! a unit: when one direction ends, the other is not left waiting on a peer
//! that may never speak again.
//!
//! - EOF on one side is forwarded as a write shutdown to the other side. The
//!   opposite direction keeps running for as long as it moves bytes, and is
//!   cancelled once it stays silent for `half_close_timeout`. Cancelling it
//!   while a write is stuck on a peer that stopped reading is an error.
//! - An I/O error on either side cancels the other direction at once.
//! - With an idle timeout, the relay is aborted when no byte has moved in
//!   either direction for that long.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::RelayConfig;

/// Progress of one direction
#[derive(Default)]
struct Flow {
    /// Bytes delivered to the writer
    bytes: AtomicU64,
    /// Bytes read but not yet delivered
    in_flight: AtomicU64,
}

impl Flow {
    fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
}

enum Finished {
    ToBackend(io::Result<()>),
    ToClient(io::Result<()>),
    Idle(io::Error),
}

/// Pump bytes in both directions until the pair is done
pub async fn relay<C, B>(
    client: &mut C,
    backend: &mut B,
    config: &RelayConfig,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let to_backend_flow = Flow::default();
    let to_client_flow = Flow::default();

    let to_backend = copy_half(
        &mut client_read,
        &mut backend_write,
        &to_backend_flow,
        config.buffer_size,
    );
    let to_client = copy_half(
        &mut backend_read,
        &mut client_write,
        &to_client_flow,
        config.buffer_size,
    );
    let watchdog = idle_watchdog(&to_backend_flow, &to_client_flow, config.idle_timeout);
    tokio::pin!(to_backend);
    tokio::pin!(to_client);
    tokio::pin!(watchdog);

    let finished = tokio::select! {
        result = &mut to_backend => Finished::ToBackend(result),
        result = &mut to_client => Finished::ToClient(result),
        err = &mut watchdog => Finished::Idle(err),
    };

    let result = match finished {
        Finished::ToBackend(result) => {
            settle(
                "client->backend",
                result,
                to_client.as_mut(),
                &to_client_flow,
                config.half_close_timeout,
            )
            .await
        }
        Finished::ToClient(result) => {
            settle(
                "backend->client",
                result,
                to_backend.as_mut(),
                &to_backend_flow,
                config.half_close_timeout,
            )
            .await
        }
        Finished::Idle(err) => Err(err),
    };

    let stats = RelayStats {
        bytes_to_backend: to_backend_flow.bytes(),
        bytes_to_client: to_client_flow.bytes(),
    };
    debug!(
        bytes_to_backend = stats.bytes_to_backend,
        bytes_to_client = stats.bytes_to_client,
        ok = result.is_ok(),
        "Relay finished"
    );

    result.map(|()| stats)
}

/// Decide the fate of the direction still running after `first` finished
///
/// The survivor runs until it ends or goes `grace` without moving a byte.
async fn settle<F>(
    first_name: &str,
    first: io::Result<()>,
    mut other: Pin<&mut F>,
    other_flow: &Flow,
    grace: Duration,
) -> io::Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    if let Err(e) = first {
        debug!(direction = first_name, error = %e, "Relay direction failed, cancelling the other");
        return Err(e);
    }

    let mut last = other_flow.bytes();
    loop {
        if let Ok(result) = tokio::time::timeout(grace, other.as_mut()).await {
            return result;
        }
        let now = other_flow.bytes();
        if now == last {
            break;
        }
        last = now;
    }

    let stuck = other_flow.in_flight();
    if stuck > 0 {
        debug!(
            direction = first_name,
            stuck_bytes = stuck,
            "Peer stopped reading after half-close, cancelling"
        );
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer stopped reading after half-close",
        ));
    }

    debug!(
        direction = first_name,
        "Peer went silent after half-close, cancelling"
    );
    Ok(())
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    flow: &Flow,
    buffer_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        flow.in_flight.store(n as u64, Ordering::Relaxed);
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        flow.in_flight.store(0, Ordering::Relaxed);
        flow.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    // Forward EOF; the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(())
}

async fn idle_watchdog(a: &Flow, b: &Flow, idle: Option<Duration>) -> io::Error {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };

    let total = || a.bytes() + b.bytes();
    let mut last = total();
    loop {
        tokio::time::sleep(idle).await;
        let now = total();
        if now == last {
            return io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout");
        }
        last = now;
    }
}
