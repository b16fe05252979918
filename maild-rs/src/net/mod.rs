//! Shared connection management: socket tuning, per-listener connection
//! caps, and the graceful-shutdown coordinator used by both protocol
//! servers.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Keepalive probe start.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Spacing between keepalive retries.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Apply per-socket options to an accepted connection: TCP_NODELAY and
/// SO_KEEPALIVE with 30s/5s probing.
pub fn tune_socket(socket: &TcpStream) -> std::io::Result<()> {
    socket.set_nodelay(true)?;

    let sock_ref = socket2::SockRef::from(socket);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    sock_ref.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

/// Bounded pool of connection permits for one listener.
#[derive(Clone)]
pub struct ConnectionLimiter {
    permits: Arc<Semaphore>,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Claim a slot for a new connection, or `None` when the listener
    /// is at capacity.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Server-wide shutdown coordinator.
///
/// Cancelling the token stops the accept loops; in-flight sessions get
/// the graceful budget to finish before the process exits and drops
/// their sockets.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting, then wait up to `grace` for in-flight sessions.
    pub async fn drain(&self, grace: Duration) {
        info!("Shutdown requested, draining connections");
        self.token.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "Graceful shutdown budget of {:?} exceeded, abandoning remaining sessions",
                grace
            );
        } else {
            info!("All sessions finished cleanly");
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
