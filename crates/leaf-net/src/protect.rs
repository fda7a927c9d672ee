//! Socket Protection
//!
//! On Android every socket the proxy opens towards a remote endpoint must
//! be passed to `VpnService.protect()` before it connects, otherwise its
//! traffic is routed back into the TUN device the proxy itself serves.
//!
//! # Contract
//!
//! - Called once per outbound socket, before `connect`
//! - `false` aborts that one connection; the runtime keeps running
//! - Hosts must answer promptly; a call that exceeds [`PROTECT_TIMEOUT`]
//!   counts as a refusal, and the socket closes once the call returns

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// OS handle of a socket passed to the protector
#[cfg(unix)]
pub type SocketHandle = std::os::fd::RawFd;

/// OS handle of a socket passed to the protector
#[cfg(windows)]
pub type SocketHandle = std::os::windows::io::RawSocket;

/// Upper bound for a single protect call
pub const PROTECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host callback excluding a socket from the tunnel
pub trait SocketProtector: Send + Sync + 'static {
    /// Return `true` if the socket was protected (or needs no protection)
    fn protect(&self, socket: SocketHandle) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(SocketHandle) -> bool + Send + Sync + 'static,
{
    fn protect(&self, socket: SocketHandle) -> bool {
        self(socket)
    }
}

/// Protector that accepts every socket
///
/// Used when the host registered nothing, e.g. on desktop hosts where the
/// proxy's own traffic is excluded by routing policy instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: SocketHandle) -> bool {
        true
    }
}

/// Run the protector for `socket` on the blocking pool, bounded by `limit`
///
/// `owner` keeps the descriptor open for as long as the callback runs; it
/// is handed back only when the socket was protected. After a timeout the
/// still-running callback drops it, so the descriptor number cannot be
/// reused by another socket while the host is looking at it.
pub async fn protect_socket<T>(
    protector: &Arc<dyn SocketProtector>,
    socket: SocketHandle,
    owner: T,
    limit: Duration,
) -> Option<T>
where
    T: Send + 'static,
{
    let protector = protector.clone();
    let call = tokio::task::spawn_blocking(move || {
        let protected = protector.protect(socket);
        (protected, owner)
    });

    match tokio::time::timeout(limit, call).await {
        Ok(Ok((protected, owner))) => {
            debug!("Protect socket {:?}: {}", socket, protected);
            protected.then_some(owner)
        }
        Ok(Err(e)) => {
            warn!("Protect callback failed for socket {:?}: {}", socket, e);
            None
        }
        Err(_) => {
            warn!("Protect callback timed out for socket {:?}", socket);
            None
        }
    }
}
