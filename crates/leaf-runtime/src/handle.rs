//! Handle to one running instance

use crate::tun::TunStats;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct HandleInner {
    tun_fd: RawFd,
    tun_stats: Arc<TunStats>,
    local_addr: Option<SocketAddr>,
    protected: bool,
    generation: AtomicU64,
    active: AtomicBool,
}

/// Returned by a successful start
///
/// Reload updates it in place (the generation increments; TUN and
/// protector stay the same). Stop invalidates it.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    inner: Arc<HandleInner>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        tun_fd: RawFd,
        tun_stats: Arc<TunStats>,
        local_addr: Option<SocketAddr>,
        protected: bool,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                tun_fd,
                tun_stats,
                local_addr,
                protected,
                generation: AtomicU64::new(0),
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Descriptor number of the runtime's TUN duplicate
    pub fn tun_fd(&self) -> RawFd {
        self.inner.tun_fd
    }

    /// Packet counters of the TUN pump
    pub fn tun_stats(&self) -> &TunStats {
        &self.inner.tun_stats
    }

    /// Local SOCKS inbound, if the configuration declares one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Whether a host protector was installed at start
    pub fn is_protected(&self) -> bool {
        self.inner.protected
    }

    /// Configuration generation, 0 at start
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// False once the instance has stopped
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn invalidate(&self) {
        self.inner.active.store(false, Ordering::Release);
    }
}
