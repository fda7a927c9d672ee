//! TUN descriptor ownership
//!
//! The host keeps its own descriptor. The runtime works on a duplicate
//! (close-on-exec), switched to non-blocking mode and registered with the
//! tokio reactor, and closes only that duplicate when it drops.
//!
//! Both descriptors share one open file description, so the host sees
//! `O_NONBLOCK` while the runtime holds the duplicate. The original mode is
//! put back before the duplicate closes.

use rustix::fs::OFlags;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Packet counters
#[derive(Debug, Default)]
pub struct TunStats {
    pub packets_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl TunStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "RX: {} pkts ({} bytes), TX: {} pkts ({} bytes)",
            self.packets_in.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed),
            self.packets_out.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }
}

/// Duplicate that clears `O_NONBLOCK` again on drop if it set it
#[derive(Debug)]
struct TunFd {
    fd: OwnedFd,
    was_blocking: bool,
}

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for TunFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        if !self.was_blocking {
            return;
        }
        let restored = rustix::fs::fcntl_getfl(&self.fd)
            .and_then(|flags| rustix::fs::fcntl_setfl(&self.fd, flags.difference(OFlags::NONBLOCK)));
        if let Err(e) = restored {
            debug!("Cannot restore blocking mode on TUN descriptor: {}", e);
        }
    }
}

/// Runtime-owned duplicate of the host's TUN descriptor
#[derive(Debug)]
pub struct TunDevice {
    fd: AsyncFd<TunFd>,
    stats: Arc<TunStats>,
}

impl TunDevice {
    /// Duplicate a host descriptor
    pub fn duplicate(fd: BorrowedFd<'_>) -> Result<OwnedFd, TunError> {
        rustix::io::fcntl_dupfd_cloexec(fd, 0).map_err(|e| TunError::Duplicate(e.into()))
    }

    /// Take ownership of an already duplicated descriptor
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_owned(fd: OwnedFd) -> Result<Self, TunError> {
        let flags = rustix::fs::fcntl_getfl(&fd).map_err(|e| TunError::NonBlocking(e.into()))?;
        if !flags.contains(OFlags::RDWR) {
            return Err(TunError::NotReadWrite);
        }
        let was_blocking = !flags.contains(OFlags::NONBLOCK);
        if was_blocking {
            rustix::fs::fcntl_setfl(&fd, flags | OFlags::NONBLOCK)
                .map_err(|e| TunError::NonBlocking(e.into()))?;
        }

        let fd = AsyncFd::new(TunFd { fd, was_blocking }).map_err(TunError::Register)?;
        Ok(Self {
            fd,
            stats: Arc::new(TunStats::default()),
        })
    }

    /// Duplicate and take ownership in one step
    pub fn open(fd: impl AsFd) -> Result<Self, TunError> {
        Self::from_owned(Self::duplicate(fd.as_fd())?)
    }

    /// Descriptor number of the duplicate
    pub fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }

    pub fn stats(&self) -> &TunStats {
        &self.stats
    }

    /// Counters that outlive the device
    pub fn shared_stats(&self) -> Arc<TunStats> {
        self.stats.clone()
    }

    /// Read one packet
    pub async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| rustix::io::read(inner.get_ref(), &mut *buf).map_err(io::Error::from)) {
                Ok(result) => {
                    let n = result?;
                    self.stats.packets_in.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(n);
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one packet
    pub async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| rustix::io::write(inner.get_ref(), packet).map_err(io::Error::from)) {
                Ok(result) => {
                    let n = result?;
                    self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(n);
                }
                Err(_would_block) => continue,
            }
        }
    }
}

/// TUN descriptor errors
#[derive(Debug, thiserror::Error)]
pub enum TunError {
    #[error("cannot duplicate TUN descriptor: {0}")]
    Duplicate(io::Error),

    #[error("TUN descriptor is not open for reading and writing")]
    NotReadWrite,

    #[error("cannot switch TUN descriptor to non-blocking mode: {0}")]
    NonBlocking(io::Error),

    #[error("cannot register TUN descriptor with the reactor: {0}")]
    Register(io::Error),
}
