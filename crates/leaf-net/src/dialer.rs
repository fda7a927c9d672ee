//! Protected TCP Dialer
//!
//! Every outbound TCP connection of the runtime goes through here:
//!
//! ```text
//! socket() ──▶ protect(fd) ──▶ connect() ──▶ TcpStream
//!                  │
//!                  └─ false ──▶ DialError::ProtectRejected (this connection only)
//! ```

use crate::protect::{protect_socket, SocketHandle, SocketProtector, PROTECT_TIMEOUT};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// Dialer configuration
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Connect timeout per address
    pub connect_timeout: Duration,
    /// Allow IPv6 destinations
    pub enable_ipv6: bool,
    /// Try IPv6 addresses first
    pub prefer_ipv6: bool,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            enable_ipv6: true,
            prefer_ipv6: false,
        }
    }
}

/// Dialer statistics
#[derive(Debug, Default)]
struct DialStats {
    connected: AtomicU64,
    rejected: AtomicU64,
}

/// TCP dialer that protects each socket before connecting
#[derive(Clone)]
pub struct ProtectedDialer {
    protector: Arc<dyn SocketProtector>,
    config: DialerConfig,
    stats: Arc<DialStats>,
}

impl ProtectedDialer {
    pub fn new(protector: Arc<dyn SocketProtector>, config: DialerConfig) -> Self {
        Self {
            protector,
            config,
            stats: Arc::new(DialStats::default()),
        }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Same dialer with a different connect timeout
    pub fn with_timeout(&self, connect_timeout: Duration) -> Self {
        Self {
            protector: self.protector.clone(),
            config: DialerConfig {
                connect_timeout,
                ..self.config.clone()
            },
            stats: self.stats.clone(),
        }
    }

    /// Connect to a single address
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        if addr.is_ipv6() && !self.config.enable_ipv6 {
            return Err(DialError::Ipv6Disabled(addr));
        }

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        let handle = raw_handle(&socket);
        let Some(socket) = protect_socket(&self.protector, handle, socket, PROTECT_TIMEOUT).await else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(DialError::ProtectRejected(addr));
        };

        let stream = tokio::time::timeout(self.config.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| DialError::Timeout(addr))??;
        stream.set_nodelay(true)?;

        self.stats.connected.fetch_add(1, Ordering::Relaxed);
        debug!("Dialed {} (socket {:?})", addr, handle);
        Ok(stream)
    }

    /// Try addresses in preference order until one connects
    pub async fn connect_any(&self, addrs: &[SocketAddr]) -> Result<TcpStream, DialError> {
        let ordered = self.order_addrs(addrs);
        let mut last_err = DialError::NoAddress;

        for addr in ordered {
            match self.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Dial {} failed: {}", addr, e);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Filter and order addresses according to the IPv6 settings
    pub fn order_addrs(&self, addrs: &[SocketAddr]) -> Vec<SocketAddr> {
        let mut ordered: Vec<SocketAddr> = addrs
            .iter()
            .copied()
            .filter(|a| self.config.enable_ipv6 || a.is_ipv4())
            .collect();
        if self.config.prefer_ipv6 {
            // Stable sort keeps resolver order within each family.
            ordered.sort_by_key(|a| a.is_ipv4());
        } else {
            ordered.sort_by_key(|a| a.is_ipv6());
        }
        ordered
    }

    /// (connected, rejected by protector)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.connected.load(Ordering::Relaxed),
            self.stats.rejected.load(Ordering::Relaxed),
        )
    }
}

#[cfg(unix)]
fn raw_handle(socket: &TcpSocket) -> SocketHandle {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_handle(socket: &TcpSocket) -> SocketHandle {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket()
}

/// Dial errors (per connection, never fatal to the runtime)
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Socket protection refused for {0}")]
    ProtectRejected(SocketAddr),

    #[error("Connect to {0} timed out")]
    Timeout(SocketAddr),

    #[error("IPv6 disabled, not dialing {0}")]
    Ipv6Disabled(SocketAddr),

    #[error("No address to dial")]
    NoAddress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::NoopProtector;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn dialer_with(protector: Arc<dyn SocketProtector>) -> ProtectedDialer {
        ProtectedDialer::new(protector, DialerConfig::default())
    }

    #[tokio::test]
    async fn test_connect_calls_protector_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let dialer = dialer_with(Arc::new(move |_s: SocketHandle| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        }));

        let stream = dialer.connect(addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dialer.stats(), (1, 0));
    }

    #[tokio::test]
    async fn test_rejected_socket_is_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = dialer_with(Arc::new(|_s: SocketHandle| false));
        let result = dialer.connect(addr).await;

        assert!(matches!(result, Err(DialError::ProtectRejected(a)) if a == addr));
        assert_eq!(dialer.stats(), (0, 1));
    }

    #[tokio::test]
    async fn test_ipv6_disabled() {
        let dialer = ProtectedDialer::new(
            Arc::new(NoopProtector),
            DialerConfig {
                enable_ipv6: false,
                ..Default::default()
            },
        );
        let result = dialer.connect("[::1]:1".parse().unwrap()).await;
        assert!(matches!(result, Err(DialError::Ipv6Disabled(_))));
    }

    #[test]
    fn test_address_ordering() {
        let v4: SocketAddr = "1.1.1.1:443".parse().unwrap();
        let v6: SocketAddr = "[2606:4700::1111]:443".parse().unwrap();

        let default = dialer_with(Arc::new(NoopProtector));
        assert_eq!(default.order_addrs(&[v6, v4]), vec![v4, v6]);

        let prefer = ProtectedDialer::new(
            Arc::new(NoopProtector),
            DialerConfig {
                prefer_ipv6: true,
                ..Default::default()
            },
        );
        assert_eq!(prefer.order_addrs(&[v4, v6]), vec![v6, v4]);

        let disabled = ProtectedDialer::new(
            Arc::new(NoopProtector),
            DialerConfig {
                enable_ipv6: false,
                ..Default::default()
            },
        );
        assert_eq!(disabled.order_addrs(&[v6, v4]), vec![v4]);
    }

    #[tokio::test]
    async fn test_connect_any_falls_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap();

        // Bind then drop to get a port nothing listens on.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let dialer = dialer_with(Arc::new(NoopProtector));
        let stream = dialer.connect_any(&[dead, good]).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), good);

        assert!(matches!(
            dialer.connect_any(&[]).await,
            Err(DialError::NoAddress)
        ));
    }
}
