//! SOCKS5 Inbound and Upstream Handshake
//!
//! The local inbound accepts `CONNECT` without authentication and hands the
//! destination to the dispatcher:
//!
//! ```text
//! app ──▶ SOCKS5 (socks-interface:socks-port) ──▶ Router ──▶ outbound ──▶ Internet
//! ```
//!
//! The same wire format is spoken towards `socks` outbounds.

use super::outbound::{Dispatcher, OutboundError};
use crate::tasks::ConnectionTasks;
use crate::engine::EngineError;
use leaf_config::Network;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands
pub(crate) const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NOT_ALLOWED: u8 = 0x02;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Pause after the first failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
/// Longest pause between failing accepts
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Destination requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            TargetAddr::Domain(domain, _) => Some(domain),
            TargetAddr::Ip(_) => None,
        }
    }

    /// `ATYP | ADDR | PORT`, shared by SOCKS5 and trojan requests
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(ADDR_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(ADDR_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(domain, _) => {
                let bytes = domain.as_bytes();
                let len = bytes.len().min(u8::MAX as usize);
                buf.push(ADDR_DOMAIN);
                buf.push(len as u8);
                buf.extend_from_slice(&bytes[..len]);
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
    }

    async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> Result<Self, SocksError> {
        let target = match atyp {
            ADDR_IPV4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
            }
            ADDR_DOMAIN => {
                let len = reader.read_u8().await?;
                let mut domain = vec![0u8; len as usize];
                reader.read_exact(&mut domain).await?;
                let port = reader.read_u16().await?;
                let domain = String::from_utf8(domain).map_err(|_| SocksError::InvalidAddress)?;
                // Clients sometimes send literal IPs as domains.
                match domain.parse::<IpAddr>() {
                    Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
                    Err(_) => TargetAddr::Domain(domain, port),
                }
            }
            ADDR_IPV6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
            }
            _ => return Err(SocksError::InvalidAddress),
        };
        Ok(target)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Server side: negotiate and read the CONNECT request
pub async fn accept_handshake<S>(stream: &mut S) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ===== Greeting =====
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion);
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(SocksError::AuthNotSupported);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

    // ===== Request =====
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion);
    }
    if header[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(header[1]));
    }

    match TargetAddr::read_from(stream, header[3]).await {
        Ok(target) => Ok(target),
        Err(e) => {
            send_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            Err(e)
        }
    }
}

/// Client side: ask an upstream SOCKS5 server to CONNECT to `target`
pub async fn connect_handshake<S>(stream: &mut S, target: &TargetAddr) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion);
    }
    if choice[1] != AUTH_NO_AUTH {
        return Err(SocksError::AuthNotSupported);
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    target.write_to(&mut request);
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion);
    }
    if header[1] != REPLY_SUCCESS {
        return Err(SocksError::Refused(header[1]));
    }
    // Bound address is not used.
    TargetAddr::read_from(stream, header[3]).await?;
    Ok(())
}

/// Send SOCKS5 reply
async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: u8) -> Result<(), SocksError> {
    let response = [
        SOCKS5_VERSION,
        reply,
        0x00, // Reserved
        ADDR_IPV4,
        0, 0, 0, 0, // Bind address (0.0.0.0)
        0, 0,       // Bind port (0)
    ];
    stream.write_all(&response).await?;
    Ok(())
}

fn reply_code(error: &OutboundError) -> u8 {
    match error {
        OutboundError::Rejected => REPLY_NOT_ALLOWED,
        OutboundError::Resolve(_) => REPLY_HOST_UNREACHABLE,
        OutboundError::Dial(_) | OutboundError::Timeout(_) => REPLY_CONNECTION_REFUSED,
        _ => REPLY_GENERAL_FAILURE,
    }
}

/// Delay between failing accepts (e.g. out of descriptors), doubling up to
/// a cap and reset by the next success
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }

    fn fail(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}

/// Counts a connection for as long as its task lives
struct ActiveGuard(Arc<AtomicU64>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Listening SOCKS5 inbound
pub struct SocksInbound {
    listener: TcpListener,
    local_addr: SocketAddr,
    active_connections: Arc<AtomicU64>,
}

impl SocksInbound {
    pub async fn bind(addr: SocketAddr) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EngineError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| EngineError::Bind { addr, source })?;

        info!("SOCKS5 inbound listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            active_connections: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently relayed by this inbound
    pub fn active_connections(&self) -> Arc<AtomicU64> {
        self.active_connections.clone()
    }

    /// Accept until cancelled; each connection uses the dispatcher current
    /// at accept time
    pub async fn run(
        self,
        dispatcher: watch::Receiver<Arc<Dispatcher>>,
        tasks: ConnectionTasks,
        cancel: CancellationToken,
    ) {
        let mut backoff = AcceptBackoff::new();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    let dispatcher = dispatcher.borrow().clone();
                    let guard = ActiveGuard::new(self.active_connections.clone());

                    tasks.spawn(async move {
                        let _guard = guard;
                        debug!("SOCKS5 connection from {}", peer);
                        if let Err(e) = handle_connection(stream, &dispatcher).await {
                            debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    let delay = backoff.fail();
                    warn!("Accept error: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(
            "SOCKS5 inbound on {} closing ({} connection(s) open)",
            self.local_addr,
            self.active_connections.load(Ordering::Relaxed)
        );
    }
}

/// Handle a single SOCKS5 connection
async fn handle_connection(mut stream: TcpStream, dispatcher: &Dispatcher) -> Result<(), SocksError> {
    let target = accept_handshake(&mut stream).await?;
    debug!("SOCKS5 CONNECT to {}", target);

    match dispatcher.dispatch(&target, Network::Tcp).await {
        Ok(mut remote) => {
            send_reply(&mut stream, REPLY_SUCCESS).await?;
            let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
            debug!("{} closed ({} bytes up, {} bytes down)", target, up, down);
            Ok(())
        }
        Err(e) => {
            debug!("Outbound for {} failed: {}", target, e);
            send_reply(&mut stream, reply_code(&e)).await?;
            Err(SocksError::Outbound(e))
        }
    }
}

/// SOCKS errors
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("Invalid SOCKS version")]
    InvalidVersion,

    #[error("Authentication not supported")]
    AuthNotSupported,

    #[error("Unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Upstream refused with reply {0:#04x}")]
    Refused(u8),

    #[error("Outbound failed: {0}")]
    Outbound(OutboundError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaf_config::RuntimeOptions;
    use leaf_net::{DialerConfig, NoopProtector, ProtectedDialer};

    #[tokio::test]
    async fn test_server_and_client_handshake() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let target = TargetAddr::Domain("example.com".into(), 443);

        let expected = target.clone();
        let server_task = tokio::spawn(async move {
            let got = accept_handshake(&mut server).await.unwrap();
            assert_eq!(got, expected);
            send_reply(&mut server, REPLY_SUCCESS).await.unwrap();
        });

        connect_handshake(&mut client, &target).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_sees_refusal() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            accept_handshake(&mut server).await.unwrap();
            send_reply(&mut server, REPLY_CONNECTION_REFUSED).await.unwrap();
        });

        let target = TargetAddr::Ip("10.0.0.1:80".parse().unwrap());
        let result = connect_handshake(&mut client, &target).await;
        assert!(matches!(result, Err(SocksError::Refused(REPLY_CONNECTION_REFUSED))));
    }

    #[tokio::test]
    async fn test_rejects_non_connect() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            // Greeting, then UDP ASSOCIATE
            client.write_all(&[5, 1, 0]).await.unwrap();
            client.write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            let mut reply = [0u8; 12];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[3], REPLY_COMMAND_NOT_SUPPORTED);
        });

        let result = accept_handshake(&mut server).await;
        assert!(matches!(result, Err(SocksError::UnsupportedCommand(3))));
    }

    #[tokio::test]
    async fn test_domain_literal_becomes_ip() {
        let mut encoded = vec![];
        TargetAddr::Domain("127.0.0.1".into(), 8080).write_to(&mut encoded);
        let mut reader = &encoded[1..];
        let target = TargetAddr::read_from(&mut reader, encoded[0]).await.unwrap();
        assert_eq!(target, TargetAddr::Ip("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_target_encoding() {
        let mut buf = vec![];
        TargetAddr::Ip("1.2.3.4:80".parse().unwrap()).write_to(&mut buf);
        assert_eq!(buf, vec![ADDR_IPV4, 1, 2, 3, 4, 0, 80]);

        let mut buf = vec![];
        TargetAddr::Domain("ab".into(), 443).write_to(&mut buf);
        assert_eq!(buf, vec![ADDR_DOMAIN, 2, b'a', b'b', 1, 187]);
    }

    #[test]
    fn test_accept_backoff_doubles_and_resets() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.fail(), ACCEPT_BACKOFF_MIN);
        assert_eq!(backoff.fail(), ACCEPT_BACKOFF_MIN * 2);
        for _ in 0..20 {
            backoff.fail();
        }
        assert_eq!(backoff.fail(), ACCEPT_BACKOFF_MAX);

        backoff.reset();
        assert_eq!(backoff.fail(), ACCEPT_BACKOFF_MIN);
    }

    #[tokio::test]
    async fn test_cancelled_connections_leave_count() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let config = leaf_config::parse("[Proxy]\nDirect = direct\n[Rule]\nFINAL, Direct\n").unwrap();
        let dialer = ProtectedDialer::new(Arc::new(NoopProtector), DialerConfig::default());
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(config), dialer, &RuntimeOptions::default()));
        let (_tx, rx) = watch::channel(dispatcher);

        let inbound = SocksInbound::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = inbound.local_addr();
        let active = inbound.active_connections();
        let tasks = ConnectionTasks::new();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(inbound.run(rx, tasks.clone(), cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        connect_handshake(&mut client, &TargetAddr::Ip(echo_addr)).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(active.load(Ordering::Relaxed), 1);

        // Cutting the generation drops the relay mid-copy.
        tasks.next_generation(true);
        tasks.shutdown(Duration::from_secs(5)).await;
        assert_eq!(active.load(Ordering::Relaxed), 0);

        cancel.cancel();
        server.await.unwrap();
    }
}
