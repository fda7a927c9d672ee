//! Outbound dispatch
//!
//! ```text
//! TargetAddr ──▶ Router ──▶ name ──┬─▶ [Proxy]        direct | reject | socks | trojan
//!                                  └─▶ [Proxy Group]  candidates() ──▶ name ──▶ ...
//! ```
//!
//! One [`Dispatcher`] exists per configuration generation. A reload swaps
//! it; connections already relaying keep the stream they were given.

use super::group::GroupState;
use super::resolver::{DnsError, Resolver};
use super::router::Router;
use super::socks::{self, TargetAddr};
use super::trojan;
use leaf_config::{Configuration, Network, Protocol, ProxyDef, RuntimeOptions};
use leaf_net::{DialError, FragmentStream, ProtectedDialer};
use rustls::ClientConfig;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Byte stream to the destination, whatever the outbound
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream, OutboundError>> + Send + 'a>>;

/// Routes targets and opens outbound connections
pub struct Dispatcher {
    config: Arc<Configuration>,
    router: Router,
    groups: HashMap<String, Arc<GroupState>>,
    resolver: Resolver,
    dialer: ProtectedDialer,
    tls: TlsConnector,
}

impl Dispatcher {
    pub fn new(config: Arc<Configuration>, dialer: ProtectedDialer, options: &RuntimeOptions) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let groups = config
            .groups
            .iter()
            .map(|g| (g.name.clone(), Arc::new(GroupState::new(g))))
            .collect();

        Self {
            router: Router::new(&config),
            resolver: Resolver::new(&config.general.dns_servers, options),
            groups,
            dialer,
            tls: TlsConnector::from(Arc::new(tls_config)),
            config,
        }
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn group(&self, name: &str) -> Option<&Arc<GroupState>> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<GroupState>> {
        self.groups.values()
    }

    /// Route `target` and connect through the selected outbound
    pub async fn dispatch(&self, target: &TargetAddr, network: Network) -> Result<BoxedStream, OutboundError> {
        let mut resolved = Vec::new();
        if let (true, Some(domain)) = (self.router.needs_resolution(target), target.domain()) {
            match self.resolver.resolve(domain).await {
                Ok(addrs) => resolved = addrs,
                // IP rules simply do not match.
                Err(e) => debug!("Routing lookup failed: {}", e),
            }
        }

        let name = self
            .router
            .route(target, network, &resolved)
            .ok_or_else(|| OutboundError::UnknownOutbound(target.to_string()))?;
        debug!("{} -> {}", target, name);
        self.connect_via(name, target).await
    }

    /// Connect through a named proxy or group
    pub fn connect_via<'a>(&'a self, name: &'a str, target: &'a TargetAddr) -> ConnectFuture<'a> {
        Box::pin(async move {
            if let Some(group) = self.groups.get(name) {
                return self.connect_group(group, target).await;
            }
            let proxy = self
                .config
                .proxy(name)
                .ok_or_else(|| OutboundError::UnknownOutbound(name.to_string()))?;
            self.connect_proxy(proxy, target).await
        })
    }

    async fn connect_group(&self, group: &GroupState, target: &TargetAddr) -> Result<BoxedStream, OutboundError> {
        let mut last_error = None;

        for member in group.candidates() {
            let started = Instant::now();
            let attempt = tokio::time::timeout(group.fail_timeout(), self.connect_via(member, target)).await;
            let health = group.health(member);

            match attempt {
                Ok(Ok(stream)) => {
                    if let Some(h) = health {
                        h.record_success(started.elapsed());
                    }
                    debug!("{}: {} via {}", group.name(), target, member);
                    return Ok(stream);
                }
                // A reject member answers for the whole group.
                Ok(Err(OutboundError::Rejected)) => return Err(OutboundError::Rejected),
                Ok(Err(e)) => {
                    debug!("{}: member {} failed: {}", group.name(), member, e);
                    if let Some(h) = health {
                        h.record_failure();
                    }
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!("{}: member {} timed out", group.name(), member);
                    if let Some(h) = health {
                        h.record_failure();
                    }
                    last_error = Some(OutboundError::Timeout(group.fail_timeout()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| OutboundError::UnknownOutbound(group.name().to_string())))
    }

    async fn connect_proxy(&self, proxy: &ProxyDef, target: &TargetAddr) -> Result<BoxedStream, OutboundError> {
        if proxy.websocket() || proxy.amux() {
            return Err(OutboundError::Unsupported(format!(
                "{}: ws/amux transport",
                proxy.name
            )));
        }

        match proxy.protocol {
            Protocol::Direct => Ok(Box::new(self.connect_direct(target).await?)),
            Protocol::Reject => Err(OutboundError::Rejected),
            Protocol::Socks => {
                let mut stream = self.dial_endpoint(proxy).await?;
                socks::connect_handshake(&mut stream, target)
                    .await
                    .map_err(|e| OutboundError::Handshake(e.to_string()))?;
                Ok(Box::new(stream))
            }
            Protocol::Trojan => {
                let password = proxy.password().unwrap_or_default();
                let tcp = self.dial_endpoint(proxy).await?;
                let stream = FragmentStream::with_spec(tcp, proxy.fragment());

                let sni = proxy.sni().unwrap_or_default().to_string();
                let server_name = rustls::pki_types::ServerName::try_from(sni.clone())
                    .map_err(|_| OutboundError::Tls(format!("invalid server name '{}'", sni)))?;
                let mut tls = self
                    .tls
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| OutboundError::Tls(e.to_string()))?;

                trojan::connect(&mut tls, password, target).await?;
                Ok(Box::new(tls))
            }
            Protocol::Shadowsocks | Protocol::Vmess | Protocol::Vless => Err(OutboundError::Unsupported(
                format!("{}: {} outbound", proxy.name, proxy.protocol.as_str()),
            )),
        }
    }

    async fn connect_direct(&self, target: &TargetAddr) -> Result<TcpStream, OutboundError> {
        match target {
            TargetAddr::Ip(addr) => Ok(self.dialer.connect(*addr).await?),
            TargetAddr::Domain(domain, port) => {
                let addrs = self.resolve_addrs(domain, *port).await?;
                Ok(self.dialer.connect_any(&addrs).await?)
            }
        }
    }

    async fn dial_endpoint(&self, proxy: &ProxyDef) -> Result<TcpStream, OutboundError> {
        let endpoint = proxy
            .endpoint
            .as_ref()
            .ok_or_else(|| OutboundError::MissingEndpoint(proxy.name.clone()))?;

        match endpoint.socket_addr() {
            Some(addr) => Ok(self.dialer.connect(addr).await?),
            None => {
                let addrs = self.resolve_addrs(&endpoint.host, endpoint.port).await?;
                Ok(self.dialer.connect_any(&addrs).await?)
            }
        }
    }

    async fn resolve_addrs(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, OutboundError> {
        let ips = self.resolver.resolve(host).await?;
        Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }

    /// Measure connect latency to a member's server
    ///
    /// `None` for members with nothing to probe (groups, `reject`).
    /// `direct` always counts as reachable.
    pub async fn probe_member(&self, name: &str, timeout: Duration) -> Option<Result<Duration, OutboundError>> {
        let proxy = self.config.proxy(name)?;
        match proxy.protocol {
            Protocol::Reject => None,
            Protocol::Direct => Some(Ok(Duration::ZERO)),
            _ => {
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, self.dial_endpoint(proxy)).await {
                    Ok(Ok(_stream)) => Ok(started.elapsed()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(OutboundError::Timeout(timeout)),
                };
                Some(result)
            }
        }
    }

    /// Re-probe every member of a group and record the results
    pub async fn probe_group(&self, group: &GroupState) {
        for member in group.member_names() {
            let Some(result) = self.probe_member(member, group.fail_timeout()).await else {
                continue;
            };
            let Some(health) = group.health(member) else {
                continue;
            };
            match result {
                Ok(latency) => {
                    debug!("{}: {} answered in {:?}", group.name(), member, latency);
                    health.record_success(latency);
                }
                Err(e) => {
                    debug!("{}: probe of {} failed: {}", group.name(), member, e);
                    health.record_failure();
                }
            }
        }
    }
}

/// Outbound errors
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("Rejected by rule")]
    Rejected,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Unknown outbound '{0}'")]
    UnknownOutbound(String),

    #[error("Proxy '{0}' has no server address")]
    MissingEndpoint(String),

    #[error("DNS error: {0}")]
    Resolve(#[from] DnsError),

    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
