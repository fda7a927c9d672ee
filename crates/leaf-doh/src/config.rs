//! DoH runtime configuration

use crate::DohError;
use leaf_config::{DnsDef, DohMethod, FragmentSpec, IntRange};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default local listener
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5123);

/// HTTPS upstream serving `application/dns-message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Dialed address (never resolved through DNS)
    pub addr: SocketAddr,
    /// TLS server name
    pub sni: String,
    /// HTTP `Host`
    pub domain: String,
    pub path: String,
}

/// Configuration of one DoH runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohConfig {
    /// Local UDP listener
    pub listen: SocketAddr,
    pub upstream: Upstream,
    pub method: DohMethod,
    /// TLS fragmentation of the upstream connection
    pub fragment: Option<FragmentSpec>,
    /// Upper bound for one upstream exchange
    pub timeout: Duration,
    pub user_agent: String,
}

impl DohConfig {
    /// Cloudflare upstream with the fragmentation defaults of the Android client
    pub fn cloudflare() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            upstream: Upstream {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(104, 21, 233, 179)), 443),
                sni: "cloudflare-dns.com".to_string(),
                domain: "cloudflare-dns.com".to_string(),
                path: "/dns-query".to_string(),
            },
            method: DohMethod::Post,
            fragment: Some(FragmentSpec {
                packets: IntRange::new(0, 1),
                length: IntRange::new(6, 9),
                interval: IntRange::new(8, 12),
            }),
            timeout: Duration::from_secs(5),
            user_agent: "Leaf Client For Android".to_string(),
        }
    }

    /// Build from a `[Dns]` entry
    pub fn from_dns_def(def: &DnsDef, user_agent: &str) -> Result<Self, DohError> {
        let addr = def
            .endpoint
            .socket_addr()
            .ok_or_else(|| DohError::Config(format!("{}: upstream host must be an IP", def.name)))?;

        Ok(Self {
            listen: def.listen().unwrap_or(DEFAULT_LISTEN),
            upstream: Upstream {
                addr,
                sni: def.sni().to_string(),
                domain: def.domain().to_string(),
                path: def.path().to_string(),
            },
            method: def.method(),
            fragment: def.fragment(),
            timeout: Duration::from_secs(5),
            user_agent: user_agent.to_string(),
        })
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
}
