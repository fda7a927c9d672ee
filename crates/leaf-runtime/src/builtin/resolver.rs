//! Domain resolution for routing and outbounds
//!
//! Queries the `dns-server` list from `[General]`. Without one, falls back
//! to the system configuration, then to Cloudflare.

use hickory_resolver::config::{LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use leaf_config::RuntimeOptions;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Resolution failed for {domain}: {reason}")]
    ResolutionFailed { domain: String, reason: String },

    #[error("No addresses found for {0}")]
    NoAddresses(String),
}

/// Async resolver shared by every connection of one configuration
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    pub fn new(servers: &[SocketAddr], options: &RuntimeOptions) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.ip_strategy = match (options.enable_ipv6, options.prefer_ipv6) {
            (false, _) => LookupIpStrategy::Ipv4Only,
            (true, true) => LookupIpStrategy::Ipv6thenIpv4,
            (true, false) => LookupIpStrategy::Ipv4thenIpv6,
        };

        let inner = if servers.is_empty() {
            let config = match hickory_resolver::system_conf::read_system_conf() {
                Ok((config, _)) => config,
                Err(e) => {
                    warn!("System DNS configuration unavailable ({}), using Cloudflare", e);
                    ResolverConfig::cloudflare()
                }
            };
            TokioAsyncResolver::tokio(config, opts)
        } else {
            let mut group = NameServerConfigGroup::new();
            for server in servers {
                group.merge(NameServerConfigGroup::from_ips_clear(
                    &[server.ip()],
                    server.port(),
                    true,
                ));
            }
            TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts)
        };

        info!("DNS resolver initialized with {} server(s)", servers.len());
        Self { inner }
    }

    /// Resolve a domain; IP literals return immediately
    pub async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        debug!("DNS lookup for: {}", domain);
        let lookup = self
            .inner
            .lookup_ip(domain)
            .await
            .map_err(|e| DnsError::ResolutionFailed {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(DnsError::NoAddresses(domain.to_string()));
        }
        Ok(addresses)
    }
}
