//! Rule matching
//!
//! Rules are checked in file order and the first match wins. `FINAL`
//! always matches, and validation guarantees it is last. Rule domains are
//! lowercased by the parser.

use super::socks::TargetAddr;
use leaf_config::{Configuration, Network, Rule, RuleKind};
use std::net::IpAddr;

/// Ordered `[Rule]` list of one configuration
pub struct Router {
    rules: Vec<Rule>,
    resolve_domains: bool,
}

impl Router {
    pub fn new(config: &Configuration) -> Self {
        Self {
            rules: config.rules.clone(),
            resolve_domains: config.general.routing_domain_resolve.unwrap_or(false),
        }
    }

    /// Whether routing `target` should wait for resolved addresses
    ///
    /// Only domain targets under `routing-domain-resolve` with at least one
    /// `IP-CIDR` rule need them.
    pub fn needs_resolution(&self, target: &TargetAddr) -> bool {
        self.resolve_domains
            && target.domain().is_some()
            && self
                .rules
                .iter()
                .any(|r| matches!(r.kind, RuleKind::IpCidr(_)))
    }

    /// Name of the outbound or group for `target`
    ///
    /// `resolved` holds addresses of a domain target, when known.
    pub fn route(&self, target: &TargetAddr, network: Network, resolved: &[IpAddr]) -> Option<&str> {
        let domain = target.domain().map(|d| d.trim_end_matches('.').to_ascii_lowercase());

        self.rules
            .iter()
            .find(|rule| matches(rule, target, domain.as_deref(), network, resolved))
            .map(|rule| rule.target.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn matches(
    rule: &Rule,
    target: &TargetAddr,
    domain: Option<&str>,
    network: Network,
    resolved: &[IpAddr],
) -> bool {
    match &rule.kind {
        RuleKind::Domain(d) => domain == Some(d.as_str()),
        RuleKind::DomainSuffix(suffix) => domain.is_some_and(|name| {
            name == suffix
                || (name.len() > suffix.len()
                    && name.ends_with(suffix.as_str())
                    && name.as_bytes()[name.len() - suffix.len() - 1] == b'.')
        }),
        RuleKind::DomainKeyword(keyword) => domain.is_some_and(|name| name.contains(keyword.as_str())),
        RuleKind::IpCidr(cidr) => match target {
            TargetAddr::Ip(addr) => cidr.contains(addr.ip()),
            TargetAddr::Domain(..) => resolved.iter().any(|ip| cidr.contains(*ip)),
        },
        RuleKind::PortRange(range) => range.contains(target.port() as i64),
        RuleKind::Network(n) => *n == network,
        RuleKind::Final => true,
    }
}
