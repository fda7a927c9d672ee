//! `check` output

use leaf_config::Configuration;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize)]
pub struct ProxySummary {
    pub name: String,
    pub protocol: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub policy: &'static str,
    pub members: Vec<String>,
}

/// What a validated configuration will run
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub socks_inbound: Option<String>,
    pub doh_server: Option<String>,
    pub dns_servers: Vec<String>,
    pub proxies: Vec<ProxySummary>,
    pub groups: Vec<GroupSummary>,
    pub rules: usize,
}

impl ConfigSummary {
    pub fn new(config: &Configuration) -> Self {
        Self {
            socks_inbound: config.general.socks_addr().map(|a| a.to_string()),
            doh_server: config.active_doh().map(|d| d.name.clone()),
            dns_servers: config.general.dns_servers.iter().map(|s| s.to_string()).collect(),
            proxies: config
                .proxies
                .iter()
                .map(|p| ProxySummary {
                    name: p.name.clone(),
                    protocol: p.protocol.as_str(),
                    server: p.endpoint.as_ref().map(|e| format!("{}:{}", e.host, e.port)),
                })
                .collect(),
            groups: config
                .groups
                .iter()
                .map(|g| GroupSummary {
                    name: g.name.clone(),
                    policy: g.policy.as_str(),
                    members: g.members.clone(),
                })
                .collect(),
            rules: config.rules.len(),
        }
    }
}

impl fmt::Display for ConfigSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration OK")?;
        writeln!(
            f,
            "  SOCKS inbound: {}",
            self.socks_inbound.as_deref().unwrap_or("disabled")
        )?;
        writeln!(f, "  DoH: {}", self.doh_server.as_deref().unwrap_or("disabled"))?;
        writeln!(f, "  Proxies ({}):", self.proxies.len())?;
        for proxy in &self.proxies {
            match proxy.server {
                Some(ref server) => writeln!(f, "    {} ({}, {})", proxy.name, proxy.protocol, server)?,
                None => writeln!(f, "    {} ({})", proxy.name, proxy.protocol)?,
            }
        }
        writeln!(f, "  Groups ({}):", self.groups.len())?;
        for group in &self.groups {
            writeln!(f, "    {} ({}): {}", group.name, group.policy, group.members.join(", "))?;
        }
        write!(f, "  Rules: {}", self.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_json() {
        let config = leaf_config::parse(
            "[General]\nsocks-port = 1086\n\
             [Proxy]\nA = socks, 10.0.0.1, 1080\nB = direct\n\
             [Proxy Group]\nP = failover, A, B\n\
             [Rule]\nFINAL, P\n",
        )
        .unwrap();

        let summary = ConfigSummary::new(&config);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["socks_inbound"], "127.0.0.1:1086");
        assert_eq!(json["proxies"][0]["server"], "10.0.0.1:1080");
        assert!(json["proxies"][1].get("server").is_none());
        assert_eq!(json["groups"][0]["policy"], "failover");
        assert_eq!(json["rules"], 1);

        let text = summary.to_string();
        assert!(text.contains("P (failover): A, B"));
    }
}
