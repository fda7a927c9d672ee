//! Configuration Parser
//!
//! Reads the line-oriented, INI-style configuration format:
//!
//! ```text
//! [General]
//! loglevel = info
//! dns-server = 127.0.0.1:5123
//!
//! [Proxy]
//! GB1 = trojan, 104.21.233.179, 443, password=wow, tls=true
//!
//! [Proxy Group]
//! Proxy = failover, GB1, GB2
//!
//! [Rule]
//! FINAL, Proxy
//! ```
//!
//! Sections may appear in any order and more than once. Inside `[Rule]`
//! the order of lines is kept. Reference checks are left to
//! [`crate::validate`].

use crate::model::{
    Configuration, DnsDef, Endpoint, General, GroupPolicy, IntRange, IpCidr, Network, Params,
    Protocol, ProxyDef, ProxyGroup, Rule, RuleKind, TunRef, RANGE_KEYS,
};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Default port for `dns-server` entries given as a bare IP
const DNS_DEFAULT_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    General,
    Env,
    Proxy,
    ProxyGroup,
    Dns,
    Rule,
}

impl Section {
    fn from_header(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "general" => Some(Section::General),
            "env" => Some(Section::Env),
            "proxy" => Some(Section::Proxy),
            "proxy group" => Some(Section::ProxyGroup),
            "dns" => Some(Section::Dns),
            "rule" => Some(Section::Rule),
            _ => None,
        }
    }
}

/// Parse configuration text
pub fn parse(text: &str) -> Result<Configuration, ParseError> {
    let mut config = Configuration::default();
    let mut section: Option<Section> = None;
    // Proxies and groups share one namespace; DoH entries have their own.
    let mut outbound_names: HashSet<String> = HashSet::new();
    let mut dns_names: HashSet<String> = HashSet::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            let name = line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .ok_or(ParseError::BadLine { line: line_no })?;
            section = Some(Section::from_header(name).ok_or_else(|| ParseError::SectionUnknown {
                line: line_no,
                name: name.trim().to_string(),
            })?);
            continue;
        }

        let current = section.ok_or(ParseError::OutsideSection { line: line_no })?;
        match current {
            Section::General => parse_general_line(&mut config.general, line, line_no)?,
            Section::Env => {
                let (key, value) = split_assignment(line, line_no)?;
                config.env.push((key.to_string(), value.to_string()));
            }
            Section::Proxy => {
                let proxy = parse_proxy_line(line, line_no)?;
                claim_name(&mut outbound_names, &proxy.name, line_no)?;
                config.proxies.push(proxy);
            }
            Section::ProxyGroup => {
                let group = parse_group_line(line, line_no)?;
                claim_name(&mut outbound_names, &group.name, line_no)?;
                config.groups.push(group);
            }
            Section::Dns => {
                let dns = parse_dns_line(line, line_no)?;
                claim_name(&mut dns_names, &dns.name, line_no)?;
                config.dns.push(dns);
            }
            Section::Rule => config.rules.push(parse_rule_line(line, line_no)?),
        }
    }

    debug!(
        "Parsed config: {} proxies, {} groups, {} dns, {} rules",
        config.proxies.len(),
        config.groups.len(),
        config.dns.len(),
        config.rules.len()
    );

    Ok(config)
}

fn claim_name(names: &mut HashSet<String>, name: &str, line: usize) -> Result<(), ParseError> {
    if !names.insert(name.to_string()) {
        return Err(ParseError::DuplicateName {
            line,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Split `key = value` at the first '='
fn split_assignment(line: &str, line_no: usize) -> Result<(&str, &str), ParseError> {
    let (key, value) = line
        .split_once('=')
        .ok_or(ParseError::BadLine { line: line_no })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ParseError::BadLine { line: line_no });
    }
    Ok((key, value.trim()))
}

fn split_fields(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .collect()
}

fn parse_bool(value: &str, key: &str, line: usize) -> Result<bool, ParseError> {
    match value.to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(bad_value(line, key, value)),
    }
}

fn parse_port(value: &str, line: usize) -> Result<u16, ParseError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::BadPort {
            line,
            value: value.trim().to_string(),
        }),
    }
}

fn bad_value(line: usize, key: &str, value: &str) -> ParseError {
    ParseError::BadValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_general_line(general: &mut General, line: &str, line_no: usize) -> Result<(), ParseError> {
    let (key, value) = split_assignment(line, line_no)?;

    match key {
        "loglevel" => {
            general.loglevel = Some(value.parse().map_err(|_| bad_value(line_no, key, value))?);
        }
        "dns-server" => {
            general.dns_servers = split_fields(value)
                .into_iter()
                .map(|s| parse_dns_server(s).ok_or_else(|| bad_value(line_no, key, s)))
                .collect::<Result<_, _>>()?;
        }
        "always-fake-ip" => {
            general.always_fake_ip = split_fields(value).into_iter().map(String::from).collect();
        }
        "always-real-ip" => {
            general.always_real_ip = split_fields(value).into_iter().map(String::from).collect();
        }
        "routing-domain-resolve" => {
            general.routing_domain_resolve = Some(parse_bool(value, key, line_no)?);
        }
        "socks-interface" => {
            general.socks_interface =
                Some(value.parse().map_err(|_| bad_value(line_no, key, value))?);
        }
        "socks-port" => {
            // 0 asks for an ephemeral port.
            general.socks_port = Some(value.parse().map_err(|_| ParseError::BadPort {
                line: line_no,
                value: value.to_string(),
            })?);
        }
        "tun" | "tun-fd" => {
            general.tun = Some(if value.eq_ignore_ascii_case("auto") {
                TunRef::Auto
            } else {
                TunRef::Fd(value.parse().map_err(|_| bad_value(line_no, key, value))?)
            });
        }
        "doh-server" => {
            general.doh_server = Some(value.to_string());
        }
        _ => {
            general.extra.push((key.to_string(), value.to_string()));
        }
    }

    Ok(())
}

/// `ip:port`, `[v6]:port` or a bare IP on port 53
fn parse_dns_server(s: &str) -> Option<SocketAddr> {
    s.parse::<SocketAddr>()
        .ok()
        .or_else(|| s.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, DNS_DEFAULT_PORT)))
}

/// Collect trailing `key=value` fields, checking the syntax of range keys
fn parse_params<'a>(
    fields: impl Iterator<Item = &'a str>,
    line: usize,
) -> Result<Params, ParseError> {
    let mut params = Params::new();
    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or(ParseError::BadLine { line })?;
        let key = key.trim();
        let value = value.trim();
        if RANGE_KEYS.contains(&key) && value.parse::<IntRange>().is_err() {
            return Err(bad_value(line, key, value));
        }
        if key == "listen" && value.parse::<SocketAddr>().is_err() {
            return Err(bad_value(line, key, value));
        }
        params.insert(key, value);
    }
    Ok(params)
}

fn parse_proxy_line(line: &str, line_no: usize) -> Result<ProxyDef, ParseError> {
    let (name, value) = split_assignment(line, line_no)?;
    let fields = split_fields(value);

    let protocol_field = *fields.first().ok_or(ParseError::MissingField {
        line: line_no,
        field: "protocol",
    })?;
    let protocol: Protocol = protocol_field
        .parse()
        .map_err(|_| ParseError::UnknownProtocol {
            line: line_no,
            protocol: protocol_field.to_string(),
        })?;

    let (endpoint, rest) = if protocol.needs_endpoint() {
        let host = positional(&fields, 1).ok_or(ParseError::MissingField {
            line: line_no,
            field: "host",
        })?;
        let port = positional(&fields, 2).ok_or(ParseError::MissingField {
            line: line_no,
            field: "port",
        })?;
        (Some(Endpoint::new(host, parse_port(port, line_no)?)), 3)
    } else {
        (None, 1)
    };

    let params = parse_params(fields.into_iter().skip(rest), line_no)?;

    Ok(ProxyDef {
        name: name.to_string(),
        protocol,
        endpoint,
        params,
    })
}

/// Positional field at `idx`, unless it is already a `key=value` pair
fn positional<'a>(fields: &[&'a str], idx: usize) -> Option<&'a str> {
    fields.get(idx).copied().filter(|f| !f.contains('='))
}

fn parse_group_line(line: &str, line_no: usize) -> Result<ProxyGroup, ParseError> {
    let (name, value) = split_assignment(line, line_no)?;
    let fields = split_fields(value);

    let policy_field = *fields.first().ok_or(ParseError::MissingField {
        line: line_no,
        field: "policy",
    })?;
    let policy: GroupPolicy = policy_field
        .parse()
        .map_err(|_| ParseError::UnknownPolicy {
            line: line_no,
            policy: policy_field.to_string(),
        })?;

    let (params, members): (Vec<&str>, Vec<&str>) =
        fields.into_iter().skip(1).partition(|f| f.contains('='));

    Ok(ProxyGroup {
        name: name.to_string(),
        policy,
        members: members.into_iter().map(String::from).collect(),
        params: parse_params(params.into_iter(), line_no)?,
    })
}

fn parse_dns_line(line: &str, line_no: usize) -> Result<DnsDef, ParseError> {
    let (name, value) = split_assignment(line, line_no)?;
    let fields = split_fields(value);

    let kind = *fields.first().ok_or(ParseError::MissingField {
        line: line_no,
        field: "protocol",
    })?;
    if !kind.eq_ignore_ascii_case("doh") {
        return Err(ParseError::UnknownProtocol {
            line: line_no,
            protocol: kind.to_string(),
        });
    }

    let host = positional(&fields, 1).ok_or(ParseError::MissingField {
        line: line_no,
        field: "host",
    })?;
    let port = positional(&fields, 2).ok_or(ParseError::MissingField {
        line: line_no,
        field: "port",
    })?;
    // The upstream is dialed before any resolver exists.
    if host.parse::<IpAddr>().is_err() {
        return Err(bad_value(line_no, "host", host));
    }
    let endpoint = Endpoint::new(host, parse_port(port, line_no)?);
    let params = parse_params(fields.into_iter().skip(3), line_no)?;

    if let Some(method) = params.get("method") {
        if method.parse::<crate::model::DohMethod>().is_err() {
            return Err(bad_value(line_no, "method", method));
        }
    }

    Ok(DnsDef {
        name: name.to_string(),
        endpoint,
        params,
    })
}

fn parse_rule_line(line: &str, line_no: usize) -> Result<Rule, ParseError> {
    let fields = split_fields(line);
    let kind_field = *fields.first().ok_or(ParseError::BadLine { line: line_no })?;
    let kind_upper = kind_field.to_uppercase();

    if kind_upper == "FINAL" {
        let target = fields.get(1).ok_or(ParseError::MissingField {
            line: line_no,
            field: "target",
        })?;
        return Ok(Rule {
            kind: RuleKind::Final,
            target: target.to_string(),
        });
    }

    let value = *fields.get(1).ok_or(ParseError::MissingField {
        line: line_no,
        field: "value",
    })?;
    let target = fields.get(2).ok_or(ParseError::MissingField {
        line: line_no,
        field: "target",
    })?;

    let kind = match kind_upper.as_str() {
        "DOMAIN" => RuleKind::Domain(value.to_lowercase()),
        "DOMAIN-SUFFIX" => RuleKind::DomainSuffix(value.trim_start_matches('.').to_lowercase()),
        "DOMAIN-KEYWORD" => RuleKind::DomainKeyword(value.to_lowercase()),
        "IP-CIDR" | "IP-CIDR6" => RuleKind::IpCidr(
            value
                .parse::<IpCidr>()
                .map_err(|_| bad_value(line_no, kind_field, value))?,
        ),
        "PORT-RANGE" => RuleKind::PortRange(
            value
                .parse::<IntRange>()
                .map_err(|_| bad_value(line_no, kind_field, value))?,
        ),
        "NETWORK" => RuleKind::Network(match value.to_lowercase().as_str() {
            "tcp" => Network::Tcp,
            "udp" => Network::Udp,
            _ => return Err(bad_value(line_no, kind_field, value)),
        }),
        _ => {
            return Err(ParseError::UnknownRuleType {
                line: line_no,
                kind: kind_field.to_string(),
            });
        }
    };

    Ok(Rule {
        kind,
        target: target.to_string(),
    })
}

/// Parse errors, all carrying the 1-based line number
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: unknown section [{name}]")]
    SectionUnknown { line: usize, name: String },

    #[error("line {line}: duplicate name '{name}'")]
    DuplicateName { line: usize, name: String },

    #[error("line {line}: missing field '{field}'")]
    MissingField { line: usize, field: &'static str },

    #[error("line {line}: bad port '{value}'")]
    BadPort { line: usize, value: String },

    #[error("line {line}: malformed line")]
    BadLine { line: usize },

    #[error("line {line}: entry outside of any section")]
    OutsideSection { line: usize },

    #[error("line {line}: unknown protocol '{protocol}'")]
    UnknownProtocol { line: usize, protocol: String },

    #[error("line {line}: unknown group policy '{policy}'")]
    UnknownPolicy { line: usize, policy: String },

    #[error("line {line}: unknown rule type '{kind}'")]
    UnknownRuleType { line: usize, kind: String },

    #[error("line {line}: bad value '{value}' for '{key}'")]
    BadValue {
        line: usize,
        key: String,
        value: String,
    },
}

impl ParseError {
    /// Line the error points at
    pub fn line(&self) -> usize {
        match self {
            ParseError::SectionUnknown { line, .. }
            | ParseError::DuplicateName { line, .. }
            | ParseError::MissingField { line, .. }
            | ParseError::BadPort { line, .. }
            | ParseError::BadLine { line }
            | ParseError::OutsideSection { line }
            | ParseError::UnknownProtocol { line, .. }
            | ParseError::UnknownPolicy { line, .. }
            | ParseError::UnknownRuleType { line, .. }
            | ParseError::BadValue { line, .. } => *line,
        }
    }
}
