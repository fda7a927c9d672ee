//! Configuration Model
//!
//! In-memory form of the proxy configuration. Every type here renders
//! back to the text format through `Display`, so a parsed configuration
//! can be written out and parsed again without loss.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Log verbosity requested by `[General] loglevel`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the TUN device in `[General] tun`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunRef {
    /// Descriptor number handed over by the host
    Fd(i32),
    /// Let the engine pick (only meaningful outside Android)
    Auto,
}

impl fmt::Display for TunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunRef::Fd(fd) => write!(f, "{}", fd),
            TunRef::Auto => f.write_str("auto"),
        }
    }
}

/// Closed integer interval such as `fragment-length=6-19`
///
/// Parsing only checks the syntax. Bound checks (`start <= end`, no
/// negative bounds) belong to validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub start: i64,
    pub end: i64,
}

impl IntRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Both bounds non-negative and ordered
    pub fn is_valid(&self) -> bool {
        self.start >= 0 && self.end >= 0 && self.start <= self.end
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.start && value <= self.end
    }
}

impl FromStr for IntRange {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(());
        }

        // A leading '-' belongs to the first bound, not the separator.
        let sep = s.char_indices().skip(1).find(|(_, c)| *c == '-').map(|(i, _)| i);
        match sep {
            Some(i) => {
                let start = s[..i].trim().parse().map_err(|_| ())?;
                let end = s[i + 1..].trim().parse().map_err(|_| ())?;
                Ok(Self { start, end })
            }
            None => {
                let v = s.parse().map_err(|_| ())?;
                Ok(Self { start: v, end: v })
            }
        }
    }
}

impl fmt::Display for IntRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Ordered `key=value` parameters trailing a definition line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set a parameter, replacing an earlier value for the same key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Boolean parameter; anything but `true` counts as false
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_range(&self, key: &str) -> Option<IntRange> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.0 {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Keys that carry closed integer intervals
pub const RANGE_KEYS: &[&str] = &["fragment-packets", "fragment-length", "fragment-interval"];

/// TLS fragmentation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSpec {
    /// Which writes of a connection get split (numbered from 1)
    pub packets: IntRange,
    /// Chunk size in bytes
    pub length: IntRange,
    /// Delay between chunks in milliseconds
    pub interval: IntRange,
}

impl Default for FragmentSpec {
    fn default() -> Self {
        Self {
            packets: IntRange::new(0, 1),
            length: IntRange::new(6, 19),
            interval: IntRange::new(8, 12),
        }
    }
}

impl FragmentSpec {
    /// Read the fragment triple from parameters; `None` unless `fragment=true`
    ///
    /// Missing keys fall back to the defaults.
    pub fn from_params(params: &Params) -> Option<Self> {
        if !params.get_bool("fragment") {
            return None;
        }
        let defaults = Self::default();
        Some(Self {
            packets: params.get_range("fragment-packets").unwrap_or(defaults.packets),
            length: params.get_range("fragment-length").unwrap_or(defaults.length),
            interval: params.get_range("fragment-interval").unwrap_or(defaults.interval),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.packets.is_valid() && self.length.is_valid() && self.interval.is_valid()
    }
}

/// Remote host and port of an outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Literal socket address, if the host is an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.host, self.port)
    }
}

/// Outbound protocol of a `[Proxy]` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Direct,
    Reject,
    Socks,
    Trojan,
    Shadowsocks,
    Vmess,
    Vless,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Direct => "direct",
            Protocol::Reject => "reject",
            Protocol::Socks => "socks",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "ss",
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
        }
    }

    /// Does this protocol dial a remote endpoint?
    pub fn needs_endpoint(&self) -> bool {
        !matches!(self, Protocol::Direct | Protocol::Reject)
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Protocol::Direct),
            "reject" | "drop" => Ok(Protocol::Reject),
            "socks" | "socks5" => Ok(Protocol::Socks),
            "trojan" => Ok(Protocol::Trojan),
            "ss" | "shadowsocks" => Ok(Protocol::Shadowsocks),
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[Proxy]` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDef {
    pub name: String,
    pub protocol: Protocol,
    /// `None` for `direct` and `reject`
    pub endpoint: Option<Endpoint>,
    pub params: Params,
}

impl ProxyDef {
    pub fn password(&self) -> Option<&str> {
        self.params.get("password")
    }

    pub fn tls(&self) -> bool {
        self.params.get_bool("tls")
    }

    /// SNI, defaulting to the endpoint host
    pub fn sni(&self) -> Option<&str> {
        self.params
            .get("sni")
            .or_else(|| self.endpoint.as_ref().map(|e| e.host.as_str()))
    }

    pub fn websocket(&self) -> bool {
        self.params.get_bool("ws")
    }

    pub fn ws_host(&self) -> Option<&str> {
        self.params.get("ws-host")
    }

    pub fn ws_path(&self) -> Option<&str> {
        self.params.get("ws-path")
    }

    /// Multiplexing (`amux`) requested
    pub fn amux(&self) -> bool {
        self.params.get_bool("amux")
    }

    pub fn amux_max(&self) -> Option<u64> {
        self.params.get_u64("amux-max")
    }

    pub fn amux_concurrency(&self) -> Option<u64> {
        self.params.get_u64("amux-con")
    }

    pub fn fragment(&self) -> Option<FragmentSpec> {
        FragmentSpec::from_params(&self.params)
    }
}

impl fmt::Display for ProxyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.protocol)?;
        if let Some(ref endpoint) = self.endpoint {
            write!(f, ", {}", endpoint)?;
        }
        write!(f, "{}", self.params)
    }
}

/// Selection policy of a `[Proxy Group]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPolicy {
    /// First healthy member in declaration order
    Failover,
    /// Lowest measured latency first
    UrlTest,
    /// Operator-selected member (first by default)
    Select,
    /// Uniformly random member
    Random,
}

impl GroupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupPolicy::Failover => "failover",
            GroupPolicy::UrlTest => "url-test",
            GroupPolicy::Select => "select",
            GroupPolicy::Random => "random",
        }
    }
}

impl FromStr for GroupPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "failover" => Ok(GroupPolicy::Failover),
            "url-test" | "urltest" => Ok(GroupPolicy::UrlTest),
            "select" | "static" => Ok(GroupPolicy::Select),
            "random" => Ok(GroupPolicy::Random),
            _ => Err(()),
        }
    }
}

impl fmt::Display for GroupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[Proxy Group]` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyGroup {
    pub name: String,
    pub policy: GroupPolicy,
    pub members: Vec<String>,
    pub params: Params,
}

impl ProxyGroup {
    /// Health re-probe interval in seconds (default 600)
    pub fn check_interval_secs(&self) -> u64 {
        self.params.get_u64("check-interval").unwrap_or(600)
    }

    /// Per-member connect timeout in seconds (default 3)
    pub fn fail_timeout_secs(&self) -> u64 {
        self.params.get_u64("fail-timeout").unwrap_or(3)
    }
}

impl fmt::Display for ProxyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.policy)?;
        for member in &self.members {
            write!(f, ", {}", member)?;
        }
        write!(f, "{}", self.params)
    }
}

/// HTTP method used for DoH queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohMethod {
    Get,
    Post,
}

impl FromStr for DohMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "get" => Ok(DohMethod::Get),
            "post" => Ok(DohMethod::Post),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DohMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DohMethod::Get => f.write_str("get"),
            DohMethod::Post => f.write_str("post"),
        }
    }
}

/// `[Dns]` entry: a DoH upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsDef {
    pub name: String,
    pub endpoint: Endpoint,
    pub params: Params,
}

impl DnsDef {
    /// HTTP host (`domain=`), defaulting to the endpoint host
    pub fn domain(&self) -> &str {
        self.params.get("domain").unwrap_or(&self.endpoint.host)
    }

    /// TLS server name, defaulting to the domain
    pub fn sni(&self) -> &str {
        self.params.get("sni").unwrap_or_else(|| self.domain())
    }

    pub fn path(&self) -> &str {
        self.params.get("path").unwrap_or("/dns-query")
    }

    pub fn method(&self) -> DohMethod {
        self.params
            .get("method")
            .and_then(|m| m.parse().ok())
            .unwrap_or(DohMethod::Post)
    }

    pub fn fragment(&self) -> Option<FragmentSpec> {
        FragmentSpec::from_params(&self.params)
    }

    /// Local UDP listener (`listen=`), if set
    pub fn listen(&self) -> Option<SocketAddr> {
        self.params.get("listen").and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for DnsDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = doh, {}{}", self.name, self.endpoint, self.params)
    }
}

/// CIDR block for `IP-CIDR` rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpCidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix.min(32) as u32)
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix.min(128) as u32)
    }
}

impl FromStr for IpCidr {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = s.split_once('/').ok_or(())?;
        let addr: IpAddr = ip.trim().parse().map_err(|_| ())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| ())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(());
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Transport network for `NETWORK` rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Match condition of a `[Rule]` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    IpCidr(IpCidr),
    PortRange(IntRange),
    Network(Network),
    /// Catch-all, must be the last rule
    Final,
}

/// `[Rule]` line: condition and target outbound or group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub target: String,
}

impl Rule {
    pub fn is_final(&self) -> bool {
        matches!(self.kind, RuleKind::Final)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RuleKind::Domain(d) => write!(f, "DOMAIN, {}, {}", d, self.target),
            RuleKind::DomainSuffix(d) => write!(f, "DOMAIN-SUFFIX, {}, {}", d, self.target),
            RuleKind::DomainKeyword(d) => write!(f, "DOMAIN-KEYWORD, {}, {}", d, self.target),
            RuleKind::IpCidr(c) => write!(f, "IP-CIDR, {}, {}", c, self.target),
            RuleKind::PortRange(r) => write!(f, "PORT-RANGE, {}, {}", r, self.target),
            RuleKind::Network(n) => write!(f, "NETWORK, {}, {}", n, self.target),
            RuleKind::Final => write!(f, "FINAL, {}", self.target),
        }
    }
}

/// `[General]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct General {
    pub loglevel: Option<LogLevel>,
    /// Resolvers used for domain routing and fake-ip
    pub dns_servers: Vec<SocketAddr>,
    pub always_fake_ip: Vec<String>,
    pub always_real_ip: Vec<String>,
    pub routing_domain_resolve: Option<bool>,
    pub socks_interface: Option<IpAddr>,
    pub socks_port: Option<u16>,
    pub tun: Option<TunRef>,
    /// `[Dns]` entry served by the local DoH runtime
    pub doh_server: Option<String>,
    /// Keys this crate does not interpret, kept for round-tripping
    pub extra: Vec<(String, String)>,
}

impl General {
    /// Local SOCKS inbound address, if one is configured
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_port.map(|port| {
            let ip = self
                .socks_interface
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
            SocketAddr::new(ip, port)
        })
    }

    fn is_empty(&self) -> bool {
        *self == General::default()
    }
}

impl fmt::Display for General {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(level) = self.loglevel {
            writeln!(f, "loglevel = {}", level)?;
        }
        if !self.dns_servers.is_empty() {
            let servers: Vec<String> = self.dns_servers.iter().map(|s| s.to_string()).collect();
            writeln!(f, "dns-server = {}", servers.join(", "))?;
        }
        if !self.always_fake_ip.is_empty() {
            writeln!(f, "always-fake-ip = {}", self.always_fake_ip.join(", "))?;
        }
        if !self.always_real_ip.is_empty() {
            writeln!(f, "always-real-ip = {}", self.always_real_ip.join(", "))?;
        }
        if let Some(v) = self.routing_domain_resolve {
            writeln!(f, "routing-domain-resolve = {}", v)?;
        }
        if let Some(ip) = self.socks_interface {
            writeln!(f, "socks-interface = {}", ip)?;
        }
        if let Some(port) = self.socks_port {
            writeln!(f, "socks-port = {}", port)?;
        }
        if let Some(tun) = self.tun {
            writeln!(f, "tun = {}", tun)?;
        }
        if let Some(ref doh) = self.doh_server {
            writeln!(f, "doh-server = {}", doh)?;
        }
        for (key, value) in &self.extra {
            writeln!(f, "{} = {}", key, value)?;
        }
        Ok(())
    }
}

/// Complete proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub general: General,
    /// `[Env]` pairs in declaration order
    pub env: Vec<(String, String)>,
    pub proxies: Vec<ProxyDef>,
    pub groups: Vec<ProxyGroup>,
    pub dns: Vec<DnsDef>,
    /// Order is significant: first match wins
    pub rules: Vec<Rule>,
}

impl Configuration {
    pub fn proxy(&self, name: &str) -> Option<&ProxyDef> {
        self.proxies.iter().find(|p| p.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&ProxyGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn dns_entry(&self, name: &str) -> Option<&DnsDef> {
        self.dns.iter().find(|d| d.name == name)
    }

    /// Is `name` a valid routing target (proxy or group)?
    pub fn has_outbound(&self, name: &str) -> bool {
        self.proxy(name).is_some() || self.group(name).is_some()
    }

    /// The `[Dns]` entry the runtime should serve locally
    ///
    /// Named by `doh-server`, otherwise the first entry.
    pub fn active_doh(&self) -> Option<&DnsDef> {
        match self.general.doh_server {
            Some(ref name) => self.dns_entry(name),
            None => self.dns.first(),
        }
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.general.is_empty() {
            writeln!(f, "[General]")?;
            write!(f, "{}", self.general)?;
            writeln!(f)?;
        }
        if !self.env.is_empty() {
            writeln!(f, "[Env]")?;
            for (key, value) in &self.env {
                writeln!(f, "{}={}", key, value)?;
            }
            writeln!(f)?;
        }
        if !self.proxies.is_empty() {
            writeln!(f, "[Proxy]")?;
            for proxy in &self.proxies {
                writeln!(f, "{}", proxy)?;
            }
            writeln!(f)?;
        }
        if !self.groups.is_empty() {
            writeln!(f, "[Proxy Group]")?;
            for group in &self.groups {
                writeln!(f, "{}", group)?;
            }
            writeln!(f)?;
        }
        if !self.dns.is_empty() {
            writeln!(f, "[Dns]")?;
            for dns in &self.dns {
                writeln!(f, "{}", dns)?;
            }
            writeln!(f)?;
        }
        if !self.rules.is_empty() {
            writeln!(f, "[Rule]")?;
            for rule in &self.rules {
                writeln!(f, "{}", rule)?;
            }
        }
        Ok(())
    }
}
