//! Leaf Config - Proxy Configuration Model
//!
//! Parses, validates and serializes the INI-style configuration consumed
//! by the proxy runtime.
//!
//! # Sections
//!
//! | Section         | Contents                                          |
//! |-----------------|---------------------------------------------------|
//! | `[General]`     | log level, resolvers, fake-ip, SOCKS inbound, TUN |
//! | `[Env]`         | `KEY=VALUE` overrides for [`RuntimeOptions`]      |
//! | `[Proxy]`       | named outbounds                                   |
//! | `[Proxy Group]` | selection policies over outbounds                 |
//! | `[Dns]`         | DoH upstreams                                     |
//! | `[Rule]`        | ordered routing rules ending with `FINAL`         |
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = leaf_config::parse(&text)?;
//! leaf_config::validate(&config)?;
//! ```

mod model;
mod options;
mod parser;
mod validate;

pub use model::{
    Configuration, DnsDef, DohMethod, Endpoint, FragmentSpec, General, GroupPolicy, IntRange,
    IpCidr, LogLevel, Network, Params, Protocol, ProxyDef, ProxyGroup, Rule, RuleKind, TunRef,
};
pub use options::{OptionsError, ReloadPolicy, RuntimeOptions};
pub use parser::{parse, ParseError};
pub use validate::{validate, ValidationError};
