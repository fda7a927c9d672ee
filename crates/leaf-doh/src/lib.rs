//! Leaf DoH - Local DNS-over-HTTPS Runtime
//!
//! Serves plain DNS on a loopback UDP port and forwards every query to an
//! HTTPS upstream over a protected, optionally fragmenting connection.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut doh = DohRuntime::new(dialer);
//! let addr = doh.start(DohConfig::cloudflare()).await?;
//! // ...
//! doh.stop().await;
//! ```

mod client;
mod config;
mod runtime;
mod server;

pub use client::{DnsExchange, DohClient, MAX_RESPONSE_SIZE};
pub use config::{DohConfig, Upstream, DEFAULT_LISTEN};
pub use runtime::{DohHandle, DohRuntime};
pub use server::DohServer;

use std::net::SocketAddr;

/// DoH errors
#[derive(Debug, thiserror::Error)]
pub enum DohError {
    #[error("Failed to bind DoH listener {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("DoH runtime already running")]
    AlreadyRunning,

    #[error("Invalid DoH configuration: {0}")]
    Config(String),

    #[error("Dial failed: {0}")]
    Dial(#[from] leaf_net::DialError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Upstream returned status {0}")]
    Status(u16),

    #[error("Upstream response too large ({0} bytes)")]
    ResponseTooLarge(usize),

    #[error("Upstream exchange timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
