//! Proxy engine seam
//!
//! The lifecycle actor never touches protocols directly. It hands an
//! [`EngineSession`] to a [`ProxyEngine`] and drives the returned
//! [`EngineInstance`] through reload and shutdown.

use crate::tasks::ConnectionTasks;
use crate::tun::TunDevice;
use async_trait::async_trait;
use leaf_config::{Configuration, RuntimeOptions};
use leaf_net::ProtectedDialer;
use std::net::SocketAddr;
use std::sync::Arc;

/// Everything an engine needs for one running session
#[derive(Clone)]
pub struct EngineSession {
    /// Runtime-owned TUN duplicate
    pub tun: Arc<TunDevice>,
    /// Validated configuration the session starts with
    pub config: Arc<Configuration>,
    /// Dialer with the host protector installed
    pub dialer: ProtectedDialer,
    pub options: Arc<RuntimeOptions>,
    /// Forwarding tasks; the runtime drains or cuts them
    pub tasks: ConnectionTasks,
}

/// Factory for running engine instances
#[async_trait]
pub trait ProxyEngine: Send + Sync + 'static {
    async fn start(&self, session: EngineSession) -> Result<Box<dyn EngineInstance>, EngineError>;
}

/// One running engine
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// Apply a validated configuration; on error the previous one stays active
    async fn reload(&mut self, config: Arc<Configuration>) -> Result<(), EngineError>;

    /// Stop accepting and release the TUN device
    async fn shutdown(&mut self);

    /// Local inbound address, if any
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to bind inbound {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Resolver setup failed: {0}")]
    Resolver(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("{0}")]
    Other(String),
}
