//! Built-in Proxy Engine
//!
//! In-process engine behind [`ProxyRuntime::builtin`](crate::ProxyRuntime::builtin):
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌────────────────────────────┐
//! │ SOCKS5       │──▶│  Router  │──▶│ direct / reject / socks /  │──▶ protected
//! │ inbound      │   │ [Rule]   │   │ trojan(+TLS, fragment)     │    sockets
//! └──────────────┘   └──────────┘   │ groups with health checks  │
//!                                   └────────────────────────────┘
//! ┌──────────────┐
//! │ TUN pump     │──▶ TunStats
//! └──────────────┘
//! ```
//!
//! Reload builds a fresh [`Dispatcher`] and publishes it; the inbound picks
//! it up for the next accepted connection.

mod group;
mod outbound;
mod resolver;
mod router;
mod socks;
mod trojan;

pub use group::{GroupState, MemberHealth};
pub use outbound::{BoxedStream, Dispatcher, OutboundError, ProxyStream};
pub use resolver::{DnsError, Resolver};
pub use router::Router;
pub use socks::{SocksError, SocksInbound, TargetAddr};

use crate::engine::{EngineError, EngineInstance, EngineSession, ProxyEngine};
use crate::tun::TunDevice;
use async_trait::async_trait;
use leaf_config::Configuration;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest IP packet read from the TUN device
const MAX_PACKET_SIZE: usize = 65535;

/// Shortest allowed health-check period
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Engine factory; stateless
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinEngine;

impl BuiltinEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProxyEngine for BuiltinEngine {
    async fn start(&self, session: EngineSession) -> Result<Box<dyn EngineInstance>, EngineError> {
        let dispatcher = Arc::new(Dispatcher::new(
            session.config.clone(),
            session.dialer.clone(),
            &session.options,
        ));
        let (dispatcher_tx, dispatcher_rx) = watch::channel(dispatcher.clone());
        let cancel = CancellationToken::new();

        let inbound = match session.config.general.socks_addr() {
            Some(configured) => {
                let inbound = SocksInbound::bind(configured).await?;
                let local_addr = inbound.local_addr();
                let task = tokio::spawn(inbound.run(
                    dispatcher_rx,
                    session.tasks.clone(),
                    cancel.child_token(),
                ));
                Some(InboundTask {
                    configured,
                    local_addr,
                    task,
                })
            }
            None => {
                debug!("No socks-port configured, inbound disabled");
                None
            }
        };

        let pump = tokio::spawn(pump_tun(session.tun.clone(), cancel.child_token()));
        let health = spawn_health_checks(&dispatcher, &cancel);

        info!(
            "Built-in engine started ({} proxies, {} groups, {} rules)",
            session.config.proxies.len(),
            session.config.groups.len(),
            session.config.rules.len()
        );

        Ok(Box::new(BuiltinInstance {
            session,
            dispatcher: dispatcher_tx,
            inbound,
            pump: Some(pump),
            cancel,
            health,
        }))
    }
}

struct InboundTask {
    /// Address as written in the configuration (port may be 0)
    configured: SocketAddr,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Running built-in engine
pub struct BuiltinInstance {
    session: EngineSession,
    dispatcher: watch::Sender<Arc<Dispatcher>>,
    inbound: Option<InboundTask>,
    pump: Option<JoinHandle<()>>,
    /// Parent of the inbound, pump and health tokens
    cancel: CancellationToken,
    /// Health checks of the current dispatcher
    health: CancellationToken,
}

#[async_trait]
impl EngineInstance for BuiltinInstance {
    async fn reload(&mut self, config: Arc<Configuration>) -> Result<(), EngineError> {
        let configured = self.inbound.as_ref().map(|i| i.configured);
        if config.general.socks_addr() != configured {
            return Err(EngineError::Other(
                "changing the SOCKS inbound requires a restart".into(),
            ));
        }

        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            self.session.dialer.clone(),
            &self.session.options,
        ));

        self.health.cancel();
        self.health = spawn_health_checks(&dispatcher, &self.cancel);
        self.dispatcher.send_replace(dispatcher);
        self.session.config = config;

        info!("Built-in engine reloaded");
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();

        if let Some(inbound) = self.inbound.take() {
            if let Err(e) = inbound.task.await {
                warn!("SOCKS inbound task failed: {}", e);
            }
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!("TUN pump task failed: {}", e);
            }
        }
        debug!("Built-in engine stopped");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inbound.as_ref().map(|i| i.local_addr)
    }
}

/// Drain packets from the TUN device into its counters
async fn pump_tun(tun: Arc<TunDevice>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            read = tun.read_packet(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("TUN device closed");
                        break;
                    }
                    Ok(n) => trace!("TUN packet: {} bytes", n),
                    Err(e) => {
                        warn!("TUN read error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// One probe loop per group, cancelled as a unit
fn spawn_health_checks(dispatcher: &Arc<Dispatcher>, parent: &CancellationToken) -> CancellationToken {
    let token = parent.child_token();

    for group in dispatcher.groups() {
        let dispatcher = dispatcher.clone();
        let group = group.clone();
        let cancel = token.clone();
        let period = group.check_interval().max(MIN_CHECK_INTERVAL);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => dispatcher.probe_group(&group).await,
                }
            }
            trace!("Health checks for {} stopped", group.name());
        });
    }

    token
}
