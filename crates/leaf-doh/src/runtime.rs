//! DoH runtime lifecycle
//!
//! `DohRuntime` owns at most one running listener. `start` binds the UDP
//! socket before returning, so a port conflict is reported to the caller
//! instead of surfacing later on a background task.

use crate::client::{DnsExchange, DohClient};
use crate::config::DohConfig;
use crate::server::DohServer;
use crate::DohError;
use leaf_net::ProtectedDialer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running listener
pub struct DohHandle {
    config: Arc<DohConfig>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DohHandle {
    pub fn config(&self) -> &DohConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel the listener and wait for it to exit
    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Start/stop wrapper around one DoH listener
pub struct DohRuntime {
    dialer: ProtectedDialer,
    active: Option<DohHandle>,
    running: Arc<AtomicBool>,
}

impl DohRuntime {
    pub fn new(dialer: ProtectedDialer) -> Self {
        Self {
            dialer,
            active: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind `config.listen` and forward to the configured upstream
    pub async fn start(&mut self, config: DohConfig) -> Result<SocketAddr, DohError> {
        let config = Arc::new(config);
        let client = DohClient::new(config.clone(), self.dialer.clone());
        self.start_with(config, Arc::new(client)).await
    }

    /// Start with a custom exchange (used by tests and embedders)
    pub async fn start_with(
        &mut self,
        config: Arc<DohConfig>,
        exchange: Arc<dyn DnsExchange>,
    ) -> Result<SocketAddr, DohError> {
        if self.active.is_some() {
            return Err(DohError::AlreadyRunning);
        }

        let server = DohServer::bind(config.listen).await?;
        let local_addr = server.local_addr();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(exchange, cancel.clone()));

        info!(
            "DoH started on {} -> {} ({})",
            local_addr, config.upstream.addr, config.upstream.domain
        );
        self.active = Some(DohHandle {
            config,
            local_addr,
            cancel,
            task,
        });
        self.running.store(true, Ordering::SeqCst);
        Ok(local_addr)
    }

    /// Stop the listener; no-op when not running
    pub async fn stop(&mut self) {
        if let Some(handle) = self.active.take() {
            let addr = handle.local_addr();
            handle.shutdown().await;
            info!("DoH stopped on {}", addr);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared flag for lock-free status reads
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn handle(&self) -> Option<&DohHandle> {
        self.active.as_ref()
    }

    /// Configuration of the running listener
    pub fn config(&self) -> Option<&DohConfig> {
        self.active.as_ref().map(|h| h.config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use leaf_net::{DialerConfig, NoopProtector};
    use tokio::net::UdpSocket;

    struct Fixed;

    #[async_trait]
    impl DnsExchange for Fixed {
        async fn exchange(&self, _query: &[u8]) -> Result<Vec<u8>, DohError> {
            Ok(vec![0xab; 12])
        }
    }

    fn runtime() -> DohRuntime {
        DohRuntime::new(ProtectedDialer::new(
            Arc::new(NoopProtector),
            DialerConfig::default(),
        ))
    }

    fn local_config() -> Arc<DohConfig> {
        Arc::new(DohConfig::cloudflare().with_listen("127.0.0.1:0".parse().unwrap()))
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let mut doh = runtime();
        assert!(!doh.is_running());
        doh.stop().await;

        let addr = doh.start_with(local_config(), Arc::new(Fixed)).await.unwrap();
        assert!(doh.is_running());
        assert_ne!(addr.port(), 0);
        assert!(matches!(
            doh.start_with(local_config(), Arc::new(Fixed)).await,
            Err(DohError::AlreadyRunning)
        ));

        doh.stop().await;
        doh.stop().await;
        assert!(!doh.is_running());

        // The port is free again after stop.
        UdpSocket::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_stopped() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Arc::new(DohConfig::cloudflare().with_listen(taken.local_addr().unwrap()));

        let mut doh = runtime();
        let result = doh.start_with(config, Arc::new(Fixed)).await;
        assert!(matches!(result, Err(DohError::Bind { .. })));
        assert!(!doh.is_running());
        assert!(doh.config().is_none());
    }

    #[tokio::test]
    async fn test_running_flag_tracks_state() {
        let mut doh = runtime();
        let flag = doh.running_flag();
        doh.start_with(local_config(), Arc::new(Fixed)).await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
        doh.stop().await;
        assert!(!flag.load(Ordering::SeqCst));
    }
}
