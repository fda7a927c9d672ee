//! Local UDP DNS listener
//!
//! Receives plain DNS queries on the loopback listener and answers each
//! one through a [`DnsExchange`] on its own task. The loop exits when its
//! cancellation token fires.

use crate::client::DnsExchange;
use crate::DohError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Maximum DNS message size for UDP
const MAX_DNS_MESSAGE_SIZE: usize = 4096;

/// DNS header length; anything shorter is not a query
const DNS_HEADER_LEN: usize = 12;

/// Bound UDP listener
pub struct DohServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl DohServer {
    /// Bind the listener
    pub async fn bind(listen: SocketAddr) -> Result<Self, DohError> {
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|source| DohError::Bind { addr: listen, source })?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve queries until `cancel` fires
    pub async fn run(self, exchange: Arc<dyn DnsExchange>, cancel: CancellationToken) {
        info!("DoH listener on {}", self.local_addr);
        let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("DoH listener on {} shutting down", self.local_addr);
                    break;
                }

                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            if len < DNS_HEADER_LEN {
                                debug!("Dropping short DNS message from {}", src);
                                continue;
                            }
                            let query = buf[..len].to_vec();
                            let socket = self.socket.clone();
                            let exchange = exchange.clone();
                            let cancel = cancel.clone();

                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    _ = handle_query(&socket, exchange.as_ref(), &query, src) => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!("DoH listener recv error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

async fn handle_query(socket: &UdpSocket, exchange: &dyn DnsExchange, query: &[u8], src: SocketAddr) {
    match exchange.exchange(query).await {
        Ok(response) => {
            if let Err(e) = socket.send_to(&response, src).await {
                debug!("DNS reply to {} failed: {}", src, e);
            }
        }
        Err(e) => {
            debug!("DNS query from {} failed: {}", src, e);
        }
    }
}
