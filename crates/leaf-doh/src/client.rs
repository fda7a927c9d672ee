//! DNS-over-HTTPS Client
//!
//! Forwards raw DNS messages to an HTTPS upstream.
//!
//! ```text
//! query ──▶ ProtectedDialer ──▶ FragmentStream ──▶ TLS ──▶ HTTP/1.1 ──▶ upstream
//! ```
//!
//! Idle HTTP/1.1 connections are kept in a small pool and reused by later
//! queries; a connection the upstream closed is dropped on checkout.

use crate::config::DohConfig;
use crate::DohError;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request};
use leaf_config::DohMethod;
use leaf_net::{FragmentStream, ProtectedDialer};
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const DNS_MESSAGE: &str = "application/dns-message";

/// Largest DNS message accepted from the upstream
pub const MAX_RESPONSE_SIZE: usize = 65_535;

/// Idle connections kept for reuse
const POOL_SIZE: usize = 4;

/// Anything that can answer a raw DNS query
#[async_trait]
pub trait DnsExchange: Send + Sync + 'static {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, DohError>;
}

/// Client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    pub queries: AtomicU64,
    pub failures: AtomicU64,
    pub connections: AtomicU64,
}

/// HTTPS client for one upstream
pub struct DohClient {
    config: Arc<DohConfig>,
    dialer: ProtectedDialer,
    tls: TlsConnector,
    pool: Mutex<Vec<SendRequest<Full<Bytes>>>>,
    stats: ClientStats,
}

impl DohClient {
    pub fn new(config: Arc<DohConfig>, dialer: ProtectedDialer) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            config,
            dialer,
            tls: TlsConnector::from(Arc::new(tls_config)),
            pool: Mutex::new(Vec::new()),
            stats: ClientStats::default(),
        }
    }

    pub fn config(&self) -> &DohConfig {
        &self.config
    }

    /// (queries, failures, connections opened)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.queries.load(Ordering::Relaxed),
            self.stats.failures.load(Ordering::Relaxed),
            self.stats.connections.load(Ordering::Relaxed),
        )
    }

    /// Build the HTTP request carrying `query`
    pub fn build_request(&self, query: &[u8]) -> Result<Request<Full<Bytes>>, DohError> {
        let upstream = &self.config.upstream;
        let builder = Request::builder()
            .header(HOST, upstream.domain.as_str())
            .header(USER_AGENT, self.config.user_agent.as_str())
            .header(ACCEPT, DNS_MESSAGE);

        let request = match self.config.method {
            DohMethod::Post => builder
                .method(Method::POST)
                .uri(upstream.path.as_str())
                .header(CONTENT_TYPE, DNS_MESSAGE)
                .body(Full::new(Bytes::copy_from_slice(query))),
            DohMethod::Get => {
                let sep = if upstream.path.contains('?') { '&' } else { '?' };
                let uri = format!("{}{}dns={}", upstream.path, sep, URL_SAFE_NO_PAD.encode(query));
                builder
                    .method(Method::GET)
                    .uri(uri)
                    .body(Full::new(Bytes::new()))
            }
        };

        request.map_err(|e| DohError::Http(e.to_string()))
    }

    async fn checkout(&self) -> Result<SendRequest<Full<Bytes>>, DohError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(mut sender) = pool.pop() {
                if sender.ready().await.is_ok() {
                    return Ok(sender);
                }
            }
        }
        self.connect().await
    }

    async fn checkin(&self, sender: SendRequest<Full<Bytes>>) {
        if sender.is_closed() {
            return;
        }
        let mut pool = self.pool.lock().await;
        if pool.len() < POOL_SIZE {
            pool.push(sender);
        }
    }

    async fn connect(&self) -> Result<SendRequest<Full<Bytes>>, DohError> {
        let upstream = &self.config.upstream;
        let tcp = self.dialer.connect(upstream.addr).await?;
        let stream = FragmentStream::with_spec(tcp, self.config.fragment);

        let server_name = rustls::pki_types::ServerName::try_from(upstream.sni.clone())
            .map_err(|_| DohError::Tls(format!("invalid server name '{}'", upstream.sni)))?;
        let tls_stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| DohError::Tls(e.to_string()))?;

        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        debug!("DoH connection to {} ({})", upstream.addr, upstream.sni);
        handshake(tls_stream).await
    }

    async fn exchange_once(&self, query: &[u8]) -> Result<Vec<u8>, DohError> {
        let request = self.build_request(query)?;
        let mut sender = self.checkout().await?;
        let response = send(&mut sender, request).await?;
        self.checkin(sender).await;
        Ok(response)
    }
}

#[async_trait]
impl DnsExchange for DohClient {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, DohError> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let result = tokio::time::timeout(self.config.timeout, self.exchange_once(query))
            .await
            .unwrap_or(Err(DohError::Timeout));

        if result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// HTTP/1.1 handshake over an established stream
async fn handshake<S>(io: S) -> Result<SendRequest<Full<Bytes>>, DohError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(io);
    let (sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| DohError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("DoH connection error: {}", e);
        }
    });

    Ok(sender)
}

/// Send one request and collect the DNS answer
async fn send(
    sender: &mut SendRequest<Full<Bytes>>,
    request: Request<Full<Bytes>>,
) -> Result<Vec<u8>, DohError> {
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| DohError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DohError::Status(status.as_u16()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| DohError::Http(e.to_string()))?
        .to_bytes();

    if body.len() > MAX_RESPONSE_SIZE {
        return Err(DohError::ResponseTooLarge(body.len()));
    }
    Ok(body.to_vec())
}
