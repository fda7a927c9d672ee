//! Lifecycle tests against loopback sockets and socketpair TUN stand-ins

use async_trait::async_trait;
use leaf_config::{Configuration, ReloadPolicy, RuntimeOptions, ValidationError};
use leaf_runtime::{
    BuiltinEngine, EngineError, EngineInstance, EngineSession, Event, ProxyEngine, ProxyRuntime,
    ReloadError, RuntimeState, SocketHandle, SocketProtector, StartError,
};
use std::net::SocketAddr;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

const DIRECT: &str = "[General]\nsocks-port = 0\n[Proxy]\nDirect = direct\n[Rule]\nFINAL, Direct\n";
const REJECT: &str = "[General]\nsocks-port = 0\n[Proxy]\nBlock = reject\n[Rule]\nFINAL, Block\n";

fn config(text: &str) -> Configuration {
    leaf_config::parse(text).unwrap()
}

fn tun_pair() -> (UnixDatagram, UnixDatagram) {
    UnixDatagram::pair().unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event within 5s")
        .unwrap()
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Open a SOCKS5 CONNECT to an IPv4 target, returning the reply code
async fn socks_connect(inbound: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
    let SocketAddr::V4(target) = target else {
        panic!("IPv4 target expected");
    };
    let mut stream = TcpStream::connect(inbound).await.unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply[1])
}

async fn assert_echoes(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

/// Engine that takes a while to start, for ordering tests
struct SlowEngine {
    delay: Duration,
}

struct SlowInstance;

#[async_trait]
impl ProxyEngine for SlowEngine {
    async fn start(&self, _session: EngineSession) -> Result<Box<dyn EngineInstance>, EngineError> {
        tokio::time::sleep(self.delay).await;
        Ok(Box::new(SlowInstance))
    }
}

#[async_trait]
impl EngineInstance for SlowInstance {
    async fn reload(&mut self, _config: Arc<Configuration>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn shutdown(&mut self) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[tokio::test]
async fn test_start_and_stop() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let mut events = runtime.subscribe();
    let (tun, _peer) = tun_pair();

    let handle = runtime.start(&tun, config(DIRECT)).await.unwrap();
    assert!(runtime.is_running());
    assert_eq!(runtime.state(), RuntimeState::Running);
    assert!(handle.is_active());
    assert!(!handle.is_protected());
    assert!(handle.local_addr().is_some());
    assert_eq!(next_event(&mut events).await, Event::Started);

    runtime.stop().await;
    assert!(!runtime.is_running());
    assert!(!handle.is_active());
    assert_eq!(next_event(&mut events).await, Event::Stopped);
}

#[tokio::test]
async fn test_stop_restores_descriptor_mode() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let (tun, peer) = tun_pair();
    let before = rustix::fs::fcntl_getfl(&tun).unwrap();

    runtime.start(&tun, config(DIRECT)).await.unwrap();
    runtime.stop().await;
    assert_eq!(rustix::fs::fcntl_getfl(&tun).unwrap(), before);

    // Blocking reads work again on the host's side.
    peer.send(&[0x45; 20]).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(tun.recv(&mut buf).unwrap(), 20);
}

#[tokio::test]
async fn test_host_may_close_its_descriptor() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let (tun, peer) = tun_pair();

    let transition = runtime.start(&tun, config(DIRECT));
    drop(tun);
    let handle = transition.await.unwrap();

    peer.send(&[0x45; 20]).unwrap();
    assert!(handle.tun_fd() >= 0);
    runtime.stop().await;
}

#[tokio::test]
async fn test_start_twice() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let (tun, _peer) = tun_pair();

    runtime.start(&tun, config(DIRECT)).await.unwrap();
    let second = runtime.start(&tun, config(DIRECT)).await;
    assert_eq!(second.unwrap_err(), StartError::AlreadyRunning);
    assert!(runtime.is_running());

    runtime.stop().await;
}

#[tokio::test]
async fn test_invalid_config() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let mut events = runtime.subscribe();
    let (tun, _peer) = tun_pair();

    let result = runtime
        .start(&tun, config("[Proxy]\nDirect = direct\n[Rule]\nDOMAIN, a.com, Direct\n"))
        .await;
    let expected = StartError::InvalidConfig(ValidationError::MissingFinal);
    assert_eq!(result.unwrap_err(), expected);
    assert_eq!(next_event(&mut events).await, Event::StartFailed(expected));
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}

#[tokio::test]
async fn test_readonly_descriptor() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let file = std::fs::File::open("/dev/null").unwrap();

    let result = runtime.start(&file, config(DIRECT)).await;
    assert!(matches!(result, Err(StartError::BindFailed(_))));
    assert!(!runtime.is_running());
}

#[tokio::test]
async fn test_doh_bind_failure_fails_start() {
    let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let (tun, _peer) = tun_pair();
    let text = format!(
        "[General]\nsocks-port = 0\n[Proxy]\nDirect = direct\n\
         [Dns]\nCF = doh, 104.21.233.179, 443, domain=cloudflare-dns.com, listen=127.0.0.1:{}\n\
         [Rule]\nFINAL, Direct\n",
        port
    );

    let before = rustix::fs::fcntl_getfl(&tun).unwrap();

    let result = runtime.start(&tun, config(&text)).await;
    assert!(matches!(result, Err(StartError::DohBindFailed(_))));
    assert!(!runtime.is_running());
    assert!(!runtime.is_doh_running());
    assert_eq!(rustix::fs::fcntl_getfl(&tun).unwrap(), before);
}

#[tokio::test]
async fn test_doh_runs_with_instance() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let (tun, _peer) = tun_pair();
    let text = "[General]\nsocks-port = 0\n[Proxy]\nDirect = direct\n\
                [Dns]\nCF = doh, 104.21.233.179, 443, domain=cloudflare-dns.com, listen=127.0.0.1:0\n\
                [Rule]\nFINAL, Direct\n";

    runtime.start(&tun, config(text)).await.unwrap();
    assert!(runtime.is_doh_running());

    // Dropping the [Dns] section on reload stops the listener.
    runtime.reload(config(DIRECT)).await.unwrap();
    assert!(!runtime.is_doh_running());

    runtime.stop().await;
    assert!(!runtime.is_doh_running());
}

#[tokio::test]
async fn test_reload_requires_running() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let mut events = runtime.subscribe();

    let result = runtime.reload(config(DIRECT)).await;
    assert_eq!(result, Err(ReloadError::NotRunning));
    assert_eq!(
        next_event(&mut events).await,
        Event::ReloadFailed(ReloadError::NotRunning)
    );
}

#[tokio::test]
async fn test_reload_bumps_generation() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let mut events = runtime.subscribe();
    let (tun, _peer) = tun_pair();

    let handle = runtime.start(&tun, config(DIRECT)).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Started);
    assert_eq!(handle.generation(), 0);

    runtime.reload(config(DIRECT)).await.unwrap();
    assert_eq!(handle.generation(), 1);
    assert_eq!(next_event(&mut events).await, Event::Reloaded);

    // Invalid reload keeps the instance and the generation.
    let bad = runtime.reload(config("[Proxy]\nA = direct\n[Rule]\nFINAL, Missing\n")).await;
    assert_eq!(
        bad,
        Err(ReloadError::InvalidConfig(ValidationError::UnknownReference("Missing".into())))
    );
    assert!(runtime.is_running());
    assert_eq!(handle.generation(), 1);

    runtime.stop().await;
}

#[tokio::test]
async fn test_drain_reload_keeps_open_connections() {
    let echo = echo_server().await;
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let (tun, peer) = tun_pair();
    let handle = runtime.start(&tun, config(DIRECT)).await.unwrap();
    let inbound = handle.local_addr().unwrap();
    let tun_fd = handle.tun_fd();

    let (mut old, reply) = socks_connect(inbound, echo).await;
    assert_eq!(reply, 0);
    assert_echoes(&mut old, b"before").await;

    runtime.reload(config(REJECT)).await.unwrap();

    // The old connection keeps relaying under the old rules.
    assert_echoes(&mut old, b"after").await;
    // New connections follow the new rules.
    let (_new, reply) = socks_connect(inbound, echo).await;
    assert_eq!(reply, 0x02);

    // Same TUN duplicate, and the pump still reads from it.
    assert_eq!(handle.tun_fd(), tun_fd);
    peer.send(&[0x45; 20]).unwrap();
    for _ in 0..100 {
        if handle.tun_stats().packets_in.load(Ordering::Relaxed) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.tun_stats().packets_in.load(Ordering::Relaxed), 1);

    drop(old);
    runtime.stop().await;
}

#[tokio::test]
async fn test_cut_reload_severs_open_connections() {
    let echo = echo_server().await;
    let options = RuntimeOptions {
        reload_policy: ReloadPolicy::Cut,
        ..RuntimeOptions::default()
    };
    let runtime = ProxyRuntime::builtin(options);
    let (tun, _peer) = tun_pair();
    let handle = runtime.start(&tun, config(DIRECT)).await.unwrap();
    let inbound = handle.local_addr().unwrap();
    let tun_fd = handle.tun_fd();

    let (mut old, reply) = socks_connect(inbound, echo).await;
    assert_eq!(reply, 0);
    assert_echoes(&mut old, b"before").await;

    runtime.reload(config(DIRECT)).await.unwrap();
    assert_eq!(handle.tun_fd(), tun_fd);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), old.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // Connections opened after the reload relay normally.
    let (mut new, reply) = socks_connect(inbound, echo).await;
    assert_eq!(reply, 0);
    assert_echoes(&mut new, b"fresh").await;

    drop(new);
    runtime.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let mut events = runtime.subscribe();

    runtime.stop().await;
    runtime.stop().await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    let (tun, _peer) = tun_pair();
    runtime.start(&tun, config(DIRECT)).await.unwrap();
    runtime.stop().await;
    runtime.stop().await;

    assert_eq!(next_event(&mut events).await, Event::Started);
    assert_eq!(next_event(&mut events).await, Event::Stopped);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_transitions_run_in_order() {
    let engine = Arc::new(SlowEngine {
        delay: Duration::from_millis(100),
    });
    let runtime = ProxyRuntime::new(engine, RuntimeOptions::default());
    let mut events = runtime.subscribe();
    let (tun, _peer) = tun_pair();

    let start = runtime.start(&tun, config(DIRECT));
    let reload = runtime.reload(config(DIRECT));
    let stop = runtime.stop();
    assert!(!runtime.is_running());

    assert!(start.await.is_ok());
    assert_eq!(reload.await, Ok(()));
    stop.await;

    assert_eq!(next_event(&mut events).await, Event::Started);
    assert_eq!(next_event(&mut events).await, Event::Reloaded);
    assert_eq!(next_event(&mut events).await, Event::Stopped);
}

#[tokio::test]
async fn test_dropped_transition_still_runs() {
    let engine = Arc::new(SlowEngine {
        delay: Duration::from_millis(50),
    });
    let runtime = ProxyRuntime::new(engine, RuntimeOptions::default());
    let (tun, _peer) = tun_pair();

    drop(runtime.start(&tun, config(DIRECT)));
    assert_eq!(runtime.reload(config(DIRECT)).await, Ok(()));
    assert!(runtime.is_running());
    runtime.stop().await;
}

#[tokio::test]
async fn test_failover_through_inbound() {
    let echo = echo_server().await;
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

    let text = format!(
        "[General]\nsocks-port = 0\n\
         [Proxy]\nDead = socks, 127.0.0.1, {}\nDirect = direct\n\
         [Proxy Group]\nAuto = failover, Dead, Direct, fail-timeout=2\n\
         [Rule]\nFINAL, Auto\n",
        dead.port()
    );

    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let mut events = runtime.subscribe();
    let (tun, _peer) = tun_pair();
    let handle = runtime.start(&tun, config(&text)).await.unwrap();
    let inbound = handle.local_addr().unwrap();

    let (mut stream, reply) = socks_connect(inbound, echo).await;
    assert_eq!(reply, 0);
    assert_echoes(&mut stream, b"through").await;

    // A failing member is handled inside the group; the runtime stays up.
    assert_eq!(next_event(&mut events).await, Event::Started);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(runtime.is_running());

    drop(stream);
    runtime.stop().await;
    assert_eq!(next_event(&mut events).await, Event::Stopped);
}

#[tokio::test]
async fn test_protector_rejection_fails_connection_only() {
    let echo = echo_server().await;
    let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
    let protector: Arc<dyn SocketProtector> = Arc::new(|_socket: SocketHandle| false);
    runtime.set_protector(protector);

    let (tun, _peer) = tun_pair();
    let handle = runtime.start(&tun, config(DIRECT)).await.unwrap();
    assert!(handle.is_protected());

    let (_stream, reply) = socks_connect(handle.local_addr().unwrap(), echo).await;
    assert_eq!(reply, 0x05);
    assert!(runtime.is_running());

    runtime.stop().await;
}

#[tokio::test]
async fn test_stop_cuts_open_connections() {
    let echo = echo_server().await;
    let options = RuntimeOptions {
        stop_grace_secs: 0,
        ..RuntimeOptions::default()
    };
    let runtime = ProxyRuntime::builtin(options);
    let (tun, _peer) = tun_pair();
    let handle = runtime.start(&tun, config(DIRECT)).await.unwrap();

    let (mut stream, reply) = socks_connect(handle.local_addr().unwrap(), echo).await;
    assert_eq!(reply, 0);

    tokio::time::timeout(Duration::from_secs(5), runtime.stop())
        .await
        .unwrap();

    // The relay is gone; the client sees EOF or a reset.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_custom_sink_receives_events() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sink = Arc::new(move |event: Event| {
        let _ = tx.send(event.tag());
    });
    let runtime = ProxyRuntime::with_sink(
        Arc::new(BuiltinEngine::new()),
        RuntimeOptions::default(),
        sink,
    );
    let (tun, _peer) = tun_pair();

    runtime.start(&tun, config(DIRECT)).await.unwrap();
    runtime.report_permission_error();
    runtime.stop().await;

    assert_eq!(rx.recv().await, Some("started"));
    assert_eq!(rx.recv().await, Some("permission_error"));
    assert_eq!(rx.recv().await, Some("stopped"));
}
