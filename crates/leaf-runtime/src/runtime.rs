//! Proxy Runtime
//!
//! Serializes lifecycle transitions through a single command actor.
//!
//! # Usage
//!
//! ```rust,ignore
//! let runtime = ProxyRuntime::builtin(RuntimeOptions::default());
//! runtime.set_protector(Arc::new(|fd| vpn_service_protect(fd)));
//!
//! let handle = runtime.start(&tun_fd, config).await?;
//! runtime.reload(new_config).await?;
//! runtime.stop().await;
//! ```
//!
//! Every call returns at once with a [`Transition`]. Awaiting it yields the
//! outcome; dropping it does not cancel anything. Transitions run strictly
//! in submission order, one at a time.

use crate::builtin::BuiltinEngine;
use crate::engine::{EngineInstance, EngineSession, ProxyEngine};
use crate::event::{BroadcastSink, Event, EventSink};
use crate::handle::RuntimeHandle;
use crate::state::{AtomicState, RuntimeState};
use crate::tasks::ConnectionTasks;
use crate::tun::{TunDevice, TunError};
use leaf_config::{Configuration, ReloadPolicy, RuntimeOptions, ValidationError};
use leaf_doh::{DohConfig, DohRuntime};
use leaf_net::{DialerConfig, NoopProtector, ProtectedDialer, SocketProtector};
use std::future::Future;
use std::os::fd::{AsFd, OwnedFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Pending outcome of a lifecycle operation
///
/// Resolves once the actor has served the request. Dropping it leaves the
/// transition running.
#[must_use = "dropping a Transition does not cancel it, but its outcome is lost"]
pub struct Transition<T> {
    rx: oneshot::Receiver<T>,
    interrupted: fn() -> T,
}

impl<T> Future for Transition<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            // Actor gone (tokio runtime shutting down)
            Poll::Ready(Err(_)) => Poll::Ready((self.interrupted)()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Actor commands
enum Command {
    Start {
        tun: Result<OwnedFd, TunError>,
        config: Configuration,
        reply: oneshot::Sender<Result<RuntimeHandle, StartError>>,
    },
    Reload {
        config: Configuration,
        reply: oneshot::Sender<Result<(), ReloadError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetProtector(Option<Arc<dyn SocketProtector>>),
}

/// State readable without going through the actor
struct Shared {
    state: AtomicState,
    events: BroadcastSink,
    sink: Option<Arc<dyn EventSink>>,
    doh_running: AtomicBool,
}

impl Shared {
    fn emit(&self, event: Event) {
        if let Some(ref sink) = self.sink {
            sink.emit(event.clone());
        }
        self.events.emit(event);
    }
}

/// Lifecycle controller for one proxy instance
pub struct ProxyRuntime {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ProxyRuntime {
    /// Create a runtime driving `engine`
    ///
    /// Must be called inside a tokio runtime; the actor task is spawned here.
    pub fn new(engine: Arc<dyn ProxyEngine>, options: RuntimeOptions) -> Self {
        Self::build(engine, options, None)
    }

    /// Create a runtime that also reports events to `sink`
    pub fn with_sink(
        engine: Arc<dyn ProxyEngine>,
        options: RuntimeOptions,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::build(engine, options, Some(sink))
    }

    /// Runtime with the built-in engine
    pub fn builtin(options: RuntimeOptions) -> Self {
        Self::new(Arc::new(BuiltinEngine::new()), options)
    }

    fn build(
        engine: Arc<dyn ProxyEngine>,
        options: RuntimeOptions,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: AtomicState::new(RuntimeState::Stopped),
            events: BroadcastSink::new(),
            sink,
            doh_running: AtomicBool::new(false),
        });
        let (commands, rx) = mpsc::unbounded_channel();

        let actor = Actor {
            engine,
            options,
            shared: shared.clone(),
            protector: None,
            active: None,
        };
        tokio::spawn(actor.run(rx));

        Self { commands, shared }
    }

    /// Start on the host's TUN descriptor
    ///
    /// The descriptor is duplicated before this returns; the host may close
    /// its own copy at any time afterwards.
    pub fn start(
        &self,
        tun: impl AsFd,
        config: Configuration,
    ) -> Transition<Result<RuntimeHandle, StartError>> {
        let tun = TunDevice::duplicate(tun.as_fd());
        self.submit(
            |reply| Command::Start { tun, config, reply },
            || Err(StartError::Interrupted),
        )
    }

    /// Replace the configuration of the running instance
    pub fn reload(&self, config: Configuration) -> Transition<Result<(), ReloadError>> {
        self.submit(
            |reply| Command::Reload { config, reply },
            || Err(ReloadError::Interrupted),
        )
    }

    /// Stop the running instance; no-op when stopped
    pub fn stop(&self) -> Transition<()> {
        self.submit(|reply| Command::Stop { reply }, || ())
    }

    /// Lock-free; true while Running or Reloading
    pub fn is_running(&self) -> bool {
        self.shared.state.get().is_running()
    }

    pub fn state(&self) -> RuntimeState {
        self.shared.state.get()
    }

    pub fn is_doh_running(&self) -> bool {
        self.shared.doh_running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Register the host protector used from the next start on
    pub fn set_protector(&self, protector: Arc<dyn SocketProtector>) {
        let _ = self.commands.send(Command::SetProtector(Some(protector)));
    }

    pub fn clear_protector(&self) {
        let _ = self.commands.send(Command::SetProtector(None));
    }

    /// Forward a host-side permission failure to subscribers
    pub fn report_permission_error(&self) {
        warn!("Host reported a permission error");
        self.shared.emit(Event::PermissionError);
    }

    fn submit<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
        interrupted: fn() -> T,
    ) -> Transition<T> {
        let (tx, rx) = oneshot::channel();
        // On failure the reply sender is dropped and the transition
        // resolves to `interrupted`.
        let _ = self.commands.send(command(tx));
        Transition { rx, interrupted }
    }
}

/// Resources of the running instance
struct Active {
    handle: RuntimeHandle,
    instance: Box<dyn EngineInstance>,
    tasks: ConnectionTasks,
    tun: Arc<TunDevice>,
    doh: DohRuntime,
    options: Arc<RuntimeOptions>,
}

/// Owns every mutable piece of runtime state
struct Actor {
    engine: Arc<dyn ProxyEngine>,
    options: RuntimeOptions,
    shared: Arc<Shared>,
    protector: Option<Arc<dyn SocketProtector>>,
    active: Option<Active>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Start { tun, config, reply } => {
                    let result = self.start(tun, config).await;
                    if let Err(ref e) = result {
                        self.shared.emit(Event::StartFailed(e.clone()));
                    }
                    let _ = reply.send(result);
                }
                Command::Reload { config, reply } => {
                    let result = self.reload(config).await;
                    if let Err(ref e) = result {
                        self.shared.emit(Event::ReloadFailed(e.clone()));
                    }
                    let _ = reply.send(result);
                }
                Command::Stop { reply } => {
                    self.stop().await;
                    let _ = reply.send(());
                }
                Command::SetProtector(protector) => {
                    debug!("Protector {}", if protector.is_some() { "registered" } else { "cleared" });
                    self.protector = protector;
                }
            }
        }

        // Every ProxyRuntime is gone.
        self.stop().await;
    }

    async fn start(
        &mut self,
        tun: Result<OwnedFd, TunError>,
        config: Configuration,
    ) -> Result<RuntimeHandle, StartError> {
        if self.shared.state.get() != RuntimeState::Stopped {
            return Err(StartError::AlreadyRunning);
        }

        self.shared.state.set(RuntimeState::Starting);
        match self.bring_up(tun, config).await {
            Ok(active) => {
                let handle = active.handle.clone();
                self.shared
                    .doh_running
                    .store(active.doh.is_running(), Ordering::SeqCst);
                self.active = Some(active);
                self.shared.state.set(RuntimeState::Running);

                info!(
                    "Runtime started (tun fd {}, inbound {:?})",
                    handle.tun_fd(),
                    handle.local_addr()
                );
                self.shared.emit(Event::Started);
                Ok(handle)
            }
            Err(e) => {
                warn!("Runtime start failed: {}", e);
                self.shared.state.set(RuntimeState::Stopped);
                Err(e)
            }
        }
    }

    /// Start every part in order, tearing down what started on failure
    async fn bring_up(
        &self,
        tun: Result<OwnedFd, TunError>,
        config: Configuration,
    ) -> Result<Active, StartError> {
        leaf_config::validate(&config)?;
        let options = Arc::new(self.options.clone().with_env(&config.env));

        let tun = tun
            .and_then(TunDevice::from_owned)
            .map_err(|e| StartError::BindFailed(e.to_string()))?;
        let tun = Arc::new(tun);

        let protector: Arc<dyn SocketProtector> = match self.protector {
            Some(ref p) => p.clone(),
            None => Arc::new(NoopProtector),
        };
        let dialer = ProtectedDialer::new(
            protector,
            DialerConfig {
                enable_ipv6: options.enable_ipv6,
                prefer_ipv6: options.prefer_ipv6,
                ..Default::default()
            },
        );

        let mut doh = DohRuntime::new(dialer.clone());
        if let Some(def) = config.active_doh() {
            let doh_config = DohConfig::from_dns_def(def, &options.user_agent)
                .map_err(|e| StartError::DohBindFailed(e.to_string()))?;
            doh.start(doh_config)
                .await
                .map_err(|e| StartError::DohBindFailed(e.to_string()))?;
        }

        let tasks = ConnectionTasks::new();
        let session = EngineSession {
            tun: tun.clone(),
            config: Arc::new(config),
            dialer,
            options: options.clone(),
            tasks: tasks.clone(),
        };

        let instance = match self.engine.start(session).await {
            Ok(instance) => instance,
            Err(e) => {
                tasks.shutdown(Duration::ZERO).await;
                doh.stop().await;
                return Err(StartError::Engine(e.to_string()));
            }
        };

        let handle = RuntimeHandle::new(
            tun.raw_fd(),
            tun.shared_stats(),
            instance.local_addr(),
            self.protector.is_some(),
        );
        Ok(Active {
            handle,
            instance,
            tasks,
            tun,
            doh,
            options,
        })
    }

    async fn reload(&mut self, config: Configuration) -> Result<(), ReloadError> {
        if self.shared.state.get() != RuntimeState::Running {
            return Err(ReloadError::NotRunning);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(ReloadError::NotRunning);
        };

        self.shared.state.set(RuntimeState::Reloading);
        let result = apply_reload(active, config, &self.options).await;
        self.shared
            .doh_running
            .store(active.doh.is_running(), Ordering::SeqCst);
        self.shared.state.set(RuntimeState::Running);

        match result {
            Ok(()) => {
                info!("Runtime reloaded (generation {})", active.handle.generation());
                self.shared.emit(Event::Reloaded);
                Ok(())
            }
            Err(e) => {
                warn!("Reload failed, previous configuration stays active: {}", e);
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.shared.state.set(RuntimeState::Stopping);

        let Active {
            handle,
            mut instance,
            tasks,
            tun,
            mut doh,
            options,
        } = active;

        instance.shutdown().await;
        tasks.shutdown(options.stop_grace()).await;
        // Dropping the engine releases the dialer and with it the protector.
        drop(instance);
        info!("TUN {}", tun.stats().format());
        drop(tun);
        doh.stop().await;

        handle.invalidate();
        self.shared.doh_running.store(false, Ordering::SeqCst);
        self.shared.state.set(RuntimeState::Stopped);
        info!("Runtime stopped");
        self.shared.emit(Event::Stopped);
    }
}

/// Apply a new configuration to the running instance
///
/// DoH is swapped first, then the engine. If the engine refuses, the
/// previous DoH listener is restored.
async fn apply_reload(
    active: &mut Active,
    config: Configuration,
    base: &RuntimeOptions,
) -> Result<(), ReloadError> {
    leaf_config::validate(&config)?;
    let options = base.clone().with_env(&config.env);

    let new_doh = config
        .active_doh()
        .map(|def| DohConfig::from_dns_def(def, &options.user_agent))
        .transpose()
        .map_err(|e| ReloadError::DohBindFailed(e.to_string()))?;
    let old_doh = active.doh.config().cloned();
    let doh_changed = new_doh != old_doh;

    if doh_changed {
        swap_doh(&mut active.doh, old_doh.clone(), new_doh).await?;
    }

    if let Err(e) = active.instance.reload(Arc::new(config)).await {
        if doh_changed {
            active.doh.stop().await;
            if let Some(old) = old_doh {
                if let Err(e) = active.doh.start(old).await {
                    warn!("Could not restore previous DoH listener: {}", e);
                }
            }
        }
        return Err(ReloadError::Engine(e.to_string()));
    }

    active
        .tasks
        .next_generation(options.reload_policy == ReloadPolicy::Cut);
    active.options = Arc::new(options);
    active.handle.bump_generation();
    Ok(())
}

async fn swap_doh(
    doh: &mut DohRuntime,
    old: Option<DohConfig>,
    new: Option<DohConfig>,
) -> Result<(), ReloadError> {
    doh.stop().await;
    let Some(new) = new else {
        return Ok(());
    };

    if let Err(e) = doh.start(new).await {
        if let Some(old) = old {
            if let Err(restore) = doh.start(old).await {
                warn!("Could not restore previous DoH listener: {}", restore);
            }
        }
        return Err(ReloadError::DohBindFailed(e.to_string()));
    }
    Ok(())
}

/// Start failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("runtime already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("cannot take TUN descriptor: {0}")]
    BindFailed(String),

    #[error("DoH listener failed: {0}")]
    DohBindFailed(String),

    #[error("engine failed to start: {0}")]
    Engine(String),

    #[error("runtime shut down before the start completed")]
    Interrupted,
}

/// Reload failures; the previous configuration stays active
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReloadError {
    #[error("runtime not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("DoH listener failed: {0}")]
    DohBindFailed(String),

    #[error("engine rejected configuration: {0}")]
    Engine(String),

    #[error("runtime shut down before the reload completed")]
    Interrupted,
}
