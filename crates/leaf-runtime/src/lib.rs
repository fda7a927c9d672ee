//! Leaf Runtime - Proxy Core Lifecycle Control
//!
//! Starts, reloads and stops one proxy instance bound to a host-provided
//! TUN descriptor, and reports every transition as an [`Event`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Host (VPN service)                    │
//! │   start(tun, config) / reload / stop      protect(fd) ◀──┐   │
//! └───────────────┬──────────────────────────────────────────│───┘
//!                 ▼                                          │
//!        ┌─────────────────┐  commands (FIFO)  ┌──────────────┴──┐
//!        │  ProxyRuntime   │──────────────────▶│  actor task     │
//!        │  is_running()   │◀── AtomicState ───│  one transition │
//!        └─────────────────┘                   │  at a time      │
//!                 ▲                            └──┬─────────┬────┘
//!                 │ Event (broadcast)             │         │
//!                                                 ▼         ▼
//!                                       ProxyEngine    DohRuntime
//!                                      (TUN, SOCKS,    (UDP ▶ HTTPS)
//!                                       outbounds)
//! ```
//!
//! # Guarantees
//!
//! - Transitions are serialized in submission order
//! - A failed start leaves nothing running
//! - A failed reload leaves the previous configuration active
//! - Stop is idempotent and emits `Stopped` only when something ran

mod builtin;
mod engine;
mod event;
mod handle;
mod runtime;
mod state;
mod tasks;
mod tun;

pub use builtin::{
    BoxedStream, BuiltinEngine, Dispatcher, DnsError, GroupState, MemberHealth, OutboundError,
    ProxyStream, Resolver, Router, SocksError, SocksInbound, TargetAddr,
};
pub use engine::{EngineError, EngineInstance, EngineSession, ProxyEngine};
pub use event::{BroadcastSink, Event, EventSink};
pub use handle::RuntimeHandle;
pub use runtime::{ProxyRuntime, ReloadError, StartError, Transition};
pub use state::RuntimeState;
pub use tasks::ConnectionTasks;
pub use tun::{TunDevice, TunError, TunStats};

pub use leaf_net::{NoopProtector, SocketHandle, SocketProtector};
