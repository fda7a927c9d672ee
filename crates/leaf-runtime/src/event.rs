//! Lifecycle events for host UIs
//!
//! Emission is fire-and-forget: a slow, lagging or absent subscriber never
//! blocks a transition.

use crate::runtime::{ReloadError, StartError};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast buffer; older events are dropped for lagging subscribers
const EVENT_CAPACITY: usize = 64;

/// Lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Reloaded,
    /// Host-side permission problem (e.g. VPN consent revoked)
    PermissionError,
    StartFailed(StartError),
    ReloadFailed(ReloadError),
}

impl Event {
    /// Stable string tag
    pub fn tag(&self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Reloaded => "reloaded",
            Event::PermissionError => "permission_error",
            Event::StartFailed(_) => "start_failed",
            Event::ReloadFailed(_) => "reload_failed",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::StartFailed(e) => write!(f, "{}: {}", self.tag(), e),
            Event::ReloadFailed(e) => write!(f, "{}: {}", self.tag(), e),
            _ => f.write_str(self.tag()),
        }
    }
}

/// Receiver of lifecycle events
pub trait EventSink: Send + Sync + 'static {
    /// Must not block
    fn emit(&self, event: Event);
}

/// Sink delivering over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: Event) {
        debug!("Event: {}", event);
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn emit(&self, event: Event) {
        self(event)
    }
}
