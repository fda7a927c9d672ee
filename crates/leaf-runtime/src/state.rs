//! Runtime lifecycle state
//!
//! ```text
//! Stopped ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!                 │          │  ▲
//!                 │          ▼  │
//!                 │        Reloading
//!                 └──(failure)──────────────────▶ Stopped
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a [`ProxyRuntime`](crate::ProxyRuntime)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Reloading = 3,
    Stopping = 4,
}

impl RuntimeState {
    /// Serving traffic (a reload keeps the previous configuration active)
    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Running | RuntimeState::Reloading)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RuntimeState::Starting,
            2 => RuntimeState::Running,
            3 => RuntimeState::Reloading,
            4 => RuntimeState::Stopping,
            _ => RuntimeState::Stopped,
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Stopped => "stopped",
            RuntimeState::Starting => "starting",
            RuntimeState::Running => "running",
            RuntimeState::Reloading => "reloading",
            RuntimeState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Lock-free state cell shared between the actor and callers
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: RuntimeState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> RuntimeState {
        RuntimeState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: RuntimeState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
