//! Forwarding task set
//!
//! Every relayed connection runs as a task tracked here. Tasks spawned
//! under one configuration generation share a cancellation token, so a
//! reload with [`ReloadPolicy::Cut`](leaf_config::ReloadPolicy) can drop
//! exactly the connections opened before it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Shared handle to the forwarding tasks of one runtime session
#[derive(Clone)]
pub struct ConnectionTasks {
    tracker: TaskTracker,
    /// Parent of every generation token; cancelled on forced teardown
    root: CancellationToken,
    generation: Arc<watch::Sender<CancellationToken>>,
}

impl ConnectionTasks {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let (generation, _) = watch::channel(root.child_token());
        Self {
            tracker: TaskTracker::new(),
            root,
            generation: Arc::new(generation),
        }
    }

    /// Spawn a forwarding task under the current generation
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.generation.borrow().clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// Token of the current generation, for long-lived helpers
    pub fn current_token(&self) -> CancellationToken {
        self.generation.borrow().clone()
    }

    /// Start a new generation; with `cut`, cancel the previous one
    pub fn next_generation(&self, cut: bool) {
        let previous = self.generation.send_replace(self.root.child_token());
        if cut {
            debug!("Cancelling connections of the previous configuration");
            previous.cancel();
        }
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Close the tracker, wait up to `grace` for the tasks to finish, then
    /// cancel what is left
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} connection(s) still open after {:?}, aborting",
                self.tracker.len(),
                grace
            );
            self.root.cancel();
            self.tracker.wait().await;
        }
    }
}

impl Default for ConnectionTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_shutdown_waits_for_short_tasks() {
        let tasks = ConnectionTasks::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        tasks.shutdown(Duration::from_secs(2)).await;
        assert!(done.load(Ordering::SeqCst));
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stragglers() {
        let tasks = ConnectionTasks::new();
        tasks.spawn(std::future::pending());
        assert_eq!(tasks.len(), 1);

        let started = tokio::time::Instant::now();
        tasks.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_cut_cancels_previous_generation() {
        let tasks = ConnectionTasks::new();
        tasks.spawn(std::future::pending());

        tasks.next_generation(false);
        tokio::task::yield_now().await;
        assert_eq!(tasks.len(), 1);

        tasks.spawn(std::future::pending());
        tasks.next_generation(true);
        for _ in 0..100 {
            if tasks.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The second task belonged to the cut generation; the first to the
        // drained one, which stays alive.
        assert_eq!(tasks.len(), 1);
    }
}
