//! Periodic background cleanup.
//!
//! Every TTL-bounded store (nonces, duplicate hashes, sessions, pending
//! handshakes) is swept by a tokio task owned by whoever created the store.
//! Dropping the handle stops the task.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Something with expired entries to discard.
pub trait Sweep: Send + Sync + 'static {
    /// Remove expired entries, returning how many were removed.
    fn sweep(&self) -> usize;
}

impl<F> Sweep for F
where
    F: Fn() -> usize + Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        self()
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Run `target.sweep()` every `interval` until the handle is shut down or dropped.
///
/// The first sweep happens one full interval after spawning.
pub fn spawn_sweeper<S: Sweep>(name: &'static str, interval: Duration, target: S) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = target.sweep();
                    if removed > 0 {
                        debug!(sweeper = name, removed, "swept expired entries");
                    } else {
                        trace!(sweeper = name, "sweep found nothing");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(sweeper = name, "sweeper stopping");
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle {
        name,
        shutdown_tx,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = spawn_sweeper("test", Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_sweeping() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = spawn_sweeper("test", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst)
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown().await;
        let seen = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = spawn_sweeper("test", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            1
        });
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
