//! Periodic background loops and the handle that stops them.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::worker_loop::WorkerPool;

/// Handle to one periodic loop.
pub struct LoopHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    /// Run `tick` every `interval` until shutdown. A tick in progress is
    /// allowed to finish.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(loop_name = name, "background loop stopped");
        });
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            error!(loop_name = self.name, error = %err, "background loop ended abnormally");
        }
    }
}

/// Everything `Runtime::start` spawned.
pub struct BackgroundTasks {
    pub(crate) workers: WorkerPool,
    pub(crate) reaper: LoopHandle,
    pub(crate) sweeper: LoopHandle,
}

impl BackgroundTasks {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new work, then wait for every loop. In-flight jobs run to
    /// completion first.
    pub async fn shutdown(self) {
        self.workers.request_shutdown();
        self.reaper.request_shutdown();
        self.sweeper.request_shutdown();

        self.workers.shutdown_and_join().await;
        self.reaper.shutdown_and_join().await;
        self.sweeper.shutdown_and_join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loop_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = {
            let ticks = Arc::clone(&ticks);
            LoopHandle::spawn("counter", Duration::from_millis(5), move || {
                let ticks = Arc::clone(&ticks);
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.shutdown_and_join().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {seen} ticks");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
