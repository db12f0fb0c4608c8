//! Named background tasks with a shared shutdown signal.
//!
//! Every task the engine runs in the background (retry drain, wait expiry,
//! user-scheduled work) is spawned here so shutdown can signal them all and
//! wait for each one, bounded by the drain timeout.

use crate::error::{EngineError, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
}

pub struct ExecutionService {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<NamedTask>>,
}

impl Default for ExecutionService {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionService {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receiver that flips to `true` when shutdown starts. Long-running
    /// futures passed to [`execute`](Self::execute) should watch it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn `future` as a named task.
    pub fn execute<F>(&self, name: impl Into<String>, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        let name = name.into();
        debug!(task = %name, "Spawning task");
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(NamedTask { name, handle });
        Ok(())
    }

    /// Run `task` once after `delay`, unless shutdown starts first.
    pub fn schedule<F>(&self, name: impl Into<String>, delay: Duration, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_signal();
        self.execute(name, async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task(),
                _ = async {
                    while shutdown_rx.changed().await.is_ok() {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                } => {}
            }
        })
    }

    /// Run `task` every `period`, first after one period, until shutdown.
    /// Late ticks are delayed rather than bunched.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        name: impl Into<String>,
        period: Duration,
        mut task: F,
    ) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(EngineError::Config("task period must be non-zero".to_string()));
        }
        let mut shutdown_rx = self.shutdown_signal();
        self.execute(name, async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => task(),
                }
            }
        })
    }

    /// Tasks spawned and not yet finished.
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Signal shutdown and wait for every task concurrently, aborting any
    /// that outlive `drain_timeout`.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<NamedTask> = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();

        let drains = tasks.into_iter().map(|NamedTask { name, mut handle }| async move {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = %name, "Task stopped"),
                Ok(Err(e)) if e.is_cancelled() => debug!(task = %name, "Task cancelled"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Task panicked"),
                Err(_) => {
                    warn!(task = %name, "Task did not stop within drain timeout, aborting");
                    handle.abort();
                }
            }
        });
        join_all(drains).await;
        info!(count, "Execution service stopped");
    }
}
