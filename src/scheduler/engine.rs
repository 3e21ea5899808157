use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    failures: AtomicU64,
}

/// Handle to a running periodic task.
///
/// Dropping the handle or calling [`PeriodicHandle::shutdown`] stops future
/// ticks. A run already in progress always completes.
#[derive(Debug)]
pub struct PeriodicHandle {
    name: &'static str,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl PeriodicHandle {
    /// Completed runs, failed ones included.
    pub fn runs(&self) -> u64 {
        self.counters.runs.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    /// Stop ticking and wait for the loop to exit.
    pub async fn shutdown(self) {
        // The loop may already be gone if its runtime is shutting down.
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join.await {
            error!(task = self.name, error = %e, "periodic task did not exit cleanly");
        }
    }
}

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Run `task` every `period`, starting one period from now.
///
/// Each run executes on the blocking pool. A run that fails or panics is
/// logged and counted; it never stops later runs. A zero period is raised to
/// one second.
pub fn spawn_periodic<F>(name: &'static str, period: Duration, task: F) -> PeriodicHandle
where
    F: FnMut() -> anyhow::Result<()> + Send + 'static,
{
    let period = if period.is_zero() {
        warn!(task = name, "zero period requested, using {}s", MIN_PERIOD.as_secs());
        MIN_PERIOD
    } else {
        period
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let counters = Arc::new(Counters::default());
    let loop_counters = Arc::clone(&counters);
    let task = Arc::new(Mutex::new(task));

    let join = tokio::spawn(async move {
        info!(task = name, period_secs = period.as_secs_f64(), "periodic task started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        tokio::pin!(shutdown_rx);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    debug!(task = name, "shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    let task = Arc::clone(&task);
                    let outcome = tokio::task::spawn_blocking(move || {
                        let mut run = task.lock();
                        (*run)()
                    })
                    .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            loop_counters.failures.fetch_add(1, Ordering::Relaxed);
                            error!(task = name, error = %e, "periodic task failed");
                        }
                        Err(e) => {
                            loop_counters.failures.fetch_add(1, Ordering::Relaxed);
                            error!(task = name, error = %e, "periodic task panicked");
                        }
                    }
                    loop_counters.runs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        info!(task = name, "periodic task stopped");
    });

    PeriodicHandle {
        name,
        shutdown_tx,
        join,
        counters,
    }
}
