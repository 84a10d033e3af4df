//! Job dispatcher
//!
//! One reusable scheduling shape shared by every periodic worker:
//! a fixed-interval timer with an immediate first run, a started flag
//! so a dispatcher cannot be registered twice, and a processing flag
//! that shutdown polls so in-flight batches finish instead of being
//! abandoned mid-claim.
//!
//! Each dispatcher owns its own state; two dispatchers (or two copies
//! of one under test) never interfere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::metrics;

/// One unit of periodic work.
pub trait JobCycle: Send + Sync {
    /// Stable job name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Run one cycle. Per-item failures are the cycle's own business;
    /// an `Err` here means the whole cycle aborted early (e.g. the
    /// store was unreachable) and the next scheduled run retries.
    fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>>;
}

/// Periodic runner for one `JobCycle`.
pub struct Dispatcher {
    job: Arc<dyn JobCycle>,
    interval: Duration,
    started: AtomicBool,
    processing: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(job: Arc<dyn JobCycle>, interval: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            job,
            interval,
            started: AtomicBool::new(false),
            processing: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    /// Start the interval loop; the first cycle runs immediately.
    /// Calling `start` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!(job = self.job.name(), "Dispatcher already started");
            return;
        }

        let dispatcher = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dispatcher.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!(
                job = dispatcher.job.name(),
                interval_seconds = dispatcher.interval.as_secs(),
                "Dispatcher started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => dispatcher.run_one_cycle().await,
                    _ = shutdown_rx.changed() => {
                        tracing::info!(job = dispatcher.job.name(), "Dispatcher stopping");
                        break;
                    }
                }
            }
        });

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    async fn run_one_cycle(&self) {
        // A cycle still marked in flight means the previous run has
        // not finished; skip rather than overlap.
        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::warn!(job = self.job.name(), "Skipping overlapping cycle");
            return;
        }

        let result = self.job.run_cycle().await;
        self.processing.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                metrics::JOB_CYCLES_TOTAL
                    .with_label_values(&[self.job.name(), "ok"])
                    .inc();
            }
            Err(e) => {
                metrics::JOB_CYCLES_TOTAL
                    .with_label_values(&[self.job.name(), "error"])
                    .inc();
                tracing::error!(job = self.job.name(), error = %e, "Dispatcher cycle failed");
            }
        }
    }

    /// Stop scheduling new cycles. In-flight work runs to completion;
    /// use `is_processing` to wait for it.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether a cycle is currently in flight.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }
}

/// All dispatchers of a process, with coordinated graceful shutdown.
pub struct DispatcherSet {
    dispatchers: Vec<Arc<Dispatcher>>,
}

impl DispatcherSet {
    pub fn new(dispatchers: Vec<Arc<Dispatcher>>) -> Self {
        Self { dispatchers }
    }

    pub fn start_all(&self) {
        for dispatcher in &self.dispatchers {
            dispatcher.start();
        }
    }

    /// Stop all dispatchers and wait (bounded) for in-flight cycles.
    ///
    /// Polls each processing flag until idle or the timeout elapses;
    /// on timeout the remaining work is abandoned and logged.
    pub async fn shutdown(&self, timeout: Duration) {
        for dispatcher in &self.dispatchers {
            dispatcher.stop();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let busy: Vec<&'static str> = self
                .dispatchers
                .iter()
                .filter(|d| d.is_processing())
                .map(|d| d.name())
                .collect();

            if busy.is_empty() {
                tracing::info!("All dispatchers idle, shutdown complete");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(?busy, "Shutdown timeout reached with cycles still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingJob {
        runs: Arc<AtomicUsize>,
    }

    impl JobCycle for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct SlowJob {
        runs: Arc<AtomicUsize>,
    }

    impl JobCycle for SlowJob {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn run_cycle(&self) -> BoxFuture<'_, Result<(), AppError>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn first_cycle_runs_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            Arc::new(CountingJob { runs: runs.clone() }),
            Duration::from_secs(3600),
        );
        dispatcher.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn double_start_registers_one_timer() {
        let runs = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            Arc::new(CountingJob { runs: runs.clone() }),
            Duration::from_secs(3600),
        );
        dispatcher.start();
        dispatcher.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn stop_prevents_new_cycles_only() {
        let runs = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            Arc::new(SlowJob { runs: runs.clone() }),
            Duration::from_secs(3600),
        );
        dispatcher.start();

        // Let the immediate cycle begin, then stop mid-flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.is_processing());
        dispatcher.stop();

        // The in-flight cycle still completes.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_processing());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_cycle() {
        let runs = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            Arc::new(SlowJob { runs: runs.clone() }),
            Duration::from_secs(3600),
        );
        let set = DispatcherSet::new(vec![Arc::clone(&dispatcher)]);
        set.start_all();

        tokio::time::sleep(Duration::from_millis(50)).await;
        set.shutdown(Duration::from_secs(5)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_processing());
    }
}
