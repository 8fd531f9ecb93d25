//! Background drain of the deleted CoValues work queue.
//!
//! Runs are throttled, never overlap, and continue in follow-up phases while
//! the run reports more pending work. Enqueues that arrive while a run is
//! scheduled or in progress are ignored.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;

/// Eraser timing.
#[derive(Debug, Clone)]
pub struct EraserConfig {
    /// Delay between an enqueue and the run it triggers.
    pub throttle: Duration,
    /// Delay before the first drain after erasure is enabled.
    pub startup_delay: Duration,
    /// Delay between phases while work remains.
    pub follow_up_delay: Duration,
    /// Time budget of a single phase.
    pub budget: Duration,
}

impl Default for EraserConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(1),
            startup_delay: Duration::from_secs(1),
            follow_up_delay: Duration::from_millis(100),
            budget: Duration::from_millis(100),
        }
    }
}

/// One erase phase; resolves to whether work remains.
pub type EraseRun = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<bool>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled,
    Running,
}

struct EraserInner {
    config: EraserConfig,
    run: EraseRun,
    phase: Mutex<Phase>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

pub struct DeletedCoValuesEraser {
    inner: Arc<EraserInner>,
}

impl DeletedCoValuesEraser {
    pub fn new(config: EraserConfig, run: EraseRun) -> Self {
        Self {
            inner: Arc::new(EraserInner {
                config,
                run,
                phase: Mutex::new(Phase::Idle),
                task: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EraserConfig {
        &self.inner.config
    }

    pub fn schedule_startup_drain(&self) {
        self.schedule(self.inner.config.startup_delay);
    }

    pub fn on_enqueue_deleted_covalue(&self) {
        self.schedule(self.inner.config.throttle);
    }

    /// Cancel any scheduled run.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        *self.inner.phase.lock() = Phase::Idle;
    }

    fn schedule(&self, delay: Duration) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, deleted values will not be erased in the background");
            return;
        };
        {
            let mut phase = self.inner.phase.lock();
            if *phase != Phase::Idle {
                return;
            }
            *phase = Phase::Scheduled;
        }
        let inner = self.inner.clone();
        let handle = runtime.spawn(run_phases(inner, delay));
        *self.inner.task.lock() = Some(handle);
    }
}

impl Drop for DeletedCoValuesEraser {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_phases(inner: Arc<EraserInner>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        *inner.phase.lock() = Phase::Running;

        let has_more = match (inner.run)().await {
            Ok(has_more) => has_more,
            Err(err) => {
                error!(error = %err, "Error running deleted values eraser");
                false
            }
        };

        if has_more && !inner.disposed.load(Ordering::SeqCst) {
            debug!("Deleted values remain, scheduling follow-up erase");
            *inner.phase.lock() = Phase::Scheduled;
            delay = inner.config.follow_up_delay;
            continue;
        }
        *inner.phase.lock() = Phase::Idle;
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::AtomicUsize;

    fn config() -> EraserConfig {
        EraserConfig {
            throttle: Duration::from_millis(30),
            startup_delay: Duration::from_millis(10),
            follow_up_delay: Duration::from_millis(10),
            budget: Duration::from_millis(100),
        }
    }

    fn counting(runs: Arc<AtomicUsize>, remaining_after: usize) -> EraseRun {
        Arc::new(move || {
            let runs = runs.clone();
            Box::pin(async move {
                let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(n < remaining_after)
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_drain_runs_once_after_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let eraser = DeletedCoValuesEraser::new(config(), counting(runs.clone(), 1));

        eraser.schedule_startup_drain();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueues_are_throttled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let eraser = DeletedCoValuesEraser::new(config(), counting(runs.clone(), 1));

        eraser.on_enqueue_deleted_covalue();
        eraser.on_enqueue_deleted_covalue();
        eraser.on_enqueue_deleted_covalue();

        tokio::time::sleep(Duration::from_millis(29)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_phases_while_work_remains() {
        let runs = Arc::new(AtomicUsize::new(0));
        let eraser = DeletedCoValuesEraser::new(config(), counting(runs.clone(), 3));

        eraser.on_enqueue_deleted_covalue();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_scheduled_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let eraser = DeletedCoValuesEraser::new(config(), counting(runs.clone(), 1));

        eraser.on_enqueue_deleted_covalue();
        eraser.dispose();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failed_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let run: EraseRun = {
            let runs = runs.clone();
            Arc::new(move || {
                let runs = runs.clone();
                Box::pin(async move {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StoreError::InvalidData("boom".into()))
                    } else {
                        Ok(false)
                    }
                })
            })
        };
        let eraser = DeletedCoValuesEraser::new(config(), run);

        eraser.on_enqueue_deleted_covalue();
        tokio::time::sleep(Duration::from_millis(31)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        eraser.on_enqueue_deleted_covalue();
        tokio::time::sleep(Duration::from_millis(31)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
