//! Background Task Registry
//!
//! Promotion, write-behind persistence, stale refreshes and invalidation
//! publishes are fire-and-forget. They are spawned through
//! [`BackgroundTasks`] rather than bare `tokio::spawn` so that:
//!
//! - outstanding work is bounded (excess work is dropped and counted)
//! - shutdown can wait for outstanding work, then abandon what is left
//! - the number of in-flight tasks is observable
//!
//! Sweeps and listeners are long-lived and live outside the registry; see
//! [`ServiceHandle`] and [`spawn_sweep`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::metrics::{Counter, MetricsSnapshot};

/// Configuration for the background task registry
#[derive(Clone, Debug)]
pub struct TaskConfig {
    /// Maximum outstanding background tasks (0 = unlimited)
    pub max_tasks: usize,

    /// How long shutdown waits before aborting outstanding tasks
    pub shutdown_grace: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_tasks: 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// What happened to outstanding work at shutdown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks still running when the grace period ran out
    pub abandoned: usize,
}

struct Inner {
    set: Mutex<JoinSet<()>>,
    max_tasks: usize,
    active: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
    spawned: Counter,
    dropped: Counter,
    completed: Counter,
}

/// Decrements the active count however the task ends (finish or abort)
struct ActiveGuard(Arc<Inner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.completed.inc();
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Bounded registry of fire-and-forget tasks
#[derive(Clone)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

impl BackgroundTasks {
    /// Create a registry with the given configuration
    #[must_use]
    pub fn new(config: &TaskConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                set: Mutex::new(JoinSet::new()),
                max_tasks: config.max_tasks,
                active: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                idle: Notify::new(),
                spawned: Counter::new(),
                dropped: Counter::new(),
                completed: Counter::new(),
            }),
        }
    }

    /// Spawn a background task
    ///
    /// Returns `false` (and drops `future` without running it) when the
    /// registry is at capacity or shutting down. Must be called from within
    /// a Tokio runtime.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.dropped.inc();
            tracing::debug!(task = name, "Registry closed, background task dropped");
            return false;
        }

        let previous = self.inner.active.fetch_add(1, Ordering::AcqRel);
        if self.inner.max_tasks > 0 && previous >= self.inner.max_tasks {
            self.inner.active.fetch_sub(1, Ordering::AcqRel);
            self.inner.dropped.inc();
            tracing::warn!(
                task = name,
                limit = self.inner.max_tasks,
                "Background task limit reached, task dropped"
            );
            return false;
        }

        let guard = ActiveGuard(Arc::clone(&self.inner));
        let mut set = self.inner.set.lock();
        // Reap finished tasks so the set does not grow unbounded
        while set.try_join_next().is_some() {}
        set.spawn(async move {
            let _guard = guard;
            future.await;
        });
        self.inner.spawned.inc();
        true
    }

    /// Number of tasks currently outstanding
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Wait until no background task is outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, wait up to `grace`, then abort what remains
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.closed.store(true, Ordering::Release);

        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            tracing::debug!("Background tasks drained");
            return ShutdownReport { abandoned: 0 };
        }

        let abandoned = self.active();
        self.inner.set.lock().abort_all();
        tracing::warn!(abandoned, "Background tasks abandoned at shutdown");
        ShutdownReport { abandoned }
    }

    /// Registry metrics
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::new();
        snap.insert("tasks_active".into(), self.active() as f64);
        snap.insert("tasks_spawned".into(), self.inner.spawned.get() as f64);
        snap.insert("tasks_dropped".into(), self.inner.dropped.get() as f64);
        snap.insert("tasks_completed".into(), self.inner.completed.get() as f64);
        snap
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("active", &self.active())
            .field("max_tasks", &self.inner.max_tasks)
            .finish()
    }
}

// ============================================================================
// Long-Lived Services
// ============================================================================

/// Handle to a long-lived background service (sweep or listener)
///
/// The service is aborted when the handle is dropped.
#[derive(Debug)]
pub struct ServiceHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ServiceHandle {
    /// Spawn `future` as a named service
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(service = name, "Starting background service");
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    /// Stop the service
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether the service has stopped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Service name, for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run `tick` every `period`, skipping missed ticks under load
///
/// The first run happens one full period after the call.
pub fn spawn_sweep<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> ServiceHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    ServiceHandle::spawn(name, async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tracing::trace!(sweep = name, "Running sweep");
            tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_spawn_and_wait_idle() {
        let tasks = BackgroundTasks::new(&TaskConfig::default());
        let ran = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            assert!(tasks.spawn("test", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tasks.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(tasks.active(), 0);
        assert_eq!(tasks.snapshot()["tasks_completed"], 10.0);
    }

    #[tokio::test]
    async fn test_capacity_drops_excess() {
        let tasks = BackgroundTasks::new(&TaskConfig {
            max_tasks: 2,
            ..Default::default()
        });
        let (tx, rx) = tokio::sync::watch::channel(false);

        for _ in 0..2 {
            let mut rx = rx.clone();
            assert!(tasks.spawn("blocked", async move {
                let _ = rx.wait_for(|released| *released).await;
            }));
        }
        assert!(!tasks.spawn("excess", async {}));
        assert_eq!(tasks.snapshot()["tasks_dropped"], 1.0);

        tx.send(true).unwrap();
        tasks.wait_idle().await;
        assert!(tasks.spawn("after", async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_stuck_tasks() {
        let tasks = BackgroundTasks::new(&TaskConfig::default());
        tasks.spawn("forever", std::future::pending());
        tasks.spawn("quick", async {});

        let report = tasks.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report.abandoned, 1);
        assert!(!tasks.spawn("late", async {}));

        // Aborted tasks release their slot once the runtime drops them
        tasks.wait_idle().await;
        assert_eq!(tasks.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_runs_periodically() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let sweep = spawn_sweep("test", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(sweep.name(), "test");
        sweep.abort();
    }
}
