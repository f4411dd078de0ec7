//! Dynamic worker pool
//!
//! Wraps a set of tokio worker tasks draining a shared job queue, with
//! live-mutable parameters:
//! - Core/max worker counts with burst-to-max admission
//! - Resizable queue capacity and swappable rejection policy
//! - Keep-alive retirement for surplus (or, optionally, all) workers
//! - Lock-free runtime counters for monitoring

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use tp_common::{MetricsSample, PoolConfig, QueueCapacity, RejectionPolicy, SampleKind};

use crate::error::ControlError;
use crate::Result;

/// Sentinel stored in the capacity atomic for unbounded queues.
const UNBOUNDED: u32 = u32::MAX;

/// A unit of work submitted to the pool.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker pool with live-reconfigurable parameters.
///
/// All counters are plain atomics so the monitoring read path never takes
/// a lock. The only lock is around the rejection policy (swapped whole on
/// reconfiguration) and the shared queue receiver that workers race on.
pub struct Executor {
    id: Arc<str>,

    core_size: Arc<AtomicU32>,
    max_size: Arc<AtomicU32>,
    /// Queue capacity; `UNBOUNDED` means no limit.
    queue_capacity: AtomicU32,
    keep_alive_ms: Arc<AtomicU64>,
    allow_core_timeout: Arc<AtomicBool>,

    /// Swappable whole on reconfiguration (policy values are Copy, readers
    /// never hold the guard across an await).
    rejection_policy: RwLock<RejectionPolicy>,

    queue_tx: mpsc::UnboundedSender<Job>,
    queue_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>,

    /// Runtime counters (Arc for sharing with worker tasks)
    queue_size: Arc<AtomicU32>,
    pool_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
    completed: Arc<AtomicU64>,
    rejects: Arc<AtomicU64>,
    largest_pool_size: Arc<AtomicU32>,

    running: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(config: &PoolConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Self {
            id: Arc::from(config.id.as_str()),
            core_size: Arc::new(AtomicU32::new(config.core_size)),
            max_size: Arc::new(AtomicU32::new(config.max_size)),
            queue_capacity: AtomicU32::new(capacity_raw(config.queue_capacity)),
            keep_alive_ms: Arc::new(AtomicU64::new(config.keep_alive.as_millis() as u64)),
            allow_core_timeout: Arc::new(AtomicBool::new(config.allow_core_timeout)),
            rejection_policy: RwLock::new(config.rejection_policy),
            queue_tx,
            queue_rx: Arc::new(AsyncMutex::new(queue_rx)),
            queue_size: Arc::new(AtomicU32::new(0)),
            pool_size: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            rejects: Arc::new(AtomicU64::new(0)),
            largest_pool_size: Arc::new(AtomicU32::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the pool. Workers are spawned on demand, not eagerly.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running
        }

        info!(
            pool_id = %self.id,
            core_size = self.core_size.load(Ordering::SeqCst),
            max_size = self.max_size.load(Ordering::SeqCst),
            "Starting worker pool"
        );
    }

    /// Submit a job to the pool.
    ///
    /// Admission order: spawn a worker while below core; enqueue while the
    /// queue has room; spawn up to max when the queue is full; otherwise
    /// apply the rejection policy.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);

        if !self.running.load(Ordering::SeqCst) {
            return Err(ControlError::ExecutorShutdown(self.id.to_string()));
        }

        let core = self.core_size.load(Ordering::SeqCst);
        if self.pool_size.load(Ordering::SeqCst) < core && self.try_spawn_worker(core) {
            return self.enqueue(job);
        }

        let capacity = self.queue_capacity.load(Ordering::SeqCst);
        if capacity == UNBOUNDED || self.queue_size.load(Ordering::SeqCst) < capacity {
            self.enqueue(job)?;
            // A pool with core=0 may have no workers at all; make sure at
            // least one exists to drain the job we just queued.
            if self.pool_size.load(Ordering::SeqCst) == 0 {
                self.try_spawn_worker(self.max_size.load(Ordering::SeqCst));
            }
            return Ok(());
        }

        // Queue full - burst beyond core up to max
        let max = self.max_size.load(Ordering::SeqCst);
        if self.pool_size.load(Ordering::SeqCst) < max && self.try_spawn_worker(max) {
            return self.enqueue(job);
        }

        self.reject(job).await
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(job).is_err() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            return Err(ControlError::ExecutorShutdown(self.id.to_string()));
        }
        Ok(())
    }

    /// Apply the configured rejection policy to an inadmissible job.
    async fn reject(&self, job: Job) -> Result<()> {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        let policy = *self.rejection_policy.read();

        debug!(pool_id = %self.id, policy = ?policy, "Pool saturated, rejecting job");

        match policy {
            RejectionPolicy::Abort => Err(ControlError::Rejected(self.id.to_string())),
            RejectionPolicy::Discard => Ok(()),
            RejectionPolicy::DiscardOldest => {
                // Drop the head of the queue to make room. If a worker holds
                // the receiver we cannot reach the head; fall back to
                // discarding the new job instead.
                if let Ok(mut rx) = self.queue_rx.try_lock() {
                    if rx.try_recv().is_ok() {
                        self.queue_size.fetch_sub(1, Ordering::SeqCst);
                    }
                    drop(rx);
                    return self.enqueue(job);
                }
                Ok(())
            }
            RejectionPolicy::CallerRuns => {
                job.await;
                Ok(())
            }
        }
    }

    /// Spawn a worker if the pool is below `limit`. The increment is a CAS
    /// so concurrent submitters never overshoot.
    fn try_spawn_worker(&self, limit: u32) -> bool {
        loop {
            let current = self.pool_size.load(Ordering::SeqCst);
            if current >= limit || limit == 0 {
                return false;
            }
            if self
                .pool_size
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.largest_pool_size.fetch_max(current + 1, Ordering::SeqCst);
                self.spawn_worker();
                return true;
            }
        }
    }

    fn spawn_worker(&self) {
        let id = Arc::clone(&self.id);
        let rx = Arc::clone(&self.queue_rx);
        let queue_size = Arc::clone(&self.queue_size);
        let pool_size = Arc::clone(&self.pool_size);
        let active_workers = Arc::clone(&self.active_workers);
        let completed = Arc::clone(&self.completed);
        let core_size = Arc::clone(&self.core_size);
        let max_size = Arc::clone(&self.max_size);
        let keep_alive_ms = Arc::clone(&self.keep_alive_ms);
        let allow_core_timeout = Arc::clone(&self.allow_core_timeout);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            Self::run_worker(
                id,
                rx,
                queue_size,
                pool_size,
                active_workers,
                completed,
                core_size,
                max_size,
                keep_alive_ms,
                allow_core_timeout,
                running,
            )
            .await;
        });
    }

    /// Worker loop: race for the shared receiver, run jobs, retire when
    /// surplus and idle past keep-alive.
    #[allow(clippy::too_many_arguments)]
    async fn run_worker(
        id: Arc<str>,
        rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>,
        queue_size: Arc<AtomicU32>,
        pool_size: Arc<AtomicU32>,
        active_workers: Arc<AtomicU32>,
        completed: Arc<AtomicU64>,
        core_size: Arc<AtomicU32>,
        max_size: Arc<AtomicU32>,
        keep_alive_ms: Arc<AtomicU64>,
        allow_core_timeout: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
    ) {
        debug!(pool_id = %id, "Worker started");

        loop {
            let keep_alive = Duration::from_millis(keep_alive_ms.load(Ordering::SeqCst));

            // recv() is cancel-safe: a job is never lost when the timeout
            // wins the race.
            let received = tokio::time::timeout(keep_alive, async {
                rx.lock().await.recv().await
            })
            .await;

            match received {
                Ok(Some(job)) => {
                    queue_size.fetch_sub(1, Ordering::SeqCst);
                    active_workers.fetch_add(1, Ordering::SeqCst);
                    job.await;
                    active_workers.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);

                    // Retire immediately if max was lowered below us.
                    let max = max_size.load(Ordering::SeqCst);
                    if pool_size.load(Ordering::SeqCst) > max
                        && Self::try_shrink(&pool_size, max)
                    {
                        break;
                    }
                }
                Ok(None) => {
                    // Channel closed - pool dropped
                    pool_size.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
                Err(_) => {
                    // Idle past keep-alive: retire if we are surplus, if
                    // core timeout is allowed, or if the pool is stopping.
                    let floor = if allow_core_timeout.load(Ordering::SeqCst)
                        || !running.load(Ordering::SeqCst)
                    {
                        0
                    } else {
                        core_size.load(Ordering::SeqCst)
                    };
                    if Self::try_shrink(&pool_size, floor) {
                        // A submit racing with this retirement can observe
                        // a nonzero pool size, enqueue, and spawn nothing
                        // while we are already committed to exiting. Never
                        // leave queued work with no worker: the last one
                        // out reinstates itself instead.
                        if queue_size.load(Ordering::SeqCst) > 0
                            && pool_size
                                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok()
                        {
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        debug!(pool_id = %id, "Worker exited");
    }

    /// Decrement the worker count only while it stays above `floor`.
    fn try_shrink(pool_size: &AtomicU32, floor: u32) -> bool {
        loop {
            let current = pool_size.load(Ordering::SeqCst);
            if current <= floor {
                return false;
            }
            if pool_size
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Live mutators - one per parameter, each independently applicable
    // ------------------------------------------------------------------

    pub fn set_core_size(&self, new_core: u32) -> Result<()> {
        self.ensure_running()?;
        let old = self.core_size.swap(new_core, Ordering::SeqCst);
        if new_core > old {
            // Prestart workers for already-queued jobs
            let backlog = self.queue_size.load(Ordering::SeqCst);
            let to_spawn = backlog.min(new_core.saturating_sub(old));
            for _ in 0..to_spawn {
                if !self.try_spawn_worker(new_core) {
                    break;
                }
            }
        }
        // Decrease: surplus workers retire on their next idle timeout
        info!(pool_id = %self.id, old = old, new = new_core, "Core size updated");
        Ok(())
    }

    pub fn set_max_size(&self, new_max: u32) -> Result<()> {
        self.ensure_running()?;
        let old = self.max_size.swap(new_max, Ordering::SeqCst);
        // Excess workers retire after finishing their current job
        info!(pool_id = %self.id, old = old, new = new_max, "Max size updated");
        Ok(())
    }

    pub fn set_queue_capacity(&self, capacity: QueueCapacity) -> Result<()> {
        self.ensure_running()?;
        let old = self.queue_capacity.swap(capacity_raw(capacity), Ordering::SeqCst);
        info!(
            pool_id = %self.id,
            old = %capacity_display(old),
            new = %capacity_display(capacity_raw(capacity)),
            "Queue capacity updated"
        );
        Ok(())
    }

    pub fn set_keep_alive(&self, keep_alive: Duration) -> Result<()> {
        self.ensure_running()?;
        let old = self
            .keep_alive_ms
            .swap(keep_alive.as_millis() as u64, Ordering::SeqCst);
        info!(
            pool_id = %self.id,
            old_ms = old,
            new_ms = keep_alive.as_millis() as u64,
            "Keep-alive updated"
        );
        Ok(())
    }

    pub fn set_rejection_policy(&self, policy: RejectionPolicy) -> Result<()> {
        self.ensure_running()?;
        let old = {
            let mut guard = self.rejection_policy.write();
            std::mem::replace(&mut *guard, policy)
        };
        info!(pool_id = %self.id, old = ?old, new = ?policy, "Rejection policy updated");
        Ok(())
    }

    pub fn set_allow_core_timeout(&self, allow: bool) -> Result<()> {
        self.ensure_running()?;
        let old = self.allow_core_timeout.swap(allow, Ordering::SeqCst);
        if old != allow {
            info!(pool_id = %self.id, allow = allow, "Allow-core-timeout updated");
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControlError::ExecutorShutdown(self.id.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    /// Lock-free sample of the runtime counters. Never touches any lock,
    /// so it is safe at any polling frequency and independent of
    /// reconfiguration activity.
    pub fn basic_sample(&self) -> MetricsSample {
        let queue_size = self.queue_size.load(Ordering::SeqCst);
        let capacity = self.queue_capacity.load(Ordering::SeqCst);
        let remaining = if capacity == UNBOUNDED {
            u32::MAX
        } else {
            capacity.saturating_sub(queue_size)
        };

        MetricsSample {
            pool_id: self.id.to_string(),
            kind: SampleKind::Basic,
            pool_size: self.pool_size.load(Ordering::SeqCst),
            active_count: self.active_workers.load(Ordering::SeqCst),
            queue_size,
            queue_remaining_capacity: remaining,
            completed_count: self.completed.load(Ordering::SeqCst),
            reject_count: self.rejects.load(Ordering::SeqCst),
            largest_pool_size: self.largest_pool_size.load(Ordering::SeqCst),
            sampled_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn core_size(&self) -> u32 {
        self.core_size.load(Ordering::SeqCst)
    }

    pub fn max_size(&self) -> u32 {
        self.max_size.load(Ordering::SeqCst)
    }

    pub fn queue_capacity(&self) -> QueueCapacity {
        let raw = self.queue_capacity.load(Ordering::SeqCst);
        if raw == UNBOUNDED {
            QueueCapacity::Unbounded
        } else {
            QueueCapacity::Bounded(raw)
        }
    }

    pub fn rejection_policy(&self) -> RejectionPolicy {
        *self.rejection_policy.read()
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms.load(Ordering::SeqCst))
    }

    pub fn allow_core_timeout(&self) -> bool {
        self.allow_core_timeout.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn reject_count(&self) -> u64 {
        self.rejects.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop accepting new work. Queued jobs still drain.
    pub fn drain(&self) {
        info!(pool_id = %self.id, "Draining pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    /// Stop the pool. Idle workers bleed off on their next keep-alive tick.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(pool_id = %self.id, "Shutting down pool");
        }
        if !self.is_fully_drained() {
            warn!(
                pool_id = %self.id,
                queue_size = self.queue_size.load(Ordering::SeqCst),
                active = self.active_workers.load(Ordering::SeqCst),
                "Pool shut down with work still in flight"
            );
        }
    }
}

fn capacity_raw(capacity: QueueCapacity) -> u32 {
    match capacity {
        QueueCapacity::Bounded(n) => n.min(UNBOUNDED - 1),
        QueueCapacity::Unbounded => UNBOUNDED,
    }
}

fn capacity_display(raw: u32) -> String {
    if raw == UNBOUNDED {
        "unbounded".to_string()
    } else {
        raw.to_string()
    }
}
