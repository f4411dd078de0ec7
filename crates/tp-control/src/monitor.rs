//! Pool Monitor
//!
//! Periodically samples every registered pool over the lock-free counter
//! path, stores the latest sample on the pool, and publishes gauges and
//! counters to the metrics recorder. A slow tick never stacks on top of
//! itself; overlapping ticks are skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::{debug, warn};

use tp_common::{AlarmThresholds, MetricsSample, PoolConfig, SampleKind};

use crate::error::ControlError;
use crate::registry::PoolRegistry;
use crate::Result;

/// Detailed view of one pool: config plus a fresh sample.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    pub config: PoolConfig,
    pub thresholds: AlarmThresholds,
    pub sample: MetricsSample,
}

pub struct Monitor {
    registry: Arc<PoolRegistry>,
    /// Last published completed/reject totals, for counter deltas.
    last_totals: DashMap<String, (u64, u64)>,
    ticking: AtomicBool,
}

impl Monitor {
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            last_totals: DashMap::new(),
            ticking: AtomicBool::new(false),
        }
    }

    /// Sample every pool once. Returns the number of pools sampled, or 0
    /// if a previous tick is still in flight.
    pub fn tick(&self) -> usize {
        if self.ticking.swap(true, Ordering::SeqCst) {
            warn!("Monitor tick still running, skipping this interval");
            return 0;
        }

        let pools = self.registry.list();
        for instance in &pools {
            let sample = instance.executor.basic_sample();
            self.publish(&sample);
            instance.store_sample(sample);
        }
        debug!(pools = pools.len(), "Monitor tick complete");

        let sampled = pools.len();
        self.ticking.store(false, Ordering::SeqCst);
        sampled
    }

    fn publish(&self, sample: &MetricsSample) {
        let pool_id = sample.pool_id.clone();

        gauge!("tidepool.pool.size", "pool_id" => pool_id.clone()).set(sample.pool_size as f64);
        gauge!("tidepool.pool.active", "pool_id" => pool_id.clone())
            .set(sample.active_count as f64);
        gauge!("tidepool.pool.largest", "pool_id" => pool_id.clone())
            .set(sample.largest_pool_size as f64);
        gauge!("tidepool.queue.size", "pool_id" => pool_id.clone()).set(sample.queue_size as f64);
        if sample.queue_remaining_capacity != u32::MAX {
            gauge!("tidepool.queue.remaining", "pool_id" => pool_id.clone())
                .set(sample.queue_remaining_capacity as f64);
        }

        // completed/rejected are cumulative on the pool; the recorder wants
        // increments.
        let (last_completed, last_rejected) = self
            .last_totals
            .get(&pool_id)
            .map(|entry| *entry.value())
            .unwrap_or((0, 0));
        let completed_delta = sample.completed_count.saturating_sub(last_completed);
        let rejected_delta = sample.reject_count.saturating_sub(last_rejected);
        if completed_delta > 0 {
            counter!("tidepool.tasks.completed", "pool_id" => pool_id.clone())
                .increment(completed_delta);
        }
        if rejected_delta > 0 {
            counter!("tidepool.tasks.rejected", "pool_id" => pool_id.clone())
                .increment(rejected_delta);
        }
        self.last_totals
            .insert(pool_id, (sample.completed_count, sample.reject_count));
    }

    /// Detailed state of one pool: config snapshot, alarm thresholds, and
    /// a fresh sample marked `Full`. Low-frequency use (dashboards, debug
    /// endpoints); the hot read path is `tick`.
    pub fn full_state(&self, pool_id: &str) -> Result<PoolState> {
        let instance = self
            .registry
            .get(pool_id)
            .ok_or_else(|| ControlError::UnknownPool(pool_id.to_string()))?;

        let mut sample = instance.executor.basic_sample();
        sample.kind = SampleKind::Full;
        sample.sampled_at = Utc::now();

        Ok(PoolState {
            config: instance.config(),
            thresholds: instance.thresholds(),
            sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PoolBuilder;

    #[tokio::test]
    async fn tick_stores_latest_sample() {
        let registry = Arc::new(PoolRegistry::new());
        PoolBuilder::new("p1").register(&registry).unwrap();
        PoolBuilder::new("p2").register(&registry).unwrap();

        let monitor = Monitor::new(registry.clone());
        assert_eq!(monitor.tick(), 2);

        let instance = registry.get("p1").unwrap();
        let sample = instance.latest_sample().expect("sample stored");
        assert_eq!(sample.pool_id, "p1");
        assert_eq!(sample.kind, SampleKind::Basic);
    }

    #[tokio::test]
    async fn full_state_includes_config() {
        let registry = Arc::new(PoolRegistry::new());
        PoolBuilder::new("p1")
            .core_size(2)
            .max_size(4)
            .register(&registry)
            .unwrap();

        let monitor = Monitor::new(registry);
        let state = monitor.full_state("p1").unwrap();
        assert_eq!(state.config.core_size, 2);
        assert_eq!(state.sample.kind, SampleKind::Full);

        assert!(matches!(
            monitor.full_state("ghost"),
            Err(ControlError::UnknownPool(_))
        ));
    }
}
