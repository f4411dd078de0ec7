//! Alarm Evaluation
//!
//! Each evaluator tick reads a fresh sample per pool and checks three
//! metrics against that pool's thresholds: queue usage, active-worker
//! ratio, and rejection growth since the previous tick. Breaches raise
//! alarms through the notifier, throttled per (pool, metric) by a quiet
//! window so a sustained breach does not flood the channels.
//!
//! Only breaches produce output. There are no recovery events.
//!
//! The evaluator deliberately samples each executor directly rather than
//! reading the monitor's stored sample: the read is lock-free either way,
//! and a direct sample keeps alarm decisions current even when the two
//! tickers run on different intervals.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use tp_common::{AlarmEvent, AlarmMetric, AlarmSeverity, AlarmThresholds, MetricsSample};

use crate::notifier::NotifierDispatcher;
use crate::registry::PoolRegistry;

/// Quiet-window throttle keyed by (pool id, metric).
///
/// `try_acquire` answers "may this alarm fire now?" and, when yes, stamps
/// the window in the same keyed critical section, so two concurrent
/// breaches of the same metric cannot both pass.
pub struct AlarmSilencer {
    last_sent: DashMap<String, Instant>,
}

impl AlarmSilencer {
    pub fn new() -> Self {
        Self {
            last_sent: DashMap::new(),
        }
    }

    pub fn try_acquire(&self, pool_id: &str, metric: AlarmMetric, quiet_window: Duration) -> bool {
        let key = format!("{}|{}", pool_id, metric.as_str());
        let now = Instant::now();
        let mut allowed = false;
        self.last_sent
            .entry(key)
            .and_modify(|last| {
                if now.duration_since(*last) >= quiet_window {
                    *last = now;
                    allowed = true;
                }
            })
            .or_insert_with(|| {
                allowed = true;
                now
            });
        allowed
    }
}

impl Default for AlarmSilencer {
    fn default() -> Self {
        Self::new()
    }
}

/// A single threshold breach found in one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    pub metric: AlarmMetric,
    pub threshold: f64,
    pub observed: f64,
}

/// Check one sample against thresholds. `reject_delta` is the rejection
/// growth since the previous evaluation.
///
/// Unbounded and zero-capacity queues skip the queue-usage check; a usage
/// ratio means nothing for them.
pub fn find_breaches(
    sample: &MetricsSample,
    max_size: u32,
    thresholds: &AlarmThresholds,
    reject_delta: u64,
) -> Vec<Breach> {
    let mut breaches = Vec::new();

    if let Some(usage) = sample.queue_usage() {
        if usage > thresholds.queue_usage_threshold {
            breaches.push(Breach {
                metric: AlarmMetric::QueueUsage,
                threshold: thresholds.queue_usage_threshold,
                observed: usage,
            });
        }
    }

    if max_size > 0 {
        let active_ratio = sample.active_count as f64 / max_size as f64;
        if active_ratio > thresholds.active_ratio_threshold {
            breaches.push(Breach {
                metric: AlarmMetric::ActiveRatio,
                threshold: thresholds.active_ratio_threshold,
                observed: active_ratio,
            });
        }
    }

    if thresholds.reject_count_threshold > 0 && reject_delta >= thresholds.reject_count_threshold {
        breaches.push(Breach {
            metric: AlarmMetric::RejectedTasks,
            threshold: thresholds.reject_count_threshold as f64,
            observed: reject_delta as f64,
        });
    }

    breaches
}

pub struct AlarmEvaluator {
    registry: Arc<PoolRegistry>,
    dispatcher: Arc<NotifierDispatcher>,
    silencer: AlarmSilencer,
    /// Rejection totals seen at the previous tick, per pool.
    last_rejects: DashMap<String, u64>,
}

impl AlarmEvaluator {
    pub fn new(registry: Arc<PoolRegistry>, dispatcher: Arc<NotifierDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
            silencer: AlarmSilencer::new(),
            last_rejects: DashMap::new(),
        }
    }

    /// Evaluate every pool once. Returns the alarms actually raised (after
    /// quiet-window throttling).
    pub async fn evaluate_tick(&self) -> Vec<AlarmEvent> {
        let mut raised = Vec::new();

        for instance in self.registry.list() {
            let thresholds = instance.thresholds();
            let sample = instance.executor.basic_sample();
            let pool_id = sample.pool_id.clone();

            // Reject delta is tracked even while alarms are disabled so
            // re-enabling does not report the whole backlog at once.
            let previous = self
                .last_rejects
                .insert(pool_id.clone(), sample.reject_count)
                .unwrap_or(0);
            let reject_delta = sample.reject_count.saturating_sub(previous);

            if !thresholds.enabled {
                continue;
            }

            let breaches = find_breaches(
                &sample,
                instance.executor.max_size(),
                &thresholds,
                reject_delta,
            );

            for breach in breaches {
                if !self
                    .silencer
                    .try_acquire(&pool_id, breach.metric, thresholds.quiet_window)
                {
                    debug!(
                        pool_id = %pool_id,
                        metric = breach.metric.as_str(),
                        "Alarm suppressed by quiet window"
                    );
                    continue;
                }

                let event = AlarmEvent {
                    pool_id: pool_id.clone(),
                    metric: breach.metric,
                    threshold: breach.threshold,
                    observed: breach.observed,
                    severity: AlarmSeverity::Warn,
                    sample: sample.clone(),
                    raised_at: Utc::now(),
                };

                let targets = instance.notify_targets();
                self.dispatcher.dispatch_alarm(&event, &targets).await;
                raised.push(event);
            }
        }

        raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PoolBuilder;
    use tp_common::{QueueCapacity, SampleKind};

    fn sample(queue_size: u32, remaining: u32, active: u32, rejects: u64) -> MetricsSample {
        MetricsSample {
            pool_id: "p1".to_string(),
            kind: SampleKind::Basic,
            pool_size: active,
            active_count: active,
            queue_size,
            queue_remaining_capacity: remaining,
            completed_count: 0,
            reject_count: rejects,
            largest_pool_size: active,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn queue_usage_breach() {
        let thresholds = AlarmThresholds::default();
        let breaches = find_breaches(&sample(9, 1, 0, 0), 4, &thresholds, 0);
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].metric, AlarmMetric::QueueUsage);
        assert!((breaches[0].observed - 0.9).abs() < 1e-9);
    }

    #[test]
    fn unbounded_queue_skips_usage_check() {
        let thresholds = AlarmThresholds::default();
        let breaches = find_breaches(&sample(10_000, u32::MAX, 0, 0), 4, &thresholds, 0);
        assert!(breaches.is_empty());
    }

    #[test]
    fn active_ratio_breach() {
        let thresholds = AlarmThresholds::default();
        let breaches = find_breaches(&sample(0, 100, 4, 0), 4, &thresholds, 0);
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].metric, AlarmMetric::ActiveRatio);
        assert_eq!(breaches[0].observed, 1.0);
    }

    #[test]
    fn reject_growth_breach() {
        let thresholds = AlarmThresholds::default();
        let breaches = find_breaches(&sample(0, 100, 0, 5), 4, &thresholds, 3);
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].metric, AlarmMetric::RejectedTasks);
        assert_eq!(breaches[0].observed, 3.0);
    }

    #[test]
    fn no_breach_at_threshold() {
        // Thresholds are strict: exactly 0.8 does not breach
        let thresholds = AlarmThresholds::default();
        let breaches = find_breaches(&sample(8, 2, 0, 0), 4, &thresholds, 0);
        assert!(breaches.is_empty());
    }

    #[test]
    fn silencer_allows_first_then_suppresses() {
        let silencer = AlarmSilencer::new();
        let window = Duration::from_secs(60);

        assert!(silencer.try_acquire("p1", AlarmMetric::QueueUsage, window));
        assert!(!silencer.try_acquire("p1", AlarmMetric::QueueUsage, window));
        // Different metric or pool: independent windows
        assert!(silencer.try_acquire("p1", AlarmMetric::ActiveRatio, window));
        assert!(silencer.try_acquire("p2", AlarmMetric::QueueUsage, window));
    }

    #[test]
    fn silencer_reopens_after_window() {
        let silencer = AlarmSilencer::new();
        let window = Duration::from_millis(0);
        assert!(silencer.try_acquire("p1", AlarmMetric::QueueUsage, window));
        assert!(silencer.try_acquire("p1", AlarmMetric::QueueUsage, window));
    }

    #[tokio::test]
    async fn evaluator_raises_once_within_quiet_window() {
        let registry = Arc::new(PoolRegistry::new());
        let mut thresholds = AlarmThresholds::default();
        thresholds.quiet_window = Duration::from_secs(300);

        let instance = PoolBuilder::new("p1")
            .core_size(1)
            .max_size(1)
            .queue_capacity(QueueCapacity::Bounded(10))
            .alarm_thresholds(thresholds)
            .register(&registry)
            .unwrap();

        // One running job plus nine queued: queue usage 0.9, active ratio 1.0
        let (release_tx, _keep) = tokio::sync::broadcast::channel::<()>(1);
        for _ in 0..10 {
            let mut rx = release_tx.subscribe();
            instance
                .executor
                .submit(async move {
                    let _ = rx.recv().await;
                })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dispatcher = Arc::new(NotifierDispatcher::new());
        let evaluator = AlarmEvaluator::new(registry, dispatcher);

        let first = evaluator.evaluate_tick().await;
        let metrics: Vec<AlarmMetric> = first.iter().map(|e| e.metric).collect();
        assert!(metrics.contains(&AlarmMetric::QueueUsage));
        assert!(metrics.contains(&AlarmMetric::ActiveRatio));

        // Still breached, but the quiet window holds
        let second = evaluator.evaluate_tick().await;
        assert!(second.is_empty());

        let _ = release_tx.send(());
    }

    #[tokio::test]
    async fn disabled_pool_is_skipped() {
        let registry = Arc::new(PoolRegistry::new());
        let mut thresholds = AlarmThresholds::default();
        thresholds.enabled = false;

        let instance = PoolBuilder::new("p1")
            .core_size(1)
            .max_size(1)
            .queue_capacity(QueueCapacity::Bounded(1))
            .alarm_thresholds(thresholds)
            .register(&registry)
            .unwrap();

        let (release_tx, _keep) = tokio::sync::broadcast::channel::<()>(1);
        for _ in 0..2 {
            let mut rx = release_tx.subscribe();
            instance
                .executor
                .submit(async move {
                    let _ = rx.recv().await;
                })
                .await
                .unwrap();
            // Give the worker time to pick up the blocking job before the
            // next submission so the single queue slot is free.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let evaluator = AlarmEvaluator::new(registry, Arc::new(NotifierDispatcher::new()));
        assert!(evaluator.evaluate_tick().await.is_empty());

        let _ = release_tx.send(());
    }
}
