use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Admission queue capacity for a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueCapacity {
    Bounded(u32),
    Unbounded,
}

impl QueueCapacity {
    /// Remaining slots given the current queue depth. Unbounded queues
    /// always report `u32::MAX`.
    pub fn remaining(&self, queue_size: u32) -> u32 {
        match self {
            QueueCapacity::Bounded(cap) => cap.saturating_sub(queue_size),
            QueueCapacity::Unbounded => u32::MAX,
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, QueueCapacity::Bounded(_))
    }
}

/// What happens to a job when the queue is full and the pool is at its
/// maximum size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectionPolicy {
    /// Refuse the job and surface an error to the submitter.
    Abort,
    /// Drop the job silently (still counted as rejected).
    Discard,
    /// Drop the oldest queued job to make room for the new one.
    DiscardOldest,
    /// Run the job on the submitting task instead of a pool worker.
    CallerRuns,
}

/// Immutable parameter set for a worker pool.
///
/// The config is a value: reconfiguration replaces the whole snapshot, it
/// never mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Pool identifier, unique within the process. Also used as the
    /// thread-name prefix for worker tasks.
    pub id: String,
    pub core_size: u32,
    pub max_size: u32,
    pub queue_capacity: QueueCapacity,
    /// Idle time after which surplus workers retire.
    #[serde(with = "duration_secs")]
    pub keep_alive: Duration,
    pub rejection_policy: RejectionPolicy,
    /// When set, core workers also retire after `keep_alive` idleness.
    pub allow_core_timeout: bool,
}

impl PoolConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            core_size: 1,
            max_size: 1,
            queue_capacity: QueueCapacity::Bounded(1024),
            keep_alive: Duration::from_secs(60),
            rejection_policy: RejectionPolicy::Abort,
            allow_core_timeout: false,
        }
    }

    /// Check the config invariant: `core <= max`, `max > 0`, non-empty id.
    /// Returns a description of the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("pool id must not be empty".to_string());
        }
        if self.max_size == 0 {
            return Err(format!("[{}] max size must be greater than zero", self.id));
        }
        if self.core_size > self.max_size {
            return Err(format!(
                "[{}] core size {} exceeds max size {}",
                self.id, self.core_size, self.max_size
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// ============================================================================
// Alarm / Notification Configuration
// ============================================================================

/// Per-pool alarm thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmThresholds {
    pub enabled: bool,
    /// Queue usage ratio (0..=1) above which a QueueUsage alarm fires.
    pub queue_usage_threshold: f64,
    /// Active-worker ratio (0..=1) above which an ActiveRatio alarm fires.
    pub active_ratio_threshold: f64,
    /// Rejections per evaluator interval above which a RejectedTasks alarm
    /// fires. 1 means "alarm on any growth".
    pub reject_count_threshold: u64,
    /// Minimum spacing between repeated alarms for the same (pool, metric).
    #[serde(with = "duration_secs")]
    pub quiet_window: Duration,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_usage_threshold: 0.8,
            active_ratio_threshold: 0.8,
            reject_count_threshold: 1,
            quiet_window: Duration::from_secs(300),
        }
    }
}

/// Delivery targets for a pool's alarm and change notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyTargets {
    /// Channel identifiers, matching channels registered on the dispatcher.
    pub channels: Vec<String>,
    /// Recipients passed through to the channel payload (user handles,
    /// phone numbers - channel-specific formatting is the channel's concern).
    pub recipients: Vec<String>,
}

// ============================================================================
// Metrics
// ============================================================================

/// Which read path produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleKind {
    /// Lock-free counters only; safe for high-frequency polling.
    Basic,
    /// Taken on demand alongside config and threshold snapshots, which
    /// read locks; low-frequency use only.
    Full,
}

/// Point-in-time read of a pool's runtime counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub pool_id: String,
    pub kind: SampleKind,
    /// Current number of live workers.
    pub pool_size: u32,
    /// Workers currently executing a job.
    pub active_count: u32,
    pub queue_size: u32,
    pub queue_remaining_capacity: u32,
    pub completed_count: u64,
    /// Cumulative rejections since pool start.
    pub reject_count: u64,
    /// High-water mark of the worker count.
    pub largest_pool_size: u32,
    pub sampled_at: DateTime<Utc>,
}

impl MetricsSample {
    /// Queue usage as a ratio in 0..=1, or None for unbounded queues.
    pub fn queue_usage(&self) -> Option<f64> {
        let capacity = self.queue_size as u64 + self.queue_remaining_capacity as u64;
        if capacity == 0 || self.queue_remaining_capacity == u32::MAX {
            return None;
        }
        Some(self.queue_size as f64 / capacity as f64)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Where a reconfiguration proposal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeSource {
    Dashboard,
    RemoteConfig,
}

/// Before/after pair for one config field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub before: String,
    pub after: String,
}

impl FieldChange {
    pub fn new(field: &str, before: impl std::fmt::Display, after: impl std::fmt::Display) -> Self {
        Self {
            field: field.to_string(),
            before: before.to_string(),
            after: after.to_string(),
        }
    }
}

/// Emitted after a successful reconfiguration apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub pool_id: String,
    pub old_config: PoolConfig,
    pub new_config: PoolConfig,
    /// Field-level diff, keyed by field name in stable order.
    pub changes: BTreeMap<String, FieldChange>,
    pub source: ChangeSource,
    pub changed_at: DateTime<Utc>,
}

/// Metric that breached its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlarmMetric {
    QueueUsage,
    ActiveRatio,
    RejectedTasks,
}

impl AlarmMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmMetric::QueueUsage => "queueUsage",
            AlarmMetric::ActiveRatio => "activeRatio",
            AlarmMetric::RejectedTasks => "rejectedTasks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlarmSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// Emitted by the alarm evaluator when a threshold is breached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    pub pool_id: String,
    pub metric: AlarmMetric,
    pub threshold: f64,
    pub observed: f64,
    pub severity: AlarmSeverity,
    /// Runtime snapshot at breach time, for the notification payload.
    pub sample: MetricsSample,
    pub raised_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_core_above_max() {
        let mut config = PoolConfig::new("p1");
        config.core_size = 5;
        config.max_size = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max() {
        let mut config = PoolConfig::new("p1");
        config.core_size = 0;
        config.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_core_equal_max() {
        let mut config = PoolConfig::new("p1");
        config.core_size = 4;
        config.max_size = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn queue_usage_ratio() {
        let sample = MetricsSample {
            pool_id: "p1".to_string(),
            kind: SampleKind::Basic,
            pool_size: 2,
            active_count: 1,
            queue_size: 9,
            queue_remaining_capacity: 1,
            completed_count: 0,
            reject_count: 0,
            largest_pool_size: 2,
            sampled_at: Utc::now(),
        };
        assert_eq!(sample.queue_usage(), Some(0.9));
    }

    #[test]
    fn queue_usage_none_for_unbounded() {
        let sample = MetricsSample {
            pool_id: "p1".to_string(),
            kind: SampleKind::Basic,
            pool_size: 2,
            active_count: 1,
            queue_size: 9,
            queue_remaining_capacity: u32::MAX,
            completed_count: 0,
            reject_count: 0,
            largest_pool_size: 2,
            sampled_at: Utc::now(),
        };
        assert_eq!(sample.queue_usage(), None);
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = PoolConfig::new("p1");
        config.queue_capacity = QueueCapacity::Unbounded;
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
