//! Pool Builder
//!
//! Fluent construction of a managed pool: validate the parameter set,
//! build the executor, register it. Nothing is registered until the whole
//! chain succeeds, so a failed build leaves no trace in the registry.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use tp_common::{AlarmThresholds, NotifyTargets, PoolConfig, QueueCapacity, RejectionPolicy};

use crate::error::ControlError;
use crate::executor::Executor;
use crate::registry::{PoolInstance, PoolKind, PoolRegistry};
use crate::Result;

/// Builder for a managed worker pool.
pub struct PoolBuilder {
    config: PoolConfig,
    thresholds: Option<AlarmThresholds>,
    notify_targets: Option<NotifyTargets>,
}

impl PoolBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            config: PoolConfig::new(id),
            thresholds: None,
            notify_targets: None,
        }
    }

    pub fn core_size(mut self, core: u32) -> Self {
        self.config.core_size = core;
        self
    }

    pub fn max_size(mut self, max: u32) -> Self {
        self.config.max_size = max;
        self
    }

    pub fn queue_capacity(mut self, capacity: QueueCapacity) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.config.rejection_policy = policy;
        self
    }

    pub fn allow_core_timeout(mut self, allow: bool) -> Self {
        self.config.allow_core_timeout = allow;
        self
    }

    pub fn alarm_thresholds(mut self, thresholds: AlarmThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    pub fn notify_targets(mut self, targets: NotifyTargets) -> Self {
        self.notify_targets = Some(targets);
        self
    }

    /// Validate, construct, start, and register the pool.
    ///
    /// Validation failures and duplicate ids both fail before anything is
    /// created or registered.
    pub fn register(self, registry: &PoolRegistry) -> Result<Arc<PoolInstance>> {
        self.config.validate().map_err(ControlError::Validation)?;

        // Check the id up front so we never build an executor we would
        // immediately throw away. The registry re-checks under its write
        // lock, so a racing duplicate still loses there.
        if registry.get(&self.config.id).is_some() {
            return Err(ControlError::DuplicateId(self.config.id));
        }

        let executor = Arc::new(Executor::new(&self.config));
        let instance = Arc::new(PoolInstance::new(
            executor,
            self.config,
            PoolKind::Application,
        ));
        if let Some(thresholds) = self.thresholds {
            instance.set_thresholds(thresholds);
        }
        if let Some(targets) = self.notify_targets {
            instance.set_notify_targets(targets);
        }

        registry.register(instance.clone())?;
        instance.executor.start();

        info!(pool_id = %instance.id(), "Built and registered pool");
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_registers() {
        let registry = PoolRegistry::new();
        let instance = PoolBuilder::new("orders")
            .core_size(2)
            .max_size(8)
            .queue_capacity(QueueCapacity::Bounded(64))
            .rejection_policy(RejectionPolicy::CallerRuns)
            .register(&registry)
            .unwrap();

        assert_eq!(instance.config().core_size, 2);
        assert_eq!(instance.config().max_size, 8);
        assert!(instance.executor.is_running());
        assert!(registry.get("orders").is_some());
    }

    #[test]
    fn invalid_config_registers_nothing() {
        let registry = PoolRegistry::new();
        let result = PoolBuilder::new("bad")
            .core_size(8)
            .max_size(2)
            .register(&registry);

        assert!(matches!(result, Err(ControlError::Validation(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_id_registers_nothing_new() {
        let registry = PoolRegistry::new();
        PoolBuilder::new("orders").register(&registry).unwrap();

        let result = PoolBuilder::new("orders").max_size(16).register(&registry);
        assert!(matches!(result, Err(ControlError::DuplicateId(_))));
        assert_eq!(registry.len(), 1);
        // Original untouched
        assert_eq!(registry.get("orders").unwrap().config().max_size, 1);
    }

    #[test]
    fn custom_thresholds_and_targets_applied() {
        let registry = PoolRegistry::new();
        let mut thresholds = AlarmThresholds::default();
        thresholds.queue_usage_threshold = 0.5;
        let targets = NotifyTargets {
            channels: vec!["webhook".to_string()],
            recipients: vec!["oncall".to_string()],
        };

        let instance = PoolBuilder::new("orders")
            .alarm_thresholds(thresholds.clone())
            .notify_targets(targets.clone())
            .register(&registry)
            .unwrap();

        assert_eq!(instance.thresholds(), thresholds);
        assert_eq!(instance.notify_targets(), targets);
    }
}
