//! Pool Registry
//!
//! Process-wide catalog of managed worker pools. Each entry pairs the live
//! executor with its current config snapshot and alarm/notify settings.
//! Registration order is preserved so listings are stable across calls.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tp_common::{AlarmThresholds, MetricsSample, NotifyTargets, PoolConfig};

use crate::error::ControlError;
use crate::executor::Executor;
use crate::Result;

/// How a pool entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Built and registered by application code.
    Application,
    /// Adapted from an embedded web server's request pool.
    Web,
}

/// A registered pool: the executor plus its management metadata.
///
/// `config` is the authoritative snapshot of the pool's parameters. The
/// executor holds the same values in its atomics; the reconfiguration
/// engine keeps the two in step under the pool's id lock.
pub struct PoolInstance {
    pub executor: Arc<Executor>,
    pub kind: PoolKind,
    config: RwLock<PoolConfig>,
    thresholds: RwLock<AlarmThresholds>,
    notify_targets: RwLock<NotifyTargets>,
    /// Most recent monitor sample, replaced wholesale each tick.
    latest_sample: RwLock<Option<MetricsSample>>,
}

impl PoolInstance {
    pub fn new(executor: Arc<Executor>, config: PoolConfig, kind: PoolKind) -> Self {
        Self {
            executor,
            kind,
            config: RwLock::new(config),
            thresholds: RwLock::new(AlarmThresholds::default()),
            notify_targets: RwLock::new(NotifyTargets::default()),
            latest_sample: RwLock::new(None),
        }
    }

    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    /// Replace the config snapshot. Only the reconfiguration engine should
    /// call this, and only while holding the pool's id lock.
    pub(crate) fn store_config(&self, config: PoolConfig) {
        *self.config.write() = config;
    }

    pub fn thresholds(&self) -> AlarmThresholds {
        self.thresholds.read().clone()
    }

    pub fn set_thresholds(&self, thresholds: AlarmThresholds) {
        *self.thresholds.write() = thresholds;
    }

    pub fn notify_targets(&self) -> NotifyTargets {
        self.notify_targets.read().clone()
    }

    pub fn set_notify_targets(&self, targets: NotifyTargets) {
        *self.notify_targets.write() = targets;
    }

    pub fn latest_sample(&self) -> Option<MetricsSample> {
        self.latest_sample.read().clone()
    }

    pub(crate) fn store_sample(&self, sample: MetricsSample) {
        *self.latest_sample.write() = Some(sample);
    }
}

/// Registry of all managed pools, keyed by pool id.
///
/// Insertion order is preserved; `list()` returns pools in the order they
/// were registered.
pub struct PoolRegistry {
    pools: RwLock<IndexMap<String, Arc<PoolInstance>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(IndexMap::new()),
        }
    }

    /// Register a pool. Fails if the id is already taken; the existing
    /// pool is left untouched.
    pub fn register(&self, instance: Arc<PoolInstance>) -> Result<()> {
        let id = instance.id();
        let mut pools = self.pools.write();
        if pools.contains_key(&id) {
            warn!(pool_id = %id, "Rejecting duplicate pool registration");
            return Err(ControlError::DuplicateId(id));
        }
        info!(pool_id = %id, kind = ?instance.kind, "Registered pool");
        pools.insert(id, instance);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PoolInstance>> {
        self.pools.read().get(id).cloned()
    }

    /// Snapshot of all pools in registration order. The snapshot is
    /// detached: concurrent register/deregister calls do not invalidate it.
    pub fn list(&self) -> Vec<Arc<PoolInstance>> {
        self.pools.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Remove a pool from the registry. The executor is not shut down;
    /// callers that want to stop it do so explicitly.
    pub fn deregister(&self, id: &str) -> Option<Arc<PoolInstance>> {
        let removed = self.pools.write().shift_remove(id);
        if removed.is_some() {
            debug!(pool_id = %id, "Deregistered pool");
        }
        removed
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
