//! Live Reconfiguration Engine
//!
//! Applies a proposed config to a registered pool under that pool's id
//! lock. The protocol:
//!
//! 1. Look up the pool; unknown ids fail fast.
//! 2. Validate the proposed config as a whole.
//! 3. Acquire the pool's id lock - proposals for the same pool serialize,
//!    proposals for different pools proceed in parallel.
//! 4. Diff against the current snapshot; a no-change proposal releases the
//!    lock and emits nothing.
//! 5. Apply changed fields through the executor's narrow mutators. Core
//!    and max are ordered so the `core <= max` invariant holds at every
//!    intermediate step.
//! 6. Store the new snapshot, release the lock, then dispatch the change
//!    notification. No I/O happens inside the critical section.
//!
//! A mutator failure mid-apply stores the intermediate state actually
//! reached and surfaces `PartialApply`. There is no rollback: half-applied
//! mutations have already taken effect on live workers, and unwinding them
//! would just be a second reconfiguration that could itself fail.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use tp_common::{ChangeEvent, ChangeSource, FieldChange, PoolConfig};

use crate::error::ControlError;
use crate::id_lock::IdLockRegistry;
use crate::notifier::NotifierDispatcher;
use crate::registry::PoolRegistry;
use crate::Result;

pub struct ReconfigEngine {
    registry: Arc<PoolRegistry>,
    locks: Arc<IdLockRegistry>,
    dispatcher: Option<Arc<NotifierDispatcher>>,
}

impl ReconfigEngine {
    pub fn new(registry: Arc<PoolRegistry>, locks: Arc<IdLockRegistry>) -> Self {
        Self {
            registry,
            locks,
            dispatcher: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<NotifierDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Apply `proposed` to the pool it names.
    ///
    /// Returns the change event on success, or `None` when the proposal
    /// matched the current config field for field.
    pub async fn apply(
        &self,
        proposed: PoolConfig,
        source: ChangeSource,
    ) -> Result<Option<ChangeEvent>> {
        let instance = self
            .registry
            .get(&proposed.id)
            .ok_or_else(|| ControlError::UnknownPool(proposed.id.clone()))?;

        proposed.validate().map_err(ControlError::Validation)?;

        let lock = self.locks.lock_for(&proposed.id);
        let event = {
            let _guard = lock.lock().await;

            let current = instance.config();
            let changes = diff_configs(&current, &proposed);
            if changes.is_empty() {
                debug!(pool_id = %proposed.id, "Reconfiguration proposal matches current config");
                return Ok(None);
            }

            let mut effective = current.clone();
            let mut applied: Vec<FieldChange> = Vec::new();

            let result = apply_changes(
                &instance.executor,
                &current,
                &proposed,
                &changes,
                &mut effective,
                &mut applied,
            );

            // The snapshot must reflect what actually took effect, whether
            // the apply completed or stopped partway.
            instance.store_config(effective);

            if let Err(reason) = result {
                warn!(
                    pool_id = %proposed.id,
                    applied = applied.len(),
                    %reason,
                    "Reconfiguration stopped partway"
                );
                return Err(ControlError::PartialApply {
                    pool_id: proposed.id,
                    applied,
                    reason,
                });
            }

            info!(
                pool_id = %proposed.id,
                changed_fields = %changes.keys().cloned().collect::<Vec<_>>().join(","),
                source = ?source,
                "Pool reconfigured"
            );

            ChangeEvent {
                pool_id: proposed.id.clone(),
                old_config: current,
                new_config: proposed,
                changes,
                source,
                changed_at: Utc::now(),
            }
        };

        // Lock released; notification I/O happens out here.
        if let Some(dispatcher) = &self.dispatcher {
            let targets = instance.notify_targets();
            dispatcher.dispatch_change(&event, &targets).await;
        }

        Ok(Some(event))
    }
}

/// Field-level diff in stable (alphabetical) order.
fn diff_configs(current: &PoolConfig, proposed: &PoolConfig) -> BTreeMap<String, FieldChange> {
    let mut changes = BTreeMap::new();

    if current.core_size != proposed.core_size {
        changes.insert(
            "coreSize".to_string(),
            FieldChange::new("coreSize", current.core_size, proposed.core_size),
        );
    }
    if current.max_size != proposed.max_size {
        changes.insert(
            "maxSize".to_string(),
            FieldChange::new("maxSize", current.max_size, proposed.max_size),
        );
    }
    if current.queue_capacity != proposed.queue_capacity {
        changes.insert(
            "queueCapacity".to_string(),
            FieldChange::new(
                "queueCapacity",
                format!("{:?}", current.queue_capacity),
                format!("{:?}", proposed.queue_capacity),
            ),
        );
    }
    if current.keep_alive != proposed.keep_alive {
        changes.insert(
            "keepAlive".to_string(),
            FieldChange::new(
                "keepAlive",
                current.keep_alive.as_secs(),
                proposed.keep_alive.as_secs(),
            ),
        );
    }
    if current.rejection_policy != proposed.rejection_policy {
        changes.insert(
            "rejectionPolicy".to_string(),
            FieldChange::new(
                "rejectionPolicy",
                format!("{:?}", current.rejection_policy),
                format!("{:?}", proposed.rejection_policy),
            ),
        );
    }
    if current.allow_core_timeout != proposed.allow_core_timeout {
        changes.insert(
            "allowCoreTimeout".to_string(),
            FieldChange::new(
                "allowCoreTimeout",
                current.allow_core_timeout,
                proposed.allow_core_timeout,
            ),
        );
    }

    changes
}

/// Push changed fields into the executor, recording each success into
/// `effective`/`applied`. Returns the failure reason if a mutator refuses.
fn apply_changes(
    executor: &crate::executor::Executor,
    current: &PoolConfig,
    proposed: &PoolConfig,
    changes: &BTreeMap<String, FieldChange>,
    effective: &mut PoolConfig,
    applied: &mut Vec<FieldChange>,
) -> std::result::Result<(), String> {
    let core_changed = changes.contains_key("coreSize");
    let max_changed = changes.contains_key("maxSize");

    // Core/max ordering: when the new core exceeds the old max, raising
    // core first would transiently violate core <= max, so max goes first.
    // In every other case core goes first so a shrinking max never dips
    // below the (old, larger) core.
    if proposed.core_size > current.max_size {
        if max_changed {
            apply_field(changes, "maxSize", applied, || {
                executor.set_max_size(proposed.max_size)?;
                Ok(())
            })?;
            effective.max_size = proposed.max_size;
        }
        if core_changed {
            apply_field(changes, "coreSize", applied, || {
                executor.set_core_size(proposed.core_size)?;
                Ok(())
            })?;
            effective.core_size = proposed.core_size;
        }
    } else {
        if core_changed {
            apply_field(changes, "coreSize", applied, || {
                executor.set_core_size(proposed.core_size)?;
                Ok(())
            })?;
            effective.core_size = proposed.core_size;
        }
        if max_changed {
            apply_field(changes, "maxSize", applied, || {
                executor.set_max_size(proposed.max_size)?;
                Ok(())
            })?;
            effective.max_size = proposed.max_size;
        }
    }

    if changes.contains_key("queueCapacity") {
        apply_field(changes, "queueCapacity", applied, || {
            executor.set_queue_capacity(proposed.queue_capacity)?;
            Ok(())
        })?;
        effective.queue_capacity = proposed.queue_capacity;
    }
    if changes.contains_key("keepAlive") {
        apply_field(changes, "keepAlive", applied, || {
            executor.set_keep_alive(proposed.keep_alive)?;
            Ok(())
        })?;
        effective.keep_alive = proposed.keep_alive;
    }
    if changes.contains_key("rejectionPolicy") {
        apply_field(changes, "rejectionPolicy", applied, || {
            executor.set_rejection_policy(proposed.rejection_policy)?;
            Ok(())
        })?;
        effective.rejection_policy = proposed.rejection_policy;
    }
    if changes.contains_key("allowCoreTimeout") {
        apply_field(changes, "allowCoreTimeout", applied, || {
            executor.set_allow_core_timeout(proposed.allow_core_timeout)?;
            Ok(())
        })?;
        effective.allow_core_timeout = proposed.allow_core_timeout;
    }

    Ok(())
}

fn apply_field(
    changes: &BTreeMap<String, FieldChange>,
    field: &str,
    applied: &mut Vec<FieldChange>,
    op: impl FnOnce() -> Result<()>,
) -> std::result::Result<(), String> {
    op().map_err(|e| e.to_string())?;
    if let Some(change) = changes.get(field) {
        applied.push(change.clone());
    }
    Ok(())
}
