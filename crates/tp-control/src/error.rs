use thiserror::Error;
use tp_common::FieldChange;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid pool config: {0}")]
    Validation(String),

    #[error("Pool already registered: {0}")]
    DuplicateId(String),

    #[error("Pool not found: {0}")]
    UnknownPool(String),

    /// A reconfiguration failed partway through. The pool is left at the
    /// last successfully-applied intermediate state; `applied` carries the
    /// fields that made it in before the failure.
    #[error("Partial reconfiguration of pool {pool_id}: {applied:?} applied before failure: {reason}")]
    PartialApply {
        pool_id: String,
        applied: Vec<FieldChange>,
        reason: String,
    },

    #[error("Pool is shut down: {0}")]
    ExecutorShutdown(String),

    #[error("Task rejected by pool {0}")]
    Rejected(String),

    #[error("Web pool extraction failed: {0}")]
    Extraction(String),
}
