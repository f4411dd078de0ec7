pub mod alarm;
pub mod builder;
pub mod error;
pub mod executor;
pub mod feed;
pub mod id_lock;
pub mod lifecycle;
pub mod monitor;
pub mod notifier;
pub mod reconfig;
pub mod registry;
pub mod web_adapter;

pub use alarm::{AlarmEvaluator, AlarmSilencer};
pub use builder::PoolBuilder;
pub use error::ControlError;
pub use executor::{Executor, Job};
pub use feed::{spawn_proposal_feed, ChangeProposal};
pub use id_lock::IdLockRegistry;
pub use lifecycle::{ControlConfig, LifecycleManager};
pub use monitor::{Monitor, PoolState};
pub use notifier::{
    create_notifier_dispatcher, LogChannel, NotifierChannel, NotifierDispatcher, WebhookChannel,
};
pub use reconfig::ReconfigEngine;
pub use registry::{PoolInstance, PoolKind, PoolRegistry};
pub use web_adapter::{
    register_web_pool, EmbeddedPoolExtractor, ServerHandle, WebPoolExtractor, WebPoolHandle,
};

pub type Result<T> = std::result::Result<T, ControlError>;
