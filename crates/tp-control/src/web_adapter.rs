//! Web-Server Pool Adapter
//!
//! Embedded web servers run their own request worker pool. This adapter
//! pulls that pool out of a server handle and registers it alongside the
//! application pools, so the monitor, alarm evaluator, and reconfiguration
//! engine manage it like any other.
//!
//! Extraction is per server family. Each family contributes a
//! `WebPoolExtractor`; the right one is picked at runtime by matching the
//! handle's family tag, so adding a family means adding an extractor, not
//! touching the adapter.

use std::any::Any;
use std::sync::Arc;

use tracing::info;

use tp_common::PoolConfig;

use crate::error::ControlError;
use crate::executor::Executor;
use crate::registry::{PoolInstance, PoolKind, PoolRegistry};
use crate::Result;

/// Opaque handle to a running web server. The payload is family-specific;
/// extractors downcast it to whatever their server exposes.
pub struct ServerHandle {
    family: String,
    inner: Box<dyn Any + Send + Sync>,
}

impl ServerHandle {
    pub fn new(family: impl Into<String>, inner: impl Any + Send + Sync) -> Self {
        Self {
            family: family.into(),
            inner: Box::new(inner),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

/// Extracts the request worker pool from one server family's handle.
pub trait WebPoolExtractor: Send + Sync {
    /// Family tag this extractor understands ("embedded", "proxy", ...).
    fn family(&self) -> &str;

    fn extract(&self, server: &ServerHandle) -> Result<Arc<Executor>>;
}

/// Extractor for the in-process server family, whose handle carries its
/// worker pool directly.
pub struct EmbeddedPoolExtractor;

impl WebPoolExtractor for EmbeddedPoolExtractor {
    fn family(&self) -> &str {
        "embedded"
    }

    fn extract(&self, server: &ServerHandle) -> Result<Arc<Executor>> {
        server
            .downcast_ref::<Arc<Executor>>()
            .cloned()
            .ok_or_else(|| {
                ControlError::Extraction(format!(
                    "embedded server handle for family '{}' does not carry a worker pool",
                    server.family()
                ))
            })
    }
}

/// A web pool under management.
pub struct WebPoolHandle {
    pub instance: Arc<PoolInstance>,
    pub family: String,
}

/// Extract the server's pool and register it.
///
/// The config snapshot is rebuilt from the live executor, so the registry
/// entry reflects whatever the server booted with.
pub fn register_web_pool(
    registry: &PoolRegistry,
    extractors: &[Arc<dyn WebPoolExtractor>],
    server: &ServerHandle,
) -> Result<WebPoolHandle> {
    let extractor = extractors
        .iter()
        .find(|e| e.family() == server.family())
        .ok_or_else(|| {
            ControlError::Extraction(format!(
                "no extractor registered for server family '{}'",
                server.family()
            ))
        })?;

    let executor = extractor.extract(server)?;

    let config = PoolConfig {
        id: executor.id().to_string(),
        core_size: executor.core_size(),
        max_size: executor.max_size(),
        queue_capacity: executor.queue_capacity(),
        keep_alive: executor.keep_alive(),
        rejection_policy: executor.rejection_policy(),
        allow_core_timeout: executor.allow_core_timeout(),
    };
    config.validate().map_err(ControlError::Validation)?;

    let instance = Arc::new(PoolInstance::new(executor, config, PoolKind::Web));
    registry.register(instance.clone())?;

    info!(
        pool_id = %instance.id(),
        family = %server.family(),
        "Web server pool under management"
    );

    Ok(WebPoolHandle {
        instance,
        family: server.family().to_string(),
    })
}
