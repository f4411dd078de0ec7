//! Notification Channels and Dispatch
//!
//! Alarm and change events fan out to named channels (webhook endpoints,
//! the process log). A failing channel never blocks the others, and
//! dispatch failures never propagate back into the control plane - they
//! are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use tp_common::{AlarmEvent, ChangeEvent, NotifyTargets};

/// A delivery channel for control-plane events.
#[async_trait]
pub trait NotifierChannel: Send + Sync {
    /// Channel identifier, matched against `NotifyTargets::channels`.
    fn name(&self) -> &str;

    async fn send_alarm(&self, event: &AlarmEvent, recipients: &[String]) -> anyhow::Result<()>;

    async fn send_change(&self, event: &ChangeEvent, recipients: &[String]) -> anyhow::Result<()>;
}

/// Posts events as JSON to a webhook endpoint.
pub struct WebhookChannel {
    name: String,
    webhook_url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(
        name: impl Into<String>,
        webhook_url: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            name: name.into(),
            webhook_url: webhook_url.into(),
            client,
        })
    }

    async fn post(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if response.status().is_success() {
            debug!(channel = %self.name, "Webhook notification delivered");
            Ok(())
        } else {
            anyhow::bail!(
                "webhook returned status {} for channel {}",
                response.status(),
                self.name
            )
        }
    }
}

#[async_trait]
impl NotifierChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_alarm(&self, event: &AlarmEvent, recipients: &[String]) -> anyhow::Result<()> {
        let payload = json!({
            "type": "alarm",
            "poolId": event.pool_id,
            "metric": event.metric.as_str(),
            "severity": event.severity,
            "threshold": event.threshold,
            "observed": event.observed,
            "sample": event.sample,
            "recipients": recipients,
            "raisedAt": event.raised_at.to_rfc3339(),
        });
        self.post(payload).await
    }

    async fn send_change(&self, event: &ChangeEvent, recipients: &[String]) -> anyhow::Result<()> {
        let payload = json!({
            "type": "configChange",
            "poolId": event.pool_id,
            "source": event.source,
            "changes": event.changes,
            "recipients": recipients,
            "changedAt": event.changed_at.to_rfc3339(),
        });
        self.post(payload).await
    }
}

/// Writes events to the process log. Useful as a default channel and in
/// environments with no webhook endpoint.
pub struct LogChannel;

#[async_trait]
impl NotifierChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_alarm(&self, event: &AlarmEvent, _recipients: &[String]) -> anyhow::Result<()> {
        warn!(
            pool_id = %event.pool_id,
            metric = event.metric.as_str(),
            threshold = event.threshold,
            observed = event.observed,
            queue_size = event.sample.queue_size,
            active = event.sample.active_count,
            pool_size = event.sample.pool_size,
            "Pool alarm raised"
        );
        Ok(())
    }

    async fn send_change(&self, event: &ChangeEvent, _recipients: &[String]) -> anyhow::Result<()> {
        let fields: Vec<String> = event
            .changes
            .values()
            .map(|c| format!("{}: {} -> {}", c.field, c.before, c.after))
            .collect();
        info!(
            pool_id = %event.pool_id,
            source = ?event.source,
            changes = %fields.join(", "),
            "Pool configuration changed"
        );
        Ok(())
    }
}

/// Routes events to each channel a pool's `NotifyTargets` names.
///
/// Channels are registered once at startup; per-pool targets select among
/// them by name at dispatch time.
pub struct NotifierDispatcher {
    channels: HashMap<String, Arc<dyn NotifierChannel>>,
}

impl NotifierDispatcher {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    pub fn register_channel(&mut self, channel: Arc<dyn NotifierChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub async fn dispatch_alarm(&self, event: &AlarmEvent, targets: &NotifyTargets) {
        for name in &targets.channels {
            match self.channels.get(name) {
                Some(channel) => {
                    if let Err(e) = channel.send_alarm(event, &targets.recipients).await {
                        error!(
                            channel = %name,
                            pool_id = %event.pool_id,
                            error = %e,
                            "Alarm notification failed"
                        );
                    }
                }
                None => {
                    warn!(channel = %name, pool_id = %event.pool_id, "Unknown notification channel");
                }
            }
        }
    }

    pub async fn dispatch_change(&self, event: &ChangeEvent, targets: &NotifyTargets) {
        for name in &targets.channels {
            match self.channels.get(name) {
                Some(channel) => {
                    if let Err(e) = channel.send_change(event, &targets.recipients).await {
                        error!(
                            channel = %name,
                            pool_id = %event.pool_id,
                            error = %e,
                            "Change notification failed"
                        );
                    }
                }
                None => {
                    warn!(channel = %name, pool_id = %event.pool_id, "Unknown notification channel");
                }
            }
        }
    }
}

impl Default for NotifierDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a dispatcher with the log channel always present and a webhook
/// channel when an endpoint is configured.
pub fn create_notifier_dispatcher(webhook_url: Option<&str>) -> Arc<NotifierDispatcher> {
    let mut dispatcher = NotifierDispatcher::new();
    dispatcher.register_channel(Arc::new(LogChannel));

    match webhook_url {
        Some(url) if !url.is_empty() => match WebhookChannel::new("webhook", url) {
            Ok(channel) => {
                info!(url = %url, "Webhook notification channel enabled");
                dispatcher.register_channel(Arc::new(channel));
            }
            Err(e) => {
                error!(error = %e, "Webhook channel unavailable, falling back to log channel");
            }
        },
        _ => {
            info!("No webhook endpoint configured, log channel only");
        }
    }

    Arc::new(dispatcher)
}
