//! Lifecycle Manager
//!
//! Owns the background tasks of the control plane: the monitor ticker,
//! the alarm ticker, and the proposal feed. Shutdown is cooperative - a
//! broadcast tells every task to finish its current iteration and exit,
//! and `shutdown()` waits (bounded) for them to do so.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alarm::AlarmEvaluator;
use crate::feed::{spawn_proposal_feed, ChangeProposal};
use crate::monitor::Monitor;
use crate::reconfig::ReconfigEngine;

/// Background-task intervals.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub monitor_interval: Duration,
    pub alarm_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(10),
            alarm_interval: Duration::from_secs(5),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl LifecycleManager {
    /// Spawn the control-plane background tasks. The proposal receiver is
    /// optional; a deployment with no external config source simply runs
    /// monitor and alarms.
    pub fn start(
        config: ControlConfig,
        monitor: Arc<Monitor>,
        evaluator: Arc<AlarmEvaluator>,
        engine: Arc<ReconfigEngine>,
        proposals: Option<mpsc::Receiver<ChangeProposal>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(spawn_monitor_task(
            monitor,
            config.monitor_interval,
            shutdown_tx.subscribe(),
        ));
        tasks.push(spawn_alarm_task(
            evaluator,
            config.alarm_interval,
            shutdown_tx.subscribe(),
        ));
        if let Some(rx) = proposals {
            tasks.push(spawn_proposal_feed(engine, rx, shutdown_tx.subscribe()));
        }

        info!(
            monitor_interval_secs = config.monitor_interval.as_secs(),
            alarm_interval_secs = config.alarm_interval.as_secs(),
            tasks = tasks.len(),
            "Control plane started"
        );

        Self { shutdown_tx, tasks }
    }

    /// Stop all background tasks and wait up to five seconds for each.
    pub async fn shutdown(self) {
        info!("Control plane shutting down");
        let _ = self.shutdown_tx.send(());

        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("Background task did not stop within the shutdown window");
            }
        }
        info!("Control plane stopped");
    }
}

fn spawn_monitor_task(
    monitor: Arc<Monitor>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    monitor.tick();
                }
            }
        }
    })
}

fn spawn_alarm_task(
    evaluator: Arc<AlarmEvaluator>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    evaluator.evaluate_tick().await;
                }
            }
        }
    })
}
