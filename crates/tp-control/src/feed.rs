//! Change-Proposal Feed
//!
//! Reconfiguration proposals arrive on an mpsc channel from whatever
//! front end produces them (dashboard handler, remote config poller) and
//! are routed to the engine one at a time. Apply failures are logged and
//! the feed keeps going; one bad proposal never stalls the stream.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tp_common::{ChangeSource, PoolConfig};

use crate::error::ControlError;
use crate::reconfig::ReconfigEngine;

/// One inbound reconfiguration request.
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    pub config: PoolConfig,
    pub source: ChangeSource,
}

/// Spawn the feed consumer task. Exits when the proposal channel closes
/// or shutdown is broadcast.
pub fn spawn_proposal_feed(
    engine: Arc<ReconfigEngine>,
    mut proposals: mpsc::Receiver<ChangeProposal>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Change-proposal feed started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Change-proposal feed shutting down");
                    break;
                }
                proposal = proposals.recv() => {
                    match proposal {
                        Some(proposal) => handle_proposal(&engine, proposal).await,
                        None => {
                            info!("Proposal channel closed, feed exiting");
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn handle_proposal(engine: &ReconfigEngine, proposal: ChangeProposal) {
    let pool_id = proposal.config.id.clone();
    match engine.apply(proposal.config, proposal.source).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(pool_id = %pool_id, "Proposal matched current config, nothing applied");
        }
        Err(ControlError::PartialApply {
            pool_id, reason, ..
        }) => {
            error!(pool_id = %pool_id, %reason, "Proposal applied partially");
        }
        Err(e) => {
            warn!(pool_id = %pool_id, error = %e, "Proposal rejected");
        }
    }
}
