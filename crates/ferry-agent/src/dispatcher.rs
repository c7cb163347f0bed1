//! Message dispatcher.
//!
//! Reads the delivery channel, verifies each envelope, and starts one
//! [`crate::deploy::run`] task per message. Runs for different delivery
//! IDs never serialize on each other. The message's offset is stored only
//! after its run has returned, which is after the primary status was
//! enqueued; a crash in between redelivers the message, and idempotent
//! application absorbs the duplicate.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use ferry_core::bus::{ConsumedMessage, DualClient};
use ferry_core::protocol::{envelope, DeploymentRequest, DeploymentStatus};

use crate::client::TeamClientProvider;
use crate::config::AgentConfig;
use crate::deploy;

fn store_offset(bus: &DualClient, msg: &ConsumedMessage) {
    if let Err(err) = bus.store_offset(msg) {
        error!(
            error = %err,
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            "unable to store consumer offset"
        );
    }
}

/// Runs the dispatcher until the delivery channel closes.
pub async fn dispatch_loop(
    bus: Arc<DualClient>,
    mut rx: mpsc::Receiver<ConsumedMessage>,
    cfg: Arc<AgentConfig>,
    provider: Arc<dyn TeamClientProvider>,
    status_tx: mpsc::Sender<DeploymentStatus>,
) {
    info!(cluster = %cfg.cluster, "starting dispatcher");

    while let Some(msg) = rx.recv().await {
        let req = match envelope::open::<DeploymentRequest>(&msg.payload, bus.signature_key()) {
            Ok(req) => req,
            Err(err) => {
                // A bad MAC never becomes valid on redelivery.
                error!(
                    topic = %msg.topic,
                    offset = msg.offset,
                    error = %err,
                    "dropping unverifiable message"
                );
                store_offset(&bus, &msg);
                continue;
            }
        };

        let bus = bus.clone();
        let cfg = cfg.clone();
        let provider = provider.clone();
        let status_tx = status_tx.clone();
        tokio::spawn(async move {
            let delivery_id = req.delivery_id.clone();
            let outcome = tokio::spawn(deploy::run(req, cfg, provider, status_tx)).await;
            if let Err(err) = outcome {
                error!(
                    delivery_id = %delivery_id,
                    error = %err,
                    "deployment task panicked"
                );
            }
            store_offset(&bus, &msg);
        });
    }

    info!("delivery channel closed; dispatcher exiting");
}
