//! Status publisher.
//!
//! A single task drains the process-wide status channel, seals each
//! status with the shared signature key, and produces it to the statuses
//! topic. Backpressure from a slow producer deliberately blocks status
//! emission; the statuses are small and share the broker cluster with the
//! requests.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use ferry_core::bus::DualClient;
use ferry_core::protocol::DeploymentStatus;

/// Capacity of the status channel. Many producers (runs and monitors),
/// one consumer (the publisher).
pub const STATUS_QUEUE_DEPTH: usize = 64;

/// Creates the process-wide status channel.
#[must_use]
pub fn status_channel() -> (
    mpsc::Sender<DeploymentStatus>,
    mpsc::Receiver<DeploymentStatus>,
) {
    mpsc::channel(STATUS_QUEUE_DEPTH)
}

/// Runs the publisher until the status channel closes.
pub async fn publish_loop(bus: Arc<DualClient>, mut rx: mpsc::Receiver<DeploymentStatus>) {
    info!("starting status publisher");

    while let Some(status) = rx.recv().await {
        match bus.produce_sealed(&status).await {
            Ok(()) => {
                counter!("ferry_agent_statuses_published_total").increment(1);
                debug!(
                    delivery_id = %status.delivery_id,
                    state = %status.state(),
                    "status published"
                );
            }
            Err(err) => {
                error!(
                    error = %err,
                    delivery_id = %status.delivery_id,
                    state = %status.state(),
                    "unable to publish status"
                );
            }
        }
    }

    info!("status channel closed; publisher exiting");
}
