//! Rollout monitors.
//!
//! One task per monitorable resource, spawned before the resource is
//! applied. A monitor outlives sibling apply failures: once the
//! orchestrator has accepted a resource, its rollout is worth observing
//! even when a later resource in the same request is rejected. Monitors
//! never cancel each other; each emits exactly one terminal status.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use ferry_core::protocol::{DeploymentRequest, DeploymentStatus};

use crate::client::TeamClient;
use crate::resource::Resource;

/// How long a rollout may take before its monitor gives up.
pub const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Spawns the monitor task for one resource.
pub fn spawn(
    client: Arc<dyn TeamClient>,
    req: DeploymentRequest,
    resource: Resource,
    status_tx: mpsc::Sender<DeploymentStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = Instant::now() + ROLLOUT_TIMEOUT;
        let status = match client.wait_for_rollout(&resource, deadline).await {
            Ok(()) => {
                info!(
                    delivery_id = %req.delivery_id,
                    kind = %resource.kind(),
                    name = %resource.name(),
                    "rollout complete"
                );
                DeploymentStatus::success(&req)
            }
            Err(err) => {
                warn!(
                    delivery_id = %req.delivery_id,
                    kind = %resource.kind(),
                    name = %resource.name(),
                    error = %err,
                    "rollout did not complete"
                );
                DeploymentStatus::failure(&req, &err)
            }
        };
        if status_tx.send(status).await.is_err() {
            warn!("status channel closed; dropping monitor status");
        }
    })
}
