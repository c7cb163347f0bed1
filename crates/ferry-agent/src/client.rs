//! Orchestrator client interfaces.
//!
//! The orchestrator is an external collaborator behind two traits: a
//! provider that resolves per-team handles, and the handle itself, which
//! can apply resources and wait for rollouts. The kube-backed
//! implementations live in [`crate::kube`]; tests substitute recording
//! mocks.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::resource::Resource;

/// Errors from the orchestrator client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A team client could not be constructed.
    #[error("creating team client: {0}")]
    TeamClient(String),

    /// The orchestrator rejected a resource application.
    #[error("applying resource: {0}")]
    Apply(String),

    /// The rollout did not converge before its deadline.
    #[error("rollout of {kind} '{name}' did not complete before the deadline")]
    RolloutDeadline {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
    },

    /// The rollout failed.
    #[error("rollout failed: {0}")]
    Rollout(String),
}

/// A per-team, per-namespace handle to the orchestrator.
#[async_trait]
pub trait TeamClient: Send + Sync {
    /// Applies one declarative resource, returning the applied document.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] when the orchestrator rejects the
    /// resource.
    async fn apply(&self, resource: &Resource) -> Result<Resource, ClientError>;

    /// Waits until the resource's rollout converges or `deadline` passes.
    ///
    /// # Errors
    ///
    /// [`ClientError::RolloutDeadline`] on deadline expiry,
    /// [`ClientError::Rollout`] when the rollout terminally fails.
    async fn wait_for_rollout(
        &self,
        resource: &Resource,
        deadline: Instant,
    ) -> Result<(), ClientError>;
}

/// Resolves team clients. Implementations cache handles per
/// `(team, namespace)`.
#[async_trait]
pub trait TeamClientProvider: Send + Sync {
    /// Returns the handle for `team` scoped to `namespace`, creating the
    /// underlying service account first when `auto_create_service_account`
    /// is set.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TeamClient`] when the handle cannot be
    /// constructed.
    async fn team_client(
        &self,
        team: &str,
        namespace: &str,
        auto_create_service_account: bool,
    ) -> Result<Arc<dyn TeamClient>, ClientError>;
}
