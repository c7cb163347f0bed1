//! Upstream provider deployment-status API.
//!
//! The ingress mirrors the status stream onto the provider's deployment
//! record: `queued` when a request is enqueued, then whatever the agents
//! publish. The provider client is a collaborator behind [`StatusPoster`];
//! the HTTP implementation targets the provider's REST shape
//! (`POST /repos/{owner}/{name}/deployments/{id}/statuses`).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::protocol::DeploymentStatus;

/// Errors from posting a status upstream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The status does not reference a deployment record.
    #[error("status carries no deployment reference")]
    MissingDeployment,

    /// The deployment reference has no repository.
    #[error("deployment reference carries no repository")]
    MissingRepository,

    /// Transport-level failure.
    #[error("posting deployment status upstream")]
    Transport(#[from] reqwest::Error),

    /// The provider rejected the status.
    #[error("upstream returned HTTP {status}")]
    Status {
        /// The offending status code.
        status: u16,
    },
}

/// Posts deployment statuses to the upstream provider.
#[async_trait]
pub trait StatusPoster: Send + Sync {
    /// Posts one status transition for the referenced deployment record.
    ///
    /// # Errors
    ///
    /// Returns an [`UpstreamError`] when the status cannot be posted.
    async fn post(&self, status: &DeploymentStatus) -> Result<(), UpstreamError>;
}

/// HTTP implementation against the provider's REST API.
pub struct HttpStatusPoster {
    base_url: String,
    token: SecretString,
    client: reqwest::Client,
}

impl HttpStatusPoster {
    /// Creates a poster against `base_url` authenticated with a bearer
    /// token.
    #[must_use]
    pub fn new(base_url: String, token: SecretString) -> Self {
        Self {
            base_url,
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl StatusPoster for HttpStatusPoster {
    async fn post(&self, status: &DeploymentStatus) -> Result<(), UpstreamError> {
        let deployment = status
            .deployment
            .as_ref()
            .ok_or(UpstreamError::MissingDeployment)?;
        let repository = deployment
            .repository
            .as_ref()
            .ok_or(UpstreamError::MissingRepository)?;

        let url = format!(
            "{}/repos/{}/{}/deployments/{}/statuses",
            self.base_url.trim_end_matches('/'),
            repository.owner,
            repository.name,
            deployment.deployment_id,
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .json(&json!({
                "state": status.state().to_string(),
                "description": status.description,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
            });
        }

        info!(
            delivery_id = %status.delivery_id,
            repository = %repository.full_name(),
            state = %status.state(),
            "deployment status posted upstream"
        );
        Ok(())
    }
}

/// Logs statuses instead of posting them. Development and test rigs.
pub struct LogStatusPoster;

#[async_trait]
impl StatusPoster for LogStatusPoster {
    async fn post(&self, status: &DeploymentStatus) -> Result<(), UpstreamError> {
        info!(
            delivery_id = %status.delivery_id,
            state = %status.state(),
            description = %status.description,
            "deployment status (not posted upstream)"
        );
        Ok(())
    }
}
