//! The dispatch handler: webhook delivery in, signed bus message out.
//!
//! Processing order is fixed and fails closed:
//!
//! 1. event type must be `deployment`
//! 2. body must parse as a deployment event with a repository
//! 3. the installation secret must exist for the repository
//! 4. the HMAC signature must verify against that secret
//! 5. the declared team must be in the repository's allowlist and
//!    provisioned with an API key
//!
//! Only then is the request sealed and published. The broker must
//! acknowledge the message before `queued` is reported upstream; a
//! `queued` that cannot be posted after a successful enqueue is logged
//! and swallowed, because the agents will produce further transitions.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use metrics::counter;
use tracing::{error, info, warn};

use ferry_core::bus::{BusError, DualClient};
use ferry_core::protocol::{DeploymentPayload, DeploymentRequest, DeploymentSpec, Repository};
use ferry_core::storage::{
    ApiKeyStorage, InstallationSecretSource, StorageError, TeamRepositories,
};
use ferry_core::upstream::StatusPoster;
use ferry_core::DeploymentStatus;

use crate::error::DispatchError;
use crate::event::DeploymentEvent;
use crate::signature::SignatureValidator;

/// Header carrying the HMAC-SHA256 body signature.
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Header carrying the event type.
const EVENT_HEADER: &str = "x-github-event";

/// Header carrying the provider-assigned delivery ID.
const DELIVERY_HEADER: &str = "x-github-delivery";

/// Maximum accepted body size (1 MiB). Deployment events with embedded
/// resources stay well under this.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// How long an enqueued request stays valid for agents.
const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// Publishes deployment requests to the bus.
///
/// The seam between the handler and the bus client; the production
/// implementation seals and produces through [`DualClient`].
#[async_trait]
pub trait RequestPublisher: Send + Sync {
    /// Seals and publishes one request, awaiting durable acceptance.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] when the bus does not acknowledge the
    /// message.
    async fn publish(&self, request: &DeploymentRequest) -> Result<(), BusError>;
}

#[async_trait]
impl RequestPublisher for DualClient {
    async fn publish(&self, request: &DeploymentRequest) -> Result<(), BusError> {
        // The bus message carries the request's own timestamp.
        let frame = ferry_core::protocol::envelope::seal(request, self.signature_key());
        self.produce_at(frame, request.timestamp).await
    }
}

/// Shared state for the dispatch endpoint.
pub struct DispatchState {
    /// Per-installation webhook secrets.
    pub secrets: Arc<dyn InstallationSecretSource>,

    /// Per-repository team allowlist.
    pub teams: Arc<dyn TeamRepositories>,

    /// Per-team API keys; a team without a provisioned key is not
    /// deployable.
    pub api_keys: Arc<dyn ApiKeyStorage>,

    /// Requests-topic publisher.
    pub publisher: Arc<dyn RequestPublisher>,

    /// Upstream deployment-status API.
    pub poster: Arc<dyn StatusPoster>,
}

/// Builds the router for the dispatch endpoint.
pub fn router(state: Arc<DispatchState>) -> Router {
    Router::new()
        .route("/events", post(dispatch_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[allow(clippy::cast_possible_wrap)]
fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

async fn dispatch_handler(
    State(state): State<Arc<DispatchState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, DispatchError> {
    let delivery_id = extract_header(&headers, DELIVERY_HEADER);
    let event_type = extract_header(&headers, EVENT_HEADER);

    info!(
        delivery_id = ?delivery_id,
        event_type = ?event_type,
        body_size = body.len(),
        "webhook delivery received"
    );

    let event_type = event_type.unwrap_or_default();
    if event_type != "deployment" {
        counter!("ferry_dispatch_rejected_total", "reason" => "event_type").increment(1);
        return Err(DispatchError::UnsupportedEventType(event_type));
    }

    let delivery_id = delivery_id.ok_or(DispatchError::MissingDeliveryId)?;

    let event: DeploymentEvent = serde_json::from_slice(&body)
        .map_err(|err| DispatchError::InvalidPayload(err.to_string()))?;
    let repository = event
        .repository
        .as_ref()
        .ok_or_else(|| DispatchError::InvalidPayload("event carries no repository".to_owned()))?;
    let (owner, name) = repository
        .split()
        .map_err(|full| DispatchError::InvalidPayload(format!("malformed repository '{full}'")))?;

    let secret = state
        .secrets
        .installation_secret(&repository.full_name)
        .await
        .map_err(|err| match err {
            StorageError::NotFound => DispatchError::UnknownRepository,
            other => DispatchError::Storage(other),
        })?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .ok_or(DispatchError::MissingSignature)?
        .to_str()
        .map_err(|_| DispatchError::InvalidSignatureFormat("non-ASCII characters".to_owned()))?;
    SignatureValidator::new(secret.webhook_secret).verify(&body, signature)?;

    let deployment = event
        .deployment
        .ok_or_else(|| DispatchError::InvalidPayload("event carries no deployment".to_owned()))?;
    let payload: DeploymentPayload = serde_json::from_value(deployment.payload)
        .map_err(|err| DispatchError::InvalidPayload(format!("deployment payload: {err}")))?;
    if payload.team.is_empty() {
        return Err(DispatchError::InvalidPayload(
            "deployment payload names no team".to_owned(),
        ));
    }

    let allowed = state
        .teams
        .teams(&repository.full_name)
        .await
        .unwrap_or_default();
    if !allowed.contains(&payload.team) {
        counter!("ferry_dispatch_rejected_total", "reason" => "team").increment(1);
        return Err(DispatchError::TeamNotAuthorized { team: payload.team });
    }

    // Allowlisted teams must also be provisioned with an API key.
    if let Err(err) = state.api_keys.read(&payload.team).await {
        return Err(match err {
            StorageError::NotFound => {
                counter!("ferry_dispatch_rejected_total", "reason" => "api_key").increment(1);
                DispatchError::TeamNotAuthorized { team: payload.team }
            }
            other => DispatchError::Storage(other),
        });
    }

    let now = now_unix();
    #[allow(clippy::cast_possible_wrap)]
    let request = DeploymentRequest {
        deployment: Some(DeploymentSpec {
            repository: Some(Repository {
                owner: owner.to_owned(),
                name: name.to_owned(),
            }),
            deployment_id: deployment.id,
        }),
        delivery_id,
        cluster: deployment.environment,
        timestamp: now,
        deadline: now + REQUEST_DEADLINE.as_secs() as i64,
        payload: serde_json::to_vec(&payload)
            .map_err(|err| DispatchError::InvalidPayload(err.to_string()))?,
    };

    info!(
        delivery_id = %request.delivery_id,
        repository = %repository.full_name,
        cluster = %request.cluster,
        team = %payload.team,
        "dispatching deployment request"
    );

    if let Err(err) = state.publisher.publish(&request).await {
        error!(error = %err, delivery_id = %request.delivery_id, "unable to enqueue deployment request");
        let failure = DeploymentStatus::failure(&request, &"unable to queue deployment request");
        if let Err(post_err) = state.poster.post(&failure).await {
            error!(error = %post_err, "unable to post failure status upstream");
        }
        return Err(DispatchError::Publish(err));
    }

    counter!("ferry_dispatch_accepted_total").increment(1);

    // The request is already enqueued; the agents will publish the
    // remaining transitions, so this failure is logged and swallowed.
    if let Err(err) = state.poster.post(&DeploymentStatus::queued(&request)).await {
        warn!(error = %err, delivery_id = %request.delivery_id, "unable to post queued status upstream");
    }

    Ok(StatusCode::CREATED)
}
