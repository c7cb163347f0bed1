//! Protocol message types.
//!
//! The structs here are hand-written prost messages; the field tags are the
//! wire contract and must never be renumbered. `DeploymentPayload` is the
//! JSON document embedded in a request's `payload` bytes; it is opaque to
//! the bus and only interpreted by the agent.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A source repository, identified by owner and name.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Repository {
    /// Repository owner (organization or user).
    #[prost(string, tag = "1")]
    pub owner: String,

    /// Repository name without the owner prefix.
    #[prost(string, tag = "2")]
    pub name: String,
}

impl Repository {
    /// Returns the `owner/name` form used in upstream API paths.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Reference to the upstream provider's deployment record.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct DeploymentSpec {
    /// The repository the deployment belongs to.
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,

    /// The provider-assigned deployment record ID, used to post status.
    #[prost(int64, tag = "2")]
    pub deployment_id: i64,
}

/// The request envelope published by the ingress and consumed by agents.
///
/// An agent only processes requests whose `cluster` matches its own
/// identity, and only while `deadline` has not passed.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeploymentRequest {
    /// Upstream deployment record reference.
    #[prost(message, optional, tag = "1")]
    pub deployment: Option<DeploymentSpec>,

    /// Provider-assigned delivery ID; correlates all downstream events.
    #[prost(string, tag = "2")]
    pub delivery_id: String,

    /// Target cluster identity.
    #[prost(string, tag = "3")]
    pub cluster: String,

    /// Publication time, seconds since the Unix epoch.
    #[prost(int64, tag = "4")]
    pub timestamp: i64,

    /// Drop-dead time, seconds since the Unix epoch. Requests past this
    /// instant are discarded without side effects.
    #[prost(int64, tag = "5")]
    pub deadline: i64,

    /// Serialized [`DeploymentPayload`] JSON document.
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
}

impl DeploymentRequest {
    /// Parses the embedded payload document.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error when the payload bytes are not a
    /// valid payload document.
    pub fn payload_spec(&self) -> Result<DeploymentPayload, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// A lifecycle transition for a single deployment request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeploymentStatus {
    /// Upstream deployment record reference, carried over from the request.
    #[prost(message, optional, tag = "1")]
    pub deployment: Option<DeploymentSpec>,

    /// Delivery ID of the originating request.
    #[prost(string, tag = "2")]
    pub delivery_id: String,

    /// Lifecycle state.
    #[prost(enumeration = "DeploymentState", tag = "3")]
    pub state: i32,

    /// Human-readable description of the transition.
    #[prost(string, tag = "4")]
    pub description: String,
}

/// Deployment lifecycle states.
///
/// `Queued` and `InProgress` are informational; the remaining states are
/// terminal. Consumers collapse the status stream per delivery ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DeploymentState {
    /// The request has been accepted by the ingress and put on the bus.
    Queued = 0,
    /// Resources were applied; rollout is being monitored.
    InProgress = 1,
    /// The deployment converged.
    Success = 2,
    /// The deployment was attempted and will not succeed.
    Failure = 3,
    /// The agent could not attempt the deployment.
    Error = 4,
}

impl DeploymentState {
    /// Whether this state ends the lifecycle of a deployment.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Error)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl DeploymentStatus {
    fn derived(req: &DeploymentRequest, state: DeploymentState, description: String) -> Self {
        Self {
            deployment: req.deployment.clone(),
            delivery_id: req.delivery_id.clone(),
            state: state as i32,
            description,
        }
    }

    /// Status for a request that has been accepted onto the bus.
    #[must_use]
    pub fn queued(req: &DeploymentRequest) -> Self {
        Self::derived(
            req,
            DeploymentState::Queued,
            "deployment request has been put on the queue for further processing".to_owned(),
        )
    }

    /// Status for a request whose resources were applied and are being
    /// monitored for rollout.
    #[must_use]
    pub fn in_progress(req: &DeploymentRequest) -> Self {
        Self::derived(
            req,
            DeploymentState::InProgress,
            "resources have been applied; monitoring rollout".to_owned(),
        )
    }

    /// Terminal success status.
    #[must_use]
    pub fn success(req: &DeploymentRequest) -> Self {
        Self::derived(
            req,
            DeploymentState::Success,
            "deployment completed successfully".to_owned(),
        )
    }

    /// Terminal failure status: the deployment was attempted, or refused on
    /// authoritative grounds, and will not succeed.
    #[must_use]
    pub fn failure(req: &DeploymentRequest, err: &impl fmt::Display) -> Self {
        Self::derived(
            req,
            DeploymentState::Failure,
            format!("deployment failed: {err}"),
        )
    }

    /// Terminal error status: the agent could not attempt the deployment.
    #[must_use]
    pub fn error(req: &DeploymentRequest, err: &impl fmt::Display) -> Self {
        Self::derived(
            req,
            DeploymentState::Error,
            format!("deployment cannot be processed: {err}"),
        )
    }
}

/// The application payload embedded in a [`DeploymentRequest`].
///
/// Resources are kept as raw JSON so the bus layer never interprets them;
/// the agent decodes each document right before application.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentPayload {
    /// Owning team; authorized by the ingress, used by the agent for
    /// namespace resolution and orchestrator identity.
    pub team: String,

    /// Declarative orchestrator resources, in application order.
    #[serde(default)]
    pub resources: Vec<Box<RawValue>>,
}
