//! Wire protocol for the request and status topics.
//!
//! Messages are Protocol Buffers encoded with [`prost`] and carried inside
//! a signed envelope (see [`envelope`]). The message set is deliberately
//! small:
//!
//! - [`DeploymentRequest`]: ingress → agent, one per upstream deployment
//!   event, addressed to a single cluster.
//! - [`DeploymentStatus`]: agent → ingress, one per lifecycle transition,
//!   keyed by delivery ID.
//!
//! A request is immutable once published; every downstream event carries
//! its `delivery_id` for correlation.

pub mod envelope;
mod messages;

pub use messages::{
    DeploymentPayload, DeploymentRequest, DeploymentSpec, DeploymentState, DeploymentStatus,
    Repository,
};
