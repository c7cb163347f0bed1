//! # ferry-ingress
//!
//! Webhook-side service of the ferry deployment dispatcher. Receives
//! upstream deployment events, authenticates and authorizes them, and
//! publishes signed [`ferry_core::DeploymentRequest`] frames to the
//! requests topic. A second loop consumes the statuses topic and mirrors
//! each transition onto the upstream provider's deployment record.
//!
//! The dispatch handler fails closed: a request that cannot be
//! authenticated (signature), authorized (team allowlist), or durably
//! enqueued never reports success upstream.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dispatch;
pub mod error;
pub mod event;
pub mod relay;
pub mod signature;

pub use dispatch::{DispatchState, RequestPublisher};
pub use error::DispatchError;
pub use signature::SignatureValidator;
