//! # ferry-core
//!
//! Shared building blocks for the ferry deployment dispatcher: the wire
//! protocol spoken over the message bus, the signed envelope codec, the
//! dual consumer/producer bus client, and the interfaces the ingress and
//! agent consume (credential storage, upstream status API).
//!
//! The two ferry services communicate only through the bus:
//!
//! ```text
//! ┌─────────────┐  requests topic   ┌─────────────┐
//! │   ingress   │ ────────────────▶ │    agent    │
//! │  (webhook)  │ ◀──────────────── │ (per cluster)│
//! └─────────────┘  statuses topic   └─────────────┘
//! ```
//!
//! Every message on either topic is a [`protocol::envelope`]-sealed frame:
//! a length-prefixed protobuf body followed by an HMAC-SHA256 over the
//! body, keyed with the shared signature key.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod config;
pub mod protocol;
pub mod storage;
pub mod upstream;

pub use bus::{ConsumedMessage, DualClient};
pub use config::BusConfig;
pub use protocol::{DeploymentRequest, DeploymentState, DeploymentStatus};
