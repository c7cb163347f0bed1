//! # ferry-agent
//!
//! Per-cluster agent of the ferry deployment dispatcher. Consumes the
//! requests topic in a consumer group keyed by cluster identity, applies
//! the resources of requests addressed to its cluster, watches rollouts,
//! and publishes status transitions to the statuses topic.
//!
//! The execution model is one task per request: the dispatcher spawns a
//! [`deploy::run`] for every verified message, each monitorable resource
//! gets its own [`monitor`] task, and a single [`publisher`] task drains
//! the process-wide status channel onto the bus.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod deploy;
pub mod dispatcher;
pub mod kube;
pub mod monitor;
pub mod publisher;
pub mod resource;

pub use client::{ClientError, TeamClient, TeamClientProvider};
pub use config::AgentConfig;
pub use resource::Resource;
