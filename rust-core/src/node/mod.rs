//! Node orchestrator and the pieces it drives: config, device correlation, peer HTTP, periodic jobs.

pub mod config;
pub mod correlator;
pub mod http;
#[allow(clippy::module_inception)]
pub mod node;
pub mod readings;
pub mod tasks;

pub use config::{ConfigError, HttpConfig, NodeConfig, ReplyRetention, TaskConfig};
pub use node::{Collaborators, DeviceRead, DeviceRefresh, Node, NodeError, ServiceOutcome};
