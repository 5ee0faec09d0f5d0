//! Common types for autok3s: cluster context, node model, tag scheme,
//! errors, retry and logging utilities

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod retry;
pub mod tags;
pub mod telemetry;

pub use config::EngineConfig;
pub use context::{ClusterContext, InstanceShape, ProviderKind, ProviderOptions, SshCredentialRef};
pub use error::Error;
pub use node::{InstanceStatus, NodeRecord, Role, Tracking};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
