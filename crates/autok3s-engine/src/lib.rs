//! Node provisioning and reconciliation engine for autok3s
//!
//! The engine brings the virtual machines that will run k3s into existence,
//! tracks them, and removes them again when an operation fails. It is written
//! once against the [`CloudApi`] adapter trait; each back-end only maps the
//! primitive calls onto its own API.
//!
//! # Modules
//!
//! - [`node_table`] - Concurrent node state table with merge semantics
//! - [`backend`] - Back-end adapter trait and capability profiles
//! - [`bootstrap`] - Discover-or-create of networks, subnets and security groups
//! - [`launcher`] - Direct and spot instance launches, ownership tagging
//! - [`poller`] - Bounded wait for instances to reach running
//! - [`binder`] - Elastic address allocation and association
//! - [`rollback`] - Best-effort teardown after a failed operation
//! - [`describe`] - Rebuild the node set from cloud-side tags
//! - [`provisioner`] - Phase sequencing for create, join, delete and status
//! - [`collaborators`] - Interfaces for the install and persistence collaborators

#![deny(missing_docs)]

pub mod backend;
pub mod binder;
pub mod bootstrap;
pub mod collaborators;
pub mod describe;
pub mod launcher;
pub mod node_table;
pub mod poller;
pub mod provisioner;
pub mod rollback;

use std::future::Future;
use std::sync::Arc;

pub use backend::{Capabilities, CloudApi};
pub use binder::AddressLedger;
pub use bootstrap::{BootstrapOutcome, Bootstrapper};
pub use collaborators::{ClusterInstaller, Phase, StateStore};
pub use describe::Existence;
pub use launcher::SpotLedger;
pub use node_table::NodeTable;
pub use provisioner::{ClusterStatus, DeleteReport, ProvisionedCluster, Provisioner};
pub use rollback::RollbackReport;

use autok3s_common::retry::retry_with_backoff;
use autok3s_common::{ClusterContext, EngineConfig, Error, Result};

/// Per-operation state shared by every worker of one create/join/delete
///
/// Cloning is cheap; all fields are reference counted so workers can be
/// spawned onto the runtime.
#[derive(Clone)]
pub struct Session {
    /// Back-end adapter
    pub cloud: Arc<dyn CloudApi>,
    /// Cluster being acted on
    pub ctx: Arc<ClusterContext>,
    /// Wait and retry bounds
    pub config: Arc<EngineConfig>,
    /// Node State Table
    pub table: Arc<NodeTable>,
    /// Spot requests submitted by this operation
    pub spot_requests: Arc<SpotLedger>,
    /// Elastic addresses allocated by this operation
    pub addresses: Arc<AddressLedger>,
}

impl Session {
    /// Start a session with an empty table
    pub fn new(cloud: Arc<dyn CloudApi>, ctx: ClusterContext, config: EngineConfig) -> Self {
        Self {
            cloud,
            ctx: Arc::new(ctx),
            config: Arc::new(config),
            table: Arc::new(NodeTable::new()),
            spot_requests: Arc::new(SpotLedger::default()),
            addresses: Arc::new(AddressLedger::default()),
        }
    }

    /// Context name of the cluster
    pub fn cluster(&self) -> String {
        self.ctx.context_name()
    }

    /// Provider name, for error attribution
    pub fn provider(&self) -> &'static str {
        self.cloud.provider().as_str()
    }

    /// Bootstrapper bound to this session
    pub fn bootstrapper(&self) -> Bootstrapper<'_> {
        Bootstrapper::new(self.cloud.as_ref(), &self.ctx, &self.config)
    }

    /// Whether this operation created anything that rollback would touch
    pub fn has_rollback_work(&self) -> bool {
        !self.table.rollback_ids().is_empty()
            || !self.spot_requests.is_empty()
            || !self.addresses.is_empty()
    }
}

/// Retry an idempotent API call on transient errors
pub(crate) async fn retry_api<F, Fut, T>(config: &EngineConfig, name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff(
        &config.api_retry.to_retry_config(),
        name,
        Error::is_retryable,
        operation,
    )
    .await
}

/// Map a worker task that panicked or was aborted onto an internal error
pub(crate) fn join_error(e: tokio::task::JoinError, context: &str) -> Error {
    Error::internal_with_context(format!("worker task failed: {}", e), context)
}
