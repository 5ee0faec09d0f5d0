//! Interfaces to the collaborators around the engine
//!
//! The engine brings machines into existence; installing k3s on them over
//! SSH and persisting cluster metadata locally are done elsewhere. These
//! traits are the hand-off points.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use autok3s_common::{ClusterContext, NodeRecord, Result};

/// Lifecycle point at which node state is handed to the [`StateStore`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Networking prerequisites resolved
    Bootstrapped,
    /// Every master is running
    MastersRunning,
    /// Every worker is running
    WorkersRunning,
    /// k3s installed on a new cluster
    Installed,
    /// New nodes joined an existing cluster
    Joined,
}

impl Phase {
    /// Kebab-case phase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrapped => "bootstrapped",
            Self::MastersRunning => "masters-running",
            Self::WorkersRunning => "workers-running",
            Self::Installed => "installed",
            Self::Joined => "joined",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installs or joins k3s on provisioned nodes
///
/// Failures are reported as [`Error::Installer`](autok3s_common::Error::Installer)
/// and roll back the nodes this operation created.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterInstaller: Send + Sync {
    /// Install k3s on a freshly created cluster
    async fn install(&self, ctx: &ClusterContext, nodes: &[NodeRecord]) -> Result<()>;

    /// Join `joining` to the cluster formed by `nodes`
    async fn join(
        &self,
        ctx: &ClusterContext,
        nodes: &[NodeRecord],
        joining: &[NodeRecord],
    ) -> Result<()>;
}

/// Local persistence of cluster metadata
///
/// Save failures are logged and never abort provisioning.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the node table after a phase
    async fn save_nodes(&self, ctx: &ClusterContext, phase: Phase, nodes: &[NodeRecord])
        -> Result<()>;

    /// Forget a deleted cluster
    async fn remove(&self, ctx: &ClusterContext) -> Result<()>;
}
