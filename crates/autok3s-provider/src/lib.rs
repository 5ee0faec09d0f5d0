//! Back-end adapters for the autok3s engine
//!
//! - [`simulated`] - In-memory cloud with per-provider behaviour profiles and fault injection
//! - [`native`] - Pre-existing machines from an inventory file
//!
//! Cloud SDK adapters plug in behind the same [`CloudApi`] trait.

#![deny(missing_docs)]

pub mod native;
pub mod simulated;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use autok3s_common::{ClusterContext, Error, ProviderKind, Result};
use autok3s_engine::CloudApi;

pub use native::{Machine, NativeCloud};
pub use simulated::{Faults, SimulatedCloud};

/// Settings needed to construct a back-end
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    /// Machine inventory for the native back-end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<PathBuf>,
}

/// Create the back-end adapter for a cluster's provider
pub fn create_cloud(ctx: &ClusterContext, settings: &BackendSettings) -> Result<Arc<dyn CloudApi>> {
    match ctx.provider {
        ProviderKind::Simulated => Ok(Arc::new(SimulatedCloud::new())),
        ProviderKind::Native => {
            let path = settings.inventory.as_ref().ok_or_else(|| {
                Error::configuration_for_field(
                    ctx.context_name(),
                    "inventory",
                    "the native provider needs a machine inventory",
                )
            })?;
            Ok(Arc::new(NativeCloud::open(path)?))
        }
        ProviderKind::Aws | ProviderKind::Alibaba | ProviderKind::Tencent => {
            Err(Error::configuration(
                ctx.context_name(),
                format!("{} SDK adapter is not built into this binary", ctx.provider),
            ))
        }
    }
}
