//! Cluster identity and shape
//!
//! A [`ClusterContext`] names the cluster being acted on and carries the
//! provider options needed to bring its machines into existence. The derived
//! context name (`name.region.provider`) is the only key correlating cloud
//! resources to a logical cluster, so two processes given the same context
//! always observe the same node set.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::tags::RESERVED_TAG_KEYS;
use crate::{Error, Result};

/// Supported infrastructure back-ends
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Amazon EC2
    Aws,
    /// Alibaba Cloud ECS
    Alibaba,
    /// Tencent Cloud CVM
    Tencent,
    /// Pre-existing / bare-metal machines
    Native,
    /// In-memory cloud for local dry runs
    #[default]
    Simulated,
}

impl ProviderKind {
    /// Lowercase provider name, as used in the context name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Alibaba => "alibaba",
            Self::Tencent => "tencent",
            Self::Native => "native",
            Self::Simulated => "simulated",
        }
    }

    /// Returns true for public-cloud back-ends that create machines
    pub fn is_cloud(&self) -> bool {
        matches!(self, Self::Aws | Self::Alibaba | Self::Tencent)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "alibaba" => Ok(Self::Alibaba),
            "tencent" => Ok(Self::Tencent),
            "native" => Ok(Self::Native),
            "simulated" => Ok(Self::Simulated),
            other => Err(Error::configuration(
                crate::error::UNKNOWN_CONTEXT,
                format!("unknown provider '{}'", other),
            )),
        }
    }
}

/// Reference to SSH connection material, owned by the SSH collaborator
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshCredentialRef {
    /// Login user
    pub user: String,
    /// SSH port
    pub port: u16,
    /// Path to a private key file (never its contents)
    pub key_path: Option<String>,
    /// Name of the key pair registered with the cloud, if any
    pub key_pair: Option<String>,
}

/// Compute shape for launched instances
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstanceShape {
    /// Machine image id
    pub image: String,
    /// Instance type (e.g., "t3.medium", "ecs.c6.large")
    pub instance_type: String,
    /// Root disk size in GiB
    pub disk_size_gb: Option<u32>,
    /// Root disk category/type
    pub disk_type: Option<String>,
}

/// Provider-specific options
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderOptions {
    /// Existing virtual network to adopt
    pub network_id: Option<String>,
    /// Existing subnet to adopt
    pub subnet_id: Option<String>,
    /// Existing security group to adopt
    pub security_group_id: Option<String>,
    /// CIDR for a created virtual network
    pub network_cidr: Option<String>,
    /// CIDR for a created subnet
    pub subnet_cidr: Option<String>,
    /// Instance shape
    pub shape: InstanceShape,
    /// Maximum spot price; launches use spot requests when set
    pub spot_price: Option<String>,
    /// Deliver public connectivity through allocated elastic addresses
    pub elastic_ip: bool,
    /// Tag networking resources for the cloud-controller-manager
    pub cloud_controller_manager: bool,
    /// Flannel backend; unset or "vxlan" requires the overlay port
    pub flannel_backend: Option<String>,
    /// Run an embedded multi-master datastore (etcd)
    pub cluster_init: bool,
    /// Prefix for the `cluster` tag value
    pub tag_prefix: Option<String>,
}

/// Default CIDR for created virtual networks
pub const DEFAULT_NETWORK_CIDR: &str = "10.0.0.0/16";
/// Default CIDR for created subnets
pub const DEFAULT_SUBNET_CIDR: &str = "10.0.1.0/24";

impl ProviderOptions {
    /// CIDR to use when creating the virtual network
    pub fn network_cidr(&self) -> &str {
        self.network_cidr.as_deref().unwrap_or(DEFAULT_NETWORK_CIDR)
    }

    /// CIDR to use when creating the subnet
    pub fn subnet_cidr(&self) -> &str {
        self.subnet_cidr.as_deref().unwrap_or(DEFAULT_SUBNET_CIDR)
    }

    /// Whether the overlay network (VXLAN, 8472/udp) is in use
    pub fn uses_overlay(&self) -> bool {
        match self.flannel_backend.as_deref() {
            None => true,
            Some(backend) => backend.is_empty() || backend.eq_ignore_ascii_case("vxlan"),
        }
    }
}

/// Identity and shape of the cluster being acted on
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterContext {
    /// Cluster name
    pub name: String,
    /// Region
    pub region: String,
    /// Availability zone
    pub zone: Option<String>,
    /// Back-end
    pub provider: ProviderKind,
    /// Number of master nodes
    pub master_count: u32,
    /// Number of worker nodes
    pub worker_count: u32,
    /// Provider-specific options
    pub options: ProviderOptions,
    /// Additional user tags applied to every instance
    pub tags: BTreeMap<String, String>,
    /// SSH connection material handed to the install collaborator
    pub ssh: SshCredentialRef,
}

impl ClusterContext {
    /// Create a context with the given identity and no nodes
    pub fn new(name: impl Into<String>, region: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            provider,
            ..Default::default()
        }
    }

    /// Set the node counts
    pub fn with_nodes(mut self, masters: u32, workers: u32) -> Self {
        self.master_count = masters;
        self.worker_count = workers;
        self
    }

    /// Set the provider options
    pub fn with_options(mut self, options: ProviderOptions) -> Self {
        self.options = options;
        self
    }

    /// Stable identity: `name.region.provider`
    pub fn context_name(&self) -> String {
        format!("{}.{}.{}", self.name, self.region, self.provider)
    }

    /// Value of the `cluster` ownership tag
    pub fn cluster_tag_value(&self) -> String {
        format!(
            "{}{}",
            self.options.tag_prefix.as_deref().unwrap_or_default(),
            self.context_name()
        )
    }

    /// Whether the embedded datastore is in use for this cluster
    pub fn embedded_datastore(&self) -> bool {
        self.options.cluster_init
    }

    /// Parse a context from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a context from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&data)
    }

    /// Validate identity and options
    ///
    /// `requires_master` is false for join operations that only add workers.
    pub fn validate(&self, requires_master: bool) -> Result<()> {
        let cluster = self.context_name();

        if self.name.is_empty() {
            return Err(Error::configuration_for_field(
                cluster,
                "name",
                "cluster name is required",
            ));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::configuration_for_field(
                cluster,
                "name",
                format!("cluster name '{}' contains invalid characters", self.name),
            ));
        }
        if self.region.is_empty() {
            return Err(Error::configuration_for_field(
                cluster,
                "region",
                "region is required",
            ));
        }
        if requires_master && self.master_count == 0 {
            return Err(Error::configuration_for_field(
                cluster,
                "master_count",
                "at least one master is required",
            ));
        }
        if self.provider.is_cloud() {
            if self.options.shape.image.is_empty() {
                return Err(Error::configuration_for_field(
                    cluster,
                    "options.shape.image",
                    "image is required",
                ));
            }
            if self.options.shape.instance_type.is_empty() {
                return Err(Error::configuration_for_field(
                    cluster,
                    "options.shape.instance_type",
                    "instance type is required",
                ));
            }
        }
        if let Some(price) = &self.options.spot_price {
            if !price.parse::<f64>().is_ok_and(|p| p.is_finite() && p > 0.0) {
                return Err(Error::configuration_for_field(
                    cluster,
                    "options.spot_price",
                    format!("spot price '{}' must be a positive number", price),
                ));
            }
        }
        for key in self.tags.keys() {
            if RESERVED_TAG_KEYS.contains(&key.as_str()) {
                return Err(Error::configuration_for_field(
                    cluster,
                    format!("tags.{}", key),
                    format!("tag key '{}' is reserved", key),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.context_name())
    }
}
