//! Back-end adapter abstraction
//!
//! Each infrastructure back-end implements [`CloudApi`]: a thin mapping of
//! the handful of primitive calls the engine needs onto the provider's own
//! API. Everything above this layer (discover-or-create, launching, polling,
//! binding, rollback, describe) is implemented once in the engine.
//!
//! Lookups model "does not exist" as `Ok(None)`; authentication failures
//! must surface as [`Error::Credential`](autok3s_common::Error::Credential)
//! so the engine can fail fast instead of attempting creation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use autok3s_common::tags::TagSet;
use autok3s_common::{InstanceStatus, ProviderKind, Result};

/// How a back-end paginates list calls
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorStyle {
    /// Opaque continuation token
    #[default]
    Token,
    /// Numeric offset
    Offset,
}

/// Features a back-end supports
///
/// The engine consults these instead of matching on the provider kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Networks, subnets and security groups are created/discovered
    pub managed_networking: bool,
    /// Spot/preemptible requests are supported
    pub spot: bool,
    /// Public connectivity via separately allocated addresses
    pub secondary_addresses: bool,
    /// The back-end offers a blocking "wait until running" primitive
    pub native_wait: bool,
    /// Pagination style of describe calls
    pub cursor: CursorStyle,
    /// Describe can exclude terminated/shutting-down instances server-side
    pub state_filter: bool,
}

impl Capabilities {
    /// EC2-like behaviour: native waiter, spot, token pagination
    pub fn aws() -> Self {
        Self {
            managed_networking: true,
            spot: true,
            secondary_addresses: false,
            native_wait: true,
            cursor: CursorStyle::Token,
            state_filter: true,
        }
    }

    /// ECS-like behaviour: spot, elastic addresses, offset pagination
    pub fn alibaba() -> Self {
        Self {
            managed_networking: true,
            spot: true,
            secondary_addresses: true,
            native_wait: false,
            cursor: CursorStyle::Offset,
            state_filter: false,
        }
    }

    /// CVM-like behaviour: elastic addresses with async tasks, offset pagination
    pub fn tencent() -> Self {
        Self {
            managed_networking: true,
            spot: false,
            secondary_addresses: true,
            native_wait: false,
            cursor: CursorStyle::Offset,
            state_filter: true,
        }
    }

    /// Pre-existing machines: nothing to create on the network side
    pub fn native() -> Self {
        Self {
            managed_networking: false,
            spot: false,
            secondary_addresses: false,
            native_wait: false,
            cursor: CursorStyle::Offset,
            state_filter: true,
        }
    }

    /// Default capability profile for a provider kind
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Aws | ProviderKind::Simulated => Self::aws(),
            ProviderKind::Alibaba => Self::alibaba(),
            ProviderKind::Tencent => Self::tencent(),
            ProviderKind::Native => Self::native(),
        }
    }
}

/// A virtual network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Back-end id
    pub id: String,
    /// Name
    pub name: String,
    /// Address range
    pub cidr: String,
}

/// A subnet within a virtual network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Back-end id
    pub id: String,
    /// Name
    pub name: String,
    /// Owning network
    pub network_id: String,
    /// Address range
    pub cidr: String,
    /// Availability zone
    pub zone: Option<String>,
}

/// Transport protocol of an ingress rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

/// One inbound permission
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IngressRule {
    /// Protocol
    pub protocol: Protocol,
    /// First port of the range
    pub from_port: u16,
    /// Last port of the range (inclusive)
    pub to_port: u16,
    /// Allowed source range
    pub source_cidr: String,
}

impl IngressRule {
    /// Rule for a single port
    pub fn port(protocol: Protocol, port: u16, source_cidr: impl Into<String>) -> Self {
        Self::range(protocol, port, port, source_cidr)
    }

    /// Rule for a port range
    pub fn range(
        protocol: Protocol,
        from_port: u16,
        to_port: u16,
        source_cidr: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            from_port,
            to_port,
            source_cidr: source_cidr.into(),
        }
    }

    /// Whether this rule already grants everything `other` grants
    pub fn covers(&self, other: &IngressRule) -> bool {
        self.protocol == other.protocol
            && self.source_cidr == other.source_cidr
            && self.from_port <= other.from_port
            && self.to_port >= other.to_port
    }
}

impl fmt::Display for IngressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from_port == self.to_port {
            write!(f, "{}/{} from {}", self.from_port, self.protocol, self.source_cidr)
        } else {
            write!(
                f,
                "{}-{}/{} from {}",
                self.from_port, self.to_port, self.protocol, self.source_cidr
            )
        }
    }
}

/// A security group / firewall
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    /// Back-end id
    pub id: String,
    /// Name
    pub name: String,
    /// Owning network
    pub network_id: String,
    /// Inbound rules already present
    pub rules: Vec<IngressRule>,
}

/// Request to create a subnet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetRequest {
    /// Deterministic name
    pub name: String,
    /// Owning network
    pub network_id: String,
    /// Address range
    pub cidr: String,
    /// Availability zone
    pub zone: Option<String>,
    /// Ownership tags
    pub tags: TagSet,
}

/// Everything needed to create an instance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Machine image
    pub image: String,
    /// Instance type
    pub instance_type: String,
    /// Root disk size in GiB
    pub disk_size_gb: Option<u32>,
    /// Root disk type
    pub disk_type: Option<String>,
    /// Subnet to place the instance in
    pub subnet_id: Option<String>,
    /// Security group to attach
    pub security_group_id: Option<String>,
    /// Availability zone
    pub zone: Option<String>,
    /// Registered key pair
    pub key_pair: Option<String>,
    /// Request an implicit public address
    pub public_ip: bool,
}

/// An instance acknowledged by a create call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchedInstance {
    /// Back-end id
    pub instance_id: String,
    /// Initial state
    pub status: InstanceStatus,
}

/// State of a spot request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpotRequestState {
    /// Waiting for capacity
    Open,
    /// Capacity granted; an instance exists
    Fulfilled {
        /// The instance created for this request
        instance_id: String,
    },
    /// The request can no longer be fulfilled
    Failed {
        /// Back-end supplied reason
        reason: String,
    },
    /// Cancelled before fulfillment
    Cancelled,
}

/// Instance list filter
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceQuery {
    /// Every pair must be present on a matching instance
    pub tags: TagSet,
    /// Restrict to these ids (empty = no restriction)
    pub instance_ids: Vec<String>,
    /// Exclude terminated and shutting-down instances
    pub exclude_gone: bool,
}

impl InstanceQuery {
    /// Query by tags, excluding gone instances
    pub fn by_tags(tags: TagSet) -> Self {
        Self {
            tags,
            instance_ids: Vec::new(),
            exclude_gone: true,
        }
    }

    /// Query specific instances regardless of state
    pub fn by_ids(ids: Vec<String>) -> Self {
        Self {
            tags: TagSet::new(),
            instance_ids: ids,
            exclude_gone: false,
        }
    }
}

/// Pagination cursor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cursor {
    /// Opaque continuation token
    Token(String),
    /// Numeric offset
    Offset(u32),
}

/// An instance as reported by describe
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceDescription {
    /// Back-end id
    pub instance_id: String,
    /// Normalized state
    pub status: InstanceStatus,
    /// Tags on the instance
    pub tags: TagSet,
    /// Private addresses
    pub internal_addresses: Vec<String>,
    /// Public addresses
    pub public_addresses: Vec<String>,
    /// Availability zone
    pub zone: Option<String>,
    /// Bound elastic address allocations
    pub secondary_resource_ids: Vec<String>,
}

/// One page of a describe call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstancePage {
    /// Instances on this page
    pub instances: Vec<InstanceDescription>,
    /// Cursor for the next page, `None` when exhausted
    pub next: Option<Cursor>,
}

/// A separately allocated public address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElasticAddress {
    /// Allocation id
    pub allocation_id: String,
    /// The public IP
    pub ip: String,
}

/// Result of an address allocation call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressAllocation {
    /// Allocated addresses (may be fewer than requested)
    pub addresses: Vec<ElasticAddress>,
    /// Asynchronous task to wait on, if the back-end allocates asynchronously
    pub task: Option<String>,
}

/// Three-way state of an asynchronous back-end task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Completed successfully
    Succeeded,
    /// Completed with a failure
    Failed(String),
    /// Still running
    Running,
}

/// Primitive calls every back-end adapter implements
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Provider kind, for logging and error attribution
    fn provider(&self) -> ProviderKind;

    /// Features supported by this back-end
    fn capabilities(&self) -> Capabilities;

    /// Cheap authenticated call to classify credential problems early
    async fn verify_credentials(&self) -> Result<()>;

    /// Fetch a network by id
    async fn get_network(&self, id: &str) -> Result<Option<Network>>;

    /// Look up a network by its deterministic name
    async fn find_network(&self, name: &str) -> Result<Option<Network>>;

    /// Create a network and return its id
    async fn create_network(&self, name: &str, cidr: &str, tags: &TagSet) -> Result<String>;

    /// Fetch a subnet by id
    async fn get_subnet(&self, id: &str) -> Result<Option<Subnet>>;

    /// Look up a subnet by name within a network
    async fn find_subnet(&self, network_id: &str, name: &str) -> Result<Option<Subnet>>;

    /// Create a subnet and return its id
    async fn create_subnet(&self, request: &SubnetRequest) -> Result<String>;

    /// Fetch a security group by id
    async fn get_security_group(&self, id: &str) -> Result<Option<SecurityGroup>>;

    /// Look up a security group by name within a network
    async fn find_security_group(
        &self,
        network_id: &str,
        name: &str,
    ) -> Result<Option<SecurityGroup>>;

    /// Create a security group and return its id
    async fn create_security_group(
        &self,
        network_id: &str,
        name: &str,
        tags: &TagSet,
    ) -> Result<String>;

    /// Append inbound rules to a security group
    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()>;

    /// Add tags to resources (instances, networks, subnets, groups)
    async fn tag_resources(&self, resource_ids: &[String], tags: &TagSet) -> Result<()>;

    /// Remove tag keys from resources
    async fn untag_resources(&self, resource_ids: &[String], keys: &[String]) -> Result<()>;

    /// Create exactly `count` instances in one call
    async fn run_instances(&self, spec: &LaunchSpec, count: usize)
        -> Result<Vec<LaunchedInstance>>;

    /// Submit one spot request and return its id
    async fn request_spot_instance(&self, spec: &LaunchSpec, max_price: &str) -> Result<String>;

    /// Current state of a spot request
    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequestState>;

    /// Cancel a spot request, returning its state after cancellation
    ///
    /// A request fulfilled before the cancel landed reports
    /// [`SpotRequestState::Fulfilled`].
    async fn cancel_spot_request(&self, request_id: &str) -> Result<SpotRequestState>;

    /// One page of instances matching `query`
    async fn describe_instances(
        &self,
        query: &InstanceQuery,
        cursor: Option<Cursor>,
    ) -> Result<InstancePage>;

    /// Block until every instance is running; `Ok(false)` on timeout
    ///
    /// Only called when [`Capabilities::native_wait`] is set.
    async fn wait_instances_running(&self, instance_ids: &[String], timeout: Duration)
        -> Result<bool>;

    /// Terminate instances; terminating an already-gone instance succeeds
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;

    /// Allocate `count` elastic addresses
    async fn allocate_addresses(&self, count: usize, tags: &TagSet) -> Result<AddressAllocation>;

    /// Associate an address with an instance
    async fn associate_address(
        &self,
        allocation_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>>;

    /// Disassociate an address from whatever it is bound to
    async fn disassociate_address(&self, allocation_id: &str) -> Result<Option<String>>;

    /// Release an address back to the pool
    async fn release_address(&self, allocation_id: &str) -> Result<Option<String>>;

    /// State of an asynchronous task
    async fn describe_task(&self, task_id: &str) -> Result<TaskStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wider_rule_covers_narrower_rule() {
        let wide = IngressRule::range(Protocol::Tcp, 2000, 3000, "10.0.0.0/16");
        let narrow = IngressRule::range(Protocol::Tcp, 2379, 2380, "10.0.0.0/16");
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
    }

    #[test]
    fn coverage_requires_same_protocol_and_source() {
        let tcp = IngressRule::port(Protocol::Tcp, 8472, "0.0.0.0/0");
        let udp = IngressRule::port(Protocol::Udp, 8472, "0.0.0.0/0");
        let scoped = IngressRule::port(Protocol::Tcp, 8472, "10.0.0.0/8");
        assert!(!tcp.covers(&udp));
        assert!(!tcp.covers(&scoped));
    }

    #[test]
    fn rule_display_is_readable() {
        assert_eq!(
            IngressRule::port(Protocol::Tcp, 22, "0.0.0.0/0").to_string(),
            "22/tcp from 0.0.0.0/0"
        );
        assert_eq!(
            IngressRule::range(Protocol::Tcp, 2379, 2380, "10.0.1.0/24").to_string(),
            "2379-2380/tcp from 10.0.1.0/24"
        );
    }

    #[test]
    fn provider_profiles_differ_where_back_ends_differ() {
        assert!(Capabilities::aws().native_wait);
        assert!(!Capabilities::alibaba().native_wait);
        assert!(Capabilities::tencent().secondary_addresses);
        assert_eq!(Capabilities::alibaba().cursor, CursorStyle::Offset);
        assert!(!Capabilities::native().managed_networking);
        assert_eq!(
            Capabilities::for_provider(ProviderKind::Tencent),
            Capabilities::tencent()
        );
    }
}
