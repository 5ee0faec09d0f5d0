//! Node model: one compute instance under management
//!
//! A [`NodeRecord`] is created by the launcher as soon as the back-end
//! acknowledges an instance, then refined by the poller (status, addresses)
//! and the secondary resource binder (elastic addresses). Records discovered
//! from the cloud by describe are tracked as [`Tracking::Known`] and are never
//! destroyed by rollback.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::SshCredentialRef;

/// Role of a node in the k3s cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// k3s server
    Master,
    /// k3s agent
    Worker,
}

impl Role {
    /// Lowercase role name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }

    /// Value of the `master` tag for this role
    pub fn master_tag_value(&self) -> &'static str {
        match self {
            Self::Master => "true",
            Self::Worker => "false",
        }
    }

    /// Derive the role from a `master` tag value
    pub fn from_master_tag(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("true") => Self::Master,
            _ => Self::Worker,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized instance state
///
/// Back-ends report their own state enums; adapters map them onto this set
/// and keep anything unrecognized verbatim in [`InstanceStatus::Other`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    /// Accepted, not yet running
    #[default]
    Pending,
    /// Running
    Running,
    /// Being stopped
    Stopping,
    /// Stopped
    Stopped,
    /// Being terminated
    ShuttingDown,
    /// Gone
    Terminated,
    /// Back-end specific state with no normalized counterpart
    Other(String),
}

impl InstanceStatus {
    /// Normalize a back-end state string
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().replace('_', "-").as_str() {
            "pending" | "starting" | "provisioning" | "creating" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" | "shutdown" | "terminating" | "deleting" => Self::ShuttingDown,
            "terminated" | "deleted" => Self::Terminated,
            _ => Self::Other(raw.to_string()),
        }
    }

    /// Whether the instance is gone or on its way out
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }

    /// Lowercase state name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping state of a record within the current operation
///
/// Replaces a pair of independent "current" / "rollback eligible" flags so
/// that a discovered record can never be marked for destruction.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Tracking {
    /// Discovered from the cloud, belongs to an earlier operation
    #[default]
    Known,
    /// Created by the in-progress operation
    Fresh,
    /// Created by the in-progress operation and marked for teardown
    PendingRollback,
}

impl Tracking {
    /// Created by the in-progress operation
    pub fn is_current(&self) -> bool {
        matches!(self, Self::Fresh | Self::PendingRollback)
    }

    /// May be destroyed by rollback
    pub fn is_rollback_eligible(&self) -> bool {
        self.is_current()
    }

    /// Merge two tracking states; never downgrades
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

/// One compute instance under management
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeRecord {
    /// Back-end assigned identity
    pub instance_id: String,
    /// Master or worker
    pub role: Option<Role>,
    /// Derived instance name (`name` tag)
    pub name: Option<String>,
    /// Availability zone
    pub zone: Option<String>,
    /// Normalized back-end state
    pub status: InstanceStatus,
    /// Private addresses, ordered as reported
    pub internal_addresses: Vec<String>,
    /// Public addresses, ordered as reported
    pub public_addresses: Vec<String>,
    /// Bookkeeping state within the current operation
    pub tracking: Tracking,
    /// Secondary resources bound to this node (elastic address allocations)
    pub secondary_resource_ids: Vec<String>,
    /// Connection material reference for the SSH collaborator
    pub ssh_credential: Option<SshCredentialRef>,
}

impl NodeRecord {
    /// Create a record for an instance just created by this operation
    pub fn fresh(instance_id: impl Into<String>, role: Role, status: InstanceStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            role: Some(role),
            status,
            tracking: Tracking::Fresh,
            ..Default::default()
        }
    }

    /// Create a record for an instance discovered from the cloud
    pub fn known(instance_id: impl Into<String>, role: Role, status: InstanceStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            role: Some(role),
            status,
            tracking: Tracking::Known,
            ..Default::default()
        }
    }

    /// Created by the in-progress operation
    pub fn is_current(&self) -> bool {
        self.tracking.is_current()
    }

    /// May be destroyed by rollback
    pub fn is_rollback_eligible(&self) -> bool {
        self.tracking.is_rollback_eligible()
    }

    /// Running with at least one internal address
    pub fn is_ready(&self) -> bool {
        self.status == InstanceStatus::Running && !self.internal_addresses.is_empty()
    }

    /// Merge a newer observation of the same instance into this record
    ///
    /// Fields present in `other` win; empty fields in `other` never erase
    /// populated ones. Tracking never downgrades and secondary ids are
    /// unioned, so a stale read cannot undo a concurrent writer's work.
    pub fn merge(&mut self, other: NodeRecord) {
        debug_assert_eq!(self.instance_id, other.instance_id);

        self.tracking = self.tracking.merge(other.tracking);
        if other.role.is_some() {
            self.role = other.role;
        }
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.zone.is_some() {
            self.zone = other.zone;
        }
        if other.ssh_credential.is_some() {
            self.ssh_credential = other.ssh_credential;
        }
        if !other.internal_addresses.is_empty() {
            self.internal_addresses = other.internal_addresses;
        }
        if !other.public_addresses.is_empty() {
            self.public_addresses = other.public_addresses;
        }
        for id in other.secondary_resource_ids {
            if !self.secondary_resource_ids.contains(&id) {
                self.secondary_resource_ids.push(id);
            }
        }
        // A running report without addresses is not yet usable; keep the
        // previous state so `running` always comes with an internal address.
        if other.status != InstanceStatus::Running || !self.internal_addresses.is_empty() {
            self.status = other.status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_normalizes_back_end_states() {
        assert_eq!(InstanceStatus::parse("Running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::parse("PENDING"), InstanceStatus::Pending);
        assert_eq!(InstanceStatus::parse("Starting"), InstanceStatus::Pending);
        assert_eq!(
            InstanceStatus::parse("shutting-down"),
            InstanceStatus::ShuttingDown
        );
        assert_eq!(
            InstanceStatus::parse("SHUTTING_DOWN"),
            InstanceStatus::ShuttingDown
        );
        assert_eq!(
            InstanceStatus::parse("LAUNCH_FAILED"),
            InstanceStatus::Other("LAUNCH_FAILED".to_string())
        );
        assert!(InstanceStatus::Terminated.is_gone());
        assert!(!InstanceStatus::Stopped.is_gone());
    }

    #[test]
    fn role_follows_master_tag() {
        assert_eq!(Role::from_master_tag(Some("true")), Role::Master);
        assert_eq!(Role::from_master_tag(Some("TRUE")), Role::Master);
        assert_eq!(Role::from_master_tag(Some("false")), Role::Worker);
        assert_eq!(Role::from_master_tag(None), Role::Worker);
    }

    #[test]
    fn tracking_never_downgrades() {
        assert_eq!(Tracking::Fresh.merge(Tracking::Known), Tracking::Fresh);
        assert_eq!(
            Tracking::Known.merge(Tracking::PendingRollback),
            Tracking::PendingRollback
        );
        assert!(!Tracking::Known.is_rollback_eligible());
        assert!(Tracking::Fresh.is_current());
    }

    /// Story: the poller's status update must not erase the binder's address
    #[test]
    fn story_merge_keeps_concurrently_written_fields() {
        let mut record = NodeRecord::fresh("i-1", Role::Worker, InstanceStatus::Pending);
        record.internal_addresses = vec!["10.0.1.5".to_string()];
        record.public_addresses = vec!["54.1.1.1".to_string()];
        record.secondary_resource_ids = vec!["eipalloc-1".to_string()];

        // A describe-derived view: Known, running, no public address yet
        let mut observed = NodeRecord::known("i-1", Role::Worker, InstanceStatus::Running);
        observed.internal_addresses = vec!["10.0.1.5".to_string()];
        record.merge(observed);

        assert_eq!(record.tracking, Tracking::Fresh);
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(record.public_addresses, vec!["54.1.1.1".to_string()]);
        assert_eq!(record.secondary_resource_ids, vec!["eipalloc-1".to_string()]);
        assert!(record.is_ready());
    }

    #[test]
    fn running_without_addresses_is_not_published() {
        let mut record = NodeRecord::fresh("i-1", Role::Master, InstanceStatus::Pending);
        record.merge(NodeRecord::fresh("i-1", Role::Master, InstanceStatus::Running));
        assert_eq!(record.status, InstanceStatus::Pending);
        assert!(!record.is_ready());
    }

    #[test]
    fn secondary_ids_are_unioned() {
        let mut record = NodeRecord::fresh("i-1", Role::Master, InstanceStatus::Pending);
        record.secondary_resource_ids = vec!["a".to_string()];
        let mut other = NodeRecord::fresh("i-1", Role::Master, InstanceStatus::Pending);
        other.secondary_resource_ids = vec!["a".to_string(), "b".to_string()];
        record.merge(other);
        assert_eq!(
            record.secondary_resource_ids,
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
