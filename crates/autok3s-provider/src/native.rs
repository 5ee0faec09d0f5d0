//! Bare-metal back-end over a fixed machine inventory
//!
//! "Launching" claims free machines from the inventory and "terminating"
//! releases them. There is no network to manage and no spot or address
//! market, so those calls are rejected; the engine never issues them because
//! [`Capabilities::native`] turns them off.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use autok3s_common::error::UNKNOWN_CONTEXT;
use autok3s_common::tags::{self, TagSet};
use autok3s_common::{Error, InstanceStatus, ProviderKind, Result};
use autok3s_engine::backend::{
    AddressAllocation, Cursor, IngressRule, InstanceDescription, InstancePage, InstanceQuery,
    LaunchSpec, LaunchedInstance, Network, SecurityGroup, SpotRequestState, Subnet,
    SubnetRequest, TaskStatus,
};
use autok3s_engine::{Capabilities, CloudApi};

/// A pre-existing machine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Stable identifier, used as the instance id
    pub id: String,
    /// Address reachable from the other nodes
    pub internal_address: String,
    /// Address reachable from outside, if different
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    /// Rack or site
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Ownership tags while claimed
    #[serde(default)]
    pub tags: TagSet,
    /// Claimed by a cluster
    #[serde(default)]
    pub claimed: bool,
}

impl Machine {
    /// An unclaimed machine
    pub fn new(id: impl Into<String>, internal_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            internal_address: internal_address.into(),
            ..Default::default()
        }
    }

    fn describe(&self) -> InstanceDescription {
        // Unclaimed machines look terminated to the engine
        let status = if self.claimed {
            InstanceStatus::Running
        } else {
            InstanceStatus::Terminated
        };
        InstanceDescription {
            instance_id: self.id.clone(),
            status,
            tags: self.tags.clone(),
            internal_addresses: vec![self.internal_address.clone()],
            public_addresses: self.public_address.iter().cloned().collect(),
            zone: self.zone.clone(),
            secondary_resource_ids: Vec::new(),
        }
    }
}

/// Inventory-backed back-end
pub struct NativeCloud {
    machines: Mutex<Vec<Machine>>,
    path: Option<PathBuf>,
}

impl NativeCloud {
    /// In-memory inventory
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            machines: Mutex::new(machines),
            path: None,
        }
    }

    /// Load an inventory file; claims are written back after every change
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read_to_string(&path)?;
        let machines: Vec<Machine> = serde_json::from_str(&data).map_err(|e| {
            Error::serialization(format!("invalid inventory {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), machines = machines.len(), "Loaded machine inventory");
        Ok(Self {
            machines: Mutex::new(machines),
            path: Some(path),
        })
    }

    /// Snapshot of the inventory
    pub fn machines(&self) -> Vec<Machine> {
        self.machines.lock().clone()
    }

    /// Apply `change` to a copy of the inventory, write the copy out, and only
    /// then make it current. A failed write leaves the inventory untouched.
    fn update<R>(&self, change: impl FnOnce(&mut Vec<Machine>) -> Result<R>) -> Result<R> {
        let mut machines = self.machines.lock();
        let mut next = machines.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *machines = next;
        Ok(out)
    }

    fn persist(&self, machines: &[Machine]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(machines)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn unsupported(&self, what: &str) -> Error {
        Error::provider_permanent(
            UNKNOWN_CONTEXT,
            ProviderKind::Native.as_str(),
            format!("{} is not available for pre-existing machines", what),
        )
    }
}

#[async_trait]
impl CloudApi for NativeCloud {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Native
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::native()
    }

    async fn verify_credentials(&self) -> Result<()> {
        Ok(())
    }

    async fn get_network(&self, _id: &str) -> Result<Option<Network>> {
        Ok(None)
    }

    async fn find_network(&self, _name: &str) -> Result<Option<Network>> {
        Ok(None)
    }

    async fn create_network(&self, _name: &str, _cidr: &str, _tags: &TagSet) -> Result<String> {
        Err(self.unsupported("network creation"))
    }

    async fn get_subnet(&self, _id: &str) -> Result<Option<Subnet>> {
        Ok(None)
    }

    async fn find_subnet(&self, _network_id: &str, _name: &str) -> Result<Option<Subnet>> {
        Ok(None)
    }

    async fn create_subnet(&self, _request: &SubnetRequest) -> Result<String> {
        Err(self.unsupported("subnet creation"))
    }

    async fn get_security_group(&self, _id: &str) -> Result<Option<SecurityGroup>> {
        Ok(None)
    }

    async fn find_security_group(
        &self,
        _network_id: &str,
        _name: &str,
    ) -> Result<Option<SecurityGroup>> {
        Ok(None)
    }

    async fn create_security_group(
        &self,
        _network_id: &str,
        _name: &str,
        _tags: &TagSet,
    ) -> Result<String> {
        Err(self.unsupported("security group creation"))
    }

    async fn authorize_ingress(&self, _group_id: &str, _rules: &[IngressRule]) -> Result<()> {
        Err(self.unsupported("firewall management"))
    }

    async fn tag_resources(&self, resource_ids: &[String], tags: &TagSet) -> Result<()> {
        self.update(|machines| {
            for id in resource_ids {
                let machine = machines
                    .iter_mut()
                    .find(|m| &m.id == id)
                    .ok_or_else(|| self.unsupported(&format!("tagging unknown machine {}", id)))?;
                machine
                    .tags
                    .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Ok(())
        })
    }

    async fn untag_resources(&self, resource_ids: &[String], keys: &[String]) -> Result<()> {
        self.update(|machines| {
            for machine in machines.iter_mut().filter(|m| resource_ids.contains(&m.id)) {
                for key in keys {
                    machine.tags.remove(key);
                }
            }
            Ok(())
        })
    }

    async fn run_instances(
        &self,
        spec: &LaunchSpec,
        count: usize,
    ) -> Result<Vec<LaunchedInstance>> {
        let claimed = self.update(|machines| {
            let mut claimed = Vec::with_capacity(count);
            for machine in machines
                .iter_mut()
                .filter(|m| !m.claimed)
                .filter(|m| spec.zone.is_none() || m.zone == spec.zone)
                .take(count)
            {
                machine.claimed = true;
                claimed.push(LaunchedInstance {
                    instance_id: machine.id.clone(),
                    status: InstanceStatus::Running,
                });
            }
            Ok(claimed)
        })?;
        debug!(requested = count, claimed = claimed.len(), "Claimed machines");
        Ok(claimed)
    }

    async fn request_spot_instance(&self, _spec: &LaunchSpec, _max_price: &str) -> Result<String> {
        Err(self.unsupported("spot capacity"))
    }

    async fn describe_spot_request(&self, _request_id: &str) -> Result<SpotRequestState> {
        Err(self.unsupported("spot capacity"))
    }

    async fn cancel_spot_request(&self, _request_id: &str) -> Result<SpotRequestState> {
        Err(self.unsupported("spot capacity"))
    }

    async fn describe_instances(
        &self,
        query: &InstanceQuery,
        cursor: Option<Cursor>,
    ) -> Result<InstancePage> {
        if cursor.is_some() {
            return Ok(InstancePage::default());
        }
        let machines = self.machines.lock();
        let instances = machines
            .iter()
            .filter(|m| query.instance_ids.is_empty() || query.instance_ids.contains(&m.id))
            .filter(|m| tags::matches_filter(&m.tags, &query.tags))
            .map(Machine::describe)
            .filter(|d| !(query.exclude_gone && d.status.is_gone()))
            .collect();
        Ok(InstancePage {
            instances,
            next: None,
        })
    }

    async fn wait_instances_running(
        &self,
        _instance_ids: &[String],
        _timeout: Duration,
    ) -> Result<bool> {
        Err(self.unsupported("native wait"))
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.update(|machines| {
            for machine in machines.iter_mut().filter(|m| instance_ids.contains(&m.id)) {
                machine.claimed = false;
                machine.tags.clear();
            }
            Ok(())
        })
    }

    async fn allocate_addresses(&self, _count: usize, _tags: &TagSet) -> Result<AddressAllocation> {
        Err(self.unsupported("address allocation"))
    }

    async fn associate_address(
        &self,
        _allocation_id: &str,
        _instance_id: &str,
    ) -> Result<Option<String>> {
        Err(self.unsupported("address association"))
    }

    async fn disassociate_address(&self, _allocation_id: &str) -> Result<Option<String>> {
        Err(self.unsupported("address association"))
    }

    async fn release_address(&self, _allocation_id: &str) -> Result<Option<String>> {
        Err(self.unsupported("address release"))
    }

    async fn describe_task(&self, _task_id: &str) -> Result<TaskStatus> {
        Err(self.unsupported("asynchronous tasks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Vec<Machine> {
        vec![
            Machine::new("m1", "192.168.0.11"),
            Machine::new("m2", "192.168.0.12"),
            Machine::new("m3", "192.168.0.13"),
        ]
    }

    #[tokio::test]
    async fn launching_claims_free_machines_only() {
        let cloud = NativeCloud::new(inventory());
        let first = cloud.run_instances(&LaunchSpec::default(), 2).await.unwrap();
        let second = cloud.run_instances(&LaunchSpec::default(), 2).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].instance_id, "m3");
    }

    #[tokio::test]
    async fn unclaimed_machines_are_reported_as_gone() {
        let cloud = NativeCloud::new(inventory());
        cloud.run_instances(&LaunchSpec::default(), 1).await.unwrap();

        let all = cloud
            .describe_instances(&InstanceQuery::default(), None)
            .await
            .unwrap();
        let live = cloud
            .describe_instances(&InstanceQuery::by_tags(TagSet::new()), None)
            .await
            .unwrap();

        assert_eq!(all.instances.len(), 3);
        assert_eq!(live.instances.len(), 1);
        assert_eq!(live.instances[0].status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn terminating_releases_the_claim_and_tags() {
        let cloud = NativeCloud::new(inventory());
        let launched = cloud.run_instances(&LaunchSpec::default(), 1).await.unwrap();
        let ids = vec![launched[0].instance_id.clone()];
        let tags: TagSet = [("cluster".to_string(), "c".to_string())].into();
        cloud.tag_resources(&ids, &tags).await.unwrap();

        cloud.terminate_instances(&ids).await.unwrap();
        cloud.terminate_instances(&ids).await.unwrap();

        let machine = &cloud.machines()[0];
        assert!(!machine.claimed);
        assert!(machine.tags.is_empty());
    }

    #[tokio::test]
    async fn claims_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, serde_json::to_string(&inventory()).unwrap()).unwrap();

        let cloud = NativeCloud::open(&path).unwrap();
        cloud.run_instances(&LaunchSpec::default(), 2).await.unwrap();
        drop(cloud);

        let reloaded = NativeCloud::open(&path).unwrap();
        assert_eq!(reloaded.machines().iter().filter(|m| m.claimed).count(), 2);
    }

    #[tokio::test]
    async fn when_the_inventory_cannot_be_written_nothing_is_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, serde_json::to_string(&inventory()).unwrap()).unwrap();
        let cloud = NativeCloud::open(&path).unwrap();
        std::fs::remove_dir_all(dir.path()).unwrap();

        let err = cloud
            .run_instances(&LaunchSpec::default(), 1)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(cloud.machines().iter().all(|m| !m.claimed));
    }

    #[tokio::test]
    async fn when_a_tag_write_fails_the_previous_tags_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, serde_json::to_string(&inventory()).unwrap()).unwrap();
        let cloud = NativeCloud::open(&path).unwrap();
        let launched = cloud.run_instances(&LaunchSpec::default(), 1).await.unwrap();
        let ids = vec![launched[0].instance_id.clone()];
        std::fs::remove_dir_all(dir.path()).unwrap();

        let tags: TagSet = [("cluster".to_string(), "c".to_string())].into();
        assert!(cloud.tag_resources(&ids, &tags).await.is_err());
        assert!(cloud.terminate_instances(&ids).await.is_err());

        let machine = &cloud.machines()[0];
        assert!(machine.claimed);
        assert!(machine.tags.is_empty());
    }

    #[test]
    fn malformed_inventory_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, "not json").unwrap();

        let err = NativeCloud::open(&path).err().unwrap();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[tokio::test]
    async fn network_calls_are_rejected() {
        let cloud = NativeCloud::new(Vec::new());
        assert!(cloud.find_network("n").await.unwrap().is_none());
        assert!(cloud
            .create_network("n", "10.0.0.0/16", &TagSet::new())
            .await
            .is_err());
    }
}
