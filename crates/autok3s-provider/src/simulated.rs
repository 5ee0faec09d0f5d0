//! In-memory cloud back-end
//!
//! Behaves like an IaaS API closely enough to drive the engine end to end
//! without an account: eventually consistent reads after creation, instances
//! that take a few describes to reach running, paged describe calls, spot
//! requests, elastic addresses with asynchronous tasks. Each provider profile
//! ([`Capabilities::aws`], [`Capabilities::alibaba`], [`Capabilities::tencent`])
//! switches the corresponding behaviour on.
//!
//! [`Faults`] injects the failure modes the engine must survive.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use autok3s_common::error::UNKNOWN_CONTEXT;
use autok3s_common::tags::{self, TagSet};
use autok3s_common::{Error, InstanceStatus, ProviderKind, Result};
use autok3s_engine::backend::{
    AddressAllocation, Cursor, CursorStyle, ElasticAddress, IngressRule, InstanceDescription,
    InstancePage, InstanceQuery, LaunchSpec, LaunchedInstance, Network, SecurityGroup,
    SpotRequestState, Subnet, SubnetRequest, TaskStatus,
};
use autok3s_engine::{Capabilities, CloudApi};

/// Failure modes to inject
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Every call fails with a credential error
    pub reject_credentials: bool,
    /// Reads of a freshly created network resource that still miss it
    pub consistency_lag: u32,
    /// Describes an instance stays pending before running
    pub pending_describes: u32,
    /// Every batch create returns this many instances fewer than asked
    pub short_batch: usize,
    /// Launch ordinals (0-based, across all launches) that never run
    pub stuck_instances: BTreeSet<usize>,
    /// Terminate calls that fail transiently before succeeding
    pub terminate_failures: u32,
    /// Launch ordinals whose termination always fails
    pub protected_instances: BTreeSet<usize>,
    /// Tagging instances fails
    pub reject_instance_tags: bool,
    /// Polls a spot request stays open before fulfillment
    pub spot_open_polls: u32,
    /// Spot requests never get capacity
    pub spot_never_fulfils: bool,
    /// Polls an address task stays running
    pub task_running_polls: u32,
    /// Address tasks end in failure
    pub fail_address_tasks: bool,
    /// Address allocations return this many addresses fewer than asked
    pub address_shortfall: usize,
}

#[derive(Debug)]
struct Tracked<T> {
    resource: T,
    tags: TagSet,
    /// Reads that still miss the resource
    hidden_reads: u32,
}

impl<T: Clone> Tracked<T> {
    fn new(resource: T, tags: TagSet, hidden_reads: u32) -> Self {
        Self {
            resource,
            tags,
            hidden_reads,
        }
    }

    /// Read through eventual consistency
    fn read(&mut self) -> Option<T> {
        if self.hidden_reads > 0 {
            self.hidden_reads -= 1;
            return None;
        }
        Some(self.resource.clone())
    }
}

#[derive(Debug)]
struct Instance {
    description: InstanceDescription,
    private_ip: String,
    pending_describes: u32,
    stuck: bool,
    protected: bool,
}

#[derive(Debug)]
struct SpotRequest {
    spec: LaunchSpec,
    open_polls: u32,
    state: SpotRequestState,
}

#[derive(Debug)]
struct Address {
    ip: String,
    instance_id: Option<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    networks: BTreeMap<String, Tracked<Network>>,
    subnets: BTreeMap<String, Tracked<Subnet>>,
    groups: BTreeMap<String, Tracked<SecurityGroup>>,
    instances: BTreeMap<String, Instance>,
    spot_requests: BTreeMap<String, SpotRequest>,
    addresses: BTreeMap<String, Address>,
    tasks: BTreeMap<String, u32>,
    launched: usize,
    terminate_failures: u32,
    calls: BTreeMap<&'static str, usize>,
}

impl CloudState {
    fn tags_mut(&mut self, id: &str) -> Option<&mut TagSet> {
        if let Some(instance) = self.instances.get_mut(id) {
            return Some(&mut instance.description.tags);
        }
        if let Some(network) = self.networks.get_mut(id) {
            return Some(&mut network.tags);
        }
        if let Some(subnet) = self.subnets.get_mut(id) {
            return Some(&mut subnet.tags);
        }
        self.groups.get_mut(id).map(|group| &mut group.tags)
    }
}

/// In-memory cloud
pub struct SimulatedCloud {
    kind: ProviderKind,
    capabilities: Capabilities,
    faults: Faults,
    page_size: usize,
    state: Mutex<CloudState>,
}

fn short_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..12])
}

impl SimulatedCloud {
    /// A simulated back-end reporting itself as `simulated`, with EC2-like
    /// behaviour
    pub fn new() -> Self {
        Self::with_profile(ProviderKind::Simulated, Capabilities::aws())
    }

    /// Emulate a specific provider's behaviour profile
    pub fn emulating(kind: ProviderKind) -> Self {
        Self::with_profile(kind, Capabilities::for_provider(kind))
    }

    /// Explicit provider kind and capabilities
    pub fn with_profile(kind: ProviderKind, capabilities: Capabilities) -> Self {
        Self {
            kind,
            capabilities,
            faults: Faults::default(),
            page_size: 50,
            state: Mutex::new(CloudState::default()),
        }
    }

    /// Inject failures
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.state.get_mut().terminate_failures = faults.terminate_failures;
        self.faults = faults;
        self
    }

    /// Instances per describe page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of calls made to an operation (e.g. "create_network")
    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Current view of an instance, bypassing state transitions
    pub fn instance(&self, instance_id: &str) -> Option<InstanceDescription> {
        self.state
            .lock()
            .instances
            .get(instance_id)
            .map(|i| i.description.clone())
    }

    /// Every instance ever launched, sorted by id
    pub fn instances(&self) -> Vec<InstanceDescription> {
        self.state
            .lock()
            .instances
            .values()
            .map(|i| i.description.clone())
            .collect()
    }

    /// Instances not terminated
    pub fn live_instances(&self) -> Vec<InstanceDescription> {
        self.instances()
            .into_iter()
            .filter(|i| !i.status.is_gone())
            .collect()
    }

    /// Number of networks
    pub fn network_count(&self) -> usize {
        self.state.lock().networks.len()
    }

    /// Number of subnets
    pub fn subnet_count(&self) -> usize {
        self.state.lock().subnets.len()
    }

    /// Number of security groups
    pub fn security_group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Rules of a security group
    pub fn security_group_rules(&self, group_id: &str) -> Vec<IngressRule> {
        self.state
            .lock()
            .groups
            .get(group_id)
            .map(|g| g.resource.rules.clone())
            .unwrap_or_default()
    }

    /// Tags on a network, subnet, group or instance
    pub fn resource_tags(&self, resource_id: &str) -> TagSet {
        self.state
            .lock()
            .tags_mut(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of allocated (not yet released) addresses
    pub fn allocated_addresses(&self) -> Vec<String> {
        self.state.lock().addresses.keys().cloned().collect()
    }

    /// Spot requests still open
    pub fn open_spot_requests(&self) -> Vec<String> {
        self.state
            .lock()
            .spot_requests
            .iter()
            .filter(|(_, r)| r.state == SpotRequestState::Open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Seed an existing network (with subnet and group) as if created out of band
    pub fn seed_network(&self, network_cidr: &str, subnet_cidr: &str) -> (String, String, String) {
        let mut state = self.state.lock();
        let network_id = short_id("vpc");
        let subnet_id = short_id("subnet");
        let group_id = short_id("sg");
        state.networks.insert(
            network_id.clone(),
            Tracked::new(
                Network {
                    id: network_id.clone(),
                    name: "seeded".to_string(),
                    cidr: network_cidr.to_string(),
                },
                TagSet::new(),
                0,
            ),
        );
        state.subnets.insert(
            subnet_id.clone(),
            Tracked::new(
                Subnet {
                    id: subnet_id.clone(),
                    name: "seeded".to_string(),
                    network_id: network_id.clone(),
                    cidr: subnet_cidr.to_string(),
                    zone: None,
                },
                TagSet::new(),
                0,
            ),
        );
        state.groups.insert(
            group_id.clone(),
            Tracked::new(
                SecurityGroup {
                    id: group_id.clone(),
                    name: "seeded".to_string(),
                    network_id: network_id.clone(),
                    rules: Vec::new(),
                },
                TagSet::new(),
                0,
            ),
        );
        (network_id, subnet_id, group_id)
    }

    fn enter(&self, operation: &'static str) -> Result<parking_lot::MutexGuard<'_, CloudState>> {
        if self.faults.reject_credentials {
            return Err(Error::credential(
                self.kind.as_str(),
                "AuthFailure: credentials could not be validated",
            ));
        }
        let mut state = self.state.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        Ok(state)
    }

    fn not_found(&self, what: &str, id: &str) -> Error {
        Error::provider_permanent(
            UNKNOWN_CONTEXT,
            self.kind.as_str(),
            format!("{} {} not found", what, id),
        )
    }

    fn unsupported(&self, what: &str) -> Error {
        Error::provider_permanent(
            UNKNOWN_CONTEXT,
            self.kind.as_str(),
            format!("{} is not supported by the {} profile", what, self.kind),
        )
    }

    fn launch_one(&self, state: &mut CloudState, spec: &LaunchSpec) -> LaunchedInstance {
        let ordinal = state.launched;
        state.launched += 1;

        let instance_id = short_id("i");
        let private_ip = format!("10.0.{}.{}", 1 + ordinal / 250, 4 + ordinal % 250);
        let public_addresses = if spec.public_ip {
            vec![format!("54.0.{}.{}", ordinal / 250, 1 + ordinal % 250)]
        } else {
            Vec::new()
        };

        let description = InstanceDescription {
            instance_id: instance_id.clone(),
            status: InstanceStatus::Pending,
            tags: TagSet::new(),
            internal_addresses: Vec::new(),
            public_addresses,
            zone: spec.zone.clone(),
            secondary_resource_ids: Vec::new(),
        };
        state.instances.insert(
            instance_id.clone(),
            Instance {
                description,
                private_ip,
                pending_describes: self.faults.pending_describes,
                stuck: self.faults.stuck_instances.contains(&ordinal),
                protected: self.faults.protected_instances.contains(&ordinal),
            },
        );
        debug!(instance_id = %instance_id, ordinal, "Simulated instance launched");

        LaunchedInstance {
            instance_id,
            status: InstanceStatus::Pending,
        }
    }

    fn new_task(&self, state: &mut CloudState) -> Option<String> {
        if self.faults.task_running_polls == 0 && !self.faults.fail_address_tasks {
            return None;
        }
        let task_id = short_id("task");
        state
            .tasks
            .insert(task_id.clone(), self.faults.task_running_polls);
        Some(task_id)
    }

    fn check_subnet(&self, state: &CloudState, spec: &LaunchSpec) -> Result<()> {
        if let Some(subnet_id) = &spec.subnet_id {
            if !state.subnets.contains_key(subnet_id) {
                return Err(self.not_found("subnet", subnet_id));
            }
        }
        if let Some(group_id) = &spec.security_group_id {
            if !state.groups.contains_key(group_id) {
                return Err(self.not_found("security group", group_id));
            }
        }
        Ok(())
    }
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance an instance one describe closer to running
fn observe(instance: &mut Instance) {
    if instance.description.status != InstanceStatus::Pending || instance.stuck {
        return;
    }
    if instance.pending_describes > 0 {
        instance.pending_describes -= 1;
        return;
    }
    instance.description.status = InstanceStatus::Running;
    instance.description.internal_addresses = vec![instance.private_ip.clone()];
}

#[async_trait]
impl CloudApi for SimulatedCloud {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn verify_credentials(&self) -> Result<()> {
        drop(self.enter("verify_credentials")?);
        Ok(())
    }

    async fn get_network(&self, id: &str) -> Result<Option<Network>> {
        let mut state = self.enter("get_network")?;
        Ok(state.networks.get_mut(id).and_then(Tracked::read))
    }

    async fn find_network(&self, name: &str) -> Result<Option<Network>> {
        let mut state = self.enter("find_network")?;
        Ok(state
            .networks
            .values_mut()
            .find(|n| n.resource.name == name)
            .and_then(Tracked::read))
    }

    async fn create_network(&self, name: &str, cidr: &str, tags: &TagSet) -> Result<String> {
        let mut state = self.enter("create_network")?;
        let id = short_id("vpc");
        let network = Network {
            id: id.clone(),
            name: name.to_string(),
            cidr: cidr.to_string(),
        };
        state.networks.insert(
            id.clone(),
            Tracked::new(network, tags.clone(), self.faults.consistency_lag),
        );
        Ok(id)
    }

    async fn get_subnet(&self, id: &str) -> Result<Option<Subnet>> {
        let mut state = self.enter("get_subnet")?;
        Ok(state.subnets.get_mut(id).and_then(Tracked::read))
    }

    async fn find_subnet(&self, network_id: &str, name: &str) -> Result<Option<Subnet>> {
        let mut state = self.enter("find_subnet")?;
        Ok(state
            .subnets
            .values_mut()
            .find(|s| s.resource.network_id == network_id && s.resource.name == name)
            .and_then(Tracked::read))
    }

    async fn create_subnet(&self, request: &SubnetRequest) -> Result<String> {
        let mut state = self.enter("create_subnet")?;
        if !state.networks.contains_key(&request.network_id) {
            return Err(self.not_found("network", &request.network_id));
        }
        let id = short_id("subnet");
        let subnet = Subnet {
            id: id.clone(),
            name: request.name.clone(),
            network_id: request.network_id.clone(),
            cidr: request.cidr.clone(),
            zone: request.zone.clone(),
        };
        state.subnets.insert(
            id.clone(),
            Tracked::new(subnet, request.tags.clone(), self.faults.consistency_lag),
        );
        Ok(id)
    }

    async fn get_security_group(&self, id: &str) -> Result<Option<SecurityGroup>> {
        let mut state = self.enter("get_security_group")?;
        Ok(state.groups.get_mut(id).and_then(Tracked::read))
    }

    async fn find_security_group(
        &self,
        network_id: &str,
        name: &str,
    ) -> Result<Option<SecurityGroup>> {
        let mut state = self.enter("find_security_group")?;
        Ok(state
            .groups
            .values_mut()
            .find(|g| g.resource.network_id == network_id && g.resource.name == name)
            .and_then(Tracked::read))
    }

    async fn create_security_group(
        &self,
        network_id: &str,
        name: &str,
        tags: &TagSet,
    ) -> Result<String> {
        let mut state = self.enter("create_security_group")?;
        if !state.networks.contains_key(network_id) {
            return Err(self.not_found("network", network_id));
        }
        let id = short_id("sg");
        let group = SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            network_id: network_id.to_string(),
            rules: Vec::new(),
        };
        state.groups.insert(
            id.clone(),
            Tracked::new(group, tags.clone(), self.faults.consistency_lag),
        );
        Ok(id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        let mut state = self.enter("authorize_ingress")?;
        let kind = self.kind;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| self.not_found("security group", group_id))?;
        if let Some(duplicate) = rules.iter().find(|r| group.resource.rules.contains(r)) {
            return Err(Error::provider_permanent(
                UNKNOWN_CONTEXT,
                kind.as_str(),
                format!("InvalidPermission.Duplicate: {}", duplicate),
            ));
        }
        group.resource.rules.extend(rules.iter().cloned());
        Ok(())
    }

    async fn tag_resources(&self, resource_ids: &[String], tags: &TagSet) -> Result<()> {
        let mut guard = self.enter("tag_resources")?;
        let state = &mut *guard;
        for id in resource_ids {
            if self.faults.reject_instance_tags && state.instances.contains_key(id) {
                return Err(Error::provider_permanent(
                    UNKNOWN_CONTEXT,
                    self.kind.as_str(),
                    format!("InvalidParameterValue: cannot tag {}", id),
                ));
            }
            let target = state
                .tags_mut(id)
                .ok_or_else(|| self.not_found("resource", id))?;
            target.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    async fn untag_resources(&self, resource_ids: &[String], keys: &[String]) -> Result<()> {
        let mut guard = self.enter("untag_resources")?;
        let state = &mut *guard;
        for id in resource_ids {
            let target = state
                .tags_mut(id)
                .ok_or_else(|| self.not_found("resource", id))?;
            for key in keys {
                target.remove(key);
            }
        }
        Ok(())
    }

    async fn run_instances(
        &self,
        spec: &LaunchSpec,
        count: usize,
    ) -> Result<Vec<LaunchedInstance>> {
        let mut state = self.enter("run_instances")?;
        self.check_subnet(&state, spec)?;
        let granted = count.saturating_sub(self.faults.short_batch);
        Ok((0..granted)
            .map(|_| self.launch_one(&mut state, spec))
            .collect())
    }

    async fn request_spot_instance(&self, spec: &LaunchSpec, max_price: &str) -> Result<String> {
        let mut state = self.enter("request_spot_instance")?;
        if !self.capabilities.spot {
            return Err(self.unsupported("spot"));
        }
        self.check_subnet(&state, spec)?;
        let request_id = short_id("sir");
        state.spot_requests.insert(
            request_id.clone(),
            SpotRequest {
                spec: spec.clone(),
                open_polls: self.faults.spot_open_polls,
                state: SpotRequestState::Open,
            },
        );
        debug!(request_id = %request_id, max_price, "Simulated spot request submitted");
        Ok(request_id)
    }

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequestState> {
        let mut guard = self.enter("describe_spot_request")?;
        let state = &mut *guard;
        let request = state
            .spot_requests
            .get_mut(request_id)
            .ok_or_else(|| self.not_found("spot request", request_id))?;

        if request.state == SpotRequestState::Open && !self.faults.spot_never_fulfils {
            if request.open_polls > 0 {
                request.open_polls -= 1;
            } else {
                let spec = request.spec.clone();
                let launched = self.launch_one(state, &spec);
                if let Some(request) = state.spot_requests.get_mut(request_id) {
                    request.state = SpotRequestState::Fulfilled {
                        instance_id: launched.instance_id,
                    };
                }
            }
        }
        Ok(state
            .spot_requests
            .get(request_id)
            .map(|r| r.state.clone())
            .unwrap_or(SpotRequestState::Cancelled))
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<SpotRequestState> {
        let mut state = self.enter("cancel_spot_request")?;
        let request = state
            .spot_requests
            .get_mut(request_id)
            .ok_or_else(|| self.not_found("spot request", request_id))?;
        if request.state == SpotRequestState::Open {
            request.state = SpotRequestState::Cancelled;
        }
        Ok(request.state.clone())
    }

    async fn describe_instances(
        &self,
        query: &InstanceQuery,
        cursor: Option<Cursor>,
    ) -> Result<InstancePage> {
        let mut state = self.enter("describe_instances")?;

        let offset = match &cursor {
            None => 0,
            Some(Cursor::Offset(n)) => *n as usize,
            Some(Cursor::Token(token)) => token
                .strip_prefix("page-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| {
                    Error::provider_permanent(
                        UNKNOWN_CONTEXT,
                        self.kind.as_str(),
                        format!("InvalidNextToken: {}", token),
                    )
                })?,
        };

        let honour_state_filter = self.capabilities.state_filter && query.exclude_gone;
        let mut matching: Vec<InstanceDescription> = Vec::new();
        for instance in state.instances.values_mut() {
            if !query.instance_ids.is_empty()
                && !query.instance_ids.contains(&instance.description.instance_id)
            {
                continue;
            }
            if !tags::matches_filter(&instance.description.tags, &query.tags) {
                continue;
            }
            if honour_state_filter && instance.description.status.is_gone() {
                continue;
            }
            observe(instance);
            matching.push(instance.description.clone());
        }

        let end = (offset + self.page_size).min(matching.len());
        let instances = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next = (end < matching.len()).then(|| match self.capabilities.cursor {
            CursorStyle::Token => Cursor::Token(format!("page-{}", end)),
            CursorStyle::Offset => Cursor::Offset(end as u32),
        });
        Ok(InstancePage { instances, next })
    }

    async fn wait_instances_running(
        &self,
        instance_ids: &[String],
        timeout: Duration,
    ) -> Result<bool> {
        let mut state = self.enter("wait_instances_running")?;
        if !self.capabilities.native_wait {
            return Err(self.unsupported("native wait"));
        }
        let mut all_running = true;
        for id in instance_ids {
            let instance = state
                .instances
                .get_mut(id)
                .ok_or_else(|| self.not_found("instance", id))?;
            if instance.stuck || instance.description.status.is_gone() {
                all_running = false;
                continue;
            }
            instance.pending_describes = 0;
            observe(instance);
        }
        debug!(count = instance_ids.len(), ?timeout, all_running, "Simulated native wait");
        Ok(all_running)
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut guard = self.enter("terminate_instances")?;
        let state = &mut *guard;

        let protected = instance_ids
            .iter()
            .find(|id| state.instances.get(*id).is_some_and(|i| i.protected));
        if let Some(id) = protected {
            return Err(Error::provider_permanent(
                UNKNOWN_CONTEXT,
                self.kind.as_str(),
                format!("OperationNotPermitted: {} has termination protection", id),
            ));
        }
        if state.terminate_failures > 0 {
            state.terminate_failures -= 1;
            return Err(Error::provider(format!(
                "RequestLimitExceeded: terminate {}",
                instance_ids.join(",")
            )));
        }

        for id in instance_ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.description.status = InstanceStatus::Terminated;
                instance.description.internal_addresses.clear();
                instance.description.public_addresses.clear();
                instance.description.secondary_resource_ids.clear();
            }
            for address in state.addresses.values_mut() {
                if address.instance_id.as_deref() == Some(id.as_str()) {
                    address.instance_id = None;
                }
            }
        }
        Ok(())
    }

    async fn allocate_addresses(&self, count: usize, _tags: &TagSet) -> Result<AddressAllocation> {
        let mut state = self.enter("allocate_addresses")?;
        if !self.capabilities.secondary_addresses {
            return Err(self.unsupported("elastic addresses"));
        }
        let granted = count.saturating_sub(self.faults.address_shortfall);
        let mut addresses = Vec::with_capacity(granted);
        for _ in 0..granted {
            let allocation_id = short_id("eip");
            let n = state.addresses.len();
            let ip = format!("47.100.{}.{}", n / 250, 1 + n % 250);
            state.addresses.insert(
                allocation_id.clone(),
                Address {
                    ip: ip.clone(),
                    instance_id: None,
                },
            );
            addresses.push(ElasticAddress { allocation_id, ip });
        }
        let task = self.new_task(&mut state);
        Ok(AddressAllocation { addresses, task })
    }

    async fn associate_address(
        &self,
        allocation_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>> {
        let mut guard = self.enter("associate_address")?;
        let state = &mut *guard;
        let address = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| self.not_found("address", allocation_id))?;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| self.not_found("instance", instance_id))?;

        address.instance_id = Some(instance_id.to_string());
        instance.description.public_addresses = vec![address.ip.clone()];
        if !instance
            .description
            .secondary_resource_ids
            .iter()
            .any(|id| id == allocation_id)
        {
            instance
                .description
                .secondary_resource_ids
                .push(allocation_id.to_string());
        }
        Ok(self.new_task(state))
    }

    async fn disassociate_address(&self, allocation_id: &str) -> Result<Option<String>> {
        let mut guard = self.enter("disassociate_address")?;
        let state = &mut *guard;
        let address = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| self.not_found("address", allocation_id))?;
        let Some(instance_id) = address.instance_id.take() else {
            return Err(Error::provider_permanent(
                UNKNOWN_CONTEXT,
                self.kind.as_str(),
                format!("InvalidAssociationID.NotFound: {} is not associated", allocation_id),
            ));
        };
        if let Some(instance) = state.instances.get_mut(&instance_id) {
            instance.description.public_addresses.clear();
            instance
                .description
                .secondary_resource_ids
                .retain(|id| id != allocation_id);
        }
        Ok(self.new_task(state))
    }

    async fn release_address(&self, allocation_id: &str) -> Result<Option<String>> {
        let mut state = self.enter("release_address")?;
        match state.addresses.get(allocation_id) {
            None => return Ok(None),
            Some(address) if address.instance_id.is_some() => {
                return Err(Error::provider_permanent(
                    UNKNOWN_CONTEXT,
                    self.kind.as_str(),
                    format!("InvalidIPAddress.InUse: {} is associated", allocation_id),
                ))
            }
            Some(_) => {}
        }
        state.addresses.remove(allocation_id);
        Ok(None)
    }

    async fn describe_task(&self, task_id: &str) -> Result<TaskStatus> {
        let mut state = self.enter("describe_task")?;
        let remaining = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| self.not_found("task", task_id))?;
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(TaskStatus::Running);
        }
        if self.faults.fail_address_tasks {
            return Ok(TaskStatus::Failed("ResourceInsufficient".to_string()));
        }
        Ok(TaskStatus::Succeeded)
    }
}
