//! Resource Bootstrapper
//!
//! Ensures the networking prerequisites for launching instances exist
//! without ever creating duplicates across repeated invocations. The same
//! discover-or-create protocol is applied to the virtual network, the subnet
//! and the security group:
//!
//! 1. an explicitly configured id is fetched and verified against its parent;
//! 2. otherwise the resource is looked up by its deterministic name;
//! 3. if absent it is created with that name and the ownership tags, then
//!    polled until the back-end reports it readable (cloud APIs are
//!    eventually consistent right after creation).
//!
//! Ingress permissions are additive: the required rule set is diffed
//! against the group's existing rules and only missing rules are appended.

use tracing::{debug, info, instrument, warn};

use autok3s_common::retry::{poll_until, PollError, Probe};
use autok3s_common::tags::{self, CcmOwnership, TagSet};
use autok3s_common::{ClusterContext, EngineConfig, Error, Result};

use crate::backend::{CloudApi, IngressRule, Network, Protocol, SecurityGroup, Subnet, SubnetRequest};
use crate::retry_api;

/// Source range for rules open to the world
pub const ANYWHERE: &str = "0.0.0.0/0";
/// SSH
pub const SSH_PORT: u16 = 22;
/// Kubernetes API server
pub const KUBE_API_PORT: u16 = 6443;
/// Kubelet API
pub const KUBELET_PORT: u16 = 10250;
/// Flannel VXLAN overlay
pub const VXLAN_PORT: u16 = 8472;
/// Embedded etcd client port
pub const ETCD_CLIENT_PORT: u16 = 2379;
/// Embedded etcd peer port
pub const ETCD_PEER_PORT: u16 = 2380;

/// Kind of bootstrap dependency
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyKind {
    /// Virtual network (VPC)
    Network,
    /// Subnet (VSwitch)
    Subnet,
    /// Security group / firewall
    SecurityGroup,
}

impl DependencyKind {
    /// Suffix of the deterministic resource name
    pub fn name_suffix(&self) -> &'static str {
        match self {
            Self::Network => "vpc",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "sg",
        }
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security group",
        })
    }
}

/// A discovered or created networking prerequisite
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapDependency {
    /// What it is
    pub kind: DependencyKind,
    /// Back-end id
    pub id: String,
    /// Name
    pub name: String,
    /// Owning network (for subnets and groups)
    pub network_id: Option<String>,
    /// Address range (networks and subnets)
    pub cidr: Option<String>,
    /// Created by this invocation rather than adopted
    pub created: bool,
}

/// What bootstrap resolved
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// Virtual network
    pub network: Option<BootstrapDependency>,
    /// Subnet
    pub subnet: Option<BootstrapDependency>,
    /// Security group
    pub security_group: Option<BootstrapDependency>,
    /// Rules appended to the security group
    pub rules_added: Vec<IngressRule>,
}

impl BootstrapOutcome {
    /// Every resolved dependency
    pub fn dependencies(&self) -> impl Iterator<Item = &BootstrapDependency> {
        [&self.network, &self.subnet, &self.security_group]
            .into_iter()
            .flatten()
    }

    /// Ids of every resolved dependency
    pub fn resource_ids(&self) -> Vec<String> {
        self.dependencies().map(|d| d.id.clone()).collect()
    }

    /// Dependencies created by this invocation
    pub fn created(&self) -> Vec<&BootstrapDependency> {
        self.dependencies().filter(|d| d.created).collect()
    }

    /// Subnet id to launch into
    pub fn subnet_id(&self) -> Option<&str> {
        self.subnet.as_ref().map(|d| d.id.as_str())
    }

    /// Security group id to attach
    pub fn security_group_id(&self) -> Option<&str> {
        self.security_group.as_ref().map(|d| d.id.as_str())
    }
}

/// Rules every k3s node needs
///
/// Baseline SSH, API server and kubelet; the VXLAN overlay port when flannel
/// uses VXLAN; etcd ports scoped to the subnet when running the embedded
/// datastore.
pub fn required_rules(ctx: &ClusterContext, subnet_cidr: &str) -> Vec<IngressRule> {
    let mut rules = vec![
        IngressRule::port(Protocol::Tcp, SSH_PORT, ANYWHERE),
        IngressRule::port(Protocol::Tcp, KUBE_API_PORT, ANYWHERE),
        IngressRule::port(Protocol::Tcp, KUBELET_PORT, ANYWHERE),
    ];
    if ctx.options.uses_overlay() {
        rules.push(IngressRule::port(Protocol::Udp, VXLAN_PORT, ANYWHERE));
    }
    if ctx.embedded_datastore() {
        rules.push(IngressRule::range(
            Protocol::Tcp,
            ETCD_CLIENT_PORT,
            ETCD_PEER_PORT,
            subnet_cidr,
        ));
    }
    rules
}

/// Rules in `required` that no existing rule already covers
///
/// Never touches `existing` and never returns the same rule twice.
pub fn missing_rules(required: &[IngressRule], existing: &[IngressRule]) -> Vec<IngressRule> {
    let mut missing: Vec<IngressRule> = Vec::new();
    for rule in required {
        let covered = existing.iter().any(|e| e.covers(rule));
        if !covered && !missing.contains(rule) {
            missing.push(rule.clone());
        }
    }
    missing
}

/// Discover-or-create driver for one cluster
pub struct Bootstrapper<'a> {
    cloud: &'a dyn CloudApi,
    ctx: &'a ClusterContext,
    config: &'a EngineConfig,
}

impl<'a> Bootstrapper<'a> {
    /// Create a bootstrapper
    pub fn new(cloud: &'a dyn CloudApi, ctx: &'a ClusterContext, config: &'a EngineConfig) -> Self {
        Self { cloud, ctx, config }
    }

    /// Resolve (and create if needed) the network, subnet and security group
    #[instrument(skip(self), fields(cluster = %self.ctx))]
    pub async fn run(&self) -> Result<BootstrapOutcome> {
        if !self.cloud.capabilities().managed_networking {
            debug!("back-end has no managed networking, skipping bootstrap");
            return Ok(BootstrapOutcome::default());
        }

        self.cloud.verify_credentials().await?;

        let network = self.ensure_network().await?;
        let subnet = self.ensure_subnet(&network).await?;
        let (group, existing_rules) = self.ensure_security_group(&network).await?;

        let subnet_cidr = subnet.cidr.clone().unwrap_or_default();
        let missing = missing_rules(&required_rules(self.ctx, &subnet_cidr), &existing_rules);
        if !missing.is_empty() {
            info!(
                security_group = %group.id,
                rules = ?missing.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Authorizing missing ingress rules"
            );
            self.cloud.authorize_ingress(&group.id, &missing).await?;
        }

        let outcome = BootstrapOutcome {
            network: Some(network),
            subnet: Some(subnet),
            security_group: Some(group),
            rules_added: missing,
        };

        if self.ctx.options.cloud_controller_manager {
            self.apply_ccm_tags(&outcome).await?;
        }

        info!(
            resources = ?outcome.resource_ids(),
            created = outcome.created().len(),
            rules_added = outcome.rules_added.len(),
            "Bootstrap complete"
        );
        Ok(outcome)
    }

    /// Resolve existing resources only; never creates or authorizes anything
    ///
    /// Used by deletion to find the resources carrying co-ownership tags.
    pub async fn discover(&self) -> Result<BootstrapOutcome> {
        if !self.cloud.capabilities().managed_networking {
            return Ok(BootstrapOutcome::default());
        }

        let mut outcome = BootstrapOutcome::default();
        let Some(network) = self.lookup_network().await? else {
            return Ok(outcome);
        };

        let subnet = match &self.ctx.options.subnet_id {
            Some(id) => self.get_subnet(id).await?,
            None => {
                let name = tags::resource_name(self.ctx, DependencyKind::Subnet.name_suffix());
                retry_api(self.config, "find_subnet", || {
                    self.cloud.find_subnet(&network.id, &name)
                })
                .await?
            }
        };
        let group = match &self.ctx.options.security_group_id {
            Some(id) => self.get_security_group(id).await?,
            None => {
                let name =
                    tags::resource_name(self.ctx, DependencyKind::SecurityGroup.name_suffix());
                retry_api(self.config, "find_security_group", || {
                    self.cloud.find_security_group(&network.id, &name)
                })
                .await?
            }
        };

        outcome.network = Some(network_dependency(network, false));
        outcome.subnet = subnet.map(|s| subnet_dependency(s, false));
        outcome.security_group = group.map(|g| group_dependency(g, false));
        Ok(outcome)
    }

    async fn lookup_network(&self) -> Result<Option<Network>> {
        if let Some(id) = &self.ctx.options.network_id {
            return self.get_network(id).await;
        }
        if let Some(subnet_id) = &self.ctx.options.subnet_id {
            if let Some(subnet) = self.get_subnet(subnet_id).await? {
                return self.get_network(&subnet.network_id).await;
            }
            return Ok(None);
        }
        let name = tags::resource_name(self.ctx, DependencyKind::Network.name_suffix());
        retry_api(self.config, "find_network", || self.cloud.find_network(&name)).await
    }

    async fn ensure_network(&self) -> Result<BootstrapDependency> {
        let cluster = self.ctx.context_name();

        if self.ctx.options.network_id.is_some() || self.ctx.options.subnet_id.is_some() {
            let network = self.lookup_network().await?.ok_or_else(|| {
                Error::configuration_for_field(
                    &cluster,
                    "options.network_id",
                    "configured network (or the network of the configured subnet) does not exist",
                )
            })?;
            debug!(network = %network.id, "Adopting configured network");
            return Ok(network_dependency(network, false));
        }

        if let Some(network) = self.lookup_network().await? {
            debug!(network = %network.id, "Adopting existing network");
            return Ok(network_dependency(network, false));
        }

        let name = tags::resource_name(self.ctx, DependencyKind::Network.name_suffix());
        let cidr = self.ctx.options.network_cidr().to_string();
        let id = self
            .cloud
            .create_network(&name, &cidr, &self.ownership_tags())
            .await?;
        info!(network = %id, name = %name, "Created network");

        let network = self
            .wait_readable(DependencyKind::Network, &id, || self.cloud.get_network(&id))
            .await?;
        Ok(network_dependency(network, true))
    }

    async fn ensure_subnet(&self, network: &BootstrapDependency) -> Result<BootstrapDependency> {
        let cluster = self.ctx.context_name();

        if let Some(id) = &self.ctx.options.subnet_id {
            let subnet = self.get_subnet(id).await?.ok_or_else(|| {
                Error::configuration_for_field(
                    &cluster,
                    "options.subnet_id",
                    format!("subnet {} does not exist", id),
                )
            })?;
            if subnet.network_id != network.id {
                return Err(Error::configuration_for_field(
                    &cluster,
                    "options.subnet_id",
                    format!(
                        "subnet {} belongs to network {}, expected {}",
                        subnet.id, subnet.network_id, network.id
                    ),
                ));
            }
            return Ok(subnet_dependency(subnet, false));
        }

        let name = tags::resource_name(self.ctx, DependencyKind::Subnet.name_suffix());
        if let Some(subnet) = retry_api(self.config, "find_subnet", || {
            self.cloud.find_subnet(&network.id, &name)
        })
        .await?
        {
            debug!(subnet = %subnet.id, "Adopting existing subnet");
            return Ok(subnet_dependency(subnet, false));
        }

        let request = SubnetRequest {
            name: name.clone(),
            network_id: network.id.clone(),
            cidr: self.ctx.options.subnet_cidr().to_string(),
            zone: self.ctx.zone.clone(),
            tags: self.ownership_tags(),
        };
        let id = self.cloud.create_subnet(&request).await?;
        info!(subnet = %id, name = %name, "Created subnet");

        let subnet = self
            .wait_readable(DependencyKind::Subnet, &id, || self.cloud.get_subnet(&id))
            .await?;
        Ok(subnet_dependency(subnet, true))
    }

    async fn ensure_security_group(
        &self,
        network: &BootstrapDependency,
    ) -> Result<(BootstrapDependency, Vec<IngressRule>)> {
        let cluster = self.ctx.context_name();

        if let Some(id) = &self.ctx.options.security_group_id {
            let group = self.get_security_group(id).await?.ok_or_else(|| {
                Error::configuration_for_field(
                    &cluster,
                    "options.security_group_id",
                    format!("security group {} does not exist", id),
                )
            })?;
            if group.network_id != network.id {
                return Err(Error::configuration_for_field(
                    &cluster,
                    "options.security_group_id",
                    format!(
                        "security group {} belongs to network {}, expected {}",
                        group.id, group.network_id, network.id
                    ),
                ));
            }
            let rules = group.rules.clone();
            return Ok((group_dependency(group, false), rules));
        }

        let name = tags::resource_name(self.ctx, DependencyKind::SecurityGroup.name_suffix());
        if let Some(group) = retry_api(self.config, "find_security_group", || {
            self.cloud.find_security_group(&network.id, &name)
        })
        .await?
        {
            debug!(security_group = %group.id, "Adopting existing security group");
            let rules = group.rules.clone();
            return Ok((group_dependency(group, false), rules));
        }

        let id = self
            .cloud
            .create_security_group(&network.id, &name, &self.ownership_tags())
            .await?;
        info!(security_group = %id, name = %name, "Created security group");

        let group = self
            .wait_readable(DependencyKind::SecurityGroup, &id, || {
                self.cloud.get_security_group(&id)
            })
            .await?;
        let rules = group.rules.clone();
        Ok((group_dependency(group, true), rules))
    }

    async fn get_network(&self, id: &str) -> Result<Option<Network>> {
        retry_api(self.config, "get_network", || self.cloud.get_network(id)).await
    }

    async fn get_subnet(&self, id: &str) -> Result<Option<Subnet>> {
        retry_api(self.config, "get_subnet", || self.cloud.get_subnet(id)).await
    }

    async fn get_security_group(&self, id: &str) -> Result<Option<SecurityGroup>> {
        retry_api(self.config, "get_security_group", || {
            self.cloud.get_security_group(id)
        })
        .await
    }

    /// Poll a just-created resource until the back-end can read it back
    async fn wait_readable<T, F, Fut>(&self, kind: DependencyKind, id: &str, mut get: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>>>,
    {
        let poll = self.config.consistency_poll.to_poll_config();
        let result = poll_until(&poll, "wait_resource_readable", |attempt| {
            let fut = get();
            async move {
                match fut.await {
                    Ok(Some(resource)) => Ok(Probe::Ready(resource)),
                    Ok(None) => Ok(Probe::Pending),
                    Err(e) if e.is_retryable() => {
                        warn!(kind = %kind, id = %id, attempt, error = %e, "Transient error reading new resource");
                        Ok(Probe::Pending)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await;

        match result {
            Ok(resource) => Ok(resource),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::Exhausted { attempts }) => Err(Error::provider_for(
                self.ctx.context_name(),
                self.cloud.provider().as_str(),
                format!(
                    "{} {} was created but not readable after {} attempt(s)",
                    kind, id, attempts
                ),
            )),
        }
    }

    async fn apply_ccm_tags(&self, outcome: &BootstrapOutcome) -> Result<()> {
        let (owned, shared): (Vec<&BootstrapDependency>, Vec<&BootstrapDependency>) =
            outcome.dependencies().partition(|d| d.created);

        for (deps, ownership) in [(owned, CcmOwnership::Owned), (shared, CcmOwnership::Shared)] {
            if deps.is_empty() {
                continue;
            }
            let ids: Vec<String> = deps.iter().map(|d| d.id.clone()).collect();
            self.cloud
                .tag_resources(&ids, &tags::ccm_tags(self.ctx, ownership))
                .await?;
            debug!(resources = ?ids, ownership = ownership.as_str(), "Applied co-ownership tags");
        }
        Ok(())
    }

    fn ownership_tags(&self) -> TagSet {
        let mut tags = tags::ownership_filter(self.ctx);
        for (k, v) in &self.ctx.tags {
            tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        tags
    }
}

fn network_dependency(network: Network, created: bool) -> BootstrapDependency {
    BootstrapDependency {
        kind: DependencyKind::Network,
        id: network.id,
        name: network.name,
        network_id: None,
        cidr: Some(network.cidr),
        created,
    }
}

fn subnet_dependency(subnet: Subnet, created: bool) -> BootstrapDependency {
    BootstrapDependency {
        kind: DependencyKind::Subnet,
        id: subnet.id,
        name: subnet.name,
        network_id: Some(subnet.network_id),
        cidr: Some(subnet.cidr),
        created,
    }
}

fn group_dependency(group: SecurityGroup, created: bool) -> BootstrapDependency {
    BootstrapDependency {
        kind: DependencyKind::SecurityGroup,
        id: group.id,
        name: group.name,
        network_id: Some(group.network_id),
        cidr: None,
        created,
    }
}
