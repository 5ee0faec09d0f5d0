//! Phase sequencing for cluster lifecycle operations
//!
//! `create` and `join` run bootstrap, then bring masters up before workers
//! (launch, wait for running, bind addresses), then hand the node set to the
//! install collaborator. Any failing step aborts the rest and rolls back what
//! the operation created before the original error is returned.
//!
//! `delete`, `status` and `exists` start from [`describe`](crate::describe),
//! so they work from cloud-side tags alone.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use autok3s_common::{ClusterContext, EngineConfig, Error, NodeRecord, Result, Role};

use crate::backend::CloudApi;
use crate::binder::{bind_secondary, release_addresses};
use crate::bootstrap::BootstrapOutcome;
use crate::collaborators::{ClusterInstaller, Phase, StateStore};
use crate::describe::{self, Existence};
use crate::launcher::launch;
use crate::poller::wait_running;
use crate::rollback::{rollback, terminate, untag_ccm};
use crate::Session;

/// A cluster whose machines are up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedCluster {
    /// Context name
    pub context: String,
    /// Every node of the cluster, sorted by instance id
    pub nodes: Vec<NodeRecord>,
    /// Networking resources the nodes were launched into
    pub bootstrap: BootstrapOutcome,
}

impl ProvisionedCluster {
    /// Nodes with the given role
    pub fn nodes_with_role(&self, role: Role) -> Vec<&NodeRecord> {
        self.nodes.iter().filter(|n| n.role == Some(role)).collect()
    }

    /// Nodes created by the operation that produced this result
    pub fn fresh_nodes(&self) -> Vec<&NodeRecord> {
        self.nodes.iter().filter(|n| n.is_current()).collect()
    }
}

/// Current state of a cluster as seen on the back-end
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterStatus {
    /// Context name
    pub context: String,
    /// Whether any live instance exists
    pub exists: bool,
    /// Master nodes
    pub masters: Vec<NodeRecord>,
    /// Worker nodes
    pub workers: Vec<NodeRecord>,
}

/// What a delete did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Context name
    pub context: String,
    /// Whether the cluster had live instances
    pub existed: bool,
    /// Instances terminated
    pub terminated: Vec<String>,
    /// Elastic addresses released
    pub released_addresses: Vec<String>,
    /// Elastic addresses that could not be released
    pub address_failures: Vec<String>,
    /// Networking resources whose co-ownership tag was removed
    pub untagged: Vec<String>,
}

/// Runs cluster lifecycle operations against one back-end
pub struct Provisioner {
    cloud: Arc<dyn CloudApi>,
    config: EngineConfig,
    installer: Option<Arc<dyn ClusterInstaller>>,
    state: Option<Arc<dyn StateStore>>,
}

impl Provisioner {
    /// Create a provisioner without collaborators
    pub fn new(cloud: Arc<dyn CloudApi>, config: EngineConfig) -> Self {
        Self {
            cloud,
            config,
            installer: None,
            state: None,
        }
    }

    /// Hand provisioned nodes to an installer
    pub fn with_installer(mut self, installer: Arc<dyn ClusterInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Persist node state after each phase
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    fn session(&self, ctx: &ClusterContext) -> Result<Session> {
        let backend = self.cloud.provider();
        if ctx.provider != backend {
            return Err(Error::configuration_for_field(
                ctx.context_name(),
                "provider",
                format!(
                    "cluster targets {} but the back-end is {}",
                    ctx.provider, backend
                ),
            ));
        }
        Ok(Session::new(
            self.cloud.clone(),
            ctx.clone(),
            self.config.clone(),
        ))
    }

    /// Create a new cluster
    ///
    /// Fails with [`Error::Preflight`] when the cluster already has live
    /// instances.
    #[instrument(skip(self, ctx), fields(cluster = %ctx))]
    pub async fn create(&self, ctx: &ClusterContext) -> Result<ProvisionedCluster> {
        ctx.validate(true)?;
        let session = self.session(ctx)?;

        let existence = describe::exists(&session).await?;
        if existence.exists {
            return Err(Error::preflight(
                session.cluster(),
                format!(
                    "cluster already exists ({} live instance(s))",
                    existence.instance_ids.len()
                ),
            ));
        }

        info!(
            masters = ctx.master_count,
            workers = ctx.worker_count,
            "Creating cluster"
        );

        let mut bootstrap = None;
        match self.run_create(&session, &mut bootstrap).await {
            Ok(cluster) => {
                info!(nodes = cluster.nodes.len(), "Cluster created");
                Ok(cluster)
            }
            Err(e) => {
                error!(error = %e, "Create failed");
                if bootstrap.is_some() || session.has_rollback_work() {
                    rollback(&session, bootstrap.as_ref()).await;
                }
                Err(e)
            }
        }
    }

    async fn run_create(
        &self,
        session: &Session,
        bootstrap_slot: &mut Option<BootstrapOutcome>,
    ) -> Result<ProvisionedCluster> {
        let bootstrap = session.bootstrapper().run().await?;
        *bootstrap_slot = Some(bootstrap.clone());
        self.save(session, Phase::Bootstrapped).await;

        bring_up(session, Role::Master, session.ctx.master_count, &bootstrap).await?;
        self.save(session, Phase::MastersRunning).await;

        bring_up(session, Role::Worker, session.ctx.worker_count, &bootstrap).await?;
        self.save(session, Phase::WorkersRunning).await;

        let nodes = session.table.records();
        if let Some(installer) = &self.installer {
            installer.install(&session.ctx, &nodes).await?;
            self.save(session, Phase::Installed).await;
        }

        Ok(ProvisionedCluster {
            context: session.cluster(),
            nodes,
            bootstrap,
        })
    }

    /// Add masters and workers to an existing cluster
    ///
    /// Existing nodes are discovered as `Known` and are never touched by the
    /// rollback of a failed join.
    #[instrument(skip(self, ctx), fields(cluster = %ctx))]
    pub async fn join(
        &self,
        ctx: &ClusterContext,
        masters: u32,
        workers: u32,
    ) -> Result<ProvisionedCluster> {
        ctx.validate(false)?;
        if masters == 0 && workers == 0 {
            return Err(Error::configuration(
                ctx.context_name(),
                "join needs at least one master or worker",
            ));
        }

        // Co-ownership tags belong to the cluster's create; re-tagging
        // adopted resources here would downgrade them to shared.
        let mut join_ctx = ctx.clone();
        join_ctx.options.cloud_controller_manager = false;
        let session = self.session(&join_ctx)?;

        let existing = describe::describe(&session).await?;
        if existing.is_empty() {
            return Err(Error::preflight(
                session.cluster(),
                "cluster does not exist",
            ));
        }
        info!(
            existing = existing.len(),
            masters, workers, "Joining nodes to cluster"
        );

        match self.run_join(&session, masters, workers).await {
            Ok(cluster) => {
                info!(joined = cluster.fresh_nodes().len(), "Join complete");
                Ok(cluster)
            }
            Err(e) => {
                error!(error = %e, "Join failed");
                if session.has_rollback_work() {
                    rollback(&session, None).await;
                }
                Err(e)
            }
        }
    }

    async fn run_join(
        &self,
        session: &Session,
        masters: u32,
        workers: u32,
    ) -> Result<ProvisionedCluster> {
        let bootstrap = session.bootstrapper().run().await?;

        bring_up(session, Role::Master, masters, &bootstrap).await?;
        bring_up(session, Role::Worker, workers, &bootstrap).await?;

        let nodes = session.table.records();
        if let Some(installer) = &self.installer {
            let (joining, existing): (Vec<NodeRecord>, Vec<NodeRecord>) =
                nodes.iter().cloned().partition(|n| n.is_current());
            installer.join(&session.ctx, &existing, &joining).await?;
        }
        self.save(session, Phase::Joined).await;

        Ok(ProvisionedCluster {
            context: session.cluster(),
            nodes,
            bootstrap,
        })
    }

    /// Delete every instance of a cluster
    ///
    /// Idempotent: deleting a cluster with no live instances succeeds without
    /// doing anything. Addresses and co-ownership tags are cleaned up on a
    /// best-effort basis; instances that cannot be terminated fail the call.
    #[instrument(skip(self, ctx), fields(cluster = %ctx))]
    pub async fn delete(&self, ctx: &ClusterContext) -> Result<DeleteReport> {
        let session = self.session(ctx)?;
        let mut report = DeleteReport {
            context: session.cluster(),
            ..Default::default()
        };

        let nodes = describe::describe(&session).await?;
        if nodes.is_empty() {
            // A previous delete may have terminated everything but failed to untag
            info!("Cluster has no live instances");
            report.untagged = remove_co_ownership(&session).await;
            return Ok(report);
        }
        report.existed = true;

        let mut allocations: Vec<String> = nodes
            .iter()
            .flat_map(|n| n.secondary_resource_ids.iter().cloned())
            .collect();
        allocations.sort();
        allocations.dedup();
        if !allocations.is_empty() {
            let released = release_addresses(&session, &allocations).await;
            report.released_addresses = released.released;
            report.address_failures = released.failed;
        }

        let ids: Vec<String> = nodes.iter().map(|n| n.instance_id.clone()).collect();
        let termination = terminate(&session, &ids).await;
        for id in &termination.terminated {
            session.table.remove(id);
        }
        report.terminated = termination.terminated;
        if !termination.failed.is_empty() {
            return Err(Error::provider_for(
                session.cluster(),
                session.provider(),
                format!(
                    "failed to terminate instance(s): {}",
                    termination.failed.join(", ")
                ),
            ));
        }

        report.untagged = remove_co_ownership(&session).await;

        if let Some(state) = &self.state {
            if let Err(e) = state.remove(ctx).await {
                warn!(error = %e, "Failed to remove local cluster state");
            }
        }

        info!(terminated = report.terminated.len(), "Cluster deleted");
        Ok(report)
    }

    /// Nodes of a cluster grouped by role
    pub async fn status(&self, ctx: &ClusterContext) -> Result<ClusterStatus> {
        let session = self.session(ctx)?;
        let nodes = describe::describe(&session).await?;

        let (masters, workers): (Vec<NodeRecord>, Vec<NodeRecord>) = nodes
            .into_iter()
            .partition(|n| n.role == Some(Role::Master));
        Ok(ClusterStatus {
            context: session.cluster(),
            exists: !masters.is_empty() || !workers.is_empty(),
            masters,
            workers,
        })
    }

    /// Whether a cluster has live instances
    pub async fn exists(&self, ctx: &ClusterContext) -> Result<Existence> {
        let session = self.session(ctx)?;
        describe::exists(&session).await
    }

    async fn save(&self, session: &Session, phase: Phase) {
        let Some(state) = &self.state else {
            return;
        };
        let nodes = session.table.records();
        if let Err(e) = state.save_nodes(&session.ctx, phase, &nodes).await {
            warn!(phase = %phase, error = %e, "Failed to save cluster state");
        }
    }
}

/// Launch, wait for and bind the nodes of one role
async fn bring_up(
    session: &Session,
    role: Role,
    count: u32,
    bootstrap: &BootstrapOutcome,
) -> Result<Vec<String>> {
    let ids = launch(session, role, count as usize, bootstrap).await?;
    wait_running(session, &ids).await?;
    bind_secondary(session, &ids).await?;
    Ok(ids)
}

/// Strip the cluster's co-ownership tags from its networking resources
///
/// Best effort: failures are logged and an empty list is returned.
async fn remove_co_ownership(session: &Session) -> Vec<String> {
    if !session.ctx.options.cloud_controller_manager {
        return Vec::new();
    }
    match session.bootstrapper().discover().await {
        Ok(outcome) => match untag_ccm(session, &outcome).await {
            Ok(untagged) => untagged,
            Err(e) => {
                warn!(error = %e, "Failed to remove co-ownership tags");
                Vec::new()
            }
        },
        Err(e) => {
            warn!(error = %e, "Failed to look up networking resources");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        Capabilities, InstanceDescription, InstancePage, LaunchedInstance, MockCloudApi,
    };
    use crate::collaborators::{MockClusterInstaller, MockStateStore};
    use autok3s_common::{tags, InstanceStatus, ProviderKind};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    fn ctx(masters: u32, workers: u32) -> ClusterContext {
        ClusterContext::new("lab", "rack-1", ProviderKind::Native).with_nodes(masters, workers)
    }

    /// A back-end without managed networking whose instances run immediately
    #[derive(Default)]
    struct Fleet {
        instances: Mutex<BTreeMap<String, InstanceDescription>>,
        terminated: Mutex<Vec<String>>,
    }

    fn native_mock(fleet: Arc<Fleet>, short_by: usize) -> MockCloudApi {
        let mut cloud = MockCloudApi::new();
        cloud.expect_provider().return_const(ProviderKind::Native);
        cloud.expect_capabilities().returning(Capabilities::native);

        let launch_fleet = fleet.clone();
        cloud.expect_run_instances().returning(move |_, count| {
            let mut instances = launch_fleet.instances.lock();
            let start = instances.len();
            let launched: Vec<LaunchedInstance> = (start..start + count.saturating_sub(short_by))
                .map(|i| {
                    let id = format!("m-{i}");
                    instances.insert(
                        id.clone(),
                        InstanceDescription {
                            instance_id: id.clone(),
                            status: InstanceStatus::Running,
                            internal_addresses: vec![format!("192.168.1.{i}")],
                            ..Default::default()
                        },
                    );
                    LaunchedInstance {
                        instance_id: id,
                        status: InstanceStatus::Pending,
                    }
                })
                .collect();
            Ok(launched)
        });

        let tag_fleet = fleet.clone();
        cloud.expect_tag_resources().returning(move |ids, tags| {
            let mut instances = tag_fleet.instances.lock();
            for id in ids {
                if let Some(instance) = instances.get_mut(id) {
                    instance.tags.extend(tags.clone());
                }
            }
            Ok(())
        });

        let describe_fleet = fleet.clone();
        cloud.expect_describe_instances().returning(move |query, _| {
            let instances = describe_fleet.instances.lock();
            let matching = instances
                .values()
                .filter(|i| query.instance_ids.is_empty() || query.instance_ids.contains(&i.instance_id))
                .filter(|i| tags::matches_filter(&i.tags, &query.tags))
                .cloned()
                .collect();
            Ok(InstancePage {
                instances: matching,
                next: None,
            })
        });

        let terminate_fleet = fleet;
        cloud.expect_terminate_instances().returning(move |ids| {
            let mut instances = terminate_fleet.instances.lock();
            for id in ids {
                if let Some(instance) = instances.get_mut(id) {
                    instance.status = InstanceStatus::Terminated;
                }
            }
            terminate_fleet.terminated.lock().extend(ids.iter().cloned());
            Ok(())
        });
        cloud
    }

    fn provisioner(fleet: Arc<Fleet>, short_by: usize) -> Provisioner {
        Provisioner::new(
            Arc::new(native_mock(fleet, short_by)),
            EngineConfig::fast(),
        )
    }

    // ==========================================================================
    // Story: Creating a Cluster
    // ==========================================================================

    #[tokio::test]
    async fn create_hands_every_node_to_the_installer_and_saves_each_phase() {
        let fleet = Arc::new(Fleet::default());

        let mut installer = MockClusterInstaller::new();
        installer
            .expect_install()
            .times(1)
            .withf(|_, nodes| nodes.len() == 3 && nodes.iter().all(|n| n.is_ready()))
            .returning(|_, _| Ok(()));

        let phases = Arc::new(Mutex::new(Vec::new()));
        let phases_clone = phases.clone();
        let mut state = MockStateStore::new();
        state.expect_save_nodes().returning(move |_, phase, _| {
            phases_clone.lock().push(phase);
            Ok(())
        });

        let provisioner = provisioner(fleet, 0)
            .with_installer(Arc::new(installer))
            .with_state_store(Arc::new(state));
        let cluster = provisioner.create(&ctx(1, 2)).await.unwrap();

        assert_eq!(cluster.nodes_with_role(Role::Master).len(), 1);
        assert_eq!(cluster.nodes_with_role(Role::Worker).len(), 2);
        assert_eq!(cluster.fresh_nodes().len(), 3);
        assert_eq!(
            *phases.lock(),
            vec![
                Phase::Bootstrapped,
                Phase::MastersRunning,
                Phase::WorkersRunning,
                Phase::Installed
            ]
        );
    }

    #[tokio::test]
    async fn installer_failure_rolls_back_every_new_node() {
        let fleet = Arc::new(Fleet::default());

        let mut installer = MockClusterInstaller::new();
        installer
            .expect_install()
            .returning(|ctx, _| Err(Error::installer(ctx.context_name(), "ssh: connection refused")));

        let provisioner = provisioner(fleet.clone(), 0).with_installer(Arc::new(installer));
        let err = provisioner.create(&ctx(1, 1)).await.unwrap_err();

        assert!(matches!(err, Error::Installer { .. }));
        let mut terminated = fleet.terminated.lock().clone();
        terminated.sort();
        assert_eq!(terminated, vec!["m-0".to_string(), "m-1".to_string()]);
    }

    /// Scenario: one master requested, back-end returns none
    #[tokio::test]
    async fn empty_batch_fails_with_nothing_to_terminate() {
        let fleet = Arc::new(Fleet::default());
        let provisioner = provisioner(fleet.clone(), 1);

        let err = provisioner.create(&ctx(1, 0)).await.unwrap_err();

        assert!(matches!(
            err,
            Error::CountMismatch {
                requested: 1,
                returned: 0,
                ..
            }
        ));
        assert!(fleet.terminated.lock().is_empty());
    }

    #[tokio::test]
    async fn create_refuses_an_existing_cluster() {
        let fleet = Arc::new(Fleet::default());
        let provisioner = provisioner(fleet.clone(), 0);
        provisioner.create(&ctx(1, 0)).await.unwrap();

        let err = provisioner.create(&ctx(1, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Preflight { .. }));
        assert!(fleet.terminated.lock().is_empty(), "preflight never rolls back");
    }

    #[tokio::test]
    async fn context_for_another_provider_is_rejected() {
        let fleet = Arc::new(Fleet::default());
        let provisioner = provisioner(fleet, 0);
        let mut other = ctx(1, 0);
        other.provider = ProviderKind::Simulated;
        let err = provisioner.exists(&other).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    // ==========================================================================
    // Story: Joining, Status and Deletion
    // ==========================================================================

    #[tokio::test]
    async fn join_passes_existing_and_joining_nodes_separately() {
        let fleet = Arc::new(Fleet::default());
        provisioner(fleet.clone(), 0)
            .create(&ctx(1, 0))
            .await
            .unwrap();

        let mut installer = MockClusterInstaller::new();
        installer
            .expect_join()
            .times(1)
            .withf(|_, existing, joining| {
                existing.len() == 1
                    && existing[0].role == Some(Role::Master)
                    && joining.len() == 2
                    && joining.iter().all(|n| n.role == Some(Role::Worker))
            })
            .returning(|_, _, _| Ok(()));

        let cluster = provisioner(fleet, 0)
            .with_installer(Arc::new(installer))
            .join(&ctx(1, 0), 0, 2)
            .await
            .unwrap();
        assert_eq!(cluster.nodes.len(), 3);
        assert_eq!(cluster.fresh_nodes().len(), 2);
    }

    #[tokio::test]
    async fn failed_join_keeps_existing_nodes() {
        let fleet = Arc::new(Fleet::default());
        provisioner(fleet.clone(), 0)
            .create(&ctx(1, 0))
            .await
            .unwrap();

        let mut installer = MockClusterInstaller::new();
        installer
            .expect_join()
            .returning(|ctx, _, _| Err(Error::installer(ctx.context_name(), "token rejected")));

        let result = provisioner(fleet.clone(), 0)
            .with_installer(Arc::new(installer))
            .join(&ctx(1, 0), 0, 1)
            .await;

        assert!(result.is_err());
        assert_eq!(*fleet.terminated.lock(), vec!["m-1".to_string()]);
    }

    #[tokio::test]
    async fn join_requires_an_existing_cluster() {
        let fleet = Arc::new(Fleet::default());
        let err = provisioner(fleet, 0)
            .join(&ctx(1, 0), 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Preflight { .. }));
    }

    #[tokio::test]
    async fn status_groups_nodes_by_role() {
        let fleet = Arc::new(Fleet::default());
        let provisioner = provisioner(fleet, 0);
        provisioner.create(&ctx(1, 2)).await.unwrap();

        let status = provisioner.status(&ctx(1, 2)).await.unwrap();
        assert!(status.exists);
        assert_eq!(status.masters.len(), 1);
        assert_eq!(status.workers.len(), 2);
    }

    #[tokio::test]
    async fn delete_terminates_everything_then_is_a_no_op() {
        let fleet = Arc::new(Fleet::default());

        let mut state = MockStateStore::new();
        state.expect_save_nodes().returning(|_, _, _| Ok(()));
        state.expect_remove().times(1).returning(|_| Ok(()));

        let provisioner = provisioner(fleet.clone(), 0).with_state_store(Arc::new(state));
        provisioner.create(&ctx(1, 1)).await.unwrap();

        let report = provisioner.delete(&ctx(1, 1)).await.unwrap();
        assert!(report.existed);
        assert_eq!(report.terminated.len(), 2);

        let again = provisioner.delete(&ctx(1, 1)).await.unwrap();
        assert!(!again.existed);
        assert!(again.terminated.is_empty());
        assert!(!provisioner.exists(&ctx(1, 1)).await.unwrap().exists);
    }
}
