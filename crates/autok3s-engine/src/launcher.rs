//! Instance Launcher
//!
//! Creates the requested number of instances for one role and registers them
//! in the Node State Table as [`Tracking::Fresh`](autok3s_common::Tracking).
//!
//! Two strategies:
//! - **Direct**: one batch create call; any shortfall is a hard failure.
//! - **Spot**: one request per instance, submitted and awaited in parallel
//!   workers. Request ids go into the [`SpotLedger`] the moment they exist so
//!   rollback can cancel them even if no instance was ever resolved.
//!
//! Every instance is then tagged with the ownership scheme. An instance is
//! registered before it is tagged, so a tagging failure leaves it in the
//! table for rollback to remove.

use dashmap::DashMap;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use autok3s_common::retry::{poll_until, PollError, Probe};
use autok3s_common::tags;
use autok3s_common::{ClusterContext, Error, InstanceStatus, NodeRecord, Result, Role};

use crate::backend::{LaunchSpec, SpotRequestState};
use crate::bootstrap::BootstrapOutcome;
use crate::{join_error, retry_api, Session};

/// Spot requests submitted by the in-progress operation
///
/// Kept apart from the Node State Table: a request that is still open when
/// the operation fails has no instance, yet must be cancelled.
#[derive(Debug, Default)]
pub struct SpotLedger {
    requests: DashMap<String, Option<String>>,
}

impl SpotLedger {
    /// Record a newly submitted request
    pub fn record(&self, request_id: impl Into<String>) {
        self.requests.entry(request_id.into()).or_insert(None);
    }

    /// Record the instance a request was fulfilled with
    pub fn resolve(&self, request_id: &str, instance_id: impl Into<String>) {
        self.requests
            .insert(request_id.to_string(), Some(instance_id.into()));
    }

    /// Every request with its resolved instance, sorted by request id
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        let mut entries: Vec<(String, Option<String>)> = self
            .requests
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Requests with no resolved instance
    pub fn unresolved(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(_, instance)| instance.is_none())
            .map(|(request, _)| request)
            .collect()
    }

    /// Forget a request (after cancellation)
    pub fn remove(&self, request_id: &str) {
        self.requests.remove(request_id);
    }

    /// Number of tracked requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no requests are tracked
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Build the create-call parameters for a cluster
pub fn launch_spec(ctx: &ClusterContext, bootstrap: &BootstrapOutcome) -> LaunchSpec {
    let shape = &ctx.options.shape;
    LaunchSpec {
        image: shape.image.clone(),
        instance_type: shape.instance_type.clone(),
        disk_size_gb: shape.disk_size_gb,
        disk_type: shape.disk_type.clone(),
        subnet_id: bootstrap.subnet_id().map(str::to_string),
        security_group_id: bootstrap.security_group_id().map(str::to_string),
        zone: ctx.zone.clone(),
        key_pair: ctx.ssh.key_pair.clone(),
        public_ip: !ctx.options.elastic_ip,
    }
}

/// Launch `count` instances of `role`; returns the new instance ids
#[instrument(skip(session, bootstrap), fields(cluster = %session.ctx))]
pub async fn launch(
    session: &Session,
    role: Role,
    count: usize,
    bootstrap: &BootstrapOutcome,
) -> Result<Vec<String>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let spec = launch_spec(&session.ctx, bootstrap);
    let ids = match session.ctx.options.spot_price.clone() {
        Some(price) => {
            if !session.cloud.capabilities().spot {
                return Err(Error::configuration_for_field(
                    session.cluster(),
                    "options.spot_price",
                    format!("{} does not support spot instances", session.provider()),
                ));
            }
            launch_spot(session, role, count, &spec, &price).await?
        }
        None => launch_direct(session, role, count, &spec).await?,
    };

    tag_instances(session, role, &ids).await?;
    info!(role = %role, count = ids.len(), instances = ?ids, "Launched instances");
    Ok(ids)
}

async fn launch_direct(
    session: &Session,
    role: Role,
    count: usize,
    spec: &LaunchSpec,
) -> Result<Vec<String>> {
    let launched = session.cloud.run_instances(spec, count).await?;

    let ids: Vec<String> = launched.iter().map(|i| i.instance_id.clone()).collect();
    for instance in launched {
        register(session, &instance.instance_id, role, instance.status);
    }

    if ids.len() != count {
        warn!(
            role = %role,
            requested = count,
            returned = ids.len(),
            "Back-end returned a different number of instances than requested"
        );
        return Err(Error::CountMismatch {
            cluster: session.cluster(),
            role: role.to_string(),
            requested: count,
            returned: ids.len(),
        });
    }
    Ok(ids)
}

async fn launch_spot(
    session: &Session,
    role: Role,
    count: usize,
    spec: &LaunchSpec,
    price: &str,
) -> Result<Vec<String>> {
    let mut workers = JoinSet::new();
    for _ in 0..count {
        let session = session.clone();
        let spec = spec.clone();
        let price = price.to_string();
        workers.spawn(async move { fulfil_spot_request(&session, role, &spec, &price).await });
    }

    // Drain every worker before reporting, so all submitted requests are in
    // the ledger when rollback runs.
    let mut ids = Vec::with_capacity(count);
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined.map_err(|e| join_error(e, "launcher"))? {
            Ok(instance_id) => ids.push(instance_id),
            Err(e) => {
                warn!(role = %role, error = %e, "Spot request failed");
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    ids.sort();
    Ok(ids)
}

async fn fulfil_spot_request(
    session: &Session,
    role: Role,
    spec: &LaunchSpec,
    price: &str,
) -> Result<String> {
    let request_id = session.cloud.request_spot_instance(spec, price).await?;
    session.spot_requests.record(&request_id);
    debug!(request_id = %request_id, role = %role, "Submitted spot request");

    let poll = session.config.spot_poll.to_poll_config();
    let cloud = session.cloud.as_ref();
    let request = request_id.as_str();
    let result = poll_until(&poll, "wait_spot_fulfilled", move |_| async move {
        match cloud.describe_spot_request(request).await {
            Ok(SpotRequestState::Fulfilled { instance_id }) => Ok(Probe::Ready(instance_id)),
            Ok(SpotRequestState::Open) => Ok(Probe::Pending),
            Ok(SpotRequestState::Failed { reason }) => Err(Error::provider_permanent(
                session.cluster(),
                session.provider(),
                format!("spot request {} failed: {}", request, reason),
            )),
            Ok(SpotRequestState::Cancelled) => Err(Error::provider_permanent(
                session.cluster(),
                session.provider(),
                format!("spot request {} was cancelled before fulfillment", request),
            )),
            Err(e) if e.is_retryable() => Ok(Probe::Pending),
            Err(e) => Err(e),
        }
    })
    .await;

    let instance_id = match result {
        Ok(instance_id) => instance_id,
        Err(PollError::Failed(e)) => return Err(e),
        Err(PollError::Exhausted { attempts }) => {
            return Err(Error::provider_for(
                session.cluster(),
                session.provider(),
                format!(
                    "spot request {} not fulfilled after {} attempt(s)",
                    request_id, attempts
                ),
            ))
        }
    };

    session.spot_requests.resolve(&request_id, &instance_id);
    register(session, &instance_id, role, InstanceStatus::Pending);
    debug!(request_id = %request_id, instance_id = %instance_id, "Spot request fulfilled");
    Ok(instance_id)
}

fn register(session: &Session, instance_id: &str, role: Role, status: InstanceStatus) {
    let mut record = NodeRecord::fresh(instance_id, role, status);
    record.zone = session.ctx.zone.clone();
    record.ssh_credential = Some(session.ctx.ssh.clone());
    session.table.upsert(record);
}

/// Apply the ownership tags to freshly launched instances
async fn tag_instances(session: &Session, role: Role, ids: &[String]) -> Result<()> {
    let tagging = ids.iter().map(|id| {
        let name = tags::instance_name(&session.ctx, role);
        let instance_tags = tags::instance_tags(&session.ctx, role, &name);
        async move {
            let target = [id.clone()];
            retry_api(&session.config, "tag_instance", || {
                session.cloud.tag_resources(&target, &instance_tags)
            })
            .await?;
            session.table.update(id, |r| r.name = Some(name));
            Ok::<(), Error>(())
        }
    });
    futures::future::try_join_all(tagging).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, LaunchedInstance, MockCloudApi};
    use autok3s_common::{EngineConfig, ProviderKind, Tracking};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> ClusterContext {
        let mut ctx = ClusterContext::new("demo", "us-east-1", ProviderKind::Aws).with_nodes(1, 2);
        ctx.options.shape.image = "ami-1".to_string();
        ctx.options.shape.instance_type = "t3.medium".to_string();
        ctx
    }

    fn mock() -> MockCloudApi {
        let mut cloud = MockCloudApi::new();
        cloud.expect_provider().return_const(ProviderKind::Aws);
        cloud.expect_capabilities().returning(Capabilities::aws);
        cloud
    }

    fn session(cloud: MockCloudApi, ctx: ClusterContext) -> Session {
        Session::new(Arc::new(cloud), ctx, EngineConfig::fast())
    }

    fn launched(n: usize) -> Vec<LaunchedInstance> {
        (0..n)
            .map(|i| LaunchedInstance {
                instance_id: format!("i-{i}"),
                status: InstanceStatus::Pending,
            })
            .collect()
    }

    // ==========================================================================
    // Story: Direct Launch
    // ==========================================================================

    #[tokio::test]
    async fn direct_launch_registers_exactly_count_fresh_records() {
        let mut cloud = mock();
        cloud
            .expect_run_instances()
            .times(1)
            .withf(|spec, count| *count == 3 && spec.image == "ami-1" && spec.public_ip)
            .returning(|_, count| Ok(launched(count)));
        cloud
            .expect_tag_resources()
            .times(3)
            .withf(|ids, tags| {
                ids.len() == 1
                    && tags.get("autok3s") == Some(&"true".to_string())
                    && tags.get("master") == Some(&"false".to_string())
            })
            .returning(|_, _| Ok(()));

        let session = session(cloud, ctx());
        let ids = launch(&session, Role::Worker, 3, &BootstrapOutcome::default())
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 3);
        for record in session.table.records() {
            assert_eq!(record.tracking, Tracking::Fresh);
            assert!(record.is_rollback_eligible());
            assert_eq!(record.status, InstanceStatus::Pending);
            assert!(record
                .name
                .as_deref()
                .unwrap()
                .starts_with("worker-demo.us-east-1.aws-"));
        }
    }

    /// Scenario: back-end returns zero instances for a one-master request
    #[tokio::test]
    async fn when_batch_returns_nothing_launch_fails_with_count_mismatch() {
        let mut cloud = mock();
        cloud
            .expect_run_instances()
            .returning(|_, _| Ok(Vec::new()));
        cloud.expect_tag_resources().times(0);

        let session = session(cloud, ctx());
        let err = launch(&session, Role::Master, 1, &BootstrapOutcome::default())
            .await
            .unwrap_err();

        match err {
            Error::CountMismatch {
                requested,
                returned,
                ..
            } => {
                assert_eq!(requested, 1);
                assert_eq!(returned, 0);
            }
            other => panic!("expected CountMismatch, got {other:?}"),
        }
        assert!(session.table.is_empty());
    }

    /// A short batch still registers what came back so rollback can remove it
    #[tokio::test]
    async fn when_batch_is_short_returned_instances_are_registered() {
        let mut cloud = mock();
        cloud
            .expect_run_instances()
            .returning(|_, _| Ok(launched(1)));

        let session = session(cloud, ctx());
        let err = launch(&session, Role::Worker, 2, &BootstrapOutcome::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CountMismatch { returned: 1, .. }));
        assert_eq!(session.table.rollback_ids(), vec!["i-0".to_string()]);
    }

    #[tokio::test]
    async fn when_tagging_fails_instances_stay_registered_for_rollback() {
        let mut cloud = mock();
        cloud
            .expect_run_instances()
            .returning(|_, count| Ok(launched(count)));
        cloud
            .expect_tag_resources()
            .returning(|_, _| Err(Error::provider_permanent("c", "aws", "InvalidTag")));

        let session = session(cloud, ctx());
        let result = launch(&session, Role::Master, 1, &BootstrapOutcome::default()).await;

        assert!(result.is_err());
        assert_eq!(session.table.rollback_ids(), vec!["i-0".to_string()]);
    }

    #[tokio::test]
    async fn zero_count_is_a_no_op() {
        let mut cloud = mock();
        cloud.expect_run_instances().times(0);
        let session = session(cloud, ctx());
        let ids = launch(&session, Role::Worker, 0, &BootstrapOutcome::default())
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    // ==========================================================================
    // Story: Spot Launch
    // ==========================================================================

    fn spot_ctx() -> ClusterContext {
        let mut ctx = ctx();
        ctx.options.spot_price = Some("0.05".to_string());
        ctx
    }

    #[tokio::test]
    async fn spot_requests_are_polled_until_fulfilled() {
        let submitted = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));
        let submitted_clone = submitted.clone();
        let polls_clone = polls.clone();

        let mut cloud = mock();
        cloud
            .expect_request_spot_instance()
            .times(2)
            .withf(|_, price| price == "0.05")
            .returning(move |_, _| {
                Ok(format!("sir-{}", submitted_clone.fetch_add(1, Ordering::SeqCst)))
            });
        cloud.expect_describe_spot_request().returning(move |id| {
            // Each request stays open once before fulfillment
            if polls_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(SpotRequestState::Open)
            } else {
                Ok(SpotRequestState::Fulfilled {
                    instance_id: id.replace("sir", "i"),
                })
            }
        });
        cloud.expect_run_instances().times(0);
        cloud.expect_tag_resources().returning(|_, _| Ok(()));

        let session = session(cloud, spot_ctx());
        let ids = launch(&session, Role::Worker, 2, &BootstrapOutcome::default())
            .await
            .unwrap();

        assert_eq!(ids, vec!["i-0".to_string(), "i-1".to_string()]);
        assert_eq!(session.spot_requests.len(), 2);
        assert!(session.spot_requests.unresolved().is_empty());
        assert_eq!(session.table.rollback_ids().len(), 2);
    }

    /// An unfulfilled request fails the launch but stays in the ledger
    #[tokio::test]
    async fn when_spot_request_never_fulfils_it_is_kept_for_cancellation() {
        let mut cloud = mock();
        cloud
            .expect_request_spot_instance()
            .returning(|_, _| Ok("sir-stuck".to_string()));
        cloud
            .expect_describe_spot_request()
            .returning(|_| Ok(SpotRequestState::Open));

        let session = session(cloud, spot_ctx());
        let err = launch(&session, Role::Master, 1, &BootstrapOutcome::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not fulfilled"));
        assert_eq!(session.spot_requests.unresolved(), vec!["sir-stuck".to_string()]);
        assert!(session.table.is_empty());
    }

    #[tokio::test]
    async fn failed_spot_request_is_a_hard_failure() {
        let mut cloud = mock();
        cloud
            .expect_request_spot_instance()
            .returning(|_, _| Ok("sir-1".to_string()));
        cloud.expect_describe_spot_request().returning(|_| {
            Ok(SpotRequestState::Failed {
                reason: "capacity-not-available".to_string(),
            })
        });

        let session = session(cloud, spot_ctx());
        let err = launch(&session, Role::Worker, 1, &BootstrapOutcome::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("capacity-not-available"));
    }

    #[tokio::test]
    async fn spot_on_back_end_without_spot_is_a_configuration_error() {
        let mut cloud = MockCloudApi::new();
        cloud.expect_provider().return_const(ProviderKind::Tencent);
        cloud.expect_capabilities().returning(Capabilities::tencent);
        cloud.expect_request_spot_instance().times(0);

        let session = session(cloud, spot_ctx());
        let err = launch(&session, Role::Worker, 1, &BootstrapOutcome::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
