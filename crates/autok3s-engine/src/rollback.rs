//! Rollback Coordinator
//!
//! Best-effort teardown of everything the failed operation created. Rollback
//! never fails: every sub-failure is logged and recorded in the
//! [`RollbackReport`], and the caller surfaces the original error.
//!
//! Only rollback-eligible records are touched. Instances discovered at the
//! start of a join are `Known` and survive any rollback.

use std::collections::BTreeSet;

use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use autok3s_common::retry::retry_with_backoff;
use autok3s_common::{tags, Error, Result};

use crate::backend::SpotRequestState;
use crate::binder::release_addresses;
use crate::bootstrap::BootstrapOutcome;
use crate::{retry_api, Session};

/// What rollback did and what it could not do
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Instances terminated
    pub terminated: Vec<String>,
    /// Instances that could not be terminated
    pub failed: Vec<String>,
    /// Spot requests cancelled
    pub cancelled_spot_requests: Vec<String>,
    /// Spot requests that could not be cancelled
    pub spot_failures: Vec<String>,
    /// Elastic addresses released
    pub released_addresses: Vec<String>,
    /// Elastic addresses that could not be released
    pub address_failures: Vec<String>,
    /// Networking resources whose co-ownership tag was removed
    pub untagged: Vec<String>,
}

impl RollbackReport {
    /// Whether every step succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.spot_failures.is_empty() && self.address_failures.is_empty()
    }
}

/// Outcome of terminating a set of instances
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TerminationOutcome {
    /// Instances terminated
    pub terminated: Vec<String>,
    /// Instances still alive after every retry
    pub failed: Vec<String>,
}

/// Undo the in-progress operation
///
/// With `ccm_resources`, the co-ownership tags applied during bootstrap are
/// removed once every instance is gone. Join rollback passes `None`: the
/// tags belong to the existing cluster.
#[instrument(skip_all, fields(cluster = %session.ctx))]
pub async fn rollback(session: &Session, ccm_resources: Option<&BootstrapOutcome>) -> RollbackReport {
    let mut report = RollbackReport::default();

    let marked = session.table.mark_pending_rollback();
    info!(
        instances = marked.len(),
        spot_requests = session.spot_requests.len(),
        addresses = session.addresses.len(),
        "Rolling back"
    );

    let mut targets: BTreeSet<String> = marked.into_iter().collect();
    targets.extend(cancel_spot_requests(session, &mut report).await);

    let mut allocations: BTreeSet<String> = session.addresses.allocation_ids().into_iter().collect();
    for record in session.table.records() {
        if record.is_rollback_eligible() {
            allocations.extend(record.secondary_resource_ids);
        }
    }
    if !allocations.is_empty() {
        let allocations: Vec<String> = allocations.into_iter().collect();
        let outcome = release_addresses(session, &allocations).await;
        report.released_addresses = outcome.released;
        report.address_failures = outcome.failed;
    }

    let targets: Vec<String> = targets.into_iter().collect();
    let termination = terminate(session, &targets).await;
    for id in &termination.terminated {
        session.table.remove(id);
    }
    report.terminated = termination.terminated;
    report.failed = termination.failed;

    if let Some(outcome) = ccm_resources {
        if report.failed.is_empty() {
            match untag_ccm(session, outcome).await {
                Ok(untagged) => report.untagged = untagged,
                Err(e) => warn!(error = %e, "Failed to remove co-ownership tags"),
            }
        } else {
            warn!("Instances remain, keeping co-ownership tags");
        }
    }

    if report.is_clean() {
        info!(terminated = report.terminated.len(), "Rollback complete");
    } else {
        error!(
            failed = ?report.failed,
            spot_failures = ?report.spot_failures,
            address_failures = ?report.address_failures,
            "Rollback left resources behind"
        );
    }
    report
}

/// Cancel every tracked spot request
///
/// Returns instances that exist because of a request but are not in the
/// table yet (fulfilled after the launcher gave up on them).
async fn cancel_spot_requests(session: &Session, report: &mut RollbackReport) -> Vec<String> {
    let mut untracked = Vec::new();

    for (request_id, instance) in session.spot_requests.entries() {
        if let Some(instance_id) = instance {
            // Already fulfilled; its instance is in the table
            if !session.table.contains(&instance_id) {
                untracked.push(instance_id);
            }
            session.spot_requests.remove(&request_id);
            continue;
        }

        let result = retry_api(&session.config, "cancel_spot_request", || {
            session.cloud.cancel_spot_request(&request_id)
        })
        .await;

        match result {
            Ok(SpotRequestState::Fulfilled { instance_id }) => {
                debug!(request_id = %request_id, instance_id = %instance_id, "Spot request was fulfilled before cancellation");
                if !session.table.contains(&instance_id) {
                    untracked.push(instance_id);
                }
                session.spot_requests.remove(&request_id);
                report.cancelled_spot_requests.push(request_id);
            }
            Ok(_) => {
                session.spot_requests.remove(&request_id);
                report.cancelled_spot_requests.push(request_id);
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Failed to cancel spot request");
                report.spot_failures.push(request_id);
            }
        }
    }
    untracked
}

/// Terminate instances concurrently, each with its own retry budget
///
/// Never fails; instances still alive after every retry are reported. Used
/// by rollback and by cluster deletion.
pub async fn terminate(session: &Session, instance_ids: &[String]) -> TerminationOutcome {
    let mut workers = JoinSet::new();
    for instance_id in instance_ids {
        let session = session.clone();
        let instance_id = instance_id.clone();
        workers.spawn(async move {
            let result = terminate_one(&session, &instance_id).await;
            (instance_id, result)
        });
    }

    let mut outcome = TerminationOutcome::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((instance_id, Ok(()))) => outcome.terminated.push(instance_id),
            Ok((instance_id, Err(e))) => {
                error!(instance_id = %instance_id, error = %e, "Failed to terminate instance");
                outcome.failed.push(instance_id);
            }
            Err(e) => error!(error = %e, "Termination worker failed"),
        }
    }

    // A worker that panicked never reported its instance
    for instance_id in instance_ids {
        if !outcome.terminated.contains(instance_id) && !outcome.failed.contains(instance_id) {
            outcome.failed.push(instance_id.clone());
        }
    }
    outcome.terminated.sort();
    outcome.failed.sort();
    outcome
}

async fn terminate_one(session: &Session, instance_id: &str) -> Result<()> {
    let target = [instance_id.to_string()];
    retry_with_backoff(
        &session.config.termination.to_retry_config(),
        "terminate_instance",
        |e: &Error| !e.is_credential(),
        || session.cloud.terminate_instances(&target),
    )
    .await?;
    debug!(instance_id, "Instance terminated");
    Ok(())
}

/// Remove the cloud-controller-manager co-ownership tag from networking
/// resources; returns the untagged resource ids
pub async fn untag_ccm(session: &Session, outcome: &BootstrapOutcome) -> Result<Vec<String>> {
    let resources = outcome.resource_ids();
    if !session.ctx.options.cloud_controller_manager || resources.is_empty() {
        return Ok(Vec::new());
    }

    let keys = [tags::ccm_tag_key(&session.ctx)];
    retry_api(&session.config, "untag_resources", || {
        session.cloud.untag_resources(&resources, &keys)
    })
    .await?;
    info!(resources = ?resources, "Removed co-ownership tags");
    Ok(resources)
}
