//! Secondary Resource Binder
//!
//! Delivers public connectivity through separately allocated elastic
//! addresses on back-ends that work that way. Allocation and association can
//! both complete asynchronously; such calls hand back a task id which is
//! polled with bounded exponential backoff.
//!
//! Every allocation lands in the [`AddressLedger`] as soon as the back-end
//! returns it, before association is attempted, so rollback can release
//! addresses that never got bound.

use dashmap::DashMap;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use autok3s_common::retry::{poll_until, PollError, Probe};
use autok3s_common::{tags, Error, Result};

use crate::backend::TaskStatus;
use crate::{join_error, Session};

/// An allocated address and what it is bound to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressBinding {
    /// The public IP
    pub ip: String,
    /// Instance the address was associated with
    pub instance_id: Option<String>,
}

/// Elastic addresses allocated by the in-progress operation
#[derive(Debug, Default)]
pub struct AddressLedger {
    bindings: DashMap<String, AddressBinding>,
}

impl AddressLedger {
    /// Record a fresh allocation
    pub fn record(&self, allocation_id: impl Into<String>, ip: impl Into<String>) {
        self.bindings.insert(
            allocation_id.into(),
            AddressBinding {
                ip: ip.into(),
                instance_id: None,
            },
        );
    }

    /// Record a completed association
    pub fn bind(&self, allocation_id: &str, instance_id: impl Into<String>) {
        if let Some(mut binding) = self.bindings.get_mut(allocation_id) {
            binding.instance_id = Some(instance_id.into());
        }
    }

    /// Binding of one allocation
    pub fn get(&self, allocation_id: &str) -> Option<AddressBinding> {
        self.bindings.get(allocation_id).map(|b| b.value().clone())
    }

    /// Every allocation id, sorted
    pub fn allocation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bindings.iter().map(|b| b.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forget an allocation (after release)
    pub fn remove(&self, allocation_id: &str) {
        self.bindings.remove(allocation_id);
    }

    /// Number of tracked allocations
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no allocations are tracked
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Outcome of a best-effort release
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Allocations returned to the pool
    pub released: Vec<String>,
    /// Allocations that could not be released
    pub failed: Vec<String>,
}

/// Allocate and associate one elastic address per instance
///
/// A no-op unless the back-end delivers public connectivity through
/// secondary addresses and the cluster asks for them.
#[instrument(skip(session), fields(cluster = %session.ctx))]
pub async fn bind_secondary(session: &Session, instance_ids: &[String]) -> Result<()> {
    if instance_ids.is_empty()
        || !session.ctx.options.elastic_ip
        || !session.cloud.capabilities().secondary_addresses
    {
        return Ok(());
    }

    let wanted = instance_ids.len();
    let allocation = session
        .cloud
        .allocate_addresses(wanted, &tags::ownership_filter(&session.ctx))
        .await
        .map_err(|e| {
            Error::secondary(
                session.cluster(),
                format!("address allocation failed: {}", e),
                Vec::new(),
            )
        })?;

    for address in &allocation.addresses {
        session
            .addresses
            .record(&address.allocation_id, &address.ip);
    }
    let allocated: Vec<String> = allocation
        .addresses
        .iter()
        .map(|a| a.allocation_id.clone())
        .collect();

    if allocation.addresses.len() < wanted {
        return Err(Error::secondary(
            session.cluster(),
            format!(
                "requested {} address(es), back-end allocated {}",
                wanted,
                allocation.addresses.len()
            ),
            allocated,
        ));
    }
    if let Some(task) = &allocation.task {
        wait_task(session, task).await?;
    }

    // Extra addresses would never be associated; hand them back now
    if allocation.addresses.len() > wanted {
        let surplus: Vec<String> = allocated[wanted..].to_vec();
        warn!(wanted, surplus = surplus.len(), "Back-end allocated more addresses than requested");
        let outcome = release_addresses(session, &surplus).await;
        if !outcome.failed.is_empty() {
            return Err(Error::secondary(
                session.cluster(),
                "surplus addresses could not be released",
                outcome.failed,
            ));
        }
    }

    let mut workers = JoinSet::new();
    for (address, instance_id) in allocation.addresses.into_iter().zip(instance_ids.iter().cloned()) {
        let session = session.clone();
        workers.spawn(async move {
            let result = associate(&session, &address.allocation_id, &address.ip, &instance_id).await;
            (address.allocation_id, result)
        });
    }

    let mut failed = Vec::new();
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        let (allocation_id, result) = joined.map_err(|e| join_error(e, "binder"))?;
        if let Err(e) = result {
            warn!(allocation_id = %allocation_id, error = %e, "Address association failed");
            failed.push(allocation_id);
            first_error.get_or_insert(e);
        }
    }

    if let Some(e) = first_error {
        failed.sort();
        return Err(Error::secondary(
            session.cluster(),
            format!("address association failed: {}", e),
            failed,
        ));
    }

    info!(count = wanted, "Bound elastic addresses");
    Ok(())
}

async fn associate(session: &Session, allocation_id: &str, ip: &str, instance_id: &str) -> Result<()> {
    let task = session
        .cloud
        .associate_address(allocation_id, instance_id)
        .await?;
    if let Some(task) = task {
        wait_task(session, &task).await?;
    }

    session.addresses.bind(allocation_id, instance_id);
    session.table.update(instance_id, |record| {
        if !record.secondary_resource_ids.iter().any(|id| id == allocation_id) {
            record.secondary_resource_ids.push(allocation_id.to_string());
        }
        record.public_addresses = vec![ip.to_string()];
    });
    debug!(allocation_id, instance_id, ip, "Associated address");
    Ok(())
}

/// Wait for an asynchronous back-end task to finish
pub async fn wait_task(session: &Session, task_id: &str) -> Result<()> {
    let poll = session.config.task_poll.to_poll_config();
    let cloud = session.cloud.as_ref();

    let result = poll_until(&poll, "wait_task", move |_| async move {
        match cloud.describe_task(task_id).await {
            Ok(TaskStatus::Succeeded) => Ok(Probe::Ready(())),
            Ok(TaskStatus::Running) => Ok(Probe::Pending),
            Ok(TaskStatus::Failed(reason)) => Err(Error::secondary(
                session.cluster(),
                format!("task {} failed: {}", task_id, reason),
                Vec::new(),
            )),
            Err(e) if e.is_retryable() => Ok(Probe::Pending),
            Err(e) => Err(e),
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(PollError::Failed(e)) => Err(e),
        Err(PollError::Exhausted { attempts }) => Err(Error::secondary(
            session.cluster(),
            format!("task {} still running after {} attempt(s)", task_id, attempts),
            Vec::new(),
        )),
    }
}

/// Disassociate and release addresses, collecting failures
///
/// Never fails: a release error is logged and reported in the outcome.
pub async fn release_addresses(session: &Session, allocation_ids: &[String]) -> ReleaseOutcome {
    let releases = allocation_ids.iter().map(|allocation_id| async move {
        (allocation_id.clone(), release_one(session, allocation_id).await)
    });
    let results = futures::future::join_all(releases).await;

    let mut outcome = ReleaseOutcome::default();
    for (allocation_id, result) in results {
        match result {
            Ok(()) => {
                session.addresses.remove(&allocation_id);
                outcome.released.push(allocation_id);
            }
            Err(e) => {
                warn!(allocation_id = %allocation_id, error = %e, "Failed to release address");
                outcome.failed.push(allocation_id);
            }
        }
    }
    outcome
}

async fn release_one(session: &Session, allocation_id: &str) -> Result<()> {
    // An address that never got associated may reject disassociation
    match session.cloud.disassociate_address(allocation_id).await {
        Ok(Some(task)) => {
            if let Err(e) = wait_task(session, &task).await {
                debug!(allocation_id, error = %e, "Disassociation task did not complete");
            }
        }
        Ok(None) => {}
        Err(e) => debug!(allocation_id, error = %e, "Disassociation failed"),
    }

    if let Some(task) = session.cloud.release_address(allocation_id).await? {
        wait_task(session, &task).await?;
    }
    Ok(())
}
