//! Describe: rebuild a cluster's node set from cloud-side tags
//!
//! The cloud is the source of truth for which instances belong to a cluster.
//! Every instance carrying the cluster's ownership tags and not terminated
//! or shutting down is a member; its role comes from the `master` tag.

use tracing::{debug, info, instrument};

use autok3s_common::tags::{self, TAG_MASTER, TAG_NAME};
use autok3s_common::{Error, NodeRecord, Result, Role};

use crate::backend::{Cursor, InstanceDescription, InstanceQuery};
use crate::{retry_api, Session};

/// Whether a cluster has live instances on the back-end
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Existence {
    /// At least one live tagged instance exists
    pub exists: bool,
    /// Ids of the live tagged instances, sorted
    pub instance_ids: Vec<String>,
}

/// Collect every page of a describe call
///
/// Bounded by `max_describe_pages`; a back-end handing back the same cursor
/// twice is treated as broken rather than looped on.
pub async fn list_instances(
    session: &Session,
    query: &InstanceQuery,
) -> Result<Vec<InstanceDescription>> {
    let max_pages = session.config.max_describe_pages.max(1);
    let mut instances = Vec::new();
    let mut cursor: Option<Cursor> = None;

    for page in 1..=max_pages {
        let current = cursor.clone();
        let result = retry_api(&session.config, "describe_instances", || {
            session.cloud.describe_instances(query, current.clone())
        })
        .await?;

        debug!(page, count = result.instances.len(), "Fetched instance page");
        instances.extend(result.instances);

        match result.next {
            None => return Ok(instances),
            Some(next) if Some(&next) == cursor.as_ref() => {
                return Err(Error::provider_permanent(
                    session.cluster(),
                    session.provider(),
                    format!("describe returned the same cursor twice ({:?})", next),
                ));
            }
            Some(next) => cursor = Some(next),
        }
    }

    Err(Error::provider_permanent(
        session.cluster(),
        session.provider(),
        format!("describe did not finish within {} page(s)", max_pages),
    ))
}

/// Map a describe result onto a `Known` observation
///
/// The role is left unset so that merging the observation into an existing
/// record keeps that record's role.
pub(crate) fn observation(instance: InstanceDescription) -> NodeRecord {
    let mut record = NodeRecord {
        instance_id: instance.instance_id,
        status: instance.status,
        ..Default::default()
    };
    record.name = instance.tags.get(TAG_NAME).cloned();
    record.zone = instance.zone;
    record.internal_addresses = instance.internal_addresses;
    record.public_addresses = instance.public_addresses;
    record.secondary_resource_ids = instance.secondary_resource_ids;
    record
}

/// Live instances of the session's cluster, as reported by the back-end
async fn tagged_instances(session: &Session) -> Result<Vec<InstanceDescription>> {
    let filter = tags::ownership_filter(&session.ctx);
    let query = InstanceQuery::by_tags(filter.clone());
    let instances = list_instances(session, &query).await?;

    // Filtered again here: not every back-end honours tag or state filters
    Ok(instances
        .into_iter()
        .filter(|i| tags::matches_filter(&i.tags, &filter) && !i.status.is_gone())
        .collect())
}

/// Rebuild the node set of a cluster and merge it into the session's table
///
/// Discovered records are [`Tracking::Known`](autok3s_common::Tracking): they
/// are never rollback candidates, and merging never downgrades a record this
/// operation created.
#[instrument(skip(session), fields(cluster = %session.ctx))]
pub async fn describe(session: &Session) -> Result<Vec<NodeRecord>> {
    let instances = tagged_instances(session).await?;

    let mut ids = Vec::with_capacity(instances.len());
    for instance in instances {
        let role = Role::from_master_tag(instance.tags.get(TAG_MASTER).map(String::as_str));
        ids.push(instance.instance_id.clone());
        let mut record = observation(instance);
        record.role = Some(role);
        record.ssh_credential = Some(session.ctx.ssh.clone());
        session.table.upsert(record);
    }

    let mut records: Vec<NodeRecord> =
        ids.iter().filter_map(|id| session.table.get(id)).collect();
    records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    info!(
        masters = records.iter().filter(|r| r.role == Some(Role::Master)).count(),
        workers = records.iter().filter(|r| r.role == Some(Role::Worker)).count(),
        "Described cluster"
    );
    Ok(records)
}

/// Whether the cluster has live tagged instances
pub async fn exists(session: &Session) -> Result<Existence> {
    let mut instance_ids: Vec<String> = tagged_instances(session)
        .await?
        .into_iter()
        .map(|i| i.instance_id)
        .collect();
    instance_ids.sort();
    Ok(Existence {
        exists: !instance_ids.is_empty(),
        instance_ids,
    })
}
