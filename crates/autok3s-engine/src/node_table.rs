//! Node State Table
//!
//! The single mutable source of truth for which instances belong to the
//! in-progress operation. Launcher, poller, binder and rollback workers all
//! write to it concurrently, so every write is a merge applied under the
//! entry's shard lock: a reader never observes a half-written record, and a
//! stale observation never erases fields another worker just wrote.

use dashmap::DashMap;

use autok3s_common::{NodeRecord, Role, Tracking};

/// Concurrent table of node records keyed by instance id
#[derive(Debug, Default)]
pub struct NodeTable {
    records: DashMap<String, NodeRecord>,
}

impl NodeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, or merge it into the existing one
    ///
    /// See [`NodeRecord::merge`] for the merge rules.
    pub fn upsert(&self, record: NodeRecord) {
        match self.records.entry(record.instance_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                existing.get_mut().merge(record);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
    }

    /// Apply `f` to a record in place; returns false if absent
    pub fn update<F>(&self, instance_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut NodeRecord),
    {
        match self.records.get_mut(instance_id) {
            Some(mut record) => {
                f(record.value_mut());
                true
            }
            None => false,
        }
    }

    /// Clone of a single record
    pub fn get(&self, instance_id: &str) -> Option<NodeRecord> {
        self.records.get(instance_id).map(|r| r.value().clone())
    }

    /// Whether a record exists
    pub fn contains(&self, instance_id: &str) -> bool {
        self.records.contains_key(instance_id)
    }

    /// Remove a record, returning it
    pub fn remove(&self, instance_id: &str) -> Option<NodeRecord> {
        self.records.remove(instance_id).map(|(_, r)| r)
    }

    /// Visit a snapshot of every record
    ///
    /// The visitor runs without holding any table lock, so it may call
    /// [`upsert`](Self::upsert) or [`update`](Self::update). Iteration order
    /// is unspecified.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&NodeRecord),
    {
        for record in self.records() {
            visitor(&record);
        }
    }

    /// Snapshot of every record, sorted by instance id
    pub fn records(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        records
    }

    /// Ids of records matching a predicate, sorted
    pub fn ids_where<P>(&self, predicate: P) -> Vec<String>
    where
        P: Fn(&NodeRecord) -> bool,
    {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Ids created by the in-progress operation
    pub fn current_ids(&self) -> Vec<String> {
        self.ids_where(NodeRecord::is_current)
    }

    /// Ids that rollback may destroy
    pub fn rollback_ids(&self) -> Vec<String> {
        self.ids_where(NodeRecord::is_rollback_eligible)
    }

    /// Ids with the given role
    pub fn ids_by_role(&self, role: Role) -> Vec<String> {
        self.ids_where(|r| r.role == Some(role))
    }

    /// Mark every current record for teardown; returns the marked ids
    ///
    /// Known records are untouched.
    pub fn mark_pending_rollback(&self) -> Vec<String> {
        let mut marked = Vec::new();
        for mut record in self.records.iter_mut() {
            if record.is_current() {
                record.tracking = Tracking::PendingRollback;
                marked.push(record.key().clone());
            }
        }
        marked.sort();
        marked
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
