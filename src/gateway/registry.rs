//! Node registry: the single owner and writer of merged node state.

use super::node::{NodeId, NodeRecord, NodeRef, NodeUpdate};
use chrono::{DateTime, Utc};
use log::trace;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RegistryInner {
    nodes: BTreeMap<NodeId, NodeRecord>,
    // short names and user ids, lowercased, pointing at the node that last announced them
    aliases: HashMap<String, NodeId>,
}

/// Maps node ids to merged records. All mutation happens under one lock so a merge
/// is atomic as a whole; callers only ever receive cloned snapshots.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: Mutex<RegistryInner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Canonicalize a node reference. Names already announced as a short name or
    /// user id resolve to that node, even when they would also parse as an
    /// address (short names like `1234`); other names must be an address form.
    pub fn resolve(&self, node: &NodeRef) -> Option<NodeId> {
        match node {
            NodeRef::Num(n) => Some(NodeId(*n)),
            NodeRef::Name(name) => {
                let known = self.lock().aliases.get(&name.trim().to_lowercase()).copied();
                known.or_else(|| NodeId::parse(name))
            }
        }
    }

    /// Merge `update` into the record for `id`, creating it on first sighting.
    ///
    /// Returns the full resulting record when at least one field changed. An empty
    /// update is a no-op and does not create a record.
    pub fn merge(&self, id: NodeId, update: &NodeUpdate) -> Option<NodeRecord> {
        self.merge_at(id, update, Utc::now())
    }

    pub fn merge_at(
        &self,
        id: NodeId,
        update: &NodeUpdate,
        now: DateTime<Utc>,
    ) -> Option<NodeRecord> {
        if update.is_empty() {
            return None;
        }
        let mut guard = self.lock();
        let RegistryInner { nodes, aliases } = &mut *guard;
        let record = nodes
            .entry(id)
            .or_insert_with(|| NodeRecord::new(id, now));
        let changed = record.apply(update, now);
        if let Some(user) = &record.user {
            for alias in [user.short_name.as_deref(), user.id.as_deref()]
                .into_iter()
                .flatten()
            {
                let key = alias.trim().to_lowercase();
                if !key.is_empty() {
                    aliases.insert(key, id);
                }
            }
        }
        trace!("merge into {} changed={}", id, changed);
        changed.then(|| record.clone())
    }

    pub fn get(&self, id: NodeId) -> Option<NodeRecord> {
        self.lock().nodes.get(&id).cloned()
    }

    /// Point-in-time copy of every record, ordered by node number.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.lock().nodes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
