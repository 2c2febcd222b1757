//! Fragment directory — where every tracked fragment currently lives.
//!
//! The directory is the store of record, not an authority: whoever installs
//! a mapping owns its contents. `install` is last-writer-wins with no lease
//! check; `install_checked` is the guarded variant for callers that want the
//! directory to refuse clobbering another node's unexpired lease.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use flame_core::{FragmentKey, FragmentMapping, LeaseTime, NodeId};

/// Returned by `install_checked` when a live lease is held by another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{key} is leased to node {holder} until {lease_ends}")]
pub struct LeaseConflict {
    pub key: FragmentKey,
    pub holder: NodeId,
    pub lease_ends: LeaseTime,
}

/// Concurrency-safe fragment → placement map. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct FragmentDirectory {
    entries: Arc<DashMap<FragmentKey, FragmentMapping>>,
}

impl FragmentDirectory {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn lookup(&self, key: &FragmentKey) -> Option<FragmentMapping> {
        self.entries.get(key).map(|m| *m)
    }

    /// Insert or wholly replace the mapping for `key`.
    pub fn install(&self, key: FragmentKey, mapping: FragmentMapping) {
        if let Some(previous) = self.entries.insert(key, mapping) {
            tracing::trace!(%key, from = previous.node, to = mapping.node, "mapping replaced");
        } else {
            tracing::trace!(%key, node = mapping.node, "mapping installed");
        }
    }

    /// Like `install`, but refuses to replace a mapping whose lease is still
    /// live at `now` and belongs to a different node. Returns the replaced
    /// mapping, if any.
    pub fn install_checked(
        &self,
        key: FragmentKey,
        mapping: FragmentMapping,
        now: LeaseTime,
    ) -> Result<Option<FragmentMapping>, LeaseConflict> {
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current.node != mapping.node && !current.lease_expired(now) {
                    tracing::debug!(%key, holder = current.node, lease_ends = current.lease_ends, "install refused, lease held");
                    return Err(LeaseConflict {
                        key,
                        holder: current.node,
                        lease_ends: current.lease_ends,
                    });
                }
                Ok(Some(entry.insert(mapping)))
            }
            Entry::Vacant(entry) => {
                entry.insert(mapping);
                Ok(None)
            }
        }
    }

    /// Edit the mapping for `key` in place under its shard lock, so no
    /// concurrent install can interleave. Returns the updated mapping, or
    /// `None` if the key is absent.
    pub fn update<F>(&self, key: &FragmentKey, edit: F) -> Option<FragmentMapping>
    where
        F: FnOnce(&mut FragmentMapping),
    {
        let mut entry = self.entries.get_mut(key)?;
        edit(entry.value_mut());
        Some(*entry.value())
    }

    /// Delete the mapping for `key`. Absent keys are ignored.
    pub fn remove(&self, key: &FragmentKey) -> Option<FragmentMapping> {
        self.entries.remove(key).map(|(_, m)| m)
    }

    /// Every mapping currently owned by `node`.
    ///
    /// The result is a copy; it may be stale as soon as it is returned.
    pub fn scan_for_node(&self, node: NodeId) -> HashMap<FragmentKey, FragmentMapping> {
        self.entries
            .iter()
            .filter(|e| e.value().node == node)
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    /// Mappings whose lease has run out at `now`, ordered by key.
    pub fn expired_leases(&self, now: LeaseTime) -> Vec<(FragmentKey, FragmentMapping)> {
        let mut expired: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.value().lease_expired(now))
            .map(|e| (*e.key(), *e.value()))
            .collect();
        expired.sort_by_key(|(key, _)| *key);
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Human-readable snapshot for logs. Sorted by key for readability only.
    pub fn dump(&self) -> String {
        let mut rows: Vec<(FragmentKey, FragmentMapping)> =
            self.entries.iter().map(|e| (*e.key(), *e.value())).collect();
        rows.sort_by_key(|(key, _)| *key);

        let mut out = format!("FragmentDirectory Dump ({} entries):\n", rows.len());
        for (key, mapping) in rows {
            let _ = writeln!(out, "{key} -> {mapping}");
        }
        out
    }
}
