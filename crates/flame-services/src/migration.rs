//! Migration controller — moves fragments through the transfer engine and
//! records the result in the directory.
//!
//! The engine and the directory know nothing about each other. This is the
//! glue an external placement layer would write: look the fragment up,
//! transfer it, then install the new placement once the transfer completes.
//! Concurrent migrations of the same fragment race; the last install wins.

use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use flame_core::config::DirectorySettings;
use flame_core::{
    FragmentFlags, FragmentKey, FragmentMapping, LeaseTime, NodeId, Priority, TransferError,
    TransferRequest,
};

use crate::directory::FragmentDirectory;
use crate::engine::{CompletionHandle, TransferEngine};

/// Evictions yield to every placement-driven migration.
pub const EVICTION_PRIORITY: Priority = 1_000;

/// Each node's simulated address space starts at `node << NODE_ADDR_SHIFT`.
const NODE_ADDR_SHIFT: u32 = 40;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("fragment {0} is not in the directory")]
    UnknownFragment(FragmentKey),
    #[error("transfer of {key} failed: {source}")]
    Transfer {
        key: FragmentKey,
        #[source]
        source: TransferError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Fragment was already on the destination; nothing transferred.
    AlreadyResident(FragmentMapping),
    Moved {
        from: NodeId,
        mapping: FragmentMapping,
    },
}

/// One requested move.
#[derive(Debug, Clone, Copy)]
pub struct Move {
    pub key: FragmentKey,
    pub dst: NodeId,
    pub priority: Priority,
}

struct InFlight {
    key: FragmentKey,
    from: FragmentMapping,
    dst: NodeId,
    handle: CompletionHandle,
}

enum Started {
    InFlight(InFlight),
    Resident(FragmentMapping),
}

pub struct MigrationController {
    engine: Arc<TransferEngine>,
    directory: FragmentDirectory,
    settings: DirectorySettings,
    /// Bound on each transfer wait. `None` waits indefinitely.
    wait_timeout: Option<Duration>,
    seq: AtomicU64,
    next_addr: DashMap<NodeId, u64>,
}

impl MigrationController {
    pub fn new(
        engine: Arc<TransferEngine>,
        directory: FragmentDirectory,
        settings: DirectorySettings,
    ) -> Self {
        Self {
            engine,
            directory,
            settings,
            wait_timeout: None,
            seq: AtomicU64::new(0),
            next_addr: DashMap::new(),
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    pub fn directory(&self) -> &FragmentDirectory {
        &self.directory
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    fn next_id(&self, src: NodeId, dst: NodeId) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("tx-{src}-{dst}-{seq}")
    }

    /// Bump-allocate a simulated address on `node`.
    ///
    /// A node's allocator starts past every mapping the directory already
    /// holds for it, so fragments installed before the controller existed
    /// are never overlapped.
    fn allocate(&self, node: NodeId, size: u32) -> u64 {
        let mut next = self
            .next_addr
            .entry(node)
            .or_insert_with(|| self.first_free(node));
        let addr = *next;
        *next = next.saturating_add(u64::from(size.max(1)));
        addr
    }

    fn first_free(&self, node: NodeId) -> u64 {
        self.directory
            .scan_for_node(node)
            .values()
            .map(|m| m.phys_addr.saturating_add(u64::from(m.size.max(1))))
            .fold(u64::from(node) << NODE_ADDR_SHIFT, u64::max)
    }

    /// Install a new fragment on `node` at a freshly allocated address.
    pub fn place(
        &self,
        key: FragmentKey,
        node: NodeId,
        size: u32,
        lease_ends: LeaseTime,
        flags: FragmentFlags,
    ) -> FragmentMapping {
        let mapping = FragmentMapping::new(node, self.allocate(node, size), size)
            .with_lease(lease_ends)
            .with_flags(flags);
        self.directory.install(key, mapping);
        mapping
    }

    /// Record an access: the lease runs until at least `now + renew_epochs`.
    /// Never shortens a lease. `None` if the fragment is unknown.
    pub fn touch(&self, key: FragmentKey, now: LeaseTime) -> Option<FragmentMapping> {
        let until = now.saturating_add(self.settings.renew_epochs);
        self.directory
            .update(&key, |m| m.lease_ends = m.lease_ends.max(until))
    }

    /// Set or clear the HOT flag. Hot fragments are never lease-evicted.
    pub fn set_hot(&self, key: FragmentKey, hot: bool) -> Option<FragmentMapping> {
        self.directory.update(&key, |m| {
            m.flags = if hot {
                m.flags | FragmentFlags::HOT
            } else {
                m.flags.difference(FragmentFlags::HOT)
            };
        })
    }

    /// Mark each fragment HOT and move it to `dst`. Results follow `keys` order.
    pub async fn promote_hot(
        &self,
        keys: &[FragmentKey],
        dst: NodeId,
        priority: Priority,
        now: LeaseTime,
    ) -> Vec<(FragmentKey, Result<MigrationOutcome, MigrationError>)> {
        let moves: Vec<Move> = keys
            .iter()
            .map(|&key| {
                self.set_hot(key, true);
                Move { key, dst, priority }
            })
            .collect();
        self.migrate_batch(&moves, now).await
    }

    async fn wait(&self, handle: CompletionHandle) -> Result<(), TransferError> {
        match self.wait_timeout {
            Some(timeout) => tokio::time::timeout(timeout, handle.wait())
                .await
                .unwrap_or(Err(TransferError::DeadlineExceeded)),
            None => handle.wait().await,
        }
    }

    /// Transfer `size_bytes` from `src` to `dst` and wait for it.
    pub async fn request_fragment_transfer(
        &self,
        src: NodeId,
        dst: NodeId,
        size_bytes: u64,
        priority: Priority,
        meta: impl Into<String>,
    ) -> Result<(), TransferError> {
        let request = TransferRequest::new(self.next_id(src, dst), src, dst)
            .with_size(size_bytes)
            .with_priority(priority)
            .with_meta(meta);
        match self.wait_timeout {
            Some(timeout) => self.engine.submit_and_wait_timeout(request, timeout).await,
            None => self.engine.submit_and_wait(request, future::pending()).await,
        }
    }

    /// Submit the transfer for one move, unless the fragment is already there.
    fn begin(&self, mv: Move) -> Result<Started, MigrationError> {
        let from = self
            .directory
            .lookup(&mv.key)
            .ok_or(MigrationError::UnknownFragment(mv.key))?;
        if from.node == mv.dst {
            return Ok(Started::Resident(from));
        }

        let request = TransferRequest::new(self.next_id(from.node, mv.dst), from.node, mv.dst)
            .with_size(u64::from(from.size))
            .with_priority(mv.priority)
            .with_meta(mv.key.to_string());
        let handle = self
            .engine
            .submit(request)
            .map_err(|source| MigrationError::Transfer { key: mv.key, source })?;

        Ok(Started::InFlight(InFlight {
            key: mv.key,
            from,
            dst: mv.dst,
            handle,
        }))
    }

    /// Wait for a submitted move and install its new placement.
    async fn finish(
        &self,
        inflight: InFlight,
        now: LeaseTime,
    ) -> Result<MigrationOutcome, MigrationError> {
        let InFlight {
            key,
            from,
            dst,
            handle,
        } = inflight;
        self.wait(handle)
            .await
            .map_err(|source| MigrationError::Transfer { key, source })?;

        let mapping = FragmentMapping {
            node: dst,
            phys_addr: self.allocate(dst, from.size),
            size: from.size,
            replica: false,
            lease_ends: now.saturating_add(self.settings.lease_epochs),
            flags: from.flags,
        };
        self.directory.install(key, mapping);
        tracing::info!(%key, from = from.node, to = dst, "fragment migrated");

        Ok(MigrationOutcome::Moved {
            from: from.node,
            mapping,
        })
    }

    /// Move one fragment to `dst` and update the directory.
    pub async fn migrate(
        &self,
        key: FragmentKey,
        dst: NodeId,
        priority: Priority,
        now: LeaseTime,
    ) -> Result<MigrationOutcome, MigrationError> {
        match self.begin(Move { key, dst, priority })? {
            Started::InFlight(inflight) => self.finish(inflight, now).await,
            Started::Resident(resident) => Ok(MigrationOutcome::AlreadyResident(resident)),
        }
    }

    /// Submit every move up front so the engine orders them by priority,
    /// then wait for each and update the directory. Results follow `moves` order.
    pub async fn migrate_batch(
        &self,
        moves: &[Move],
        now: LeaseTime,
    ) -> Vec<(FragmentKey, Result<MigrationOutcome, MigrationError>)> {
        let started: Vec<_> = moves.iter().map(|mv| (mv.key, self.begin(*mv))).collect();

        let mut results = Vec::with_capacity(started.len());
        for (key, begun) in started {
            let result = match begun {
                Ok(Started::InFlight(inflight)) => self.finish(inflight, now).await,
                Ok(Started::Resident(resident)) => Ok(MigrationOutcome::AlreadyResident(resident)),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::warn!(%key, error = %e, "migration failed");
            }
            results.push((key, result));
        }
        results
    }

    /// Send expired, cold, unpinned fragments back to the home node.
    /// Returns the keys that were moved.
    pub async fn evict_expired(&self, now: LeaseTime) -> Vec<FragmentKey> {
        let home = self.settings.home_node;
        let moves: Vec<Move> = self
            .directory
            .expired_leases(now)
            .into_iter()
            .filter(|(_, m)| {
                m.node != home
                    && !m.flags.contains(FragmentFlags::HOT)
                    && !m.flags.contains(FragmentFlags::RESERVED)
            })
            .map(|(key, _)| Move {
                key,
                dst: home,
                priority: EVICTION_PRIORITY,
            })
            .collect();

        if moves.is_empty() {
            return Vec::new();
        }

        let evicted: Vec<FragmentKey> = self
            .migrate_batch(&moves, now)
            .await
            .into_iter()
            .filter_map(|(key, r)| matches!(r, Ok(MigrationOutcome::Moved { .. })).then_some(key))
            .collect();
        tracing::info!(now, evicted = evicted.len(), home, "lease eviction pass");
        evicted
    }
}
