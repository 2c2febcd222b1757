//! Fragment addressing and placement records.
//!
//! A fragment is a sub-page slice of a virtual page that is placed and
//! migrated independently. The directory maps each `FragmentKey` to the
//! `FragmentMapping` most recently installed for it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transfer::NodeId;

/// Simulated lease clock. Callers pick the unit (epochs, ticks, ms).
pub type LeaseTime = i64;

/// (virtual page number, sub-page fragment index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentKey {
    pub vpn: u64,
    pub index: u16,
}

impl FragmentKey {
    pub const fn new(vpn: u64, index: u16) -> Self {
        Self { vpn, index }
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VPN={:#x} idx={}", self.vpn, self.index)
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Placement hint bitfield carried on a mapping.
///
/// Bits 0-2 are defined below; the remaining bits are free for callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentFlags(pub u32);

impl FragmentFlags {
    pub const NONE: Self = Self(0);
    /// Recently and frequently accessed.
    pub const HOT: Self = Self(1 << 0);
    pub const WRITE_HEAVY: Self = Self(1 << 1);
    /// Pinned by the placement layer; not a candidate for eviction.
    pub const RESERVED: Self = Self(1 << 2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for FragmentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ── Mapping ───────────────────────────────────────────────────────────────────

/// Current placement of one fragment. Always replaced as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMapping {
    pub node: NodeId,
    /// Simulated physical address (or any unique location id).
    pub phys_addr: u64,
    pub size: u32,
    pub replica: bool,
    pub lease_ends: LeaseTime,
    pub flags: FragmentFlags,
}

impl FragmentMapping {
    pub fn new(node: NodeId, phys_addr: u64, size: u32) -> Self {
        Self {
            node,
            phys_addr,
            size,
            ..Self::default()
        }
    }

    pub fn with_lease(mut self, lease_ends: LeaseTime) -> Self {
        self.lease_ends = lease_ends;
        self
    }

    pub fn with_flags(mut self, flags: FragmentFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn replicated(mut self) -> Self {
        self.replica = true;
        self
    }

    pub fn lease_expired(&self, now: LeaseTime) -> bool {
        self.lease_ends <= now
    }
}

impl fmt::Display for FragmentMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node={} pa={:#x} size={} replica={} lease={} flags={:#x}",
            self.node,
            self.phys_addr,
            self.size,
            self.replica,
            self.lease_ends,
            self.flags.bits()
        )
    }
}
