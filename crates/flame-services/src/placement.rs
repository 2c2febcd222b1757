//! Placement planner — greedy utility-per-cost placement under node budgets.
//!
//! Input is a JSON plan:
//!
//! ```json
//! {
//!   "fragments": [ {"id":"f0001","size":4096,"importance":0.9,"reuse":3,"timescale":"short"} ],
//!   "nodes":     [ {"id":0,"hbm_budget":8589934592,"tlb_budget":262144} ]
//! }
//! ```
//!
//! For every fragment/node pair the planner scores
//!   utility = max(0, w_r * reuse + w_i * importance - w_c * interference)
//!   cost    = size + ceil(size / 4096) * 4096 * 0.1
//! and takes candidates in descending `utility / cost`, placing each fragment
//! at most once and only while the node's HBM (and TLB, when bounded) budget
//! covers it.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use flame_core::config::PlacementSettings;
use flame_core::{FragmentKey, NodeId};

/// One TLB entry covers a 4 KiB page.
pub const TLB_PAGE: u64 = 4096;

/// Fraction of a page's bytes charged as TLB pressure.
const TLB_PRESSURE: f64 = 0.1;

/// Fragments without an explicit address are laid out from this VPN.
pub const DEFAULT_BASE_VPN: u64 = 0x1000;

/// Implicit layout packs this many fragments into one virtual page.
pub const FRAGMENTS_PER_PAGE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("failed to parse plan: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("fragment id {0} appears more than once")]
    DuplicateFragment(String),
    #[error("node id {0} appears more than once")]
    DuplicateNode(NodeId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentSpec {
    pub id: String,
    pub size: u64,
    #[serde(default)]
    pub importance: f64,
    #[serde(default)]
    pub reuse: f64,
    /// Informational ("short", "long", ...). Not scored.
    #[serde(default)]
    pub timescale: Option<String>,
    /// Explicit directory address. Both must be set to take effect.
    #[serde(default)]
    pub vpn: Option<u64>,
    #[serde(default)]
    pub index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub hbm_budget: u64,
    /// 0 = unbounded.
    #[serde(default)]
    pub tlb_budget: u64,
    #[serde(default)]
    pub pred_interference: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub fragments: Vec<FragmentSpec>,
    pub nodes: Vec<NodeSpec>,
}

impl PlacementPlan {
    pub fn from_path(path: &Path) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PlanError::Read(path.to_path_buf(), e))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, PlanError> {
        let plan: Self = serde_json::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let mut ids = HashSet::new();
        for f in &self.fragments {
            if !ids.insert(f.id.as_str()) {
                return Err(PlanError::DuplicateFragment(f.id.clone()));
            }
        }
        let mut nodes = HashSet::new();
        for n in &self.nodes {
            if !nodes.insert(n.id) {
                return Err(PlanError::DuplicateNode(n.id));
            }
        }
        Ok(())
    }

    /// Directory key for the fragment at position `ordinal`.
    pub fn key_for(&self, ordinal: usize) -> Option<FragmentKey> {
        let f = self.fragments.get(ordinal)?;
        Some(match (f.vpn, f.index) {
            (Some(vpn), Some(index)) => FragmentKey::new(vpn, index),
            _ => FragmentKey::new(
                DEFAULT_BASE_VPN + (ordinal / FRAGMENTS_PER_PAGE) as u64,
                (ordinal % FRAGMENTS_PER_PAGE) as u16,
            ),
        })
    }

    /// Fragments paired with their directory keys, in plan order.
    pub fn keyed_fragments(&self) -> impl Iterator<Item = (FragmentKey, &FragmentSpec)> + '_ {
        self.fragments
            .iter()
            .enumerate()
            .filter_map(|(i, f)| self.key_for(i).map(|key| (key, f)))
    }
}

/// A fragment chosen for a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub fragment_id: String,
    pub key: FragmentKey,
    pub node: NodeId,
    pub size: u64,
    pub utility: f64,
    pub cost: f64,
    pub rho: f64,
}

/// TLB entries needed to map `size_bytes`.
pub fn tlb_units(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(TLB_PAGE)
}

/// Placement cost in pseudo-bytes: payload plus TLB pressure.
pub fn cost(size_bytes: u64) -> f64 {
    size_bytes as f64 + (tlb_units(size_bytes) * TLB_PAGE) as f64 * TLB_PRESSURE
}

pub struct Planner {
    weights: PlacementSettings,
}

struct Candidate<'a> {
    rho: f64,
    utility: f64,
    cost: f64,
    ordinal: usize,
    fragment: &'a FragmentSpec,
    node: &'a NodeSpec,
}

impl Planner {
    pub fn new(weights: PlacementSettings) -> Self {
        Self { weights }
    }

    pub fn utility(&self, fragment: &FragmentSpec, node: &NodeSpec) -> f64 {
        let w = &self.weights;
        let ub = w.reuse_weight * fragment.reuse + w.importance_weight * fragment.importance
            - w.interference_weight * node.pred_interference;
        ub.max(0.0)
    }

    /// Greedy placement, best `utility / cost` first. Deterministic: ties
    /// fall back to fragment id, then node id.
    pub fn plan(&self, plan: &PlacementPlan) -> Vec<Placement> {
        let mut candidates = Vec::with_capacity(plan.fragments.len() * plan.nodes.len());
        for (ordinal, fragment) in plan.fragments.iter().enumerate() {
            for node in &plan.nodes {
                let cost = cost(fragment.size);
                if cost <= 0.0 {
                    continue;
                }
                let utility = self.utility(fragment, node);
                candidates.push(Candidate {
                    rho: utility / cost,
                    utility,
                    cost,
                    ordinal,
                    fragment,
                    node,
                });
            }
        }
        candidates.sort_by(|a, b| {
            b.rho
                .total_cmp(&a.rho)
                .then_with(|| a.fragment.id.cmp(&b.fragment.id))
                .then_with(|| a.node.id.cmp(&b.node.id))
        });

        let mut hbm_left: HashMap<NodeId, f64> =
            plan.nodes.iter().map(|n| (n.id, n.hbm_budget as f64)).collect();
        let mut tlb_left: HashMap<NodeId, u64> =
            plan.nodes.iter().map(|n| (n.id, n.tlb_budget)).collect();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut placements = Vec::new();

        for c in candidates {
            if placed.contains(c.fragment.id.as_str()) {
                continue;
            }
            let hbm = hbm_left.get(&c.node.id).copied().unwrap_or(0.0);
            if hbm < c.cost {
                continue;
            }
            let units = tlb_units(c.fragment.size);
            if c.node.tlb_budget > 0 && tlb_left.get(&c.node.id).copied().unwrap_or(0) < units {
                continue;
            }

            hbm_left.insert(c.node.id, hbm - c.cost);
            if c.node.tlb_budget > 0 {
                if let Some(left) = tlb_left.get_mut(&c.node.id) {
                    *left -= units;
                }
            }
            placed.insert(c.fragment.id.as_str());

            let Some(key) = plan.key_for(c.ordinal) else {
                continue;
            };
            placements.push(Placement {
                fragment_id: c.fragment.id.clone(),
                key,
                node: c.node.id,
                size: c.fragment.size,
                utility: c.utility,
                cost: c.cost,
                rho: c.rho,
            });
        }

        tracing::debug!(
            fragments = plan.fragments.len(),
            nodes = plan.nodes.len(),
            placed = placements.len(),
            "placement plan computed"
        );
        placements
    }
}
