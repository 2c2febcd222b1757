//! Built-in plan used when no plan file is given.

use flame_core::NodeId;
use flame_services::placement::{FragmentSpec, NodeSpec, PlacementPlan};

pub const N_FRAGMENTS: usize = 64;
pub const FRAG_SIZE: u64 = 4096;
pub const N_NODES: NodeId = 4;

/// 64 fragments of 4 KiB with a spread of importance/reuse, and four nodes
/// with room for a handful of fragments each. Deterministic.
pub fn plan() -> PlacementPlan {
    let fragments = (0..N_FRAGMENTS)
        .map(|i| FragmentSpec {
            id: format!("f{i:04}"),
            size: FRAG_SIZE,
            importance: ((i * 37) % 100) as f64 / 100.0,
            reuse: ((i * 13) % 5) as f64,
            timescale: Some(if i % 3 == 0 { "long" } else { "short" }.to_string()),
            vpn: None,
            index: None,
        })
        .collect();

    let nodes = (0..N_NODES)
        .map(|id| NodeSpec {
            id,
            hbm_budget: 8 * FRAG_SIZE * 2,
            tlb_budget: 0,
            pred_interference: f64::from(id) * 0.25,
        })
        .collect();

    PlacementPlan { fragments, nodes }
}
