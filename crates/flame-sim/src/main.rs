//! flame-sim — drives the transfer engine and fragment directory through a
//! placement plan, then runs epochs of synthetic accesses, periodic hot
//! promotion and lease eviction.
//!
//! Usage: flame-sim [plan.json] [epochs]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use flame_core::{FlameConfig, FragmentFlags, FragmentKey, LeaseTime, NodeId};
use flame_services::{
    FragmentDirectory, MigrationController, MigrationOutcome, Move, PlacementPlan, Planner,
    TransferEngine,
};

mod access;
mod demo;

const DEFAULT_EPOCHS: LeaseTime = 20;
const EPOCH_TICK: Duration = Duration::from_millis(20);

const ACCESS_SEED: u64 = 0x5eed;
const TOUCHES_PER_EPOCH: usize = 8;
const PROMOTE_EVERY: LeaseTime = 5;
const HOT_TOP_K: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FlameConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FlameConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FlameConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let plan = match args.next() {
        Some(path) => {
            let path = PathBuf::from(path);
            tracing::info!(path = %path.display(), "loading placement plan");
            PlacementPlan::from_path(&path)
                .with_context(|| format!("failed to load plan {}", path.display()))?
        }
        None => {
            tracing::info!("no plan given, using built-in demo plan");
            demo::plan()
        }
    };
    let epochs: LeaseTime = match args.next() {
        Some(v) => v.parse().context("epochs must be an integer")?,
        None => DEFAULT_EPOCHS,
    };

    let engine = Arc::new(TransferEngine::start(&config.engine));
    let directory = FragmentDirectory::new();
    let controller = MigrationController::new(
        engine.clone(),
        directory.clone(),
        config.directory.clone(),
    );

    tokio::select! {
        r = run(&config, &plan, epochs, &controller) => r?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    engine.stop();
    tracing::info!("{}", engine.stats());
    tracing::debug!("\n{}", directory.dump());
    Ok(())
}

async fn run(
    config: &FlameConfig,
    plan: &PlacementPlan,
    epochs: LeaseTime,
    controller: &MigrationController,
) -> Result<()> {
    let directory = controller.directory();
    let home = config.directory.home_node;

    // Every fragment starts on the home node with a lease that runs out at
    // staggered epochs.
    for (ordinal, (key, fragment)) in plan.keyed_fragments().enumerate() {
        let size = u32::try_from(fragment.size)
            .with_context(|| format!("fragment {} too large", fragment.id))?;
        let lease = 1 + (ordinal as LeaseTime % config.directory.lease_epochs.max(1));
        controller.place(key, home, size, lease, FragmentFlags::NONE);
    }
    tracing::info!(fragments = directory.len(), home, "directory seeded");

    let placements = Planner::new(config.placement.clone()).plan(plan);
    let moves: Vec<Move> = placements
        .iter()
        .enumerate()
        .map(|(rank, p)| Move {
            key: p.key,
            dst: p.node,
            priority: config.placement.base_priority + rank as i32,
        })
        .collect();
    tracing::info!(placements = moves.len(), "placement plan ready");

    let results = controller.migrate_batch(&moves, 0).await;
    let moved = results
        .iter()
        .filter(|(_, r)| matches!(r, Ok(MigrationOutcome::Moved { .. })))
        .count();
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    tracing::info!(moved, failed, resident = results.len() - moved - failed, "initial placement done");

    // Hot fragments are promoted to the first non-home node in the plan.
    let hot_node: Option<NodeId> = plan.nodes.iter().map(|n| n.id).filter(|&id| id != home).min();
    let mut access = access::AccessModel::new(plan, ACCESS_SEED);
    let mut hot: Vec<FragmentKey> = Vec::new();

    let mut tick = tokio::time::interval(EPOCH_TICK);
    for epoch in 1..=epochs {
        tick.tick().await;

        for key in access.step(TOUCHES_PER_EPOCH) {
            controller.touch(key, epoch);
        }

        if let Some(dst) = hot_node.filter(|_| epoch % PROMOTE_EVERY == 0) {
            let top = access.hottest(HOT_TOP_K);
            for key in hot.iter().filter(|k| !top.contains(k)) {
                controller.set_hot(*key, false);
            }
            let promoted = controller
                .promote_hot(&top, dst, config.placement.base_priority, epoch)
                .await
                .iter()
                .filter(|(_, r)| matches!(r, Ok(MigrationOutcome::Moved { .. })))
                .count();
            tracing::info!(epoch, node = dst, hot = top.len(), promoted, "hot promotion");
            hot = top;
        }

        let evicted = controller.evict_expired(epoch).await;
        if !evicted.is_empty() {
            tracing::info!(
                epoch,
                evicted = evicted.len(),
                sample = ?&evicted[..evicted.len().min(3)],
                "lease eviction"
            );
        }
    }

    for node in plan.nodes.iter().map(|n| n.id) {
        tracing::info!(node, fragments = directory.scan_for_node(node).len(), "final residency");
    }
    tracing::info!("{}", controller.engine().stats());
    Ok(())
}
