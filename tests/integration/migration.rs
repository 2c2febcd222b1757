use std::time::Duration;

use anyhow::Result;
use flame_core::config::{DirectorySettings, PlacementSettings};
use flame_core::{FragmentFlags, FragmentKey, FragmentMapping, TransferError};
use flame_services::{
    FragmentDirectory, MigrationController, MigrationError, MigrationOutcome, Move,
    PlacementPlan, Planner, TransferEvent,
};

use crate::*;

const PLAN: &str = r#"{
    "fragments": [
        {"id":"f0000","size":4096,"importance":0.9,"reuse":4,"timescale":"short"},
        {"id":"f0001","size":4096,"importance":0.2,"reuse":1,"timescale":"long"},
        {"id":"f0002","size":2048,"importance":0.7,"reuse":3},
        {"id":"f0003","size":8192,"importance":0.1,"reuse":0}
    ],
    "nodes": [
        {"id":0,"hbm_budget":0},
        {"id":1,"hbm_budget":10000,"pred_interference":0.5},
        {"id":2,"hbm_budget":6000}
    ]
}"#;

fn seed(dir: &FragmentDirectory, plan: &PlacementPlan) {
    for (key, f) in plan.keyed_fragments() {
        let addr = key.vpn << 8 | u64::from(key.index);
        dir.install(key, FragmentMapping::new(0, addr, f.size as u32).with_lease(1));
    }
}

#[tokio::test]
async fn test_plan_migrate_and_directory_agree() -> Result<()> {
    let plan = PlacementPlan::from_json_str(PLAN)?;
    let placements = Planner::new(PlacementSettings::default()).plan(&plan);
    assert!(!placements.is_empty());

    let dir = FragmentDirectory::new();
    seed(&dir, &plan);
    let ctl = MigrationController::new(fast_engine(), dir.clone(), DirectorySettings::default())
        .with_wait_timeout(WAIT);

    let moves: Vec<Move> = placements
        .iter()
        .enumerate()
        .map(|(rank, p)| Move { key: p.key, dst: p.node, priority: rank as i32 })
        .collect();
    let results = ctl.migrate_batch(&moves, 0).await;
    assert_eq!(results.len(), moves.len());

    for (p, (key, result)) in placements.iter().zip(&results) {
        assert_eq!(*key, p.key);
        match result {
            Ok(MigrationOutcome::Moved { from, mapping }) => {
                assert_eq!(*from, 0);
                assert_eq!(mapping.node, p.node);
                assert_eq!(u64::from(mapping.size), p.size);
            }
            other => panic!("{key}: unexpected {other:?}"),
        }
        assert_eq!(dir.lookup(key).map(|m| m.node), Some(p.node));
    }

    let placed_on = |node| placements.iter().filter(|p| p.node == node).count();
    assert_eq!(dir.scan_for_node(1).len(), placed_on(1));
    assert_eq!(dir.scan_for_node(2).len(), placed_on(2));
    assert_eq!(
        dir.scan_for_node(0).len(),
        plan.fragments.len() - placements.len()
    );
    Ok(())
}

#[tokio::test]
async fn test_batch_dispatches_in_priority_order() -> Result<()> {
    let engine = fast_engine();
    let mut events = engine.subscribe();
    let dir = FragmentDirectory::new();
    let keys: Vec<FragmentKey> = (0..4).map(|i| FragmentKey::new(0x2000, i)).collect();
    for key in &keys {
        dir.install(*key, FragmentMapping::new(0, 0, 256));
    }
    let ctl = MigrationController::new(engine, dir.clone(), DirectorySettings::default());

    // Listed in one order, prioritized in the reverse.
    let moves: Vec<Move> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| Move { key: *key, dst: 1, priority: 10 - i as i32 })
        .collect();
    let results = ctl.migrate_batch(&moves, 0).await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    // Migration ids are tx-{src}-{dst}-{seq}, seq in submission order.
    let order = dispatch_order(&mut events, 4).await?;
    assert_eq!(order, ["tx-0-1-3", "tx-0-1-2", "tx-0-1-1", "tx-0-1-0"]);
    Ok(())
}

#[tokio::test]
async fn test_lease_eviction_returns_cold_fragments_home() -> Result<()> {
    let dir = FragmentDirectory::new();
    let settings = DirectorySettings {
        lease_epochs: 3,
        home_node: 0,
        ..DirectorySettings::default()
    };
    let ctl = MigrationController::new(fast_engine(), dir.clone(), settings);

    let cold = FragmentKey::new(0x3000, 0);
    let hot = FragmentKey::new(0x3000, 1);
    dir.install(cold, FragmentMapping::new(0, 0, 4096));
    dir.install(hot, FragmentMapping::new(0, 0, 4096).with_flags(FragmentFlags::HOT));

    ctl.migrate(cold, 2, 1, 10).await?;
    ctl.migrate(hot, 2, 1, 10).await?;
    assert_eq!(dir.scan_for_node(2).len(), 2);

    // Leases run until 13.
    assert!(ctl.evict_expired(12).await.is_empty());
    assert_eq!(ctl.evict_expired(13).await, [cold]);

    assert_eq!(dir.lookup(&cold).map(|m| m.node), Some(0));
    assert_eq!(dir.lookup(&hot).map(|m| m.node), Some(2));
    assert_eq!(dir.lookup(&cold).map(|m| m.lease_ends), Some(16));
    Ok(())
}

#[tokio::test]
async fn test_failed_transfer_leaves_directory_untouched() -> Result<()> {
    let engine = fast_engine();
    engine.stop();
    let dir = FragmentDirectory::new();
    let key = FragmentKey::new(0x4000, 0);
    let before = FragmentMapping::new(1, 0x99, 256).with_lease(7);
    dir.install(key, before);

    let ctl = MigrationController::new(engine, dir.clone(), DirectorySettings::default())
        .with_wait_timeout(Duration::from_millis(20));
    let err = ctl.migrate(key, 2, 0, 0).await.unwrap_err();
    assert_eq!(
        err,
        MigrationError::Transfer { key, source: TransferError::DeadlineExceeded }
    );
    assert_eq!(dir.lookup(&key), Some(before));
    Ok(())
}

#[tokio::test]
async fn test_checked_install_guards_after_migration() -> Result<()> {
    let engine = fast_engine();
    let mut events = engine.subscribe();
    let dir = FragmentDirectory::new();
    let key = FragmentKey::new(0x5000, 0);
    dir.install(key, FragmentMapping::new(0, 0, 256));

    let ctl = MigrationController::new(engine, dir.clone(), DirectorySettings::default());
    ctl.migrate(key, 1, 0, 100).await?;
    assert!(matches!(
        events.try_recv(),
        Ok(TransferEvent::Dispatched { .. }) | Ok(TransferEvent::Completed { .. })
    ));

    // Another placer tries to claim it while node 1 still holds the lease.
    let conflict = dir
        .install_checked(key, FragmentMapping::new(3, 0, 256), 101)
        .unwrap_err();
    assert_eq!(conflict.holder, 1);
    assert_eq!(dir.lookup(&key).map(|m| m.node), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_eviction_home_never_reuses_resident_address() -> Result<()> {
    let dir = FragmentDirectory::new();
    let settings = DirectorySettings {
        lease_epochs: 1,
        ..DirectorySettings::default()
    };
    let ctl = MigrationController::new(fast_engine(), dir.clone(), settings);

    // Laid out on the home node before the controller allocates anything there.
    let resident: Vec<FragmentKey> = (0..4).map(|i| FragmentKey::new(0x6000, i)).collect();
    for (i, key) in resident.iter().enumerate() {
        dir.install(*key, FragmentMapping::new(0, i as u64 * 4096, 4096).with_lease(100));
    }
    let visitor = FragmentKey::new(0x6000, 9);
    dir.install(visitor, FragmentMapping::new(3, 0, 4096));

    assert_eq!(ctl.evict_expired(1).await, [visitor]);

    let home = dir.scan_for_node(0);
    let mut ranges: Vec<(u64, u64)> = home
        .values()
        .map(|m| (m.phys_addr, m.phys_addr + u64::from(m.size)))
        .collect();
    ranges.sort_unstable();
    assert_eq!(ranges.len(), 5);
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlap: {pair:?}");
    }
    Ok(())
}

#[tokio::test]
async fn test_touched_and_hot_fragments_survive_eviction() -> Result<()> {
    let dir = FragmentDirectory::new();
    let settings = DirectorySettings {
        lease_epochs: 2,
        renew_epochs: 2,
        ..DirectorySettings::default()
    };
    let ctl = MigrationController::new(fast_engine(), dir.clone(), settings);

    let keys: Vec<FragmentKey> = (0..3).map(|i| FragmentKey::new(0x7000, i)).collect();
    for key in &keys {
        ctl.place(*key, 0, 1024, 0, FragmentFlags::NONE);
    }
    let [touched, promoted, idle] = [keys[0], keys[1], keys[2]];

    // All three land on node 1 with leases ending at epoch 2.
    let moves: Vec<Move> = keys.iter().map(|&key| Move { key, dst: 1, priority: 0 }).collect();
    assert!(ctl.migrate_batch(&moves, 0).await.iter().all(|(_, r)| r.is_ok()));

    // An access at epoch 2 keeps `touched` leased through epoch 4.
    assert_eq!(ctl.touch(touched, 2).map(|m| m.lease_ends), Some(4));
    // Promotion to node 2 marks it hot; its fresh lease also ends at 4.
    let promotions = ctl.promote_hot(&[promoted], 2, 0, 2).await;
    assert!(matches!(promotions[0].1, Ok(MigrationOutcome::Moved { from: 1, .. })));

    assert_eq!(ctl.evict_expired(2).await, [idle]);
    assert!(ctl.evict_expired(3).await.is_empty());

    // At epoch 4 both leases are up, but only the cold one goes home.
    assert_eq!(ctl.evict_expired(4).await, [touched]);
    let hot = dir.lookup(&promoted).expect("promoted fragment tracked");
    assert_eq!(hot.node, 2);
    assert!(hot.flags.contains(FragmentFlags::HOT));

    // Once it cools down it is evicted like any other.
    ctl.set_hot(promoted, false);
    assert_eq!(ctl.evict_expired(5).await, [promoted]);
    assert_eq!(dir.scan_for_node(0).len(), 3);
    Ok(())
}
