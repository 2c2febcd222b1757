use std::collections::HashSet;

use anyhow::Result;
use flame_core::{FragmentFlags, FragmentKey, FragmentMapping};
use flame_services::FragmentDirectory;

#[test]
fn test_example_install_lookup() {
    let dir = FragmentDirectory::new();
    let mapping = FragmentMapping::new(3, 0xABCD, 4096);
    dir.install(FragmentKey::new(0x1000, 2), mapping);

    let found = dir.lookup(&FragmentKey::new(0x1000, 2));
    assert_eq!(found, Some(mapping));
}

#[test]
fn test_remove_then_lookup_not_found() {
    let dir = FragmentDirectory::new();
    let key = FragmentKey::new(0x1000, 2);
    dir.install(key, FragmentMapping::new(3, 0xABCD, 4096));
    dir.remove(&key);
    assert_eq!(dir.lookup(&key), None);
}

#[test]
fn test_scan_matches_latest_owner_after_churn() {
    let dir = FragmentDirectory::new();
    // Each key is installed three times; only the last owner counts.
    for round in 0..3u32 {
        for i in 0..60u16 {
            let node = (u32::from(i) + round) % 4;
            dir.install(FragmentKey::new(0x10, i), FragmentMapping::new(node, 0, 256));
        }
    }
    for i in (0..60u16).step_by(10) {
        dir.remove(&FragmentKey::new(0x10, i));
    }

    for node in 0..4u32 {
        let expected: HashSet<FragmentKey> = (0..60u16)
            .filter(|i| i % 10 != 0)
            .filter(|i| (u32::from(*i) + 2) % 4 == node)
            .map(|i| FragmentKey::new(0x10, i))
            .collect();
        let got: HashSet<FragmentKey> = dir.scan_for_node(node).into_keys().collect();
        assert_eq!(got, expected, "node {node}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_and_readers() -> Result<()> {
    let dir = FragmentDirectory::new();
    let shared = FragmentKey::new(0xFFFF, 0);

    let mut writers = Vec::new();
    for node in 0..4u32 {
        let dir = dir.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..500u16 {
                let mapping = FragmentMapping::new(node, u64::from(node) << 32 | u64::from(i), 512)
                    .with_lease(i64::from(i))
                    .with_flags(FragmentFlags(node));
                dir.install(FragmentKey::new(u64::from(node), i), mapping);
                // Everyone also fights over one key.
                dir.install(shared, mapping);
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let reader = {
        let dir = dir.clone();
        tokio::spawn(async move {
            for _ in 0..2000 {
                if let Some(m) = dir.lookup(&shared) {
                    // Whole mapping from a single writer, never a mix.
                    assert_eq!(m.phys_addr >> 32, u64::from(m.node));
                    assert_eq!(m.flags.bits(), m.node);
                    assert_eq!(m.lease_ends as u64, m.phys_addr & 0xFFFF);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for w in writers {
        w.await?;
    }
    reader.await?;

    assert_eq!(dir.len(), 4 * 500 + 1);
    for node in 0..4u32 {
        let owned = dir.scan_for_node(node);
        let disjoint = owned.keys().filter(|k| **k != shared).count();
        assert_eq!(disjoint, 500);
        for (key, m) in owned {
            if key != shared {
                assert_eq!(m.phys_addr, u64::from(node) << 32 | u64::from(key.index));
            }
        }
    }
    let last = dir.lookup(&shared).expect("shared key installed");
    assert_eq!(last.lease_ends, 499);
    Ok(())
}

#[test]
fn test_dump_mentions_every_fragment() {
    let dir = FragmentDirectory::new();
    for i in 0..5u16 {
        dir.install(FragmentKey::new(0x1000, i), FragmentMapping::new(1, u64::from(i), 256));
    }
    let dump = dir.dump();
    for i in 0..5u16 {
        assert!(dump.contains(&format!("VPN=0x1000 idx={i} -> node=1")), "{dump}");
    }
}
