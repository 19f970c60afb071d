//! End-to-end coverage of the key/value tree over the in-memory cache.

mod common;

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use common::*;
use cowtree::mock::key_bytes;
use cowtree::Bpt;

#[test]
fn empty_tree_behaviors() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    assert_eq!(contents(&tree, &wu), vec![]);
    assert!(get(&tree, &wu, 7).is_none());
    assert!(!rmv(&tree, &wu, 7));
    assert_eq!(remove_range(&tree, &wu, 0, 100), 0);
    assert!(tree.validate(&wu));

    tree.delete(&wu);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn sequential_insert_splits_root() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    for k in 1..=5 {
        assert!(!ins(&tree, &wu, k, k * 10));
    }
    // Still a full leaf-root of five.
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes, stats.entries), (1, 1, 5));

    // The sixth insert splits the root.
    assert!(!ins(&tree, &wu, 6, 60));
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.index_nodes, stats.leaf_nodes), (2, 1, 2));
    assert_eq!(stats.entries, 6);

    assert_eq!(get(&tree, &wu, 4), Some(40));
    assert_eq!(
        contents(&tree, &wu),
        (1..=6).map(|k| (k, k * 10)).collect::<Vec<_>>()
    );
    assert!(tree.validate(&wu));
    tree.delete(&wu);
}

#[test]
fn insert_replaces_existing_value() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    assert!(!ins(&tree, &wu, 42, 1));
    assert!(ins(&tree, &wu, 42, 2));
    assert_eq!(get(&tree, &wu, 42), Some(2));
    assert_eq!(contents(&tree, &wu).len(), 1);
    tree.delete(&wu);
}

#[test]
fn key_below_minimum_propagates() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    for k in [50, 60, 70, 80, 90, 100, 110] {
        ins(&tree, &wu, k, k);
    }
    assert!(tree.statistics(&wu).depth >= 2);
    // Smaller than everything present: the minimum key on the descent
    // path is rewritten before recursing.
    ins(&tree, &wu, 5, 5);
    assert!(tree.validate(&wu));
    assert_eq!(get(&tree, &wu, 5), Some(5));
    assert_eq!(contents(&tree, &wu)[0], (5, 5));
    tree.delete(&wu);
}

#[test]
fn remove_key_rebalances_from_sibling() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    // Shape: leaves [10,20] and [30,40,50,60,70] under an index root.
    for k in [10, 20, 30, 40, 50, 60, 70] {
        ins(&tree, &wu, k, k);
    }
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes), (2, 2));

    // Removing from the two-entry leaf first pulls entries over from
    // the right sibling, which has spares.
    assert!(rmv(&tree, &wu, 10));
    assert!(tree.validate(&wu));
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes, stats.entries), (2, 2, 6));
    assert_eq!(
        contents(&tree, &wu),
        [20, 30, 40, 50, 60, 70].map(|k| (k, k)).to_vec()
    );
    tree.delete(&wu);
}

#[test]
fn remove_key_merges_and_collapses_root() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    // Shape: leaves [10,20] and [30,40,50].
    for k in [10, 20, 30, 40, 50, 60] {
        ins(&tree, &wu, k, k);
    }
    rmv(&tree, &wu, 60);
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes), (2, 2));

    // No sibling has spares: the leaves merge and the root collapses
    // back into a lone leaf.
    assert!(rmv(&tree, &wu, 10));
    assert!(tree.validate(&wu));
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes, stats.entries), (1, 1, 4));
    assert_eq!(contents(&tree, &wu), [20, 30, 40, 50].map(|k| (k, k)).to_vec());
    tree.delete(&wu);
}

#[test]
fn remove_then_lookup_misses() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    ins(&tree, &wu, 9, 90);
    assert!(rmv(&tree, &wu, 9));
    assert!(get(&tree, &wu, 9).is_none());
    assert!(!rmv(&tree, &wu, 9));
    tree.delete(&wu);
}

#[test]
fn remove_range_trims_and_collapses() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    for k in [10, 20, 30, 40, 50, 60, 70] {
        ins(&tree, &wu, k, k);
    }
    assert_eq!(tree.statistics(&wu).depth, 2);

    // Trims the covered middle and repairs the edges; the survivors fit
    // into the root again.
    assert_eq!(remove_range(&tree, &wu, 25, 65), 4);
    assert!(tree.validate(&wu));
    assert_eq!(contents(&tree, &wu), vec![(10, 10), (20, 20), (70, 70)]);
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes), (1, 1));

    // Idempotent on a stable tree.
    assert_eq!(remove_range(&tree, &wu, 25, 65), 0);
    assert_eq!(contents(&tree, &wu), vec![(10, 10), (20, 20), (70, 70)]);
    tree.delete(&wu);
}

#[test]
fn remove_range_covering_everything_empties_the_tree() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    for k in 1..=40 {
        ins(&tree, &wu, k, k);
    }
    assert!(tree.statistics(&wu).depth >= 2);

    assert_eq!(remove_range(&tree, &wu, 1, 40), 40);
    assert!(tree.validate(&wu));
    assert_eq!(contents(&tree, &wu), vec![]);
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes, stats.entries), (1, 1, 0));

    // The tree remains usable.
    ins(&tree, &wu, 3, 3);
    assert_eq!(contents(&tree, &wu), vec![(3, 3)]);
    tree.delete(&wu);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn remove_range_single_key_delegates() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    for k in 1..=10 {
        ins(&tree, &wu, k, k);
    }
    assert_eq!(remove_range(&tree, &wu, 4, 4), 1);
    assert!(get(&tree, &wu, 4).is_none());
    // Inverted bounds are a no-op.
    assert_eq!(remove_range(&tree, &wu, 9, 3), 0);
    tree.delete(&wu);
}

#[test]
fn insert_range_round_trip_and_overwrite() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    // A dense, sorted run of 40 consecutive keys.
    let keys: Vec<u8> = (100u32..140).flat_map(|k| key_bytes(k)).collect();
    let vals: Vec<u8> = (100u32..140).flat_map(|k| key_bytes(k * 2)).collect();

    assert_eq!(tree.insert_range(&wu, &keys, &vals), 0);
    assert!(tree.validate(&wu));
    assert_eq!(
        range(&tree, &wu, 100, 139, 100),
        (100..140).map(|k| (k, k * 2)).collect::<Vec<_>>()
    );

    // A second pass reports a 100% overwrite and leaves the same
    // contents behind.
    assert_eq!(tree.insert_range(&wu, &keys, &vals), 40);
    assert!(tree.validate(&wu));
    assert_eq!(contents(&tree, &wu).len(), 40);

    // Removing the exact range empties the tree again.
    assert_eq!(remove_range(&tree, &wu, 100, 139), 40);
    assert_eq!(contents(&tree, &wu), vec![]);
    tree.delete(&wu);
}

#[test]
fn lookup_range_respects_the_cap() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    for k in 1..=30 {
        ins(&tree, &wu, k, k);
    }
    let first = range(&tree, &wu, 1, 30, 7);
    assert_eq!(first, (1..=7).map(|k| (k, k)).collect::<Vec<_>>());

    // The caller resumes from past the last hit.
    let second = range(&tree, &wu, 8, 30, 100);
    assert_eq!(second.len(), 23);
    tree.delete(&wu);
}

#[test]
fn clone_shares_pages_and_isolates_writes() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    for k in 1..=25 {
        ins(&tree, &wu, k, k);
    }
    let pages_before = cache.live_pages();

    let clone = bpt_fanout5(&cache, 2);
    tree.clone_into(&wu, &clone);
    // Only the root was copied.
    assert_eq!(cache.live_pages(), pages_before + 1);
    assert!(Bpt::validate_clones(&wu, &[&tree, &clone]));

    // A write in the clone COWs the touched path and nothing else.
    ins(&clone, &wu, 26, 26);
    assert!(Bpt::validate_clones(&wu, &[&tree, &clone]));
    assert_eq!(get(&tree, &wu, 26), None);
    assert_eq!(get(&clone, &wu, 26), Some(26));
    assert_eq!(contents(&tree, &wu).len(), 25);
    assert_eq!(contents(&clone, &wu).len(), 26);

    // Diverge harder and re-check the refcount accounting.
    assert_eq!(remove_range(&clone, &wu, 5, 20), 16);
    assert!(Bpt::validate_clones(&wu, &[&tree, &clone]));
    assert_eq!(contents(&tree, &wu).len(), 25);

    clone.delete(&wu);
    assert!(tree.validate(&wu));
    assert_eq!(contents(&tree, &wu).len(), 25);
    tree.delete(&wu);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn clone_of_leaf_root_shares_nothing() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);
    ins(&tree, &wu, 1, 1);

    let clone = bpt_fanout5(&cache, 2);
    tree.clone_into(&wu, &clone);
    assert!(Bpt::validate_clones(&wu, &[&tree, &clone]));

    ins(&clone, &wu, 2, 2);
    assert_eq!(contents(&tree, &wu), vec![(1, 1)]);
    assert_eq!(contents(&clone, &wu), vec![(1, 1), (2, 2)]);
    tree.delete(&wu);
    clone.delete(&wu);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn attributes_live_in_the_root() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    tree.with_attributes_mut(&wu, |attrs| {
        attrs[..4].copy_from_slice(b"meta");
    });
    // Attributes survive structural changes of the root.
    for k in 1..=20 {
        ins(&tree, &wu, k, k);
    }
    tree.with_attributes(&wu, |attrs| assert_eq!(&attrs[..4], b"meta"));
    tree.delete(&wu);
}

#[test]
fn reattach_and_iterate() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    let root_addr = tree.create(&wu);
    for k in 1..=20 {
        ins(&tree, &wu, k, k);
    }
    // Dropping the state keeps the on-disk tree; a fresh state can
    // attach to the same root.
    tree.destroy(&wu);
    let tree = bpt_fanout5(&cache, 2);
    tree.open(&wu, root_addr);
    assert_eq!(get(&tree, &wu, 17), Some(17));

    let stats = tree.statistics(&wu);
    let mut visited = 0u64;
    tree.iter(&wu, |_| visited += 1);
    assert_eq!(visited, stats.index_nodes + stats.leaf_nodes);
    tree.delete(&wu);
}

#[test]
fn init_map_formats_a_chosen_address() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.init_map(&wu, 777);
    tree.open(&wu, 777);
    ins(&tree, &wu, 5, 50);
    assert_eq!(get(&tree, &wu, 5), Some(50));
    tree.delete(&wu);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn root_cow_updates_the_parent_reference() {
    use cowtree::PageCache;

    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    let root_addr = tree.create(&wu);
    ins(&tree, &wu, 1, 1);

    // Simulate a parent tree holding a counted reference to this root.
    cache.inc_refcount(&wu, root_addr);
    let mut parent_ref = root_addr.to_le_bytes();

    tree.cow_root_and_update(&wu, &mut parent_ref);
    let new_addr = u64::from_le_bytes(parent_ref);
    assert_ne!(new_addr, root_addr, "shared root must relocate");
    assert_eq!(cache.refcount_of(root_addr), 1);
    assert_eq!(cache.refcount_of(new_addr), 1);

    // The state follows the relocated root.
    assert_eq!(get(&tree, &wu, 1), Some(1));
    tree.delete(&wu);
    cache.dealloc(&wu, root_addr);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn randomized_against_model() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);

    let mut model = BTreeMap::new();
    let mut rng = XorShiftRng::seed_from_u64(0x5eed);

    for round in 0..2000 {
        let key = rng.gen_range(0..300u32);
        match rng.gen_range(0..10) {
            0..=4 => {
                let val = rng.gen_range(0..1000u32);
                let replaced = ins(&tree, &wu, key, val);
                assert_eq!(replaced, model.insert(key, val).is_some());
            }
            5..=7 => {
                assert_eq!(rmv(&tree, &wu, key), model.remove(&key).is_some());
            }
            8 => {
                assert_eq!(get(&tree, &wu, key), model.get(&key).copied());
            }
            _ => {
                let hi = key + rng.gen_range(0..40);
                let expected = model.range(key..=hi).count();
                assert_eq!(
                    range(&tree, &wu, key, hi, 10_000).len(),
                    expected,
                    "range [{},{}]",
                    key,
                    hi
                );
                let removed = remove_range(&tree, &wu, key, hi);
                assert_eq!(removed, expected);
                model.retain(|&k, _| k < key || k > hi);
            }
        }
        if round % 100 == 0 {
            assert!(tree.validate(&wu), "round {}", round);
        }
    }

    assert!(tree.validate(&wu));
    assert_eq!(
        contents(&tree, &wu),
        model.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>()
    );
    tree.delete(&wu);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn randomized_clone_set_stays_consistent() {
    let cache = new_cache();
    let wu = wu();
    let tree = bpt_fanout5(&cache, 1);
    tree.create(&wu);
    for k in 0..60 {
        ins(&tree, &wu, k * 3, k);
    }

    let mut rng = XorShiftRng::seed_from_u64(42);
    let mut clones = vec![tree];
    for tid in 2..6 {
        let src = rng.gen_range(0..clones.len());
        let clone = bpt_fanout5(&cache, tid);
        clones[src].clone_into(&wu, &clone);
        clones.push(clone);

        // Mutate a random member after every clone.
        let victim = &clones[rng.gen_range(0..clones.len())];
        for _ in 0..20 {
            let key = rng.gen_range(0..200u32);
            if rng.gen_bool(0.6) {
                ins(victim, &wu, key, key);
            } else {
                rmv(victim, &wu, key);
            }
        }
        let refs: Vec<&TestBpt> = clones.iter().collect();
        assert!(Bpt::validate_clones(&wu, &refs));
    }

    for clone in &clones {
        clone.delete(&wu);
    }
    assert_eq!(cache.live_pages(), 0);
}
