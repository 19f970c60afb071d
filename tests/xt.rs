//! End-to-end coverage of the extent tree over the in-memory cache.

mod common;

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use common::*;
use cowtree::mock::ExtentStore;
use cowtree::Xt;

#[test]
fn empty_tree_behaviors() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    assert_eq!(xt_contents(&tree, &wu), vec![]);
    assert_eq!(xt_remove_range(&tree, &wu, 0, 100), 0);
    assert!(tree.validate(&wu));
    tree.delete(&wu);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn insert_lookup_and_interior_removal() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    // One extent [10..14].
    assert_eq!(xt_ins(&tree, &wu, &store, 10, 5), 0);
    assert_eq!(xt_range(&tree, &wu, 8, 20, 10), vec![(10, 5)]);
    assert_eq!(store.allocated_units(), 5);

    // Removing its interior splits it into the two remainders.
    assert_eq!(xt_remove_range(&tree, &wu, 12, 13), 2);
    assert!(tree.validate(&wu));
    assert_eq!(xt_contents(&tree, &wu), vec![(10, 2), (14, 1)]);
    assert_eq!(store.allocated_units(), 3);

    tree.delete(&wu);
    assert_eq!(store.allocated_units(), 0);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn overlapping_insert_overwrites() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    assert_eq!(xt_ins(&tree, &wu, &store, 10, 5), 0);
    // [12..13] punches through the middle of [10..14].
    assert_eq!(xt_ins(&tree, &wu, &store, 12, 2), 2);
    assert!(tree.validate(&wu));
    assert_eq!(xt_contents(&tree, &wu), vec![(10, 2), (12, 2), (14, 1)]);
    // Five units were written, two of the first region released again.
    assert_eq!(store.allocated_units(), 5);

    tree.delete(&wu);
    assert_eq!(store.allocated_units(), 0);
}

#[test]
fn lookup_range_chops_partial_extents() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    xt_ins(&tree, &wu, &store, 10, 10); // [10..19]
    xt_ins(&tree, &wu, &store, 30, 10); // [30..39]

    // Both edges only partially overlap the queried bounds.
    assert_eq!(xt_range(&tree, &wu, 15, 34, 10), vec![(15, 5), (30, 5)]);
    // The stored extents are untouched.
    assert_eq!(xt_contents(&tree, &wu), vec![(10, 10), (30, 10)]);
    tree.delete(&wu);
}

#[test]
fn insert_covering_everything_in_a_leaf() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    for start in [10, 20, 30] {
        xt_ins(&tree, &wu, &store, start, 2);
    }
    // [5..44] swallows all three extents whole.
    assert_eq!(xt_ins(&tree, &wu, &store, 5, 40), 6);
    assert!(tree.validate(&wu));
    assert_eq!(xt_contents(&tree, &wu), vec![(5, 40)]);
    assert_eq!(store.allocated_units(), 40);
    tree.delete(&wu);
    assert_eq!(store.allocated_units(), 0);
}

#[test]
fn insert_overwrite_repairs_leaf_underflow() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    // Two levels: leaves [(10),(20)] and [(30),(40),(50)].
    for start in [10, 20, 30, 40, 50] {
        xt_ins(&tree, &wu, &store, start, 2);
    }
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes), (2, 2));

    // [8..37] wipes the left leaf completely and part of the right one.
    // The insert refills the emptied leaf with sub-extents of the new
    // one instead of leaving it underflowed.
    assert_eq!(xt_ins(&tree, &wu, &store, 8, 30), 6);
    assert!(tree.validate(&wu));
    let all = xt_contents(&tree, &wu);
    // The pieces tile [8..37] exactly, then the untouched tail follows.
    let mut cursor = 8;
    let mut covered = 0;
    for &(start, len) in &all {
        if covered < 30 {
            assert_eq!(start, cursor);
            cursor += len;
            covered += len;
        }
    }
    assert_eq!(covered, 30);
    assert_eq!(&all[all.len() - 2..], &[(40, 2), (50, 2)]);
    assert_eq!(store.allocated_units(), 34);
    tree.delete(&wu);
    assert_eq!(store.allocated_units(), 0);
}

#[test]
fn remove_range_spill_from_a_full_leaf() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    // Four extents of five units each in the root leaf.
    for start in [10, 30, 50, 70] {
        xt_ins(&tree, &wu, &store, start, 5);
    }
    // Interior removal splits one extent and fills the root to its
    // capacity of five.
    assert_eq!(xt_remove_range(&tree, &wu, 12, 13), 2);
    assert_eq!(
        xt_contents(&tree, &wu),
        vec![(10, 2), (14, 1), (30, 5), (50, 5), (70, 5)]
    );

    // Now the leaf is full; splitting another extent has no room for
    // the trailing piece, which must spill and be re-inserted.
    assert_eq!(xt_remove_range(&tree, &wu, 32, 33), 2);
    assert!(tree.validate(&wu));
    assert_eq!(
        xt_contents(&tree, &wu),
        vec![(10, 2), (14, 1), (30, 2), (34, 1), (50, 5), (70, 5)]
    );
    assert_eq!(store.allocated_units(), 16);

    tree.delete(&wu);
    assert_eq!(store.allocated_units(), 0);
    assert_eq!(cache.live_pages(), 0);
}

#[test]
fn remove_range_across_leaves() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    for i in 0..12 {
        xt_ins(&tree, &wu, &store, 10 * i, 5);
    }
    assert!(tree.statistics(&wu).depth >= 2);
    let before = tree.statistics(&wu).total_length;

    // Chop both edges, release everything between.
    let removed = xt_remove_range(&tree, &wu, 12, 93);
    assert!(tree.validate(&wu));
    let all = xt_contents(&tree, &wu);
    assert_eq!(all.first().copied(), Some((0, 5)));
    assert!(all.contains(&(10, 2)));
    assert!(all.contains(&(94, 1)));
    assert_eq!(tree.statistics(&wu).total_length, before - removed);
    assert_eq!(store.allocated_units() as u64, before - removed);

    // Idempotent on a stable tree.
    assert_eq!(xt_remove_range(&tree, &wu, 12, 93), 0);
    tree.delete(&wu);
    assert_eq!(store.allocated_units(), 0);
}

#[test]
fn remove_range_covering_everything_empties_the_tree() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    for i in 0..20 {
        xt_ins(&tree, &wu, &store, 10 * i, 4);
    }
    let total = tree.statistics(&wu).total_length;
    assert_eq!(xt_remove_range(&tree, &wu, 0, 1000), total);
    assert!(tree.validate(&wu));
    assert_eq!(xt_contents(&tree, &wu), vec![]);
    assert_eq!(store.allocated_units(), 0);
    let stats = tree.statistics(&wu);
    assert_eq!((stats.depth, stats.leaf_nodes, stats.entries), (1, 1, 0));
    tree.delete(&wu);
}

#[test]
fn clone_shares_pages_and_isolates_writes() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    for i in 0..15 {
        xt_ins(&tree, &wu, &store, 20 * i, 8);
    }
    let pages_before = cache.live_pages();

    let clone = xt_fanout5(&cache, &store, 2);
    tree.clone_into(&wu, &clone);
    assert_eq!(cache.live_pages(), pages_before + 1);
    assert!(Xt::validate_clones(&wu, &[&tree, &clone]));

    // Overwrite in the clone: the source keeps its view.
    xt_ins(&clone, &wu, &store, 25, 10);
    assert!(Xt::validate_clones(&wu, &[&tree, &clone]));
    assert!(xt_contents(&tree, &wu).contains(&(20, 8)));
    assert!(xt_contents(&clone, &wu).contains(&(25, 10)));

    // Tearing down the clone releases only what the clone owns: pages
    // it COWed and the regions its own leaf copies dropped. The data
    // regions now referenced by both leaf copies are the collaborator's
    // accounting problem, so the source is detached rather than deleted.
    clone.delete(&wu);
    assert!(tree.validate(&wu));
    assert!(xt_contents(&tree, &wu).contains(&(20, 8)));
    tree.destroy(&wu);
}

#[test]
fn randomized_against_model() {
    let cache = new_cache();
    let store = ExtentStore::new();
    let wu = wu();
    let tree = xt_fanout5(&cache, &store, 1);
    tree.create(&wu);

    // Model: logical unit -> covered?, plus a parallel length check.
    let mut model: BTreeMap<u32, ()> = BTreeMap::new();
    let mut rng = XorShiftRng::seed_from_u64(0xe47e);

    for round in 0..600 {
        let start = rng.gen_range(0..400u32);
        let len = rng.gen_range(1..25u32);
        if rng.gen_bool(0.7) {
            let overwritten = xt_ins(&tree, &wu, &store, start, len);
            let expected = (start..start + len).filter(|u| model.contains_key(u)).count();
            assert_eq!(overwritten, expected as u64, "round {}", round);
            for u in start..start + len {
                model.insert(u, ());
            }
        } else {
            let removed = xt_remove_range(&tree, &wu, start, start + len - 1);
            let expected = (start..start + len).filter(|u| model.contains_key(u)).count();
            assert_eq!(removed, expected as u64, "round {}", round);
            for u in start..start + len {
                model.remove(&u);
            }
        }
        if round % 50 == 0 {
            assert!(tree.validate(&wu), "round {}", round);
            assert_eq!(tree.statistics(&wu).total_length, model.len() as u64);
            assert_eq!(store.allocated_units(), model.len());
        }
    }

    // The tree must describe exactly the covered units.
    let mut covered = Vec::new();
    for (start, len) in xt_contents(&tree, &wu) {
        covered.extend(start..start + len);
    }
    assert_eq!(covered, model.keys().copied().collect::<Vec<_>>());

    tree.delete(&wu);
    assert_eq!(store.allocated_units(), 0);
    assert_eq!(cache.live_pages(), 0);
}
