//! Invariant checking and per-tree statistics.
//!
//! Validation descends the tree with read locks and verifies, per node,
//! occupancy, strictly ascending keys and containment in the key range
//! dictated by the parent. Clone-set validation additionally counts how
//! many of the trees reach each page and compares the count with the
//! reference-count store.

use std::cmp::Ordering;

use log::warn;
use rustc_hash::FxHashMap;

use crate::cache::{NodeHandle, PageCache};
use crate::node;
use crate::ops::{DataOps, KeyOps};

use super::Bpt;

/// Node and entry counts computed by [`Bpt::statistics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels, 1 for a lone leaf-root.
    pub depth: u32,
    pub index_nodes: u64,
    pub leaf_nodes: u64,
    /// Total number of leaf entries.
    pub entries: u64,
}

fn validate_single_node<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    data: &[u8],
) -> bool {
    let used = node::used(data);

    // A non-leaf root must never narrow to a single child.
    if node::is_root(data) && !node::is_leaf(data) && used == 1 {
        return false;
    }
    if !node::is_root(data) && used < tree.shape.min_ent {
        return false;
    }
    if used > node::max_ent(&tree.shape, data) {
        return false;
    }
    for i in 1..used {
        let prev = node::kth_key(&tree.shape, data, i - 1);
        let cur = node::kth_key(&tree.shape, data, i);
        if tree.ops.keys.compare(prev, cur) != Ordering::Less {
            return false;
        }
    }
    true
}

fn validate_node<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    h: &C::Handle,
    lo: &[u8],
    hi: Option<&[u8]>,
) -> bool {
    let ctx = tree.ctx();
    let data = h.data();

    if !validate_single_node(tree, data) {
        warn!(
            "bpt[{}]: node failed local validation, {} entries",
            tree.tid(),
            node::used(data)
        );
        return false;
    }

    if !node::is_root(data) {
        if tree.ops.keys.compare(lo, node::min_key(&tree.shape, data)) == Ordering::Greater {
            warn!("bpt[{}]: node minimum below the dictated range", tree.tid());
            return false;
        }
        if let Some(hi) = hi {
            if tree.ops.keys.compare(node::max_key(&tree.shape, data), hi) != Ordering::Less {
                warn!("bpt[{}]: node maximum reaches the dictated bound", tree.tid());
                return false;
            }
        }
    }

    if node::is_leaf(data) {
        return true;
    }
    for i in 0..node::used(data) {
        let (child_lo, child_addr) = node::kth_index_entry(&tree.shape, data, i);
        let child_lo = child_lo.to_vec();
        let child_hi = if i + 1 < node::used(data) {
            Some(node::kth_key(&tree.shape, data, i + 1).to_vec())
        } else {
            hi.map(|h| h.to_vec())
        };
        let child = ctx.get_for_read(wu, child_addr);
        let ok = validate_node(tree, wu, &child, &child_lo, child_hi.as_deref());
        ctx.release(wu, child);
        if !ok {
            return false;
        }
    }
    true
}

pub(super) fn validate<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
) -> bool {
    let ctx = tree.ctx();
    let root = tree.lock_root_sl(wu);
    let rc = if node::used(root.data()) == 0 {
        node::is_leaf(root.data())
    } else {
        let lo = node::min_key(&tree.shape, root.data()).to_vec();
        validate_node(tree, wu, &root, &lo, None)
    };
    ctx.release(wu, root);
    rc
}

pub(super) fn validate_clones<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    wu: &C::Wu,
    trees: &[&Bpt<C, K, D>],
) -> bool {
    for tree in trees {
        if !validate(tree, wu) {
            return false;
        }
    }

    let mut labels = FxHashMap::default();
    for tree in trees {
        let root = tree.lock_root_sl(wu);
        tree.ctx().label_count(wu, &root, &mut labels);
        tree.ctx().release(wu, root);
    }
    for tree in trees {
        let root = tree.lock_root_sl(wu);
        let ok = tree.ctx().compare_labels(wu, &root, &labels);
        tree.ctx().release(wu, root);
        if !ok {
            return false;
        }
    }
    true
}

fn stats_node<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    h: &C::Handle,
    depth: u32,
    out: &mut TreeStats,
) {
    let ctx = tree.ctx();
    out.depth = out.depth.max(depth);
    if node::is_leaf(h.data()) {
        out.leaf_nodes += 1;
        out.entries += node::used(h.data()) as u64;
        return;
    }
    out.index_nodes += 1;
    for i in 0..node::used(h.data()) {
        let child_addr = node::kth_child_addr(&tree.shape, h.data(), i);
        let child = ctx.get_for_read(wu, child_addr);
        stats_node(tree, wu, &child, depth + 1, out);
        ctx.release(wu, child);
    }
}

pub(super) fn statistics<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
) -> TreeStats {
    let mut out = TreeStats::default();
    let root = tree.lock_root_sl(wu);
    stats_node(tree, wu, &root, 1, &mut out);
    tree.ctx().release(wu, root);
    out
}
