//! Invariant checking and statistics for extent trees. On top of the
//! structural checks this verifies that extents within a leaf are
//! strictly disjoint and that end offsets respect the parent's bounds.

use std::cmp::Ordering;

use log::warn;
use rustc_hash::FxHashMap;

use crate::cache::{NodeHandle, PageCache};
use crate::node;
use crate::ops::KeyOps;

use super::{leaf, ExtentOps, Xt};

/// Counts computed by [`Xt::statistics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XtStats {
    /// Number of levels, 1 for a lone leaf-root.
    pub depth: u32,
    pub index_nodes: u64,
    pub leaf_nodes: u64,
    /// Total number of extent entries.
    pub entries: u64,
    /// Sum of the extent lengths.
    pub total_length: u64,
}

fn validate_single_node<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
) -> bool {
    let x = &tree.ops.0;
    let used = node::used(data);

    if node::is_root(data) && !node::is_leaf(data) && used == 1 {
        return false;
    }
    if !node::is_root(data) && used < tree.shape.min_ent {
        return false;
    }
    if used > node::max_ent(&tree.shape, data) {
        return false;
    }

    if node::is_leaf(data) {
        // Extents must be ordered and strictly disjoint:
        // end(E_i) < start(E_{i+1}).
        let mut end = vec![0; tree.shape.key_size];
        for i in 1..used {
            let (pk, pr) = node::kth_leaf_entry(&tree.shape, data, i - 1);
            x.end_offset(pk, pr, &mut end);
            let cur = node::kth_key(&tree.shape, data, i);
            if x.compare(&end, cur) != Ordering::Less {
                return false;
            }
        }
    } else {
        for i in 1..used {
            let prev = node::kth_key(&tree.shape, data, i - 1);
            let cur = node::kth_key(&tree.shape, data, i);
            if x.compare(prev, cur) != Ordering::Less {
                return false;
            }
        }
    }
    true
}

fn validate_node<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    h: &C::Handle,
    lo: &[u8],
    hi: Option<&[u8]>,
) -> bool {
    let ctx = tree.ctx();
    let x = &tree.ops.0;
    let data = h.data();

    if !validate_single_node(tree, data) {
        warn!(
            "xt[{}]: node failed local validation, {} entries",
            tree.tid(),
            node::used(data)
        );
        return false;
    }

    if !node::is_root(data) {
        if x.compare(lo, node::min_key(&tree.shape, data)) == Ordering::Greater {
            warn!("xt[{}]: node minimum below the dictated range", tree.tid());
            return false;
        }
        if let Some(hi) = hi {
            // End offsets count: a leaf's last extent must end below the
            // bound too.
            let mut end = vec![0; tree.shape.key_size];
            leaf::max_ofs(tree, data, &mut end);
            if x.compare(&end, hi) != Ordering::Less {
                warn!("xt[{}]: node reaches past the dictated bound", tree.tid());
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

pub(super) fn validate<C: PageCache, X: ExtentOps<C::Wu>>(tree: &Xt<C, X>, wu: &C::Wu) -> bool {
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

pub(super) fn validate_clones<C: PageCache, X: ExtentOps<C::Wu>>(
    wu: &C::Wu,
    trees: &[&Xt<C, X>],
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

fn stats_node<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    h: &C::Handle,
    depth: u32,
    out: &mut XtStats,
) {
    let ctx = tree.ctx();
    out.depth = out.depth.max(depth);
    if node::is_leaf(h.data()) {
        out.leaf_nodes += 1;
        out.entries += node::used(h.data()) as u64;
        out.total_length += leaf::leaf_length(tree, h.data());
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

pub(super) fn statistics<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
) -> XtStats {
    let mut out = XtStats::default();
    let root = tree.lock_root_sl(wu);
    stats_node(tree, wu, &root, 1, &mut out);
    tree.ctx().release(wu, root);
    out
}
