//! Range removal: delete everything in `[min, max]`, then restore the
//! tree invariants.
//!
//! Phase one recurses post-order into every child overlapping the range,
//! deallocating wholly covered subtrees and trimming partially covered
//! leaves; the tree may be left with in-danger nodes along the range
//! edges. Phase two re-locates those edges by key. Phase three (the
//! shared restoration pass) repairs them top-down. The whole operation
//! holds the tree lock exclusively.

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, restore};
use crate::ops::{DataOps, KeyOps};

use super::{remove_key, Bpt};

/// Remove the keys of `[min, max]` from one leaf. Returns the count.
fn remove_range_from_leaf<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    leaf: &mut C::Handle,
    min: &[u8],
    max: &[u8],
) -> usize {
    let ctx = tree.ctx();
    debug_assert!(node::is_leaf(leaf.data()));

    let Some(lo) = ctx.lookup_ge(leaf.data(), min) else {
        return 0;
    };
    let Some(hi) = ctx.lookup_le(leaf.data(), max) else {
        return 0;
    };
    if lo > hi {
        return 0;
    }
    ctx.node_remove_entries(wu, leaf.data_mut(), lo, hi);
    hi - lo + 1
}

/// Phase one. Returns the number of removed keys and whether the entire
/// subtree under `h` should vanish (in which case nothing was removed
/// here; the caller deallocates the subtree).
fn remove_phase<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    h: &mut C::Handle,
    min: &[u8],
    max: &[u8],
) -> (usize, bool) {
    let ctx = tree.ctx();

    if node::is_leaf(h.data()) {
        if ctx.covered(h.data(), min, max) {
            return (node::used(h.data()), true);
        }
        return (remove_range_from_leaf(tree, wu, h, min, max), false);
    }

    let min_loc = ctx.lookup_le(h.data(), min).unwrap_or(0);
    let Some(mut max_loc) = ctx.lookup_le(h.data(), max) else {
        // Every key of the node is above the range.
        return (0, false);
    };
    if min_loc == max_loc + 1 {
        // The node holds the maximal key and nothing else in range.
        max_loc = min_loc;
    }

    let mut count = 0;
    let mut del_range: Option<(usize, usize)> = None;
    for i in min_loc..=max_loc {
        let child_addr = node::kth_child_addr(ctx.shape, h.data(), i);
        let mut child = ctx.get_for_write(wu, child_addr, Some((&mut *h, i)));
        let (c, rmv_child) = remove_phase(tree, wu, &mut child, min, max);
        count += c;
        if rmv_child {
            del_range = Some(match del_range {
                None => (i, i),
                Some((s, _)) => (s, i),
            });
        }
        ctx.release(wu, child);
    }

    let used = node::used(h.data());
    match del_range {
        None => {}
        Some((0, e)) if e == used - 1 => return (count, true),
        Some((s, e)) => {
            for i in s..=e {
                let child_addr = node::kth_child_addr(ctx.shape, h.data(), i);
                let child = ctx.get_for_read(wu, child_addr);
                ctx.delete_subtree(wu, child);
            }
            node::shuffle_remove_range(h.data_mut(), s, e);
        }
    }
    (count, false)
}

/// Deallocate every subtree below an index root and clear its entries.
fn delete_all<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    root: &mut C::Handle,
) {
    let ctx = tree.ctx();
    let used = node::used(root.data());
    if !node::is_leaf(root.data()) {
        for i in 0..used {
            let child_addr = node::kth_child_addr(ctx.shape, root.data(), i);
            let child = ctx.get_for_read(wu, child_addr);
            ctx.delete_subtree(wu, child);
        }
    }
    if used > 0 {
        ctx.node_remove_entries(wu, root.data_mut(), 0, used - 1);
    }
}

pub(super) fn remove_range<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    min: &[u8],
    max: &[u8],
) -> usize {
    use std::cmp::Ordering;

    let ctx = tree.ctx();
    match tree.ops.keys.compare(min, max) {
        Ordering::Greater => return 0,
        // A single key; the plain removal handles it.
        Ordering::Equal => return remove_key::remove(tree, wu, min) as usize,
        Ordering::Less => {}
    }

    let mut root = tree.lock_root_xl(wu);
    if node::used(root.data()) == 0 {
        ctx.release(wu, root);
        return 0;
    }

    if node::is_leaf(root.data()) {
        let count = remove_range_from_leaf(tree, wu, &mut root, min, max);
        ctx.release(wu, root);
        return count;
    }

    let (count, rmv_all) = remove_phase(tree, wu, &mut root, min, max);
    if count == 0 {
        ctx.release(wu, root);
    } else if rmv_all {
        // The range covers the whole tree; collapse to an empty
        // leaf-root.
        delete_all(tree, wu, &mut root);
        node::set_leaf(root.data_mut(), true);
        ctx.release(wu, root);
    } else {
        assert!(node::used(root.data()) > 0);
        restore::restore(ctx, wu, root, min, max);
    }
    count
}
