//! Extent range removal: the three-phase algorithm of the key/value
//! flavor, counting removed length instead of keys.
//!
//! Two extent-specific twists. Edge extents straddling the bounds are
//! chopped rather than dropped, which can split one extent into three
//! pieces; in a full leaf the trailing piece spills into a side slot and
//! is re-inserted once restoration is done. And leaf coverage is judged
//! by end offsets, not start keys.

use std::cmp::Ordering;

use log::trace;

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, restore};
use crate::ops::KeyOps;

use super::{insert_range, leaf, ExtentOps, Xt};

/// Phase one. Returns the removed length and whether the whole subtree
/// under `h` should vanish. `spill` is threaded down single-child paths
/// only; a spill can only arise when the entire range lies inside one
/// extent of one full leaf.
fn remove_phase<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    h: &mut C::Handle,
    min: &[u8],
    max: &[u8],
    mut spill: Option<&mut leaf::Spill>,
) -> (u64, bool) {
    let ctx = tree.ctx();

    if node::is_leaf(h.data()) {
        if leaf::covered(tree, h.data(), min, max) {
            return (leaf::leaf_length(tree, h.data()), true);
        }
        return (
            leaf::leaf_remove_range(tree, wu, h.data_mut(), min, max, spill),
            false,
        );
    }

    let min_loc = ctx.lookup_le(h.data(), min).unwrap_or(0);
    let Some(mut max_loc) = ctx.lookup_le(h.data(), max) else {
        return (0, false);
    };
    if min_loc == max_loc + 1 {
        max_loc = min_loc;
    }

    let single_child = min_loc == max_loc;
    let mut removed = 0;
    let mut del_range: Option<(usize, usize)> = None;
    for i in min_loc..=max_loc {
        let child_addr = node::kth_child_addr(ctx.shape, h.data(), i);
        let mut child = ctx.get_for_write(wu, child_addr, Some((&mut *h, i)));
        let child_spill = if single_child { spill.as_deref_mut() } else { None };
        let (len, rmv_child) = remove_phase(tree, wu, &mut child, min, max, child_spill);
        removed += len;
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
        Some((0, e)) if e == used - 1 => return (removed, true),
        Some((s, e)) => {
            for i in s..=e {
                let child_addr = node::kth_child_addr(ctx.shape, h.data(), i);
                let child = ctx.get_for_read(wu, child_addr);
                ctx.delete_subtree(wu, child);
            }
            node::shuffle_remove_range(h.data_mut(), s, e);
        }
    }
    (removed, false)
}

/// Deallocate every subtree below an index root and clear its entries.
fn delete_all<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
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

pub(super) fn remove_range<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    min: &[u8],
    max: &[u8],
) -> u64 {
    let ctx = tree.ctx();
    if tree.ops.0.compare(min, max) == Ordering::Greater {
        return 0;
    }

    let mut root = tree.lock_root_xl(wu);
    if node::used(root.data()) == 0 {
        ctx.release(wu, root);
        return 0;
    }

    let mut spill = leaf::Spill::new(&tree.shape);
    let removed;

    if node::is_leaf(root.data()) {
        removed =
            leaf::leaf_remove_range(tree, wu, root.data_mut(), min, max, Some(&mut spill));
        ctx.release(wu, root);
    } else {
        let (len, rmv_all) = remove_phase(tree, wu, &mut root, min, max, Some(&mut spill));
        removed = len;
        if len == 0 {
            debug_assert!(!spill.set);
            ctx.release(wu, root);
        } else if rmv_all {
            delete_all(tree, wu, &mut root);
            node::set_leaf(root.data_mut(), true);
            ctx.release(wu, root);
        } else {
            assert!(node::used(root.data()) > 0);
            restore::restore(ctx, wu, root, min, max);
        }
    }

    if spill.set {
        // The trailing piece of a split extent had no room in its full
        // leaf; put it back now that the tree is whole. Its length was
        // never counted as removed.
        trace!(
            "remove_range: re-inserting spilled ext={}",
            tree.ops.0.format_record(&spill.key, &spill.rcrd)
        );
        let overwritten = insert_range::insert_range(tree, wu, &spill.key, &spill.rcrd);
        debug_assert_eq!(overwritten, 0);
    }
    removed
}
