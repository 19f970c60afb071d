//! Extent insertion: a loop around a bounded descent that places one
//! chunk of the extent per leaf.
//!
//! The descent mirrors the key/value range insert but carries a single
//! extent. An upper-bound key (one past the extent's end, narrowed on
//! every level and on every split) limits how much of the extent the
//! target leaf may take; the remainder is chopped off and re-descended.
//! Leaves reserve two slots (`used > max - 2` counts as full) so the
//! sub-extents an overwrite can leave behind always fit.

use std::cmp::Ordering;

use log::trace;

use crate::cache::{NodeHandle, PageCache};
use crate::node;
use crate::ops::KeyOps;

use super::{leaf, ExtentOps, Xt};

/// Narrow `hi_key` to the node's minimum when the minimum is lower.
fn update_hi_key<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
    hi_key: &mut [u8],
) {
    let min = node::min_key(&tree.shape, data);
    if tree.ops.0.compare(hi_key, min) == Ordering::Greater {
        hi_key.copy_from_slice(min);
    }
}

/// One bounded descent. Inserts the prefix of `(key, rcrd)` that fits
/// under the narrowing bound into a single leaf; `rcrd` is chopped to
/// that prefix in place. Returns the overwritten length and records the
/// inserted length in `len_inserted`.
fn fill_single_leaf<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    key: &[u8],
    rcrd: &mut [u8],
    len_inserted: &mut u64,
) -> u64 {
    let ctx = tree.ctx();
    let x = &tree.ops.0;
    trace!("fill_single_leaf: ext={}", x.format_record(key, rcrd));

    *len_inserted = 0;
    let mut root = tree.lock_root_xl(wu);

    // The bound starts one past the extent's end.
    let mut hi_bound = vec![0u8; tree.shape.key_size];
    x.end_offset(key, rcrd, &mut hi_bound);
    let end = hi_bound.clone();
    x.inc(&end, &mut hi_bound);

    if leaf::is_full_for_insert(tree, root.data()) {
        ctx.split_root(wu, &mut root);
    }

    if node::is_leaf(root.data()) {
        // A lone root-leaf has no sibling bound; the whole extent fits.
        let overwritten = leaf::insert_into_leaf(tree, wu, root.data_mut(), key, rcrd);
        ctx.release(wu, root);
        *len_inserted = x.length(key, rcrd);
        return overwritten;
    }

    ctx.correct_min_key(root.data_mut(), key);
    let mut father = root;

    loop {
        let (child_addr, idx) = ctx
            .index_lookup_key(father.data(), key)
            .expect("minimum key was corrected, the lookup cannot miss");
        if idx + 1 < node::used(father.data()) {
            hi_bound.copy_from_slice(node::kth_key(&tree.shape, father.data(), idx + 1));
        }
        let mut child = ctx.get_for_write(wu, child_addr, Some((&mut father, idx)));

        if node::is_leaf(child.data()) {
            if !leaf::is_full_for_insert(tree, child.data()) {
                // Chop to what this leaf may take, then insert.
                x.chop_top(key, rcrd, &hi_bound);
                *len_inserted = x.length(key, rcrd);
                let overwritten = leaf::insert_into_leaf(tree, wu, child.data_mut(), key, rcrd);
                ctx.release(wu, father);
                ctx.release(wu, child);
                return overwritten;
            }

            debug_assert!(!node::is_root(child.data()));
            let mut right = ctx.split(wu, &mut child);
            let into_right =
                x.compare(key, node::min_key(&tree.shape, right.data())) != Ordering::Less;
            if !into_right {
                update_hi_key(tree, right.data(), &mut hi_bound);
            }
            x.chop_top(key, rcrd, &hi_bound);
            *len_inserted = x.length(key, rcrd);
            debug_assert!(*len_inserted > 0);

            let overwritten = if into_right {
                leaf::insert_into_leaf(tree, wu, right.data_mut(), key, rcrd)
            } else {
                leaf::insert_into_leaf(tree, wu, child.data_mut(), key, rcrd)
            };
            ctx.index_replace_w2(&mut father, idx, &child, &right);
            ctx.release(wu, father);
            ctx.release(wu, child);
            ctx.release(wu, right);
            return overwritten;
        }

        debug_assert!(!node::is_root(child.data()));
        ctx.correct_min_key(child.data_mut(), key);

        if leaf::is_full_for_insert(tree, child.data()) {
            let right = ctx.split(wu, &mut child);
            ctx.index_replace_w2(&mut father, idx, &child, &right);
            if x.compare(key, node::min_key(&tree.shape, right.data())) == Ordering::Less {
                update_hi_key(tree, right.data(), &mut hi_bound);
                ctx.release(wu, right);
            } else {
                ctx.release(wu, child);
                child = right;
            }
        }

        ctx.release(wu, father);
        father = child;
    }
}

pub(super) fn insert_range<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    key: &[u8],
    rcrd: &[u8],
) -> u64 {
    let x = &tree.ops.0;
    let ext_len = x.length(key, rcrd);
    debug_assert!(ext_len > 0);

    let mut cur_key = key.to_vec();
    let mut cur_rcrd = rcrd.to_vec();
    let mut overwritten = 0;
    let mut total = 0;

    loop {
        let mut len_inserted = 0;
        overwritten += fill_single_leaf(tree, wu, &cur_key, &mut cur_rcrd, &mut len_inserted);
        total += len_inserted;
        debug_assert!(len_inserted > 0 && total <= ext_len);
        trace!("insert_range: {} of {} units placed", total, ext_len);

        if total == ext_len {
            return overwritten;
        }
        // Re-descend with what remains of the extent.
        cur_key.copy_from_slice(key);
        cur_rcrd.copy_from_slice(rcrd);
        x.chop_length(&mut cur_key, &mut cur_rcrd, total);
    }
}
