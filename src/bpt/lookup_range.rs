//! Range lookup: a loop around a mini-lookup that harvests one leaf (or
//! two, when the range straddles a child boundary) per descent.
//!
//! The descent read-locks father and child. When the lower-bound child
//! might not contain the range start, the sibling holding the upper
//! bound is read-locked as well and kept pinned until leaf processing
//! finishes, so no matching entry can slip between the two. The outer
//! loop advances a cursor past the largest key found so far; only cursor
//! stability is guaranteed against concurrent writers.

use std::cmp::Ordering;

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, ops::Ctx};
use crate::ops::{DataOps, KeyOps};

use super::Bpt;

pub(super) struct RangeDst<'a> {
    pub max_keys: usize,
    pub keys_out: &'a mut [u8],
    pub data_out: Option<&'a mut [u8]>,
    pub found: usize,
}

/// Does `data` hold any key greater or equal to `probe`?
fn check_in_bounds<C: PageCache>(ctx: Ctx<C>, data: &[u8], probe: &[u8]) -> bool {
    ctx.ops.compare_keys(probe, node::max_key(ctx.shape, data)) != Ordering::Greater
}

/// Copy the entries of a leaf lying in `[min_key, max_key]` into the
/// output buffers. Returns whether anything in the node matched.
fn search_in_leaf<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    data: &[u8],
    min_key: &[u8],
    max_key: &[u8],
    dst: &mut RangeDst<'_>,
) -> bool {
    let ctx = tree.ctx();
    debug_assert!(node::is_leaf(data));
    debug_assert!(dst.found < dst.max_keys);

    let Some(lo) = ctx.lookup_ge(data, min_key) else {
        return false;
    };
    let Some(hi) = ctx.lookup_le(data, max_key) else {
        return false;
    };
    if lo > hi {
        return false;
    }

    let ks = ctx.shape.key_size;
    let vs = ctx.shape.val_size;
    for i in lo..=hi {
        if dst.found >= dst.max_keys {
            break;
        }
        let (key, value) = node::kth_leaf_entry(ctx.shape, data, i);
        dst.keys_out[dst.found * ks..(dst.found + 1) * ks].copy_from_slice(key);
        if let Some(out) = dst.data_out.as_deref_mut() {
            out[dst.found * vs..(dst.found + 1) * vs].copy_from_slice(value);
        }
        dst.found += 1;
    }
    true
}

/// Descend from an already read-locked `node` straight towards
/// `min_key` and harvest the leaf. Used for the pinned upper-bound
/// sibling of a mini-lookup.
fn simple_descent<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    node_h: C::Handle,
    min_key: &[u8],
    max_key: &[u8],
    dst: &mut RangeDst<'_>,
) -> bool {
    let ctx = tree.ctx();

    if node::is_leaf(node_h.data()) {
        let rc = search_in_leaf(tree, node_h.data(), min_key, max_key, dst);
        ctx.release(wu, node_h);
        return rc;
    }

    let mut father = node_h;
    loop {
        let addr = match ctx.index_lookup_key(father.data(), min_key) {
            Some((addr, _)) => addr,
            // The range starts below this subtree; enter its leftmost child.
            None => node::kth_child_addr(ctx.shape, father.data(), 0),
        };
        let child = ctx.get_for_read(wu, addr);

        if node::is_leaf(child.data()) {
            let rc = search_in_leaf(tree, child.data(), min_key, max_key, dst);
            ctx.release(wu, child);
            ctx.release(wu, father);
            return rc;
        }
        ctx.release(wu, father);
        father = child;
    }
}

/// One bounded lookup: descend towards `min_key`, keep the upper-bound
/// sibling pinned while the target leaf is read, then sweep the sibling
/// too if it was kept.
fn mini_lookup<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    min_key: &[u8],
    max_key: &[u8],
    dst: &mut RangeDst<'_>,
) -> bool {
    let ctx = tree.ctx();
    let root = tree.lock_root_sl(wu);

    if node::is_leaf(root.data()) {
        let rc = search_in_leaf(tree, root.data(), min_key, max_key, dst);
        ctx.release(wu, root);
        return rc;
    }

    let mut father = root;
    let mut hi_pin: Option<C::Handle> = None;

    let mut rc = loop {
        let loc_lo = ctx.lookup_le(father.data(), min_key);
        let loc_hi = ctx.lookup_ge(father.data(), min_key);
        assert!(loc_lo.is_some() || loc_hi.is_some());
        let lo = loc_lo.or(loc_hi).unwrap();
        let hi = loc_hi.or(loc_lo).unwrap();

        // Assume the lower bound points the right way.
        let child = ctx.get_for_read(wu, node::kth_child_addr(ctx.shape, father.data(), lo));

        if check_in_bounds(ctx, child.data(), min_key) {
            // The child certainly holds the range start; the upper
            // bound cannot contribute anything the child misses.
            if let Some(h) = hi_pin.take() {
                ctx.release(wu, h);
            }
        } else if hi != lo {
            // The range start may live in the next sibling. Hold a read
            // lock on it until leaf processing is over.
            if let Some(h) = hi_pin.take() {
                ctx.release(wu, h);
            }
            hi_pin =
                Some(ctx.get_for_read(wu, node::kth_child_addr(ctx.shape, father.data(), hi)));
        }

        if node::is_leaf(child.data()) {
            let rc = search_in_leaf(tree, child.data(), min_key, max_key, dst);
            ctx.release(wu, father);
            ctx.release(wu, child);
            break rc;
        }
        ctx.release(wu, father);
        father = child;
    };

    if let Some(h) = hi_pin {
        // The low path may have missed the start; sweep the pinned
        // sibling as well.
        rc |= simple_descent(tree, wu, h, min_key, max_key, dst);
    }
    rc
}

pub(super) fn lookup_range<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    min_key: &[u8],
    max_key: &[u8],
    max_keys: usize,
    keys_out: &mut [u8],
    data_out: Option<&mut [u8]>,
) -> usize {
    let ks = tree.shape.key_size;
    let mut dst = RangeDst { max_keys, keys_out, data_out, found: 0 };

    if max_keys == 0 || tree.ops.keys.compare(min_key, max_key) == Ordering::Greater {
        return 0;
    }

    let mut cursor = min_key.to_vec();
    while dst.found < dst.max_keys {
        if !mini_lookup(tree, wu, &cursor, max_key, &mut dst) {
            break;
        }
        // Move the cursor one past the largest key found so far.
        debug_assert!(dst.found > 0);
        let last = dst.keys_out[(dst.found - 1) * ks..dst.found * ks].to_vec();
        tree.ops.keys.inc(&last, &mut cursor);
    }
    dst.found
}
