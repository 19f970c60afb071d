//! Extent range lookup. Same descent as the key/value flavor; the
//! difference is in the leaf: the first and last matching extents may
//! straddle the bounds and only their intersection with the range is
//! copied out.

use std::cmp::Ordering;

use crate::cache::{NodeHandle, PageCache};
use crate::node;
use crate::ops::KeyOps;

use super::{leaf, ExtentOps, Xt};

struct RangeDst<'a> {
    max_extents: usize,
    keys_out: &'a mut [u8],
    rcrds_out: &'a mut [u8],
    found: usize,
}

/// Chop `(key, rcrd)` to `[min_key, max_key]` and append the
/// intersection to the output, capacity permitting.
fn copy_partial_ext<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    key: &[u8],
    rcrd: &[u8],
    min_key: &[u8],
    max_key: &[u8],
    dst: &mut RangeDst<'_>,
) {
    if dst.found == dst.max_extents {
        return;
    }
    let (_, [_, middle, _]) = tree.ops.0.bound_split(key, rcrd, min_key, max_key);
    let middle = middle.expect("extent intersects the range");

    let ks = tree.shape.key_size;
    let vs = tree.shape.val_size;
    dst.keys_out[dst.found * ks..(dst.found + 1) * ks].copy_from_slice(&middle.key);
    dst.rcrds_out[dst.found * vs..(dst.found + 1) * vs].copy_from_slice(&middle.rcrd);
    dst.found += 1;
}

/// Does the node cover any offset at or above `probe`?
fn check_in_bounds<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
    probe: &[u8],
) -> bool {
    let mut end = vec![0; tree.shape.key_size];
    leaf::max_ofs(tree, data, &mut end);
    tree.ops.0.compare(probe, &end) != Ordering::Greater
}

/// Harvest the extents of a leaf intersecting `[min_key, max_key]`.
fn search_in_leaf<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
    min_key: &[u8],
    max_key: &[u8],
    dst: &mut RangeDst<'_>,
) -> bool {
    let ctx = tree.ctx();
    debug_assert!(node::is_leaf(data));
    debug_assert!(dst.found < dst.max_extents);

    let Some(lo) = ctx.lookup_ge(data, min_key) else {
        return false;
    };
    let Some(hi) = ctx.lookup_le(data, max_key) else {
        return false;
    };
    if lo > hi {
        return false;
    }

    // The edge extents may partially overlap the range.
    {
        let (key, rcrd) = node::kth_leaf_entry(&tree.shape, data, lo);
        copy_partial_ext(tree, key, rcrd, min_key, max_key, dst);
    }
    if lo == hi {
        return true;
    }

    // The interior extents lie fully inside; copy them verbatim.
    let ks = tree.shape.key_size;
    let vs = tree.shape.val_size;
    for i in lo + 1..hi {
        if dst.found >= dst.max_extents {
            break;
        }
        let (key, rcrd) = node::kth_leaf_entry(&tree.shape, data, i);
        dst.keys_out[dst.found * ks..(dst.found + 1) * ks].copy_from_slice(key);
        dst.rcrds_out[dst.found * vs..(dst.found + 1) * vs].copy_from_slice(rcrd);
        dst.found += 1;
    }

    {
        let (key, rcrd) = node::kth_leaf_entry(&tree.shape, data, hi);
        copy_partial_ext(tree, key, rcrd, min_key, max_key, dst);
    }
    true
}

fn simple_descent<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
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
            None => node::kth_child_addr(&tree.shape, father.data(), 0),
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

fn mini_lookup<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
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

        let child = ctx.get_for_read(wu, node::kth_child_addr(&tree.shape, father.data(), lo));

        if check_in_bounds(tree, child.data(), min_key) {
            if let Some(h) = hi_pin.take() {
                ctx.release(wu, h);
            }
        } else if hi != lo {
            if let Some(h) = hi_pin.take() {
                ctx.release(wu, h);
            }
            hi_pin =
                Some(ctx.get_for_read(wu, node::kth_child_addr(&tree.shape, father.data(), hi)));
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
        rc |= simple_descent(tree, wu, h, min_key, max_key, dst);
    }
    rc
}

pub(super) fn lookup_range<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    min_key: &[u8],
    max_key: &[u8],
    max_extents: usize,
    keys_out: &mut [u8],
    rcrds_out: &mut [u8],
) -> usize {
    let x = &tree.ops.0;
    let ks = tree.shape.key_size;
    let vs = tree.shape.val_size;
    let mut dst = RangeDst { max_extents, keys_out, rcrds_out, found: 0 };

    if max_extents == 0 || x.compare(min_key, max_key) == Ordering::Greater {
        return 0;
    }

    let mut cursor = min_key.to_vec();
    while dst.found < dst.max_extents {
        if !mini_lookup(tree, wu, &cursor, max_key, &mut dst) {
            break;
        }
        // Advance one past the end of the last extent found.
        debug_assert!(dst.found > 0);
        let last_key = dst.keys_out[(dst.found - 1) * ks..dst.found * ks].to_vec();
        let last_rcrd = dst.rcrds_out[(dst.found - 1) * vs..dst.found * vs].to_vec();
        let mut end = vec![0; ks];
        x.end_offset(&last_key, &last_rcrd, &mut end);
        x.inc(&end, &mut cursor);

        if x.compare(&cursor, max_key) == Ordering::Greater {
            break;
        }
    }
    dst.found
}
