//! Restoration pass of range removal.
//!
//! The delete phase of a range removal may leave in-danger nodes (non-root
//! nodes with fewer than `b + 2` entries) along the paths to the smallest
//! and largest surviving keys of the removed range. This pass walks those
//! paths top-down and repairs every in-danger node by shuffling entries
//! from a sibling or merging with one. The `b + 2` margin guarantees the
//! repairs never re-create an in-danger node further up.

use log::trace;

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, ops::Ctx};

/// Outcome of hunting for problematic children below a node.
pub(crate) enum Problem<H> {
    /// Nothing left to repair below this node.
    Zero,
    /// A single problematic child, locked for write.
    One { child: H, kth: usize },
    /// Two adjacent full children that cannot be combined; the repair
    /// paths to the range edges diverge here.
    Two { left: H, right: H },
}

/// Write-lock the neighbors of the child at position `k`, where present.
fn get_prev_next<C: PageCache>(
    ctx: Ctx<C>,
    wu: &C::Wu,
    parent: &mut C::Handle,
    k: usize,
) -> (Option<C::Handle>, Option<C::Handle>) {
    let used = node::used(parent.data());
    debug_assert!(k < used);

    let left = if k > 0 {
        let addr = node::kth_child_addr(ctx.shape, parent.data(), k - 1);
        Some(ctx.get_for_write(wu, addr, Some((&mut *parent, k - 1))))
    } else {
        None
    };
    let right = if k < used - 1 {
        let addr = node::kth_child_addr(ctx.shape, parent.data(), k + 1);
        Some(ctx.get_for_write(wu, addr, Some((&mut *parent, k + 1))))
    } else {
        None
    };
    (left, right)
}

/// Bring `child` to at least `b + 2` entries by a skewed rebalance from a
/// sibling, or merge it with one. A merge yields at least `b + 1`
/// entries, which may still be short; [`wrap_fix`] calls again when so.
pub(crate) fn fix<C: PageCache>(
    ctx: Ctx<C>,
    wu: &C::Wu,
    parent: &mut C::Handle,
    child: &mut C::Handle,
    kth: usize,
) {
    let b = ctx.shape.min_ent;
    if node::used(child.data()) >= b + 2 {
        return;
    }
    debug_assert!(!node::is_root(child.data()));
    debug_assert!(node::used(parent.data()) > 1);
    trace!(
        "restore fix: kth={} parent has {} child has {}",
        kth,
        node::used(parent.data()),
        node::used(child.data())
    );

    let (mut left, mut right) = get_prev_next(ctx, wu, parent, kth);
    debug_assert!(left.is_some() || right.is_some());
    let mut done = false;

    if let Some(l) = left.as_mut() {
        if node::used(l.data()) + node::used(child.data()) >= 2 * b + 2 {
            ctx.rebalance(child, l, true);
            let min = node::min_key(ctx.shape, child.data()).to_vec();
            node::set_kth_index_entry(ctx.shape, parent.data_mut(), kth, &min, child.disk_addr());
            done = true;
        }
    }
    if !done {
        if let Some(r) = right.as_mut() {
            if node::used(r.data()) + node::used(child.data()) >= 2 * b + 2 {
                ctx.rebalance(child, r, true);
                let min = node::min_key(ctx.shape, r.data()).to_vec();
                node::set_kth_index_entry(
                    ctx.shape,
                    parent.data_mut(),
                    kth + 1,
                    &min,
                    r.disk_addr(),
                );
                done = true;
            }
        }
    }
    if !done {
        // No sibling has spare entries; merge with one. The merged node
        // holds at least b + 1 entries.
        if let Some(l) = left.take() {
            ctx.move_and_dealloc(wu, child, l);
            let min = node::min_key(ctx.shape, child.data()).to_vec();
            node::set_kth_index_entry(ctx.shape, parent.data_mut(), kth, &min, child.disk_addr());
            node::shuffle_remove(parent.data_mut(), kth - 1);
        } else {
            let r = right.take().expect("in-danger child has a neighbor");
            ctx.move_and_dealloc(wu, child, r);
            let min = node::min_key(ctx.shape, child.data()).to_vec();
            node::set_kth_index_entry(ctx.shape, parent.data_mut(), kth, &min, child.disk_addr());
            node::shuffle_remove(parent.data_mut(), kth + 1);
        }
        debug_assert!(node::used(child.data()) >= b + 1);
    }

    if let Some(l) = left {
        ctx.release(wu, l);
    }
    if let Some(r) = right {
        ctx.release(wu, r);
    }
}

/// [`fix`] until `child` leaves the danger zone; one extra call always
/// suffices. The child's position in the parent may change across the
/// first call and is re-located by key.
pub(crate) fn wrap_fix<C: PageCache>(
    ctx: Ctx<C>,
    wu: &C::Wu,
    parent: &mut C::Handle,
    child: &mut C::Handle,
    kth: usize,
) {
    fix(ctx, wu, parent, child, kth);
    if node::used(child.data()) < ctx.shape.min_ent + 2 {
        let min = node::min_key(ctx.shape, child.data()).to_vec();
        let (_, new_kth) = ctx
            .index_lookup_key(parent.data(), &min)
            .expect("child still bound in its parent");
        debug_assert_eq!(
            ctx.ops
                .compare_keys(&min, node::kth_key(ctx.shape, parent.data(), new_kth)),
            std::cmp::Ordering::Equal
        );
        fix(ctx, wu, parent, child, new_kth);
    }
    assert!(node::used(child.data()) >= ctx.shape.min_ent + 2);
}

/// Locate the children of `parent` straddling `[min, max]`: the child
/// holding keys below `min` and, when distinct, its right neighbor
/// holding keys above `max`. Both come back write-locked.
fn find_children_in_range<C: PageCache>(
    ctx: Ctx<C>,
    wu: &C::Wu,
    parent: &mut C::Handle,
    min: &[u8],
    max: &[u8],
) -> (Option<C::Handle>, Option<C::Handle>, usize) {
    debug_assert!(!node::is_leaf(parent.data()));
    let mut min_loc = ctx.lookup_le(parent.data(), min);
    let max_loc = ctx.lookup_le(parent.data(), max);
    if min_loc.is_none() {
        min_loc = max_loc;
    }

    match (min_loc, max_loc) {
        (Some(lo), Some(hi)) if lo != hi => {
            debug_assert_eq!(hi, lo + 1);
            let laddr = node::kth_child_addr(ctx.shape, parent.data(), lo);
            let left = ctx.get_for_write(wu, laddr, Some((&mut *parent, lo)));
            let raddr = node::kth_child_addr(ctx.shape, parent.data(), hi);
            let right = ctx.get_for_write(wu, raddr, Some((&mut *parent, hi)));
            (Some(left), Some(right), lo)
        }
        (Some(lo), Some(_)) => {
            let addr = node::kth_child_addr(ctx.shape, parent.data(), lo);
            let left = ctx.get_for_write(wu, addr, Some((&mut *parent, lo)));
            (Some(left), None, lo)
        }
        _ => {
            // Every key of the node is above the removed range.
            debug_assert!(min_loc.is_none() && max_loc.is_none());
            (None, None, 0)
        }
    }
}

/// Collapse the (up to two) children touching the removed range into a
/// single problematic child. Two full children that can neither merge
/// nor shift entries are reported as [`Problem::Two`] and repaired
/// independently by the caller. The boolean reports whether the tree was
/// modified.
pub(crate) fn combine_problematic_children<C: PageCache>(
    ctx: Ctx<C>,
    wu: &C::Wu,
    parent: &mut C::Handle,
    min: &[u8],
    max: &[u8],
) -> (Problem<C::Handle>, bool) {
    let b = ctx.shape.min_ent;
    let (left, right, kth) = find_children_in_range(ctx, wu, parent, min, max);

    let Some(mut left) = left else {
        return (Problem::Zero, false);
    };
    let Some(mut right) = right else {
        trace!("combine: single child in range");
        return (Problem::One { child: left, kth }, false);
    };

    trace!("combine: two children in range");
    let max_ent = node::max_ent(ctx.shape, left.data());
    if node::used(left.data()) == max_ent && node::used(right.data()) == max_ent {
        // Both full: entries can move in neither direction. The caller
        // repairs the two edge paths separately.
        return (Problem::Two { left, right }, false);
    }

    if node::used(left.data()) + node::used(right.data()) <= 2 * b + 1 {
        ctx.move_and_dealloc(wu, &mut left, right);
        let min_key = node::min_key(ctx.shape, left.data()).to_vec();
        node::set_kth_index_entry(ctx.shape, parent.data_mut(), kth, &min_key, left.disk_addr());
        node::shuffle_remove(parent.data_mut(), kth + 1);
        return (Problem::One { child: left, kth }, true);
    }

    // At least 2b + 2 entries between the two: shift the edge entry so
    // both edges of the range end up inside the smaller node.
    if node::used(left.data()) <= node::used(right.data()) {
        ctx.move_min_key(&mut left, &mut right);
        let min_key = node::min_key(ctx.shape, right.data()).to_vec();
        node::set_kth_index_entry(
            ctx.shape,
            parent.data_mut(),
            kth + 1,
            &min_key,
            right.disk_addr(),
        );
        ctx.release(wu, right);
        (Problem::One { child: left, kth }, true)
    } else {
        ctx.move_max_key(&mut right, &mut left);
        let min_key = node::min_key(ctx.shape, right.data()).to_vec();
        node::set_kth_index_entry(
            ctx.shape,
            parent.data_mut(),
            kth + 1,
            &min_key,
            right.disk_addr(),
        );
        ctx.release(wu, left);
        (Problem::One { child: right, kth: kth + 1 }, true)
    }
}

/// Repair the root until it is out of danger: collapse a single-child
/// root (or split an oversized single child), then combine and fix the
/// children overlapping the removed range. Returns the child the caller
/// continues with.
fn restore_root<C: PageCache>(
    ctx: Ctx<C>,
    wu: &C::Wu,
    root: &mut C::Handle,
    min: &[u8],
    max: &[u8],
) -> Problem<C::Handle> {
    debug_assert!(node::used(root.data()) > 0);

    loop {
        trace!("restore_root: {} entries", node::used(root.data()));
        if node::is_leaf(root.data()) {
            return Problem::Zero;
        }

        if node::used(root.data()) == 1 {
            let child_addr = node::kth_child_addr(ctx.shape, root.data(), 0);
            let mut child = ctx.get_for_write(wu, child_addr, Some((&mut *root, 0)));
            if node::used(child.data()) <= ctx.shape.max_root {
                ctx.copy_into_root_and_dealloc(wu, root, child);
            } else {
                // The child holds more entries than the root can; split
                // it and bind both halves.
                let right = ctx.split(wu, &mut child);
                ctx.index_replace_w2(root, 0, &child, &right);
                ctx.release(wu, child);
                ctx.release(wu, right);
            }
            continue;
        }

        match combine_problematic_children(ctx, wu, root, min, max) {
            (Problem::Zero, _) => return Problem::Zero,
            (two @ Problem::Two { .. }, _) => return two,
            (Problem::One { mut child, kth }, modified) => {
                if node::used(root.data()) == 1 {
                    // Combining merged away the root's other entry; loop
                    // back to collapse the root.
                    ctx.release(wu, child);
                    continue;
                }
                let mut modified = modified;
                if node::used(child.data()) < ctx.shape.min_ent + 2 {
                    fix(ctx, wu, root, &mut child, kth);
                    modified = true;
                }
                if !modified {
                    return Problem::One { child, kth };
                }
                ctx.release(wu, child);
            }
        }
    }
}

/// Walk the path towards `key` from `father` down, fixing every child on
/// the way.
fn restore_path<C: PageCache>(ctx: Ctx<C>, wu: &C::Wu, key: &[u8], mut father: C::Handle) {
    loop {
        if node::is_leaf(father.data()) {
            ctx.release(wu, father);
            return;
        }
        let Some(kth) = ctx.lookup_le(father.data(), key) else {
            ctx.release(wu, father);
            return;
        };
        let child_addr = node::kth_child_addr(ctx.shape, father.data(), kth);
        let mut child = ctx.get_for_write(wu, child_addr, Some((&mut father, kth)));
        fix(ctx, wu, &mut father, &mut child, kth);
        ctx.release(wu, father);
        father = child;
    }
}

/// Full restoration: repair the root, then descend the edge path (or
/// both paths when they diverge at two full siblings). Consumes and
/// releases the write-locked root handle.
pub(crate) fn restore<C: PageCache>(
    ctx: Ctx<C>,
    wu: &C::Wu,
    mut root: C::Handle,
    min: &[u8],
    max: &[u8],
) {
    let outcome = restore_root(ctx, wu, &mut root, min, max);
    if node::is_leaf(root.data()) {
        // Only the root remains.
        ctx.release(wu, root);
        return;
    }

    let (mut father, mut child) = match outcome {
        Problem::Zero => {
            ctx.release(wu, root);
            return;
        }
        Problem::Two { left, right } => {
            ctx.release(wu, root);
            restore_path(ctx, wu, min, left);
            restore_path(ctx, wu, max, right);
            return;
        }
        Problem::One { child, .. } => (root, child),
    };

    loop {
        trace!("restore: descending, child has {} entries", node::used(child.data()));
        if node::is_leaf(child.data()) {
            ctx.release(wu, child);
            ctx.release(wu, father);
            return;
        }

        match combine_problematic_children(ctx, wu, &mut child, min, max) {
            (Problem::Zero, _) => {
                ctx.release(wu, child);
                ctx.release(wu, father);
                return;
            }
            (Problem::Two { left, right }, _) => {
                ctx.release(wu, child);
                ctx.release(wu, father);
                restore_path(ctx, wu, min, left);
                restore_path(ctx, wu, max, right);
                return;
            }
            (Problem::One { child: mut grand, kth }, _) => {
                wrap_fix(ctx, wu, &mut child, &mut grand, kth);
                ctx.release(wu, father);
                father = child;
                child = grand;
            }
        }
    }
}
