//! Single-key removal with a pro-active merge policy.
//!
//! Before descending into a child that holds exactly `b` entries the
//! child is fixed: entries are pulled over from a sibling with spare
//! capacity, or the child is merged with a sibling. The removal at the
//! leaf therefore never underflows anything above its direct parent.

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, SearchOutcome};
use crate::ops::{DataOps, KeyOps};

use super::Bpt;

/// Remove `key` from a single node, releasing the value when the node is
/// a leaf. Returns whether the key was present.
fn node_remove_key<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    h: &mut C::Handle,
    key: &[u8],
) -> bool {
    let ctx = tree.ctx();
    match ctx.search_in_node(h.data(), key) {
        SearchOutcome::NotFound { .. } => false,
        SearchOutcome::Found(k) => {
            if node::is_leaf(h.data()) {
                let (_, value) = node::kth_leaf_entry(ctx.shape, h.data(), k);
                tree.ops.data.release(wu, value);
            }
            node::shuffle_remove(h.data_mut(), k);
            true
        }
    }
}

/// Write-lock the neighbors of the child at position `k` in `father`.
fn get_prev_next<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    father: &mut C::Handle,
    k: usize,
) -> (Option<C::Handle>, Option<C::Handle>) {
    let ctx = tree.ctx();
    let used = node::used(father.data());
    let left = if k > 0 && k < used {
        let addr = node::kth_child_addr(ctx.shape, father.data(), k - 1);
        Some(ctx.get_for_write(wu, addr, Some((&mut *father, k - 1))))
    } else {
        None
    };
    let right = if k + 1 < used {
        let addr = node::kth_child_addr(ctx.shape, father.data(), k + 1);
        Some(ctx.get_for_write(wu, addr, Some((&mut *father, k + 1))))
    } else {
        None
    };
    (left, right)
}

/// `child` holds exactly `b` entries. Pull entries from a sibling with
/// more than `b + 1`, or merge with a sibling (the merged node holds at
/// least `2b` entries).
fn fix<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    father: &mut C::Handle,
    child: &mut C::Handle,
    kth: usize,
) {
    let ctx = tree.ctx();
    let b = ctx.shape.min_ent;
    debug_assert_eq!(node::used(child.data()), b);
    debug_assert!(!node::is_root(child.data()));
    debug_assert!(node::used(father.data()) > 1);

    let (mut left, mut right) = get_prev_next(tree, wu, father, kth);
    debug_assert!(left.is_some() || right.is_some());
    let mut done = false;

    if let Some(l) = left.as_mut() {
        if node::used(l.data()) > b + 1 {
            ctx.rebalance(child, l, false);
            let min = node::min_key(ctx.shape, child.data()).to_vec();
            node::set_kth_index_entry(ctx.shape, father.data_mut(), kth, &min, child.disk_addr());
            done = true;
        }
    }
    if !done {
        if let Some(r) = right.as_mut() {
            if node::used(r.data()) > b + 1 {
                ctx.rebalance(child, r, false);
                let min = node::min_key(ctx.shape, r.data()).to_vec();
                node::set_kth_index_entry(
                    ctx.shape,
                    father.data_mut(),
                    kth + 1,
                    &min,
                    r.disk_addr(),
                );
                done = true;
            }
        }
    }
    if !done {
        // All neighbors hold b or b+1 entries; merge with one of them.
        if let Some(l) = left.take() {
            ctx.move_and_dealloc(wu, child, l);
            let min = node::min_key(ctx.shape, child.data()).to_vec();
            node::set_kth_index_entry(ctx.shape, father.data_mut(), kth, &min, child.disk_addr());
            node::shuffle_remove(father.data_mut(), kth - 1);
        } else {
            let r = right.take().expect("minimal child has a neighbor");
            ctx.move_and_dealloc(wu, child, r);
            let min = node::min_key(ctx.shape, child.data()).to_vec();
            node::set_kth_index_entry(ctx.shape, father.data_mut(), kth, &min, child.disk_addr());
            node::shuffle_remove(father.data_mut(), kth + 1);
        }
    }

    if let Some(l) = left {
        ctx.release(wu, l);
    }
    if let Some(r) = right {
        ctx.release(wu, r);
    }
}

/// Look up the child of `father` that may hold `key` and write-lock it.
fn lookup_child<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    father: &mut C::Handle,
    key: &[u8],
) -> Option<(C::Handle, usize)> {
    let ctx = tree.ctx();
    let (addr, kth) = ctx.index_lookup_key(father.data(), key)?;
    Some((ctx.get_for_write(wu, addr, Some((&mut *father, kth))), kth))
}

pub(super) fn remove<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    key: &[u8],
) -> bool {
    let ctx = tree.ctx();
    let b = ctx.shape.min_ent;
    let mut root = tree.lock_root_xl(wu);

    if node::is_leaf(root.data()) {
        let rc = node_remove_key(tree, wu, &mut root, key);
        ctx.release(wu, root);
        return rc;
    }
    // An index root may hold as few as two entries; no fixing needed.

    let mut father = root;
    debug_assert!(node::used(father.data()) > 1);

    let Some((mut child, mut kth)) = lookup_child(tree, wu, &mut father, key) else {
        ctx.release(wu, father);
        return false;
    };

    if node::used(child.data()) == b {
        fix(tree, wu, &mut father, &mut child, kth);

        if node::used(father.data()) == 1 {
            // Fixing merged away the root's other child; pull the lone
            // child into the root and drop a level.
            ctx.copy_into_root_and_dealloc(wu, &mut father, child);
            debug_assert!(node::used(father.data()) > 2);

            if node::is_leaf(father.data()) {
                let rc = node_remove_key(tree, wu, &mut father, key);
                ctx.release(wu, father);
                return rc;
            }
            match lookup_child(tree, wu, &mut father, key) {
                None => {
                    ctx.release(wu, father);
                    return false;
                }
                Some((c, k)) => {
                    child = c;
                    kth = k;
                }
            }
        }
    }

    loop {
        debug_assert!(node::used(child.data()) >= b);
        debug_assert!(
            node::is_root(father.data()) && node::used(father.data()) > 1
                || node::used(father.data()) >= b
        );

        if node::used(child.data()) == b {
            fix(tree, wu, &mut father, &mut child, kth);
        }

        if node::is_leaf(child.data()) {
            let rc = node_remove_key(tree, wu, &mut child, key);
            ctx.release(wu, father);
            ctx.release(wu, child);
            return rc;
        }

        ctx.release(wu, father);
        father = child;
        match lookup_child(tree, wu, &mut father, key) {
            None => {
                ctx.release(wu, father);
                return false;
            }
            Some((c, k)) => {
                child = c;
                kth = k;
            }
        }
    }
}
