//! Single-key insertion with a pro-active split policy.
//!
//! Every full node met on the way down is split before descending into
//! it, so the insert at the leaf can split at most the leaf itself and
//! never ripples upward past its direct parent. Locks are taken in
//! write mode, coupled father/child, and released strictly top-down.

use std::cmp::Ordering;

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, SearchOutcome};
use crate::ops::{DataOps, KeyOps};

use super::Bpt;

/// Insert into a leaf with room to spare. Returns whether an existing
/// value was replaced.
pub(super) fn leaf_insert<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    leaf: &mut C::Handle,
    key: &[u8],
    value: &[u8],
) -> bool {
    let ctx = tree.ctx();
    match ctx.search_in_node(leaf.data(), key) {
        SearchOutcome::Found(k) => {
            {
                let (_, old) = node::kth_leaf_entry(ctx.shape, leaf.data(), k);
                tree.ops.data.release(wu, old);
            }
            node::replace_leaf_value(ctx.shape, leaf.data_mut(), k, value);
            true
        }
        SearchOutcome::NotFound { insert_at, .. } => {
            assert!(node::used(leaf.data()) < node::max_ent(ctx.shape, leaf.data()));
            node::alloc_new_leaf_entry(ctx.shape, leaf.data_mut(), key, value);
            node::shuffle_insert(leaf.data_mut(), insert_at);
            false
        }
    }
}

pub(super) fn insert<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    key: &[u8],
    value: &[u8],
) -> bool {
    let ctx = tree.ctx();
    let mut root = tree.lock_root_xl(wu);

    if node::is_full(ctx.shape, root.data()) {
        ctx.split_root(wu, &mut root);
    }

    if node::is_leaf(root.data()) {
        // The tree is only a root; a full one was split above.
        debug_assert!(!node::is_full(ctx.shape, root.data()));
        let replaced = leaf_insert(tree, wu, &mut root, key, value);
        ctx.release(wu, root);
        return replaced;
    }

    ctx.correct_min_key(root.data_mut(), key);
    let mut father = root;

    loop {
        let (child_addr, idx) = ctx
            .index_lookup_key(father.data(), key)
            .expect("minimum key was corrected, the lookup cannot miss");
        let mut child = ctx.get_for_write(wu, child_addr, Some((&mut father, idx)));

        if node::is_leaf(child.data()) {
            if !node::is_full(ctx.shape, child.data()) {
                let replaced = leaf_insert(tree, wu, &mut child, key, value);
                ctx.release(wu, father);
                ctx.release(wu, child);
                return replaced;
            }

            debug_assert!(!node::is_root(child.data()));
            let mut right = ctx.split(wu, &mut child);
            let replaced = if tree.ops.keys.compare(key, node::min_key(ctx.shape, right.data()))
                == Ordering::Less
            {
                leaf_insert(tree, wu, &mut child, key, value)
            } else {
                leaf_insert(tree, wu, &mut right, key, value)
            };
            ctx.index_replace_w2(&mut father, idx, &child, &right);
            ctx.release(wu, father);
            ctx.release(wu, child);
            ctx.release(wu, right);
            return replaced;
        }

        ctx.correct_min_key(child.data_mut(), key);
        if node::is_full(ctx.shape, child.data()) {
            // Splitting here cannot split the father: it was split on
            // the previous level if it was full.
            debug_assert!(!node::is_root(child.data()));
            let right = ctx.split(wu, &mut child);
            ctx.index_replace_w2(&mut father, idx, &child, &right);
            if tree.ops.keys.compare(key, node::min_key(ctx.shape, right.data())) == Ordering::Less
            {
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
