//! Range insertion: the caller provides a dense, sorted run of pairs and
//! a loop fills one leaf per descent.
//!
//! Each descent behaves like a single-key insert (pro-active splits,
//! write-mode lock coupling) but tracks the upper bound of the target
//! leaf: initially one past the last key, narrowed to the next index key
//! on every level and on every split. The pairs below the bound go into
//! the leaf in one pass.

use std::cmp::Ordering;

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, SearchOutcome};
use crate::ops::{DataOps, KeyOps};

use super::Bpt;

/// Append pairs `from..` at the end of a leaf while room remains.
/// Returns the number of pairs appended.
fn alloc_array_at_end<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    leaf: &mut C::Handle,
    keys: &[u8],
    vals: &[u8],
    from: usize,
) -> usize {
    let ks = tree.shape.key_size;
    let vs = tree.shape.val_size;
    let length = keys.len() / ks;
    let max_ent = node::max_ent(&tree.shape, leaf.data());

    let mut n = 0;
    for i in from..length {
        if node::used(leaf.data()) >= max_ent {
            break;
        }
        node::alloc_new_leaf_entry(
            &tree.shape,
            leaf.data_mut(),
            &keys[i * ks..(i + 1) * ks],
            &vals[i * vs..(i + 1) * vs],
        );
        n += 1;
    }
    n
}

/// Insert as many consecutive pairs as fit into a non-full leaf.
/// Returns `(overwritten, inserted)`.
fn insert_array_into_leaf<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    leaf: &mut C::Handle,
    keys: &[u8],
    vals: &[u8],
) -> (usize, usize) {
    let ctx = tree.ctx();
    let ks = ctx.shape.key_size;
    let vs = ctx.shape.val_size;
    let length = keys.len() / ks;
    debug_assert!(length > 0);
    debug_assert!(node::is_leaf(leaf.data()));
    let max_ent = node::max_ent(ctx.shape, leaf.data());

    let mut overwritten = 0;
    let mut inserted = 0;

    'done: {
        if node::used(leaf.data()) == 0 {
            inserted += alloc_array_at_end(tree, leaf, keys, vals, 0);
            break 'done;
        }

        // All new keys above the node: append.
        let key0 = &keys[..ks];
        if tree.ops.keys.compare(key0, node::max_key(ctx.shape, leaf.data())) == Ordering::Greater
        {
            inserted += alloc_array_at_end(tree, leaf, keys, vals, 0);
            break 'done;
        }

        // The run starts inside the node; walk both in step.
        let mut loc = match ctx.search_in_node(leaf.data(), key0) {
            SearchOutcome::Found(k) => k,
            SearchOutcome::NotFound { insert_at, .. } => insert_at,
        };
        let mut i = 0;
        while i < length && loc < node::used(leaf.data()) {
            let key_i = &keys[i * ks..(i + 1) * ks];
            let val_i = &vals[i * vs..(i + 1) * vs];
            match tree.ops.keys.compare(key_i, node::kth_key(ctx.shape, leaf.data(), loc)) {
                Ordering::Equal => {
                    {
                        let (_, old) = node::kth_leaf_entry(ctx.shape, leaf.data(), loc);
                        tree.ops.data.release(wu, old);
                    }
                    node::replace_leaf_value(ctx.shape, leaf.data_mut(), loc, val_i);
                    overwritten += 1;
                }
                Ordering::Greater => unreachable!("input run is dense and sorted"),
                Ordering::Less => {
                    if node::used(leaf.data()) == max_ent {
                        break 'done;
                    }
                    node::alloc_new_leaf_entry(ctx.shape, leaf.data_mut(), key_i, val_i);
                    node::shuffle_insert(leaf.data_mut(), loc);
                }
            }
            inserted += 1;
            i += 1;
            loc += 1;
        }

        if i < length {
            // Ran off the node contents; append the rest.
            inserted += alloc_array_at_end(tree, leaf, keys, vals, i);
        }
    }

    debug_assert!(inserted > 0);
    (overwritten, inserted)
}

/// How many keys of the run sort strictly below `hi_key`.
fn chop<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    keys: &[u8],
    hi_key: &[u8],
) -> usize {
    let ks = tree.shape.key_size;
    let length = keys.len() / ks;
    debug_assert!(length > 0);

    if tree.ops.keys.compare(&keys[(length - 1) * ks..], hi_key) == Ordering::Less {
        return length;
    }
    for i in 0..length {
        if tree.ops.keys.compare(&keys[i * ks..(i + 1) * ks], hi_key) != Ordering::Less {
            return i;
        }
    }
    unreachable!("some key reaches the bound");
}

/// Narrow `hi_key` to the node's minimum when the minimum is lower.
fn update_hi_key<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    data: &[u8],
    hi_key: &mut [u8],
) {
    let min = node::min_key(&tree.shape, data);
    if tree.ops.keys.compare(hi_key, min) == Ordering::Greater {
        hi_key.copy_from_slice(min);
    }
}

/// One bounded descent that fills a single leaf. Returns the number of
/// overwritten keys and advances `*inserted` past the consumed pairs.
fn fill_single_leaf<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    keys: &[u8],
    vals: &[u8],
    inserted: &mut usize,
) -> usize {
    let ctx = tree.ctx();
    let ks = ctx.shape.key_size;
    let vs = ctx.shape.val_size;
    let length = keys.len() / ks;
    let min_key = &keys[..ks];

    let mut root = tree.lock_root_xl(wu);

    // The bound starts one past the run; it only restricts once index
    // keys are known.
    let mut hi_bound = vec![0u8; ks];
    tree.ops.keys.inc(&keys[(length - 1) * ks..], &mut hi_bound);

    if node::is_full(ctx.shape, root.data()) {
        ctx.split_root(wu, &mut root);
    }

    if node::is_leaf(root.data()) {
        let (ov, ins) = insert_array_into_leaf(tree, wu, &mut root, keys, vals);
        ctx.release(wu, root);
        *inserted += ins;
        return ov;
    }

    ctx.correct_min_key(root.data_mut(), min_key);
    let mut father = root;

    loop {
        let (child_addr, idx) = ctx
            .index_lookup_key(father.data(), min_key)
            .expect("minimum key was corrected, the lookup cannot miss");
        if idx + 1 < node::used(father.data()) {
            hi_bound.copy_from_slice(node::kth_key(ctx.shape, father.data(), idx + 1));
        }
        let mut child = ctx.get_for_write(wu, child_addr, Some((&mut father, idx)));

        if node::is_leaf(child.data()) {
            if !node::is_full(ctx.shape, child.data()) {
                let eligible = chop(tree, keys, &hi_bound);
                debug_assert!(eligible > 0);
                let (ov, ins) = insert_array_into_leaf(
                    tree,
                    wu,
                    &mut child,
                    &keys[..eligible * ks],
                    &vals[..eligible * vs],
                );
                ctx.release(wu, father);
                ctx.release(wu, child);
                *inserted += ins;
                return ov;
            }

            debug_assert!(!node::is_root(child.data()));
            let mut right = ctx.split(wu, &mut child);
            let into_right = tree.ops.keys.compare(min_key, node::min_key(ctx.shape, right.data()))
                != Ordering::Less;
            if !into_right {
                update_hi_key(tree, right.data(), &mut hi_bound);
            }
            let eligible = chop(tree, keys, &hi_bound);
            debug_assert!(eligible > 0);
            let trg = if into_right { &mut right } else { &mut child };
            let (ov, ins) =
                insert_array_into_leaf(tree, wu, trg, &keys[..eligible * ks], &vals[..eligible * vs]);
            ctx.index_replace_w2(&mut father, idx, &child, &right);
            ctx.release(wu, father);
            ctx.release(wu, child);
            ctx.release(wu, right);
            *inserted += ins;
            return ov;
        }

        debug_assert!(!node::is_root(child.data()));
        ctx.correct_min_key(child.data_mut(), min_key);

        if node::is_full(ctx.shape, child.data()) {
            let right = ctx.split(wu, &mut child);
            ctx.index_replace_w2(&mut father, idx, &child, &right);
            if tree.ops.keys.compare(min_key, node::min_key(ctx.shape, right.data()))
                == Ordering::Less
            {
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

pub(super) fn insert_range<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    keys: &[u8],
    vals: &[u8],
) -> usize {
    let ks = tree.shape.key_size;
    let vs = tree.shape.val_size;
    let length = keys.len() / ks;
    debug_assert!(length > 0);

    let mut overwritten = 0;
    let mut consumed = 0;
    while consumed < length {
        overwritten += fill_single_leaf(
            tree,
            wu,
            &keys[consumed * ks..],
            &vals[consumed * vs..],
            &mut consumed,
        );
    }
    assert_eq!(consumed, length);
    overwritten
}
