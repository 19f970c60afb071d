//! Extent-aware leaf operations: bounded removal with extent splitting
//! and insertion that overwrites overlapping extents.

use std::cmp::Ordering;

use log::trace;

use crate::cache::PageCache;
use crate::config::NodeShape;
use crate::node::{self, SearchOutcome};
use crate::ops::KeyOps;

use super::{ExtentOps, Xt};

/// Overflow slot for [`leaf_remove_range`]: when removing the interior
/// of an extent splits it in three inside a full leaf, the trailing
/// sub-extent has nowhere to go and spills here. At most one sub-extent
/// can ever spill, and only when the removed range lies entirely within
/// a single extent.
pub(super) struct Spill {
    pub key: Vec<u8>,
    pub rcrd: Vec<u8>,
    pub set: bool,
}

impl Spill {
    pub(super) fn new(shape: &NodeShape) -> Spill {
        Spill {
            key: vec![0; shape.key_size],
            rcrd: vec![0; shape.val_size],
            set: false,
        }
    }
}

/// Write the largest covered offset of the node into `out`: the end
/// offset of the last extent for leaves, the last key for index nodes.
pub(super) fn max_ofs<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
    out: &mut [u8],
) {
    let last = node::used(data) - 1;
    if node::is_leaf(data) {
        let (key, rcrd) = node::kth_leaf_entry(&tree.shape, data, last);
        tree.ops.0.end_offset(key, rcrd, out);
    } else {
        out.copy_from_slice(node::kth_key(&tree.shape, data, last));
    }
}

/// Fullness for the insert path. A leaf keeps two slots in reserve so
/// the sub-extents an insert can leave behind always fit.
pub(super) fn is_full_for_insert<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
) -> bool {
    let max = node::max_ent(&tree.shape, data);
    if node::is_leaf(data) {
        node::used(data) > max - 2
    } else {
        node::used(data) == max
    }
}

/// Is the node, end offsets included, fully inside `[min, max]`?
pub(super) fn covered<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
    min: &[u8],
    max: &[u8],
) -> bool {
    let x = &tree.ops.0;
    if x.compare(min, node::min_key(&tree.shape, data)) == Ordering::Greater {
        return false;
    }
    let mut end = vec![0; tree.shape.key_size];
    max_ofs(tree, data, &mut end);
    x.compare(&end, max) != Ordering::Greater
}

/// Sum of the extent lengths of a leaf.
pub(super) fn leaf_length<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    data: &[u8],
) -> u64 {
    let mut total = 0;
    for i in 0..node::used(data) {
        let (key, rcrd) = node::kth_leaf_entry(&tree.shape, data, i);
        total += tree.ops.0.length(key, rcrd);
    }
    total
}

/// Remove the part of the extent at position `k` lying inside
/// `[min, max]`. The extent splits into up to three pieces; the middle
/// one is released and its length returned, the outer ones go back into
/// the leaf. With `one_subextent_at_most` the caller guarantees at most
/// one piece survives; otherwise a full leaf routes the trailing piece
/// into `spill`.
fn remove_part<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    data: &mut [u8],
    min: &[u8],
    max: &[u8],
    k: usize,
    one_subextent_at_most: bool,
    spill: Option<&mut Spill>,
) -> u64 {
    let x = &tree.ops.0;
    let shape = &tree.shape;

    let (_, [before, middle, after]) = {
        let (key, rcrd) = node::kth_leaf_entry(shape, data, k);
        trace!(
            "remove_part: range=[{},{}] ext={}",
            x.format(min),
            x.format(max),
            x.format_record(key, rcrd)
        );
        x.bound_split(key, rcrd, min, max)
    };

    let middle = middle.expect("removed range intersects the extent");
    let removed = x.length(&middle.key, &middle.rcrd);
    x.release(wu, &middle.key, &middle.rcrd);

    match (before, after) {
        (None, None) => {
            // The whole extent fell inside the range.
            node::shuffle_remove(data, k);
        }
        (Some(e), None) | (None, Some(e)) => {
            node::replace_kth_key(shape, data, k, &e.key);
            node::replace_leaf_value(shape, data, k, &e.rcrd);
        }
        (Some(b), Some(a)) => {
            assert!(!one_subextent_at_most, "split in three where one piece was promised");
            node::replace_kth_key(shape, data, k, &b.key);
            node::replace_leaf_value(shape, data, k, &b.rcrd);

            if node::used(data) < node::max_ent(shape, data) {
                node::alloc_new_leaf_entry(shape, data, &a.key, &a.rcrd);
                node::shuffle_insert(data, k + 1);
            } else {
                let spill = spill.expect("full leaf removal without a spill slot");
                assert!(!spill.set);
                spill.set = true;
                spill.key.copy_from_slice(&a.key);
                spill.rcrd.copy_from_slice(&a.rcrd);
            }
        }
    }
    removed
}

/// Remove everything inside `[min, max]` from a leaf. Partially covered
/// edge extents are chopped, fully covered interior ones released
/// whole. Returns the total length removed.
pub(super) fn leaf_remove_range<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    data: &mut [u8],
    min: &[u8],
    max: &[u8],
    spill: Option<&mut Spill>,
) -> u64 {
    let ctx = tree.ctx();
    debug_assert!(node::is_leaf(data));
    if let Some(s) = &spill {
        assert!(!s.set);
    }

    let Some(min_loc) = ctx.lookup_ge(data, min) else {
        return 0;
    };
    let Some(max_loc) = ctx.lookup_le(data, max) else {
        return 0;
    };
    if min_loc > max_loc {
        return 0;
    }
    trace!("leaf_remove_range: entries [{},{}]", min_loc, max_loc);

    if min_loc == max_loc {
        // The range touches a single extent, which may split in three.
        return remove_part(tree, wu, data, min, max, min_loc, false, spill);
    }

    // Work downward: removing a low entry shuffles the higher ones and
    // would invalidate the computed positions.
    let mut removed = remove_part(tree, wu, data, min, max, max_loc, true, None);

    if min_loc + 1 <= max_loc - 1 {
        for i in min_loc + 1..=max_loc - 1 {
            let (key, rcrd) = node::kth_leaf_entry(&tree.shape, data, i);
            removed += tree.ops.0.length(key, rcrd);
            tree.ops.0.release(wu, key, rcrd);
        }
        node::shuffle_remove_range(data, min_loc + 1, max_loc - 1);
    }

    removed += remove_part(tree, wu, data, min, max, min_loc, true, None);
    removed
}

/// Insert an extent into a leaf that is not full-for-insert: remove all
/// overlapping parts of existing extents, then place the new one.
/// Returns the overwritten length.
pub(super) fn insert_into_leaf<C: PageCache, X: ExtentOps<C::Wu>>(
    tree: &Xt<C, X>,
    wu: &C::Wu,
    data: &mut [u8],
    key: &[u8],
    rcrd: &[u8],
) -> u64 {
    let ctx = tree.ctx();
    let x = &tree.ops.0;
    let shape = &tree.shape;
    debug_assert!(node::is_leaf(data));
    trace!(
        "insert_into_leaf: ext={} used={}",
        x.format_record(key, rcrd),
        node::used(data)
    );

    if node::used(data) == 0 {
        node::alloc_new_leaf_entry(shape, data, key, rcrd);
        return 0;
    }

    // Above everything present: append.
    let mut tmp = vec![0; shape.key_size];
    max_ofs(tree, data, &mut tmp);
    if x.compare(key, &tmp) == Ordering::Greater {
        node::alloc_new_leaf_entry(shape, data, key, rcrd);
        return 0;
    }

    // Clear the overlap, then insert.
    x.end_offset(key, rcrd, &mut tmp);
    let overwritten = leaf_remove_range(tree, wu, data, key, &tmp, None);
    debug_assert!(node::used(data) < node::max_ent(shape, data));

    let b = shape.min_ent;
    if node::is_root(data) || node::used(data) >= b - 1 {
        let insert_at = match ctx.search_in_node(data, key) {
            SearchOutcome::Found(_) => unreachable!("overlap was just removed"),
            SearchOutcome::NotFound { insert_at, .. } => insert_at,
        };
        node::alloc_new_leaf_entry(shape, data, key, rcrd);
        node::shuffle_insert(data, insert_at);
    } else {
        // The overlap removal drove the leaf below its minimum; divide
        // the new extent into enough pieces to fill back up to b.
        let pieces = b - node::used(data);
        trace!("insert_into_leaf: subdividing into {} extents", pieces);
        let subs = x.split_into_sub(key, rcrd, pieces);
        debug_assert_eq!(subs.len(), pieces);
        // Insert in descending order so the pieces land ascending.
        for e in subs.iter().rev() {
            let insert_at = match ctx.search_in_node(data, &e.key) {
                SearchOutcome::Found(_) => unreachable!("pieces are disjoint from the leaf"),
                SearchOutcome::NotFound { insert_at, .. } => insert_at,
            };
            node::alloc_new_leaf_entry(shape, data, &e.key, &e.rcrd);
            node::shuffle_insert(data, insert_at);
        }
    }
    overwritten
}
