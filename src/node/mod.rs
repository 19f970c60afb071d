//! On-page node layout and the entry-directory codec.
//!
//! Four node kinds share one layout: root-leaf, root-index, leaf and
//! index. A page starts with a one-byte flag set, a little-endian `u32`
//! count of used entries and a 256-byte directory of slot indices. Root
//! nodes append an opaque attribute buffer. The packed entry area
//! follows the header; a leaf entry is `key || value`, an index entry is
//! `key || child_addr (u64 LE)`.
//!
//! The directory gives one level of indirection: the entry at logical
//! position `k` lives in slot `dir[k]`. Insertion and removal reorder
//! slot indices only; entry payloads never move. `dir[0..used)` is a
//! permutation of a subset of the slot numbers, `dir[used..]` holds the
//! free slots that subsequent inserts reuse.

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::PageAddr;
use crate::config::{NodeShape, ATTRIBUTES_BUF_SIZE};

pub(crate) mod ops;
pub(crate) mod restore;

pub(crate) mod layout {
    use super::ATTRIBUTES_BUF_SIZE;

    pub(crate) const FLAG_ROOT: u8 = 0x1;
    pub(crate) const FLAG_LEAF: u8 = 0x2;

    pub(crate) const FLAGS_OFF: usize = 0;
    pub(crate) const USED_OFF: usize = 1;
    pub(crate) const DIR_OFF: usize = 5;
    pub(crate) const DIR_LEN: usize = 256;

    /// Header of a non-root node.
    pub(crate) const HDR_SIZE: usize = DIR_OFF + DIR_LEN;
    /// Header of a root node, attribute buffer included.
    pub(crate) const ROOT_HDR_SIZE: usize = HDR_SIZE + ATTRIBUTES_BUF_SIZE;
}

use layout::*;

pub(crate) fn is_root(data: &[u8]) -> bool {
    data[FLAGS_OFF] & FLAG_ROOT != 0
}

pub(crate) fn is_leaf(data: &[u8]) -> bool {
    data[FLAGS_OFF] & FLAG_LEAF != 0
}

pub(crate) fn set_leaf(data: &mut [u8], leaf: bool) {
    if leaf {
        data[FLAGS_OFF] |= FLAG_LEAF;
    } else {
        data[FLAGS_OFF] &= !FLAG_LEAF;
    }
}

pub(crate) fn set_root(data: &mut [u8], root: bool) {
    if root {
        data[FLAGS_OFF] |= FLAG_ROOT;
    } else {
        data[FLAGS_OFF] &= !FLAG_ROOT;
    }
}

pub(crate) fn used(data: &[u8]) -> usize {
    LittleEndian::read_u32(&data[USED_OFF..USED_OFF + 4]) as usize
}

pub(crate) fn set_used(data: &mut [u8], n: usize) {
    debug_assert!(n <= DIR_LEN);
    LittleEndian::write_u32(&mut data[USED_OFF..USED_OFF + 4], n as u32);
}

fn dir(data: &[u8], k: usize) -> usize {
    data[DIR_OFF + k] as usize
}

fn dir_set(data: &mut [u8], k: usize, slot: usize) {
    debug_assert!(slot < DIR_LEN);
    data[DIR_OFF + k] = slot as u8;
}

/// Offset of the packed entry area; depends on the root flag.
pub(crate) fn entry_area_off(data: &[u8]) -> usize {
    if is_root(data) {
        ROOT_HDR_SIZE
    } else {
        HDR_SIZE
    }
}

pub(crate) fn entry_size(shape: &NodeShape, data: &[u8]) -> usize {
    if is_leaf(data) {
        shape.leaf_ent_size
    } else {
        shape.index_ent_size
    }
}

/// Capacity of this node given its root/leaf flags.
pub(crate) fn max_ent(shape: &NodeShape, data: &[u8]) -> usize {
    if is_root(data) {
        shape.max_root
    } else if is_leaf(data) {
        shape.max_leaf
    } else {
        shape.max_index
    }
}

pub(crate) fn is_full(shape: &NodeShape, data: &[u8]) -> bool {
    used(data) == max_ent(shape, data)
}

/// Byte offset of the entry at logical position `k`.
fn entry_off(shape: &NodeShape, data: &[u8], k: usize) -> usize {
    debug_assert!(k < used(data), "entry index {} out of {}", k, used(data));
    entry_area_off(data) + dir(data, k) * entry_size(shape, data)
}

pub(crate) fn kth_key<'a>(shape: &NodeShape, data: &'a [u8], k: usize) -> &'a [u8] {
    let off = entry_off(shape, data, k);
    &data[off..off + shape.key_size]
}

pub(crate) fn kth_leaf_entry<'a>(
    shape: &NodeShape,
    data: &'a [u8],
    k: usize,
) -> (&'a [u8], &'a [u8]) {
    debug_assert!(is_leaf(data));
    let off = entry_off(shape, data, k);
    (
        &data[off..off + shape.key_size],
        &data[off + shape.key_size..off + shape.leaf_ent_size],
    )
}

pub(crate) fn kth_index_entry<'a>(
    shape: &NodeShape,
    data: &'a [u8],
    k: usize,
) -> (&'a [u8], PageAddr) {
    debug_assert!(!is_leaf(data));
    let off = entry_off(shape, data, k);
    let addr = LittleEndian::read_u64(&data[off + shape.key_size..off + shape.index_ent_size]);
    (&data[off..off + shape.key_size], addr)
}

pub(crate) fn kth_child_addr(shape: &NodeShape, data: &[u8], k: usize) -> PageAddr {
    kth_index_entry(shape, data, k).1
}

pub(crate) fn min_key<'a>(shape: &NodeShape, data: &'a [u8]) -> &'a [u8] {
    kth_key(shape, data, 0)
}

pub(crate) fn max_key<'a>(shape: &NodeShape, data: &'a [u8]) -> &'a [u8] {
    kth_key(shape, data, used(data) - 1)
}

/// Overwrite the index entry at position `k` with `(key, addr)`.
pub(crate) fn set_kth_index_entry(
    shape: &NodeShape,
    data: &mut [u8],
    k: usize,
    key: &[u8],
    addr: PageAddr,
) {
    debug_assert!(!is_leaf(data));
    let off = entry_off(shape, data, k);
    data[off..off + shape.key_size].copy_from_slice(key);
    LittleEndian::write_u64(&mut data[off + shape.key_size..off + shape.index_ent_size], addr);
}

/// Rewrite only the child address of the index entry at `k`, checking
/// that the stored address still matches `old`.
pub(crate) fn replace_kth_index_addr(
    shape: &NodeShape,
    data: &mut [u8],
    k: usize,
    old: PageAddr,
    new: PageAddr,
) {
    debug_assert!(!is_leaf(data));
    let off = entry_off(shape, data, k) + shape.key_size;
    let stored = LittleEndian::read_u64(&data[off..off + 8]);
    assert_eq!(stored, old, "stale child pointer during COW fix-up");
    LittleEndian::write_u64(&mut data[off..off + 8], new);
}

/// Overwrite only the key of the entry at position `k`.
pub(crate) fn replace_kth_key(shape: &NodeShape, data: &mut [u8], k: usize, key: &[u8]) {
    let off = entry_off(shape, data, k);
    data[off..off + shape.key_size].copy_from_slice(key);
}

/// Overwrite the value of the leaf entry at position `k`. Releasing the
/// previous value is the caller's business.
pub(crate) fn replace_leaf_value(shape: &NodeShape, data: &mut [u8], k: usize, value: &[u8]) {
    debug_assert!(is_leaf(data));
    let off = entry_off(shape, data, k) + shape.key_size;
    data[off..off + shape.val_size].copy_from_slice(value);
}

/// Write `(key, value)` into the free slot `dir[used]` and account for
/// it. The new entry sits at the logical end; a following
/// [`shuffle_insert`] moves it into place.
pub(crate) fn alloc_new_leaf_entry(shape: &NodeShape, data: &mut [u8], key: &[u8], value: &[u8]) {
    debug_assert!(is_leaf(data));
    debug_assert!(used(data) < max_ent(shape, data));
    let n = used(data);
    let off = entry_area_off(data) + dir(data, n) * shape.leaf_ent_size;
    data[off..off + shape.key_size].copy_from_slice(key);
    data[off + shape.key_size..off + shape.leaf_ent_size].copy_from_slice(value);
    set_used(data, n + 1);
}

/// Index-node counterpart of [`alloc_new_leaf_entry`].
pub(crate) fn alloc_new_index_entry(
    shape: &NodeShape,
    data: &mut [u8],
    key: &[u8],
    addr: PageAddr,
) {
    debug_assert!(!is_leaf(data));
    debug_assert!(used(data) < max_ent(shape, data));
    let n = used(data);
    let off = entry_area_off(data) + dir(data, n) * shape.index_ent_size;
    data[off..off + shape.key_size].copy_from_slice(key);
    LittleEndian::write_u64(&mut data[off + shape.key_size..off + shape.index_ent_size], addr);
    set_used(data, n + 1);
}

/// Rotate the slot index stored at `used-1` into logical position `loc`,
/// shifting the directory entries in between one step up.
pub(crate) fn shuffle_insert(data: &mut [u8], loc: usize) {
    let n = used(data);
    debug_assert!(n >= 1);
    if n == 1 || loc == n - 1 {
        return;
    }
    let val = dir(data, n - 1);
    for i in (loc..n - 1).rev() {
        let v = dir(data, i);
        dir_set(data, i + 1, v);
    }
    dir_set(data, loc, val);
}

/// Free the slot at logical position `idx`: rotate it to the end of the
/// directory and shrink `used`. The payload stays available for reuse.
pub(crate) fn shuffle_remove(data: &mut [u8], idx: usize) {
    let n = used(data);
    debug_assert!(n >= 1);
    let val = dir(data, idx);
    for i in idx + 1..n {
        let v = dir(data, i);
        dir_set(data, i - 1, v);
    }
    dir_set(data, n - 1, val);
    set_used(data, n - 1);
}

/// Drop every entry at logical position `idx` and above.
pub(crate) fn shuffle_remove_above(data: &mut [u8], idx: usize) {
    // The tail of the directory is already ordered; shrinking suffices.
    set_used(data, idx);
}

fn dir_swap(data: &mut [u8], i: usize, j: usize) {
    debug_assert!(i != j);
    let (a, b) = (dir(data, i), dir(data, j));
    dir_set(data, i, b);
    dir_set(data, j, a);
}

/// Drop every entry at logical position `idx` and below.
pub(crate) fn shuffle_remove_below(data: &mut [u8], idx: usize) {
    let n = used(data);
    debug_assert!(n >= 2);
    debug_assert!(idx < n - 1);
    for i in idx + 1..n {
        dir_swap(data, i, i - (idx + 1));
    }
    set_used(data, n - (idx + 1));
}

/// Drop the entries at logical positions `start..=end` by swapping each
/// surviving entry above `end` into the vacated range. Runs in
/// `O(used - end)` and keeps the freed slots on the free list.
pub(crate) fn shuffle_remove_range(data: &mut [u8], start: usize, end: usize) {
    let n = used(data);
    debug_assert!(n >= 1);
    debug_assert!(start <= end && end < n);
    let len = end - start + 1;
    for i in end + 1..n {
        dir_swap(data, i, i - len);
    }
    set_used(data, n - len);
}

/// Format a page as an empty leaf-root: flags, zero count, identity
/// directory. The attribute buffer and entry area are left untouched, so
/// the root can be re-initialized in place when a tree collapses.
pub(crate) fn init_root(data: &mut [u8]) {
    data[FLAGS_OFF] = FLAG_ROOT | FLAG_LEAF;
    set_used(data, 0);
    for i in 0..DIR_LEN {
        data[DIR_OFF + i] = i as u8;
    }
}

pub(crate) fn root_attributes(data: &[u8]) -> &[u8] {
    assert!(is_root(data));
    &data[HDR_SIZE..ROOT_HDR_SIZE]
}

pub(crate) fn root_attributes_mut(data: &mut [u8]) -> &mut [u8] {
    assert!(is_root(data));
    &mut data[HDR_SIZE..ROOT_HDR_SIZE]
}

/// Where an unsuccessful search landed relative to the node contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchClass {
    /// Below every key in the node.
    Lo,
    /// Between two keys.
    Mid,
    /// Above every key in the node.
    Hi,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchOutcome {
    Found(usize),
    NotFound { insert_at: usize, class: SearchClass },
}

/// Binary search over the logical positions `0..used`. `cmp_at(k)`
/// reports how the probe compares against the entry at position `k`
/// (`Greater` means the probe is above the entry).
pub(crate) fn search(
    used: usize,
    cmp_at: impl Fn(usize) -> std::cmp::Ordering,
) -> SearchOutcome {
    use std::cmp::Ordering::*;

    if used == 0 {
        return SearchOutcome::NotFound { insert_at: 0, class: SearchClass::Lo };
    }
    if used == 1 {
        return match cmp_at(0) {
            Equal => SearchOutcome::Found(0),
            Greater => SearchOutcome::NotFound { insert_at: 1, class: SearchClass::Hi },
            Less => SearchOutcome::NotFound { insert_at: 0, class: SearchClass::Lo },
        };
    }

    let mut lo = 0;
    let mut hi = used - 1;

    match cmp_at(lo) {
        Equal => return SearchOutcome::Found(lo),
        Less => return SearchOutcome::NotFound { insert_at: 0, class: SearchClass::Lo },
        Greater => {}
    }
    match cmp_at(hi) {
        Equal => return SearchOutcome::Found(hi),
        Greater => {
            return SearchOutcome::NotFound { insert_at: used, class: SearchClass::Hi }
        }
        Less => {}
    }

    // The probe is strictly between positions lo and hi.
    let mut mid = used / 2;
    loop {
        if lo + 1 == hi {
            return SearchOutcome::NotFound { insert_at: hi, class: SearchClass::Mid };
        }
        match cmp_at(mid) {
            Equal => return SearchOutcome::Found(mid),
            Greater => lo = mid,
            Less => hi = mid,
        }
        mid = (lo + hi) / 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> NodeShape {
        NodeShape {
            key_size: 4,
            val_size: 4,
            node_size: 1024,
            leaf_ent_size: 8,
            index_ent_size: 12,
            max_leaf: 16,
            max_index: 16,
            max_root: 16,
            min_ent: 2,
        }
    }

    fn leaf_page(shape: &NodeShape) -> Vec<u8> {
        let mut data = vec![0u8; shape.node_size];
        init_root(&mut data);
        set_root(&mut data, false);
        data
    }

    fn key(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn insert_sorted(shape: &NodeShape, data: &mut [u8], v: u32) {
        let probe = key(v);
        let out = search(used(data), |k| {
            probe.as_slice().cmp(kth_key(shape, data, k))
        });
        let loc = match out {
            SearchOutcome::Found(_) => panic!("duplicate"),
            SearchOutcome::NotFound { insert_at, .. } => insert_at,
        };
        alloc_new_leaf_entry(shape, data, &probe, &key(v * 10));
        shuffle_insert(data, loc);
    }

    fn keys(shape: &NodeShape, data: &[u8]) -> Vec<u32> {
        (0..used(data))
            .map(|k| u32::from_le_bytes(kth_key(shape, data, k).try_into().unwrap()))
            .collect()
    }

    #[test]
    fn directory_keeps_order_without_moving_payloads() {
        let shape = shape();
        let mut data = leaf_page(&shape);
        for v in [30, 10, 50, 20, 40] {
            insert_sorted(&shape, &mut data, v);
        }
        assert_eq!(keys(&shape, &data), vec![10, 20, 30, 40, 50]);
        let (k, v) = kth_leaf_entry(&shape, &data, 2);
        assert_eq!(u32::from_le_bytes(k.try_into().unwrap()), 30);
        assert_eq!(u32::from_le_bytes(v.try_into().unwrap()), 300);
    }

    #[test]
    fn remove_variants() {
        let shape = shape();
        let mut data = leaf_page(&shape);
        for v in [10, 20, 30, 40, 50, 60] {
            insert_sorted(&shape, &mut data, v);
        }

        shuffle_remove(&mut data, 1); // drop 20
        assert_eq!(keys(&shape, &data), vec![10, 30, 40, 50, 60]);

        shuffle_remove_range(&mut data, 1, 2); // drop 30, 40
        assert_eq!(keys(&shape, &data), vec![10, 50, 60]);

        // Freed slots must be reusable.
        insert_sorted(&shape, &mut data, 55);
        assert_eq!(keys(&shape, &data), vec![10, 50, 55, 60]);

        shuffle_remove_below(&mut data, 0); // drop 10
        assert_eq!(keys(&shape, &data), vec![50, 55, 60]);

        shuffle_remove_above(&mut data, 1); // keep only 50
        assert_eq!(keys(&shape, &data), vec![50]);
    }

    #[test]
    fn directory_stays_a_permutation() {
        let shape = shape();
        let mut data = leaf_page(&shape);
        for v in [5, 3, 9, 1, 7, 8, 2] {
            insert_sorted(&shape, &mut data, v);
        }
        shuffle_remove(&mut data, 3);
        shuffle_remove_range(&mut data, 1, 2);
        let mut slots: Vec<usize> = (0..16).map(|i| dir(&data, i)).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 16, "directory lost a slot");
    }

    #[test]
    fn search_classification() {
        let shape = shape();
        let mut data = leaf_page(&shape);
        for v in [10, 20, 30, 40] {
            insert_sorted(&shape, &mut data, v);
        }
        let cmp = |probe: u32| {
            let shape = &shape;
            let data = &data;
            move |k: usize| {
                let p = key(probe);
                p.as_slice().cmp(kth_key(shape, data, k))
            }
        };
        assert!(matches!(search(4, cmp(20)), SearchOutcome::Found(1)));
        assert!(matches!(
            search(4, cmp(5)),
            SearchOutcome::NotFound { insert_at: 0, class: SearchClass::Lo }
        ));
        assert!(matches!(
            search(4, cmp(25)),
            SearchOutcome::NotFound { insert_at: 2, class: SearchClass::Mid }
        ));
        assert!(matches!(
            search(4, cmp(45)),
            SearchOutcome::NotFound { insert_at: 4, class: SearchClass::Hi }
        ));
    }
}
