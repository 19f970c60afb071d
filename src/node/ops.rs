//! Structural node operations shared by both tree flavors: COW-aware
//! write access, split, merge, rebalance and subtree teardown.

use std::cmp::Ordering;

use log::{trace, warn};
use rustc_hash::FxHashMap;

use crate::cache::{NodeHandle, PageAddr, PageCache};
use crate::config::NodeShape;
use crate::node::{self, layout, SearchClass, SearchOutcome};

/// The flavor-specific entry behavior the shared layer depends on. Key
/// trees compare plain keys everywhere; extent trees classify a probe
/// against the stored extent when searching a leaf and release the disk
/// region behind a record when an entry is dropped.
pub(crate) trait EntryOps<Wu> {
    fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Comparator used when searching inside a leaf. `Greater` means
    /// the probe lies above the stored entry.
    fn leaf_cmp(&self, probe: &[u8], entry_key: &[u8], entry_val: &[u8]) -> Ordering;

    /// Called whenever a leaf entry is logically dropped from the tree.
    fn release_value(&self, wu: &Wu, key: &[u8], value: &[u8]);

    fn format_key(&self, key: &[u8]) -> String;
}

/// Bundle of everything a structural operation needs: the cache, the
/// computed capacities and the flavor callbacks.
pub(crate) struct Ctx<'a, C: PageCache> {
    pub cache: &'a C,
    pub shape: &'a NodeShape,
    pub ops: &'a dyn EntryOps<C::Wu>,
}

impl<'a, C: PageCache> Clone for Ctx<'a, C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, C: PageCache> Copy for Ctx<'a, C> {}

impl<'a, C: PageCache> Ctx<'a, C> {
    pub(crate) fn get_for_read(self, wu: &C::Wu, addr: PageAddr) -> C::Handle {
        self.cache.get_sl(wu, addr)
    }

    /// The single COW entry point. Acquires an exclusive lock, bumps the
    /// children's reference counts when the page is shared, marks the
    /// page dirty and, if the cache relocated it, rewrites the parent's
    /// child pointer. The parent must already be write-locked.
    pub(crate) fn get_for_write(
        self,
        wu: &C::Wu,
        addr: PageAddr,
        parent: Option<(&mut C::Handle, usize)>,
    ) -> C::Handle {
        let mut h = self.cache.get_xl(wu, addr);
        let rc = self.cache.refcount(wu, h.disk_addr());
        debug_assert!(rc >= 1, "refcount of a live page dropped to zero");
        if rc > 1 && !node::is_leaf(h.data()) {
            self.inc_children_refcount(wu, h.data());
        }
        let relocated = self.cache.mark_dirty(wu, &mut h, rc > 1);
        if let Some(new_addr) = relocated {
            trace!("cow: page {} relocated to {}", addr, new_addr);
            if let Some((parent, idx)) = parent {
                node::replace_kth_index_addr(self.shape, parent.data_mut(), idx, addr, new_addr);
            }
        }
        h
    }

    pub(crate) fn release(self, wu: &C::Wu, h: C::Handle) {
        self.cache.release(wu, h);
    }

    /// Unlock `h` and drop one reference from its page.
    pub(crate) fn dealloc_node(self, wu: &C::Wu, h: C::Handle) {
        let addr = h.disk_addr();
        self.cache.release(wu, h);
        self.cache.dealloc(wu, addr);
    }

    /// Drop one reference from a node. When this was the last reference
    /// the values of a leaf are released as well.
    pub(crate) fn delete_node(self, wu: &C::Wu, h: C::Handle) {
        let rc = self.cache.refcount(wu, h.disk_addr());
        debug_assert!(rc > 0);
        if rc == 1 && node::is_leaf(h.data()) {
            let data = h.data();
            for i in 0..node::used(data) {
                let (key, val) = node::kth_leaf_entry(self.shape, data, i);
                self.ops.release_value(wu, key, val);
            }
        }
        self.dealloc_node(wu, h);
    }

    /// Tear down the subtree rooted at `h`. Shared nodes only lose one
    /// reference; exclusively owned ones are recursed into and freed.
    pub(crate) fn delete_subtree(self, wu: &C::Wu, h: C::Handle) {
        let rc = self.cache.refcount(wu, h.disk_addr());
        debug_assert!(rc > 0);
        if rc == 1 && !node::is_leaf(h.data()) {
            for i in 0..node::used(h.data()) {
                let child_addr = node::kth_child_addr(self.shape, h.data(), i);
                let child = self.get_for_read(wu, child_addr);
                self.delete_subtree(wu, child);
            }
        }
        self.delete_node(wu, h);
    }

    pub(crate) fn inc_children_refcount(self, wu: &C::Wu, data: &[u8]) {
        debug_assert!(!node::is_leaf(data));
        for i in 0..node::used(data) {
            let addr = node::kth_child_addr(self.shape, data, i);
            self.cache.inc_refcount(wu, addr);
        }
    }

    /// Visit every node of the subtree rooted at `h`, parent first.
    pub(crate) fn iter_nodes(
        self,
        wu: &C::Wu,
        h: &C::Handle,
        f: &mut dyn FnMut(&C::Handle),
    ) {
        f(h);
        if !node::is_leaf(h.data()) {
            for i in 0..node::used(h.data()) {
                let child_addr = node::kth_child_addr(self.shape, h.data(), i);
                let child = self.get_for_read(wu, child_addr);
                self.iter_nodes(wu, &child, f);
                self.release(wu, child);
            }
        }
    }

    // ----- search -------------------------------------------------------

    pub(crate) fn search_in_node(self, data: &[u8], probe: &[u8]) -> SearchOutcome {
        let leaf = node::is_leaf(data);
        node::search(node::used(data), |k| {
            if leaf {
                let (ek, ev) = node::kth_leaf_entry(self.shape, data, k);
                self.ops.leaf_cmp(probe, ek, ev)
            } else {
                self.ops.compare_keys(probe, node::kth_key(self.shape, data, k))
            }
        })
    }

    /// Position of the first entry greater or equal to `probe`.
    pub(crate) fn lookup_ge(self, data: &[u8], probe: &[u8]) -> Option<usize> {
        if node::used(data) == 0 {
            return None;
        }
        match self.search_in_node(data, probe) {
            SearchOutcome::Found(k) => Some(k),
            SearchOutcome::NotFound { class: SearchClass::Lo, .. } => Some(0),
            SearchOutcome::NotFound { class: SearchClass::Mid, insert_at } => Some(insert_at),
            SearchOutcome::NotFound { class: SearchClass::Hi, .. } => None,
        }
    }

    /// Position of the first entry strictly greater than `probe`.
    #[allow(dead_code)]
    pub(crate) fn lookup_gt(self, data: &[u8], probe: &[u8]) -> Option<usize> {
        if node::used(data) == 0 {
            return None;
        }
        match self.search_in_node(data, probe) {
            SearchOutcome::Found(k) => {
                if k + 1 < node::used(data) {
                    Some(k + 1)
                } else {
                    None
                }
            }
            SearchOutcome::NotFound { class: SearchClass::Lo, .. } => Some(0),
            SearchOutcome::NotFound { class: SearchClass::Mid, insert_at } => Some(insert_at),
            SearchOutcome::NotFound { class: SearchClass::Hi, .. } => None,
        }
    }

    /// Position of the last entry smaller or equal to `probe`.
    pub(crate) fn lookup_le(self, data: &[u8], probe: &[u8]) -> Option<usize> {
        if node::used(data) == 0 {
            return None;
        }
        match self.search_in_node(data, probe) {
            SearchOutcome::Found(k) => Some(k),
            SearchOutcome::NotFound { class: SearchClass::Lo, .. } => None,
            SearchOutcome::NotFound { class: SearchClass::Mid, insert_at } => {
                debug_assert!(insert_at > 0);
                Some(insert_at - 1)
            }
            SearchOutcome::NotFound { class: SearchClass::Hi, .. } => {
                Some(node::used(data) - 1)
            }
        }
    }

    /// Inexact child lookup in an index node: the child whose key range
    /// may contain `probe`, together with its position. `None` means the
    /// probe is below every key of the node.
    pub(crate) fn index_lookup_key(self, data: &[u8], probe: &[u8]) -> Option<(PageAddr, usize)> {
        debug_assert!(!node::is_leaf(data));
        let k = self.lookup_le(data, probe)?;
        Some((node::kth_child_addr(self.shape, data, k), k))
    }

    /// Is the whole node covered by `[min, max]`?
    pub(crate) fn covered(self, data: &[u8], min: &[u8], max: &[u8]) -> bool {
        let lo = node::min_key(self.shape, data);
        let hi = node::max_key(self.shape, data);
        self.ops.compare_keys(min, lo) != Ordering::Greater
            && self.ops.compare_keys(hi, max) != Ordering::Greater
    }

    /// Do all keys of `a` sort below all keys of `b`? The nodes must not
    /// interleave.
    pub(crate) fn node_is_lower(self, a: &[u8], b: &[u8]) -> bool {
        match self.ops.compare_keys(node::max_key(self.shape, a), node::max_key(self.shape, b)) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => unreachable!("sibling nodes share a key"),
        }
    }

    // ----- entry movement ----------------------------------------------

    /// Append `n` entries of `src` starting at `start` into `trg`,
    /// keeping `trg` ordered. When `src` sorts below `trg` the copied
    /// entries are rotated to the front one by one.
    pub(crate) fn copy_n_entries(self, trg: &mut [u8], src: &[u8], start: usize, n: usize) {
        debug_assert_eq!(node::is_leaf(src), node::is_leaf(trg));
        debug_assert!(n > 0);
        debug_assert!(start + n <= node::used(src));
        debug_assert!(node::used(trg) + n <= node::max_ent(self.shape, trg));

        let lo = node::used(trg) > 0 && self.node_is_lower(src, trg);
        let leaf = node::is_leaf(src);
        for i in 0..n {
            let k = start + i;
            if leaf {
                let (key, val) = node::kth_leaf_entry(self.shape, src, k);
                node::alloc_new_leaf_entry(self.shape, trg, key, val);
            } else {
                let (key, addr) = node::kth_index_entry(self.shape, src, k);
                node::alloc_new_index_entry(self.shape, trg, key, addr);
            }
            if lo {
                node::shuffle_insert(trg, i);
            }
        }
    }

    /// Split a full non-root node in half. The upper half moves to a
    /// fresh sibling which is returned write-locked; `min(right) >
    /// max(node)` afterwards.
    pub(crate) fn split(self, wu: &C::Wu, h: &mut C::Handle) -> C::Handle {
        debug_assert!(!node::is_root(h.data()));
        let mut right = self.cache.alloc(wu);
        right.data_mut().copy_from_slice(h.data());

        let k = node::used(h.data()) / 2;
        trace!(
            "split: {} {} entries into {}+{}",
            if node::is_leaf(h.data()) { "leaf" } else { "index" },
            node::used(h.data()),
            k,
            node::used(h.data()) - k
        );
        node::shuffle_remove_above(h.data_mut(), k);
        node::shuffle_remove_below(right.data_mut(), k - 1);
        right
    }

    /// Split a full root in place: spill its entries into a fresh child,
    /// split that child, and turn the root into an index node with two
    /// entries. The root page never moves.
    pub(crate) fn split_root(self, wu: &C::Wu, root: &mut C::Handle) {
        debug_assert!(node::is_root(root.data()));
        trace!("split_root");

        let mut left = self.cache.alloc(wu);
        {
            let ld = left.data_mut();
            let rd = root.data();
            ld[..layout::HDR_SIZE].copy_from_slice(&rd[..layout::HDR_SIZE]);
            node::set_root(ld, false);
            let area = self.shape.node_size - layout::ROOT_HDR_SIZE;
            ld[layout::HDR_SIZE..layout::HDR_SIZE + area]
                .copy_from_slice(&rd[layout::ROOT_HDR_SIZE..layout::ROOT_HDR_SIZE + area]);
        }
        let right = self.split(wu, &mut left);

        {
            let rd = root.data_mut();
            node::set_used(rd, 0);
            node::set_leaf(rd, false);
        }
        let lmin = node::min_key(self.shape, left.data()).to_vec();
        let rmin = node::min_key(self.shape, right.data()).to_vec();
        let (laddr, raddr) = (left.disk_addr(), right.disk_addr());
        node::alloc_new_index_entry(self.shape, root.data_mut(), &lmin, laddr);
        node::alloc_new_index_entry(self.shape, root.data_mut(), &rmin, raddr);

        self.release(wu, left);
        self.release(wu, right);
    }

    /// Move entries from `from` into the underflowing `under` until the
    /// latter holds at least `b` (or `b + 2` when `skewed`) entries.
    pub(crate) fn rebalance(self, under: &mut C::Handle, from: &mut C::Handle, skewed: bool) {
        let b = self.shape.min_ent;
        debug_assert!(!node::is_root(under.data()) && !node::is_root(from.data()));
        debug_assert!(node::used(from.data()) > b);
        debug_assert!(node::used(from.data()) + node::used(under.data()) >= 2 * b);
        if skewed {
            debug_assert!(node::used(from.data()) + node::used(under.data()) >= 2 * b + 2);
        }

        let hi = self.node_is_lower(under.data(), from.data());
        let mut moved = (1 + node::used(from.data()) - b) / 2;
        if skewed {
            while node::used(under.data()) + moved < b + 2 {
                moved += 1;
            }
        }
        trace!(
            "rebalance: moving {} entries {}",
            moved,
            if hi { "from the right sibling" } else { "from the left sibling" }
        );

        if hi {
            // The donor sits above `under`: its smallest entries move.
            self.copy_n_entries(under.data_mut(), from.data(), 0, moved);
            node::shuffle_remove_below(from.data_mut(), moved - 1);
        } else {
            let start = node::used(from.data()) - moved;
            self.copy_n_entries(under.data_mut(), from.data(), start, moved);
            node::shuffle_remove_above(from.data_mut(), start);
        }

        debug_assert!(node::used(from.data()) >= b);
        debug_assert!(node::used(under.data()) >= b);
    }

    /// Concatenate all entries of `src` into `trg` and drop `src`.
    pub(crate) fn move_and_dealloc(self, wu: &C::Wu, trg: &mut C::Handle, src: C::Handle) {
        debug_assert!(!node::is_root(trg.data()) && !node::is_root(src.data()));
        debug_assert!(
            node::used(trg.data()) + node::used(src.data())
                <= node::max_ent(self.shape, src.data())
        );
        trace!(
            "merge: {} entries into a node holding {}",
            node::used(src.data()),
            node::used(trg.data())
        );
        self.copy_n_entries(trg.data_mut(), src.data(), 0, node::used(src.data()));
        self.dealloc_node(wu, src);
    }

    /// Collapse the root's only child into the root and drop the child.
    pub(crate) fn copy_into_root_and_dealloc(
        self,
        wu: &C::Wu,
        root: &mut C::Handle,
        child: C::Handle,
    ) {
        assert!(node::is_root(root.data()));
        debug_assert!(!node::is_root(child.data()));
        assert!(node::max_ent(self.shape, root.data()) >= node::used(child.data()));
        trace!(
            "collapse: child with {} entries into the root (leaf={})",
            node::used(child.data()),
            node::is_leaf(child.data())
        );

        let child_is_leaf = node::is_leaf(child.data());
        {
            let rd = root.data_mut();
            node::init_root(rd);
            node::set_leaf(rd, child_is_leaf);
        }
        self.copy_n_entries(root.data_mut(), child.data(), 0, node::used(child.data()));
        self.dealloc_node(wu, child);
    }

    /// Replace the binding at position `k` of an index node with two
    /// bindings, `min(left) -> left` and `min(right) -> right`.
    pub(crate) fn index_replace_w2(
        self,
        parent: &mut C::Handle,
        k: usize,
        left: &C::Handle,
        right: &C::Handle,
    ) {
        let lmin = node::min_key(self.shape, left.data()).to_vec();
        let rmin = node::min_key(self.shape, right.data()).to_vec();
        let (laddr, raddr) = (left.disk_addr(), right.disk_addr());

        let pd = parent.data_mut();
        debug_assert!(!node::is_leaf(pd));
        node::set_kth_index_entry(self.shape, pd, k, &lmin, laddr);
        node::alloc_new_index_entry(self.shape, pd, &rmin, raddr);
        node::shuffle_insert(pd, k + 1);
    }

    /// If `key` is below the node's minimum, overwrite the minimum key.
    /// Keeps the index-node lookup of a descending insert from missing
    /// the leftmost child.
    pub(crate) fn correct_min_key(self, data: &mut [u8], key: &[u8]) {
        debug_assert!(!node::is_leaf(data));
        debug_assert!(node::used(data) >= 1);
        if self.ops.compare_keys(key, node::min_key(self.shape, data)) == Ordering::Less {
            trace!("replacing the minimum key of an index node");
            node::replace_kth_key(self.shape, data, 0, key);
        }
    }

    /// Move the largest entry of `src` to the front of `trg`. All keys
    /// of `src` must sort below all keys of `trg`.
    pub(crate) fn move_max_key(self, trg: &mut C::Handle, src: &mut C::Handle) {
        debug_assert_eq!(node::is_leaf(src.data()), node::is_leaf(trg.data()));
        debug_assert!(!node::is_root(src.data()) && !node::is_root(trg.data()));
        let last = node::used(src.data()) - 1;
        if node::is_leaf(src.data()) {
            let (key, val) = {
                let (k, v) = node::kth_leaf_entry(self.shape, src.data(), last);
                (k.to_vec(), v.to_vec())
            };
            node::alloc_new_leaf_entry(self.shape, trg.data_mut(), &key, &val);
        } else {
            let (key, addr) = {
                let (k, a) = node::kth_index_entry(self.shape, src.data(), last);
                (k.to_vec(), a)
            };
            node::alloc_new_index_entry(self.shape, trg.data_mut(), &key, addr);
        }
        node::shuffle_insert(trg.data_mut(), 0);
        node::shuffle_remove(src.data_mut(), last);
    }

    /// Move the smallest entry of `src` to the back of `trg`. All keys
    /// of `src` must sort above all keys of `trg`.
    pub(crate) fn move_min_key(self, trg: &mut C::Handle, src: &mut C::Handle) {
        debug_assert_eq!(node::is_leaf(src.data()), node::is_leaf(trg.data()));
        debug_assert!(!node::is_root(src.data()) && !node::is_root(trg.data()));
        if node::is_leaf(src.data()) {
            let (key, val) = {
                let (k, v) = node::kth_leaf_entry(self.shape, src.data(), 0);
                (k.to_vec(), v.to_vec())
            };
            node::alloc_new_leaf_entry(self.shape, trg.data_mut(), &key, &val);
        } else {
            let (key, addr) = {
                let (k, a) = node::kth_index_entry(self.shape, src.data(), 0);
                (k.to_vec(), a)
            };
            node::alloc_new_index_entry(self.shape, trg.data_mut(), &key, addr);
        }
        node::shuffle_remove(src.data_mut(), 0);
    }

    /// Count how many trees of a clone set reach each page. An already
    /// labeled page is shared: its count goes up and the walk stops
    /// there, exactly how reference counts behave under cloning.
    pub(crate) fn label_count(
        self,
        wu: &C::Wu,
        h: &C::Handle,
        labels: &mut FxHashMap<PageAddr, u32>,
    ) {
        let addr = h.disk_addr();
        if let Some(label) = labels.get_mut(&addr) {
            *label += 1;
            return;
        }
        labels.insert(addr, 1);

        if !node::is_leaf(h.data()) {
            for i in 0..node::used(h.data()) {
                let child_addr = node::kth_child_addr(self.shape, h.data(), i);
                let child = self.get_for_read(wu, child_addr);
                self.label_count(wu, &child, labels);
                self.release(wu, child);
            }
        }
    }

    /// Compare the counted labels against the reference-count store.
    pub(crate) fn compare_labels(
        self,
        wu: &C::Wu,
        h: &C::Handle,
        labels: &FxHashMap<PageAddr, u32>,
    ) -> bool {
        let addr = h.disk_addr();
        let counted = labels.get(&addr).copied().unwrap_or(0);
        let stored = self.cache.refcount(wu, addr);
        if counted != stored {
            warn!(
                "page {} reached by {} trees but its refcount is {}",
                addr, counted, stored
            );
            return false;
        }

        if !node::is_leaf(h.data()) {
            for i in 0..node::used(h.data()) {
                let child_addr = node::kth_child_addr(self.shape, h.data(), i);
                let child = self.get_for_read(wu, child_addr);
                let ok = self.compare_labels(wu, &child, labels);
                self.release(wu, child);
                if !ok {
                    return false;
                }
            }
        }
        true
    }

    /// Drop the entries at positions `start..=end`, releasing leaf
    /// values through the flavor callback.
    pub(crate) fn node_remove_entries(
        self,
        wu: &C::Wu,
        data: &mut [u8],
        start: usize,
        end: usize,
    ) {
        if node::is_leaf(data) {
            for i in start..=end {
                let (key, val) = node::kth_leaf_entry(self.shape, data, i);
                self.ops.release_value(wu, key, val);
            }
        }
        node::shuffle_remove_range(data, start, end);
    }
}
