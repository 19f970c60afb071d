//! The key/value flavor: a B+-tree mapping opaque fixed-size keys to
//! fixed-size values, with cheap copy-on-write clones.

mod insert;
mod insert_range;
mod lookup;
mod lookup_range;
mod remove_key;
mod remove_range;
mod validate;

use std::cell::Cell;
use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use parking_lot::RwLock;

use crate::cache::{NodeHandle, PageAddr, PageCache, NO_PAGE};
use crate::config::{BptConfig, ConfigError, NodeShape};
use crate::node::{self, ops::Ctx, ops::EntryOps};
use crate::ops::{DataOps, KeyOps};

pub use validate::TreeStats;

/// Callback bundle of a key/value tree.
pub(crate) struct KvOps<K, D> {
    pub(crate) keys: K,
    pub(crate) data: D,
}

impl<Wu, K: KeyOps, D: DataOps<Wu>> EntryOps<Wu> for KvOps<K, D> {
    fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.keys.compare(a, b)
    }

    fn leaf_cmp(&self, probe: &[u8], entry_key: &[u8], _entry_val: &[u8]) -> Ordering {
        self.keys.compare(probe, entry_key)
    }

    fn release_value(&self, wu: &Wu, _key: &[u8], value: &[u8]) {
        self.data.release(wu, value);
    }

    fn format_key(&self, key: &[u8]) -> String {
        self.keys.format(key)
    }
}

/// A copy-on-write B+-tree over an external page cache.
///
/// The state owns nothing but the pinned root address; every page is
/// borrowed from the cache for the duration of one operation. Public
/// operations serialize through a per-tree reader/writer lock and
/// through per-page lock coupling, following the discipline of the
/// original design: range removal takes the tree lock exclusively, all
/// other operations take it shared.
pub struct Bpt<C: PageCache, K: KeyOps, D: DataOps<C::Wu>> {
    cache: C,
    shape: NodeShape,
    ops: KvOps<K, D>,
    tid: u64,
    lock: RwLock<()>,
    root: Cell<PageAddr>,
}

impl<C: PageCache, K: KeyOps, D: DataOps<C::Wu>> Bpt<C, K, D> {
    /// Validate `cfg` and build a tree state without a root. Follow up
    /// with [`create`](Bpt::create) or [`open`](Bpt::open); `tid` only
    /// labels traces.
    pub fn new(cache: C, cfg: &BptConfig, keys: K, data: D, tid: u64) -> Result<Self, ConfigError> {
        let shape = cfg.shape()?;
        trace!(
            "bpt[{}]: max leaf/index/root = {}/{}/{}, b = {}",
            tid,
            shape.max_leaf,
            shape.max_index,
            shape.max_root,
            shape.min_ent
        );
        Ok(Bpt {
            cache,
            shape,
            ops: KvOps { keys, data },
            tid,
            lock: RwLock::new(()),
            root: Cell::new(NO_PAGE),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub(crate) fn ctx(&self) -> Ctx<'_, C> {
        Ctx { cache: &self.cache, shape: &self.shape, ops: &self.ops }
    }

    pub(crate) fn root_addr(&self) -> PageAddr {
        let addr = self.root.get();
        assert_ne!(addr, NO_PAGE, "tree has no root");
        addr
    }

    /// Write-lock the root through the COW path and keep the pinned
    /// address in step if the cache relocated the page.
    pub(crate) fn lock_root_xl(&self, wu: &C::Wu) -> C::Handle {
        let addr = self.root_addr();
        let h = self.ctx().get_for_write(wu, addr, None);
        let new_addr = h.disk_addr();
        if new_addr != addr {
            self.cache.unpin(wu, addr);
            self.cache.pin(wu, new_addr);
            self.root.set(new_addr);
        }
        h
    }

    pub(crate) fn lock_root_sl(&self, wu: &C::Wu) -> C::Handle {
        self.cache.get_sl(wu, self.root_addr())
    }

    /// Allocate and format the root; returns its address. The root stays
    /// pinned until [`destroy`](Bpt::destroy).
    pub fn create(&self, wu: &C::Wu) -> PageAddr {
        assert_eq!(self.root.get(), NO_PAGE, "tree already has a root");
        let _t = self.lock.write();
        let mut h = self.cache.alloc(wu);
        node::init_root(h.data_mut());
        let addr = h.disk_addr();
        self.cache.pin(wu, addr);
        self.cache.release(wu, h);
        self.root.set(addr);
        trace!("bpt[{}]: created root at {}", self.tid, addr);
        addr
    }

    /// Attach to an existing tree whose root sits at `addr`.
    pub fn open(&self, wu: &C::Wu, addr: PageAddr) {
        assert_eq!(self.root.get(), NO_PAGE, "tree already has a root");
        self.cache.pin(wu, addr);
        self.root.set(addr);
    }

    /// Format the page at the caller-chosen `addr` as an empty tree
    /// root. The caller must exclude concurrent access to that page.
    pub fn init_map(&self, wu: &C::Wu, addr: PageAddr) {
        let mut h = self.cache.alloc_at(wu, addr);
        node::init_root(h.data_mut());
        self.cache.release(wu, h);
    }

    /// Release the pinned root. The only path that unpins; the on-disk
    /// tree stays intact.
    pub fn destroy(&self, wu: &C::Wu) {
        let addr = self.root_addr();
        trace!("bpt[{}]: destroying state, root {}", self.tid, addr);
        self.cache.unpin(wu, addr);
        self.root.set(NO_PAGE);
    }

    /// Tear the whole tree down: every node loses one reference, values
    /// of exclusively owned leaves are released.
    pub fn delete(&self, wu: &C::Wu) {
        trace!("bpt[{}]: delete", self.tid);
        let _t = self.lock.write();
        let addr = self.root_addr();
        let h = self.cache.get_sl(wu, addr);
        self.ctx().delete_subtree(wu, h);
        self.cache.unpin(wu, addr);
        self.root.set(NO_PAGE);
    }

    /// Insert `(key, data)`; returns whether an existing value was
    /// replaced.
    pub fn insert_key(&self, wu: &C::Wu, key: &[u8], data: &[u8]) -> bool {
        debug_assert_eq!(key.len(), self.shape.key_size);
        debug_assert_eq!(data.len(), self.shape.val_size);
        trace!("bpt[{}]: insert key={}", self.tid, self.ops.keys.format(key));
        let _t = self.lock.read();
        insert::insert(self, wu, key, data)
    }

    /// Copy the value bound to `key` into `data_out`; returns whether
    /// the key exists.
    pub fn lookup_key(&self, wu: &C::Wu, key: &[u8], data_out: &mut [u8]) -> bool {
        debug_assert_eq!(key.len(), self.shape.key_size);
        debug_assert_eq!(data_out.len(), self.shape.val_size);
        trace!("bpt[{}]: lookup key={}", self.tid, self.ops.keys.format(key));
        let _t = self.lock.read();
        lookup::lookup(self, wu, key, data_out)
    }

    /// Remove `key`, releasing its value; returns whether it existed.
    pub fn remove_key(&self, wu: &C::Wu, key: &[u8]) -> bool {
        debug_assert_eq!(key.len(), self.shape.key_size);
        trace!("bpt[{}]: remove key={}", self.tid, self.ops.keys.format(key));
        let _t = self.lock.read();
        remove_key::remove(self, wu, key)
    }

    /// Copy up to `max_keys` entries with keys in `[min_key, max_key]`
    /// into the output buffers, ascending. Returns the number found.
    /// Only cursor stability is guaranteed between internal iterations.
    pub fn lookup_range(
        &self,
        wu: &C::Wu,
        min_key: &[u8],
        max_key: &[u8],
        max_keys: usize,
        keys_out: &mut [u8],
        data_out: Option<&mut [u8]>,
    ) -> usize {
        debug_assert!(keys_out.len() >= max_keys * self.shape.key_size);
        if let Some(d) = &data_out {
            debug_assert!(d.len() >= max_keys * self.shape.val_size);
        }
        trace!(
            "bpt[{}]: lookup_range [{},{}]",
            self.tid,
            self.ops.keys.format(min_key),
            self.ops.keys.format(max_key)
        );
        let _t = self.lock.read();
        lookup_range::lookup_range(self, wu, min_key, max_key, max_keys, keys_out, data_out)
    }

    /// Insert a dense, sorted run of `(key, data)` pairs. Returns how
    /// many existing entries were overwritten. Not atomic as a whole.
    pub fn insert_range(&self, wu: &C::Wu, keys: &[u8], data: &[u8]) -> usize {
        let ks = self.shape.key_size;
        let vs = self.shape.val_size;
        debug_assert_eq!(keys.len() % ks, 0);
        debug_assert_eq!(data.len() % vs, 0);
        debug_assert_eq!(keys.len() / ks, data.len() / vs);
        if keys.is_empty() {
            return 0;
        }
        trace!("bpt[{}]: insert_range of {} keys", self.tid, keys.len() / ks);
        let _t = self.lock.read();
        insert_range::insert_range(self, wu, keys, data)
    }

    /// Remove every key in `[min_key, max_key]` and repair the tree.
    /// Returns the number of removed keys. Holds the tree lock
    /// exclusively for the duration.
    pub fn remove_range(&self, wu: &C::Wu, min_key: &[u8], max_key: &[u8]) -> usize {
        trace!(
            "bpt[{}]: remove_range [{},{}]",
            self.tid,
            self.ops.keys.format(min_key),
            self.ops.keys.format(max_key)
        );
        let _t = self.lock.write();
        remove_range::remove_range(self, wu, min_key, max_key)
    }

    /// Clone this tree into `trg`: copy the root and bump the reference
    /// count of its children. Afterwards the trees share every page
    /// below the root; writes on either side copy the touched path.
    pub fn clone_into(&self, wu: &C::Wu, trg: &Self) -> PageAddr {
        assert_eq!(trg.root.get(), NO_PAGE, "clone target already has a root");
        assert_eq!(self.shape.key_size, trg.shape.key_size);
        assert_eq!(self.shape.val_size, trg.shape.val_size);
        assert_eq!(self.shape.node_size, trg.shape.node_size);
        trace!("bpt[{}]: clone into tid={}", self.tid, trg.tid);

        let _t = self.lock.write();
        let src_root = self.cache.get_xl(wu, self.root_addr());
        let mut trg_root = self.cache.alloc(wu);
        trg_root.data_mut().copy_from_slice(src_root.data());
        if !node::is_leaf(src_root.data()) {
            self.ctx().inc_children_refcount(wu, src_root.data());
        }
        let addr = trg_root.disk_addr();
        self.cache.release(wu, src_root);
        self.cache.release(wu, trg_root);
        self.cache.pin(wu, addr);
        trg.root.set(addr);
        addr
    }

    /// Visit every node of the tree, parents before children, with read
    /// locks, under the exclusive tree lock.
    pub fn iter(&self, wu: &C::Wu, mut f: impl FnMut(&C::Handle)) {
        let _t = self.lock.write();
        let root = self.lock_root_sl(wu);
        self.ctx().iter_nodes(wu, &root, &mut f);
        self.cache.release(wu, root);
    }

    /// Check the structural invariants of this tree.
    pub fn validate(&self, wu: &C::Wu) -> bool {
        let _t = self.lock.write();
        validate::validate(self, wu)
    }

    /// Validate a set of clones: each tree individually, then the
    /// reference counts of every reachable page against the number of
    /// trees that reach it.
    pub fn validate_clones(wu: &C::Wu, trees: &[&Self]) -> bool {
        let guards: Vec<_> = trees.iter().map(|t| t.lock.write()).collect();
        let rc = validate::validate_clones(wu, trees);
        drop(guards);
        rc
    }

    /// Node and entry counts of this tree.
    pub fn statistics(&self, wu: &C::Wu) -> TreeStats {
        let _t = self.lock.write();
        validate::statistics(self, wu)
    }

    /// Read access to the opaque attribute buffer in the root header.
    pub fn with_attributes<R>(&self, wu: &C::Wu, f: impl FnOnce(&[u8]) -> R) -> R {
        let _t = self.lock.read();
        let h = self.lock_root_sl(wu);
        let r = f(node::root_attributes(h.data()));
        self.cache.release(wu, h);
        r
    }

    /// Write access to the attribute buffer. The root is COWed first if
    /// it is shared.
    pub fn with_attributes_mut<R>(&self, wu: &C::Wu, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let _t = self.lock.read();
        let mut h = self.lock_root_xl(wu);
        let r = f(node::root_attributes_mut(h.data_mut()));
        self.cache.release(wu, h);
        r
    }

    /// COW the root if it is shared and rewrite the 8-byte reference a
    /// parent tree keeps to it. The caller must hold the parent's page
    /// write-locked.
    pub fn cow_root_and_update(&self, wu: &C::Wu, parent_ref: &mut [u8]) {
        let _t = self.lock.write();
        let prev = LittleEndian::read_u64(&parent_ref[..8]);
        let h = self.lock_root_xl(wu);
        let addr = h.disk_addr();
        if addr != prev {
            trace!("bpt[{}]: root moved {} -> {}", self.tid, prev, addr);
            LittleEndian::write_u64(&mut parent_ref[..8], addr);
        }
        self.cache.release(wu, h);
    }
}
