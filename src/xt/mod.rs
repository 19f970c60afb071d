//! The extent flavor: keys are interval start points and values are
//! variable-length extents referring to on-disk regions. Inserting an
//! extent overwrites whatever it overlaps; range reads chop partially
//! matching extents to the requested bounds.

mod extent;
mod insert_range;
mod leaf;
mod lookup_range;
mod remove_range;
mod validate;

use std::cell::Cell;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use parking_lot::RwLock;

use crate::cache::{NodeHandle, PageAddr, PageCache, NO_PAGE};
use crate::config::{ConfigError, NodeShape, XtConfig};
use crate::node::{self, ops::Ctx};
use crate::ops::KeyOps;

pub use extent::{ExtentCmp, ExtentOps, OwnedExtent};
pub use validate::XtStats;

use extent::XtOps;

/// A copy-on-write extent tree over an external page cache.
///
/// Shares the node layout, locking discipline and clone semantics of
/// [`Bpt`](crate::Bpt); extents within a leaf are kept strictly disjoint
/// and ordered.
pub struct Xt<C: PageCache, X: ExtentOps<C::Wu>> {
    cache: C,
    shape: NodeShape,
    ops: XtOps<X>,
    tid: u64,
    lock: RwLock<()>,
    root: Cell<PageAddr>,
}

impl<C: PageCache, X: ExtentOps<C::Wu>> Xt<C, X> {
    /// Validate `cfg` and build a tree state without a root.
    pub fn new(cache: C, cfg: &XtConfig, ops: X, tid: u64) -> Result<Self, ConfigError> {
        let shape = cfg.shape()?;
        trace!(
            "xt[{}]: max leaf/index/root = {}/{}/{}, b = {}",
            tid,
            shape.max_leaf,
            shape.max_index,
            shape.max_root,
            shape.min_ent
        );
        Ok(Xt {
            cache,
            shape,
            ops: XtOps(ops),
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

    /// Allocate and format the root; returns its address.
    pub fn create(&self, wu: &C::Wu) -> PageAddr {
        assert_eq!(self.root.get(), NO_PAGE, "tree already has a root");
        let _t = self.lock.write();
        let mut h = self.cache.alloc(wu);
        node::init_root(h.data_mut());
        let addr = h.disk_addr();
        self.cache.pin(wu, addr);
        self.cache.release(wu, h);
        self.root.set(addr);
        trace!("xt[{}]: created root at {}", self.tid, addr);
        addr
    }

    /// Attach to an existing tree whose root sits at `addr`.
    pub fn open(&self, wu: &C::Wu, addr: PageAddr) {
        assert_eq!(self.root.get(), NO_PAGE, "tree already has a root");
        self.cache.pin(wu, addr);
        self.root.set(addr);
    }

    /// Format the page at the caller-chosen `addr` as an empty root.
    pub fn init_map(&self, wu: &C::Wu, addr: PageAddr) {
        let mut h = self.cache.alloc_at(wu, addr);
        node::init_root(h.data_mut());
        self.cache.release(wu, h);
    }

    /// Release the pinned root; the on-disk tree stays intact.
    pub fn destroy(&self, wu: &C::Wu) {
        let addr = self.root_addr();
        trace!("xt[{}]: destroying state, root {}", self.tid, addr);
        self.cache.unpin(wu, addr);
        self.root.set(NO_PAGE);
    }

    /// Tear the whole tree down, releasing the extents of exclusively
    /// owned leaves.
    pub fn delete(&self, wu: &C::Wu) {
        trace!("xt[{}]: delete", self.tid);
        let _t = self.lock.write();
        let addr = self.root_addr();
        let h = self.cache.get_sl(wu, addr);
        self.ctx().delete_subtree(wu, h);
        self.cache.unpin(wu, addr);
        self.root.set(NO_PAGE);
    }

    /// Insert one extent, overwriting whatever it overlaps. Returns the
    /// total length overwritten. Not atomic across leaves.
    pub fn insert_range(&self, wu: &C::Wu, key: &[u8], rcrd: &[u8]) -> u64 {
        debug_assert_eq!(key.len(), self.shape.key_size);
        debug_assert_eq!(rcrd.len(), self.shape.val_size);
        trace!("xt[{}]: insert ext={}", self.tid, self.ops.0.format_record(key, rcrd));
        let _t = self.lock.read();
        insert_range::insert_range(self, wu, key, rcrd)
    }

    /// Copy up to `max_extents` extents intersecting `[min_key,
    /// max_key]` into the output buffers, ascending; the first and last
    /// are chopped to the bounds. Returns the number found.
    pub fn lookup_range(
        &self,
        wu: &C::Wu,
        min_key: &[u8],
        max_key: &[u8],
        max_extents: usize,
        keys_out: &mut [u8],
        rcrds_out: &mut [u8],
    ) -> usize {
        debug_assert!(keys_out.len() >= max_extents * self.shape.key_size);
        debug_assert!(rcrds_out.len() >= max_extents * self.shape.val_size);
        trace!(
            "xt[{}]: lookup_range [{},{}]",
            self.tid,
            self.ops.0.format(min_key),
            self.ops.0.format(max_key)
        );
        let _t = self.lock.read();
        lookup_range::lookup_range(self, wu, min_key, max_key, max_extents, keys_out, rcrds_out)
    }

    /// Remove everything inside `[min_key, max_key]`, chopping extents
    /// that straddle the bounds, and repair the tree. Returns the total
    /// length removed. Holds the tree lock exclusively.
    pub fn remove_range(&self, wu: &C::Wu, min_key: &[u8], max_key: &[u8]) -> u64 {
        trace!(
            "xt[{}]: remove_range [{},{}]",
            self.tid,
            self.ops.0.format(min_key),
            self.ops.0.format(max_key)
        );
        let _t = self.lock.write();
        remove_range::remove_range(self, wu, min_key, max_key)
    }

    /// Clone this tree into `trg`; see [`Bpt::clone_into`](crate::Bpt::clone_into).
    pub fn clone_into(&self, wu: &C::Wu, trg: &Self) -> PageAddr {
        assert_eq!(trg.root.get(), NO_PAGE, "clone target already has a root");
        assert_eq!(self.shape.key_size, trg.shape.key_size);
        assert_eq!(self.shape.val_size, trg.shape.val_size);
        assert_eq!(self.shape.node_size, trg.shape.node_size);
        trace!("xt[{}]: clone into tid={}", self.tid, trg.tid);

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

    /// Visit every node, parents before children, with read locks.
    pub fn iter(&self, wu: &C::Wu, mut f: impl FnMut(&C::Handle)) {
        let _t = self.lock.write();
        let root = self.lock_root_sl(wu);
        self.ctx().iter_nodes(wu, &root, &mut f);
        self.cache.release(wu, root);
    }

    /// Check the structural invariants, extent disjointness included.
    pub fn validate(&self, wu: &C::Wu) -> bool {
        let _t = self.lock.write();
        validate::validate(self, wu)
    }

    /// Validate a set of clones; see
    /// [`Bpt::validate_clones`](crate::Bpt::validate_clones).
    pub fn validate_clones(wu: &C::Wu, trees: &[&Self]) -> bool {
        let guards: Vec<_> = trees.iter().map(|t| t.lock.write()).collect();
        let rc = validate::validate_clones(wu, trees);
        drop(guards);
        rc
    }

    /// Node, entry and length counts of this tree.
    pub fn statistics(&self, wu: &C::Wu) -> XtStats {
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

    /// Write access to the attribute buffer; COWs a shared root first.
    pub fn with_attributes_mut<R>(&self, wu: &C::Wu, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let _t = self.lock.read();
        let mut h = self.lock_root_xl(wu);
        let r = f(node::root_attributes_mut(h.data_mut()));
        self.cache.release(wu, h);
        r
    }

    /// COW the root if it is shared and rewrite the 8-byte reference a
    /// parent tree keeps to it.
    pub fn cow_root_and_update(&self, wu: &C::Wu, parent_ref: &mut [u8]) {
        let _t = self.lock.write();
        let prev = LittleEndian::read_u64(&parent_ref[..8]);
        let h = self.lock_root_xl(wu);
        let addr = h.disk_addr();
        if addr != prev {
            trace!("xt[{}]: root moved {} -> {}", self.tid, prev, addr);
            LittleEndian::write_u64(&mut parent_ref[..8], addr);
        }
        self.cache.release(wu, h);
    }
}
