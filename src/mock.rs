//! In-memory reference implementations of the external contracts: a
//! page cache with reference counts and copy-on-write relocation, plus
//! `u32`-keyed callback tables for both tree flavors.
//!
//! The cache backs the test suite but is a faithful implementation of
//! the contract and can serve as a harness for downstream crates. It
//! never blocks: in the single-task test setting a conflicting page lock
//! is a bug, so lock acquisition asserts instead of suspending.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cache::{NodeHandle, PageAddr, PageCache, NO_PAGE};
use crate::ops::{DataOps, KeyOps};
use crate::xt::{ExtentCmp, ExtentOps, OwnedExtent};

/// The opaque caller token of the mock cache. Carries an id for traces.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkUnit {
    pub id: u64,
}

type Page = Arc<RwLock<Box<[u8]>>>;
type ReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

enum Guard {
    Shared(ReadGuard),
    Excl(WriteGuard),
}

/// A borrowed, locked page of the [`MemCache`].
pub struct MemHandle {
    addr: PageAddr,
    guard: Guard,
}

impl NodeHandle for MemHandle {
    fn disk_addr(&self) -> PageAddr {
        self.addr
    }

    fn data(&self) -> &[u8] {
        match &self.guard {
            Guard::Shared(g) => &g[..],
            Guard::Excl(g) => &g[..],
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.guard {
            Guard::Excl(g) => &mut g[..],
            Guard::Shared(_) => panic!("write access through a shared lock"),
        }
    }
}

struct CacheState {
    pages: FxHashMap<PageAddr, Page>,
    refcounts: FxHashMap<PageAddr, u32>,
    pins: FxHashMap<PageAddr, u32>,
    next_addr: PageAddr,
}

struct CacheInner {
    page_size: usize,
    state: Mutex<CacheState>,
}

/// An in-memory page cache with reference counts. Cloning the handle
/// shares the cache.
#[derive(Clone)]
pub struct MemCache {
    inner: Arc<CacheInner>,
}

impl MemCache {
    pub fn new(page_size: usize) -> MemCache {
        MemCache {
            inner: Arc::new(CacheInner {
                page_size,
                state: Mutex::new(CacheState {
                    pages: FxHashMap::default(),
                    refcounts: FxHashMap::default(),
                    pins: FxHashMap::default(),
                    next_addr: 1,
                }),
            }),
        }
    }

    fn alloc_page(&self, addr: PageAddr) -> MemHandle {
        let page: Page =
            Arc::new(RwLock::new(vec![0u8; self.inner.page_size].into_boxed_slice()));
        let guard = page.try_write_arc().expect("fresh page is unlocked");
        let mut st = self.inner.state.lock();
        assert!(!st.pages.contains_key(&addr), "page {} allocated twice", addr);
        st.pages.insert(addr, page);
        st.refcounts.insert(addr, 1);
        MemHandle { addr, guard: Guard::Excl(guard) }
    }

    /// Number of live pages; used by tests to observe sharing.
    pub fn live_pages(&self) -> usize {
        self.inner.state.lock().pages.len()
    }

    pub fn refcount_of(&self, addr: PageAddr) -> u32 {
        *self.inner.state.lock().refcounts.get(&addr).expect("live page")
    }
}

impl PageCache for MemCache {
    type Wu = WorkUnit;
    type Handle = MemHandle;

    fn alloc(&self, _wu: &WorkUnit) -> MemHandle {
        let addr = {
            let mut st = self.inner.state.lock();
            let addr = st.next_addr;
            st.next_addr += 1;
            addr
        };
        self.alloc_page(addr)
    }

    fn alloc_at(&self, _wu: &WorkUnit, addr: PageAddr) -> MemHandle {
        assert_ne!(addr, NO_PAGE);
        {
            let mut st = self.inner.state.lock();
            st.next_addr = st.next_addr.max(addr + 1);
        }
        self.alloc_page(addr)
    }

    fn dealloc(&self, _wu: &WorkUnit, addr: PageAddr) {
        let mut st = self.inner.state.lock();
        let rc = st.refcounts.get_mut(&addr).expect("dealloc of a live page");
        assert!(*rc > 0);
        *rc -= 1;
        if *rc == 0 {
            st.refcounts.remove(&addr);
            st.pages.remove(&addr);
        }
    }

    fn get_sl(&self, _wu: &WorkUnit, addr: PageAddr) -> MemHandle {
        let page = self.inner.state.lock().pages.get(&addr).expect("live page").clone();
        let guard = page.try_read_arc().expect("lock-mode conflict on a page");
        MemHandle { addr, guard: Guard::Shared(guard) }
    }

    fn get_xl(&self, _wu: &WorkUnit, addr: PageAddr) -> MemHandle {
        let page = self.inner.state.lock().pages.get(&addr).expect("live page").clone();
        let guard = page.try_write_arc().expect("lock-mode conflict on a page");
        MemHandle { addr, guard: Guard::Excl(guard) }
    }

    fn release(&self, _wu: &WorkUnit, handle: MemHandle) {
        drop(handle);
    }

    fn mark_dirty(
        &self,
        _wu: &WorkUnit,
        handle: &mut MemHandle,
        must_cow: bool,
    ) -> Option<PageAddr> {
        assert!(
            matches!(handle.guard, Guard::Excl(_)),
            "mark_dirty on a shared-locked page"
        );
        if !must_cow {
            return None;
        }

        let mut st = self.inner.state.lock();
        if *st.refcounts.get(&handle.addr).expect("live page") <= 1 {
            return None;
        }

        // Shared page: relocate. The prior page keeps its bytes for the
        // other owners and loses one reference.
        let new_addr = st.next_addr;
        st.next_addr += 1;
        let page: Page = Arc::new(RwLock::new(handle.data().to_vec().into_boxed_slice()));
        let guard = page.try_write_arc().expect("fresh page is unlocked");
        st.pages.insert(new_addr, page);
        st.refcounts.insert(new_addr, 1);
        *st.refcounts.get_mut(&handle.addr).unwrap() -= 1;
        drop(st);

        handle.addr = new_addr;
        handle.guard = Guard::Excl(guard);
        Some(new_addr)
    }

    fn pin(&self, _wu: &WorkUnit, addr: PageAddr) {
        *self.inner.state.lock().pins.entry(addr).or_insert(0) += 1;
    }

    fn unpin(&self, _wu: &WorkUnit, addr: PageAddr) {
        let mut st = self.inner.state.lock();
        let pins = st.pins.get_mut(&addr).expect("unpin of an unpinned page");
        assert!(*pins > 0);
        *pins -= 1;
        if *pins == 0 {
            st.pins.remove(&addr);
        }
    }

    fn inc_refcount(&self, _wu: &WorkUnit, addr: PageAddr) {
        *self.inner.state.lock().refcounts.get_mut(&addr).expect("live page") += 1;
    }

    fn refcount(&self, _wu: &WorkUnit, addr: PageAddr) -> u32 {
        *self.inner.state.lock().refcounts.get(&addr).expect("live page")
    }
}

// ----- u32 keys -------------------------------------------------------

pub fn key_bytes(k: u32) -> [u8; 4] {
    k.to_le_bytes()
}

pub fn key_value(key: &[u8]) -> u32 {
    LittleEndian::read_u32(key)
}

/// Little-endian `u32` keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct U32Key;

impl KeyOps for U32Key {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        key_value(a).cmp(&key_value(b))
    }

    fn inc(&self, key: &[u8], out: &mut [u8]) {
        out.copy_from_slice(&(key_value(key) + 1).to_le_bytes());
    }

    fn format(&self, key: &[u8]) -> String {
        key_value(key).to_string()
    }
}

/// Values without external resources; release is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueData;

impl<Wu> DataOps<Wu> for OpaqueData {
    fn format(&self, data: &[u8]) -> String {
        format!("{:02x?}", data)
    }
}

// ----- u32 extents ----------------------------------------------------

/// Record layout of a mock extent: length then data start, both `u32`
/// little-endian. The data start addresses a region in an
/// [`ExtentStore`].
pub fn record_bytes(len: u32, data: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    LittleEndian::write_u32(&mut out[..4], len);
    LittleEndian::write_u32(&mut out[4..], data);
    out
}

pub fn record_fields(rcrd: &[u8]) -> (u32, u32) {
    (LittleEndian::read_u32(&rcrd[..4]), LittleEndian::read_u32(&rcrd[4..8]))
}

struct StoreInner {
    allocated: FxHashSet<u32>,
    next: u32,
}

/// A unit-granular allocator standing in for the on-disk region store
/// behind extent records.
#[derive(Clone)]
pub struct ExtentStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for ExtentStore {
    fn default() -> Self {
        ExtentStore::new()
    }
}

impl ExtentStore {
    pub fn new() -> ExtentStore {
        ExtentStore {
            inner: Arc::new(Mutex::new(StoreInner { allocated: FxHashSet::default(), next: 1 })),
        }
    }

    /// Reserve `len` fresh units; returns the data start.
    pub fn alloc(&self, len: u32) -> u32 {
        let mut st = self.inner.lock();
        let start = st.next;
        st.next += len;
        for unit in start..start + len {
            st.allocated.insert(unit);
        }
        start
    }

    /// Free the units `[start .. start + len)`. Freeing an unallocated
    /// unit is a double release.
    pub fn dealloc(&self, start: u32, len: u32) {
        let mut st = self.inner.lock();
        for unit in start..start + len {
            assert!(st.allocated.remove(&unit), "double release of unit {}", unit);
        }
    }

    pub fn allocated_units(&self) -> usize {
        self.inner.lock().allocated.len()
    }
}

/// Extent arithmetic over `u32` start keys and `(len, data)` records.
#[derive(Clone)]
pub struct U32ExtentOps {
    pub store: ExtentStore,
}

impl U32ExtentOps {
    pub fn new(store: ExtentStore) -> U32ExtentOps {
        U32ExtentOps { store }
    }

    fn piece(&self, a_start: u32, data: u32, s: u32, e: u32) -> OwnedExtent {
        debug_assert!(e >= s && s >= a_start);
        OwnedExtent {
            key: key_bytes(s).to_vec(),
            rcrd: record_bytes(e - s + 1, data + (s - a_start)).to_vec(),
        }
    }
}

impl KeyOps for U32ExtentOps {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        key_value(a).cmp(&key_value(b))
    }

    fn inc(&self, key: &[u8], out: &mut [u8]) {
        out.copy_from_slice(&(key_value(key) + 1).to_le_bytes());
    }

    fn format(&self, key: &[u8]) -> String {
        key_value(key).to_string()
    }
}

impl<Wu> ExtentOps<Wu> for U32ExtentOps {
    fn compare_records(
        &self,
        a_key: &[u8],
        a_rcrd: &[u8],
        b_key: &[u8],
        b_rcrd: &[u8],
    ) -> ExtentCmp {
        let a_start = key_value(a_key);
        let (a_len, _) = record_fields(a_rcrd);
        let a_end = a_start + a_len - 1;
        let b_start = key_value(b_key);
        let (b_len, _) = record_fields(b_rcrd);
        let b_end = b_start + b_len - 1;
        assert!(a_len > 0 && b_len > 0);

        if a_end < b_start {
            ExtentCmp::Smaller
        } else if a_start > b_end {
            ExtentCmp::Greater
        } else if a_start == b_start && a_end == b_end {
            ExtentCmp::Equal
        } else if a_start >= b_start && a_end <= b_end {
            ExtentCmp::Covered
        } else if a_start <= b_start && a_end >= b_end {
            ExtentCmp::FullyCovers
        } else if a_start < b_start {
            ExtentCmp::PartOverlapSmaller
        } else {
            ExtentCmp::PartOverlapGreater
        }
    }

    fn compare_key_to_record(&self, key: &[u8], r_key: &[u8], r_rcrd: &[u8]) -> Ordering {
        let probe = key_value(key);
        let start = key_value(r_key);
        let (len, _) = record_fields(r_rcrd);
        if probe < start {
            Ordering::Less
        } else if probe > start + len - 1 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    fn bound_split(
        &self,
        key: &[u8],
        rcrd: &[u8],
        min_key: &[u8],
        max_key: &[u8],
    ) -> (ExtentCmp, [Option<OwnedExtent>; 3]) {
        let a_start = key_value(key);
        let (a_len, data) = record_fields(rcrd);
        let a_end = a_start + a_len - 1;
        let b_start = key_value(min_key);
        let b_end = key_value(max_key);

        let b_rcrd = record_bytes(b_end - b_start + 1, 0);
        let cmp = <Self as ExtentOps<Wu>>::compare_records(self, key, rcrd, min_key, &b_rcrd);

        let parts = match cmp {
            ExtentCmp::Smaller => [Some(self.piece(a_start, data, a_start, a_end)), None, None],
            ExtentCmp::Greater => [None, None, Some(self.piece(a_start, data, a_start, a_end))],
            ExtentCmp::Equal | ExtentCmp::Covered => {
                [None, Some(self.piece(a_start, data, a_start, a_end)), None]
            }
            ExtentCmp::FullyCovers => [
                (a_start < b_start).then(|| self.piece(a_start, data, a_start, b_start - 1)),
                Some(self.piece(a_start, data, b_start, b_end)),
                (a_end > b_end).then(|| self.piece(a_start, data, b_end + 1, a_end)),
            ],
            ExtentCmp::PartOverlapSmaller => [
                Some(self.piece(a_start, data, a_start, b_start - 1)),
                Some(self.piece(a_start, data, b_start, a_end)),
                None,
            ],
            ExtentCmp::PartOverlapGreater => [
                None,
                Some(self.piece(a_start, data, a_start, b_end)),
                Some(self.piece(a_start, data, b_end + 1, a_end)),
            ],
        };
        (cmp, parts)
    }

    fn end_offset(&self, key: &[u8], rcrd: &[u8], end_key_out: &mut [u8]) {
        let (len, _) = record_fields(rcrd);
        debug_assert!(len > 0);
        end_key_out.copy_from_slice(&(key_value(key) + len - 1).to_le_bytes());
    }

    fn chop_length(&self, key: &mut [u8], rcrd: &mut [u8], len: u64) {
        let len = len as u32;
        let (r_len, data) = record_fields(rcrd);
        debug_assert!(len < r_len);
        key.copy_from_slice(&(key_value(key) + len).to_le_bytes());
        rcrd.copy_from_slice(&record_bytes(r_len - len, data + len));
    }

    fn chop_top(&self, key: &[u8], rcrd: &mut [u8], hi_key: &[u8]) {
        let start = key_value(key);
        let top = key_value(hi_key);
        assert!(start < top);
        let (len, data) = record_fields(rcrd);
        rcrd.copy_from_slice(&record_bytes(len.min(top - start), data));
    }

    fn split_into_sub(&self, key: &[u8], rcrd: &[u8], n: usize) -> Vec<OwnedExtent> {
        let start = key_value(key);
        let (len, data) = record_fields(rcrd);
        let n32 = n as u32;
        assert!(n > 1 && len >= n32);

        let sub = len / n32;
        let mut out = Vec::with_capacity(n);
        for i in 0..n32 {
            let s = start + i * sub;
            let piece_len = if i + 1 < n32 { sub } else { len - i * sub };
            out.push(OwnedExtent {
                key: key_bytes(s).to_vec(),
                rcrd: record_bytes(piece_len, data + i * sub).to_vec(),
            });
        }
        out
    }

    fn length(&self, _key: &[u8], rcrd: &[u8]) -> u64 {
        record_fields(rcrd).0 as u64
    }

    fn release(&self, _wu: &Wu, _key: &[u8], rcrd: &[u8]) {
        let (len, data) = record_fields(rcrd);
        self.store.dealloc(data, len);
    }

    fn format_record(&self, key: &[u8], rcrd: &[u8]) -> String {
        let start = key_value(key);
        let (len, _) = record_fields(rcrd);
        format!("{}-{}", start, start + len - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    fn ops() -> U32ExtentOps {
        U32ExtentOps::new(ExtentStore::new())
    }

    fn cmp(a: (u32, u32), b: (u32, u32)) -> ExtentCmp {
        let x = ops();
        ExtentOps::<WorkUnit>::compare_records(
            &x,
            &key_bytes(a.0),
            &record_bytes(a.1, 0),
            &key_bytes(b.0),
            &record_bytes(b.1, 0),
        )
    }

    #[test]
    fn seven_way_classification() {
        assert_eq!(cmp((10, 4), (15, 2)), ExtentCmp::Smaller);
        assert_eq!(cmp((10, 4), (8, 2)), ExtentCmp::Greater);
        assert_eq!(cmp((10, 4), (10, 4)), ExtentCmp::Equal);
        assert_eq!(cmp((10, 4), (9, 7)), ExtentCmp::Covered);
        assert_eq!(cmp((10, 4), (11, 2)), ExtentCmp::FullyCovers);
        assert_eq!(cmp((10, 4), (12, 9)), ExtentCmp::PartOverlapSmaller);
        assert_eq!(cmp((10, 4), (5, 6)), ExtentCmp::PartOverlapGreater);
    }

    #[test]
    fn bound_split_cases() {
        let x = ops();
        // Interior removal splits in three with derived data offsets.
        let (cmp, [before, mid, after]) = ExtentOps::<WorkUnit>::bound_split(
            &x,
            &key_bytes(10),
            &record_bytes(5, 100),
            &key_bytes(11),
            &key_bytes(13),
        );
        assert_eq!(cmp, ExtentCmp::FullyCovers);
        let before = before.unwrap();
        assert_eq!((key_value(&before.key), record_fields(&before.rcrd)), (10, (1, 100)));
        let mid = mid.unwrap();
        assert_eq!((key_value(&mid.key), record_fields(&mid.rcrd)), (11, (3, 101)));
        let after = after.unwrap();
        assert_eq!((key_value(&after.key), record_fields(&after.rcrd)), (14, (1, 104)));
    }

    #[quickcheck]
    fn bound_split_reassembles(start: u16, len: u8, lo: u16, hi: u16) -> TestResult {
        if len == 0 || lo > hi {
            return TestResult::discard();
        }
        let (start, len) = (start as u32, len as u32);
        let (lo, hi) = (lo as u32, hi as u32);
        let x = ops();
        let (_, parts) = ExtentOps::<WorkUnit>::bound_split(
            &x,
            &key_bytes(start),
            &record_bytes(len, 500),
            &key_bytes(lo),
            &key_bytes(hi),
        );

        // The present pieces must tile the input extent exactly.
        let mut covered = 0u32;
        let mut cursor = start;
        for piece in parts.iter().flatten() {
            let s = key_value(&piece.key);
            let (l, d) = record_fields(&piece.rcrd);
            if s < cursor || d != 500 + (s - start) {
                return TestResult::failed();
            }
            cursor = s + l;
            covered += l;
        }
        TestResult::from_bool(covered == len && cursor == start + len)
    }

    #[quickcheck]
    fn bound_split_pieces_are_contiguous(start: u16, len: u8, lo: u16, hi: u16) -> TestResult {
        if len == 0 || lo > hi {
            return TestResult::discard();
        }
        let x = ops();
        let (_, parts) = ExtentOps::<WorkUnit>::bound_split(
            &x,
            &key_bytes(start as u32),
            &record_bytes(len as u32, 9),
            &key_bytes(lo as u32),
            &key_bytes(hi as u32),
        );
        let mut expected = start as u32;
        for piece in parts.iter().flatten() {
            if key_value(&piece.key) != expected {
                return TestResult::failed();
            }
            expected += record_fields(&piece.rcrd).0;
        }
        TestResult::passed()
    }

    #[test]
    fn store_tracks_units() {
        let store = ExtentStore::new();
        let a = store.alloc(5);
        let b = store.alloc(3);
        assert_eq!(store.allocated_units(), 8);
        store.dealloc(a + 1, 2);
        assert_eq!(store.allocated_units(), 6);
        store.dealloc(a, 1);
        store.dealloc(a + 3, 2);
        store.dealloc(b, 3);
        assert_eq!(store.allocated_units(), 0);
    }

    #[test]
    fn split_into_sub_divides_evenly() {
        let x = ops();
        let subs =
            ExtentOps::<WorkUnit>::split_into_sub(&x, &key_bytes(10), &record_bytes(7, 50), 3);
        assert_eq!(subs.len(), 3);
        assert_eq!((key_value(&subs[0].key), record_fields(&subs[0].rcrd)), (10, (2, 50)));
        assert_eq!((key_value(&subs[1].key), record_fields(&subs[1].rcrd)), (12, (2, 52)));
        assert_eq!((key_value(&subs[2].key), record_fields(&subs[2].rcrd)), (14, (3, 54)));
    }
}
