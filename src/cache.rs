//! Contracts of the external collaborators: the page cache and the
//! reference-count store the tree core runs on top of.
//!
//! The core never performs I/O on its own. It borrows pages from a
//! [`PageCache`], reads and writes them through [`NodeHandle`]s, and asks
//! the cache to relocate shared pages when a copy-on-write is required.
//! Reference counts are owned by the same collaborator; a count equals
//! the number of distinct trees whose live structure reaches the page.

/// Address of a page in the external cache.
pub type PageAddr = u64;

/// The distinguished "no such page" address.
pub const NO_PAGE: PageAddr = 0;

/// A borrowed, locked page.
///
/// A handle stands for both the pin and the lock on a page: holding a
/// handle keeps the page resident, dropping it (via
/// [`PageCache::release`]) gives the lock back. The payload visible
/// through [`data`](NodeHandle::data) excludes any cache-private page
/// header.
pub trait NodeHandle {
    /// Current on-disk address of the page. May change across a
    /// [`PageCache::mark_dirty`] call that relocates the page.
    fn disk_addr(&self) -> PageAddr;

    /// The page payload.
    fn data(&self) -> &[u8];

    /// Mutable access to the page payload.
    ///
    /// Calling this on a shared-locked handle is a lock-mode mismatch;
    /// implementations must treat it as fatal.
    fn data_mut(&mut self) -> &mut [u8];
}

/// The page cache and reference-count store contract.
///
/// All operations take an opaque work-unit token `Wu` supplied by the
/// caller; the core threads it through every cache and callback
/// invocation for accounting and tracing but never inspects it.
///
/// Lock discipline expected from implementations:
/// * `get_sl`/`get_xl` suspend (or fail fatally in a single-task
///   setting) until the lock can be granted.
/// * a page is mutable only through an exclusively locked handle.
pub trait PageCache {
    /// Opaque caller token threaded through every call.
    type Wu;
    /// The handle type for borrowed pages.
    type Handle: NodeHandle;

    /// Allocate a fresh zeroed page with reference count one. The
    /// returned handle is exclusively locked.
    fn alloc(&self, wu: &Self::Wu) -> Self::Handle;

    /// Same as [`alloc`](PageCache::alloc) at a caller-chosen address.
    fn alloc_at(&self, wu: &Self::Wu, addr: PageAddr) -> Self::Handle;

    /// Drop one reference from `addr`. The page returns to the allocator
    /// when its count reaches zero.
    fn dealloc(&self, wu: &Self::Wu, addr: PageAddr);

    /// Acquire a shared lock on `addr`.
    fn get_sl(&self, wu: &Self::Wu, addr: PageAddr) -> Self::Handle;

    /// Acquire an exclusive lock on `addr`.
    fn get_xl(&self, wu: &Self::Wu, addr: PageAddr) -> Self::Handle;

    /// Drop the lock and unpin the page.
    fn release(&self, wu: &Self::Wu, handle: Self::Handle);

    /// Mark an exclusively locked page dirty.
    ///
    /// With `must_cow` set (the page is shared, reference count above
    /// one) the cache may relocate the page to implement copy-on-write:
    /// the prior page stays intact for the other owners, the handle
    /// switches to the fresh copy, and the new address is returned. The
    /// caller must consult the return value (or re-read
    /// [`NodeHandle::disk_addr`]) to detect relocation.
    fn mark_dirty(
        &self,
        wu: &Self::Wu,
        handle: &mut Self::Handle,
        must_cow: bool,
    ) -> Option<PageAddr>;

    /// Keep `addr` resident without holding a lock. Tree states pin
    /// their root between operations; destroying the state is the only
    /// path that unpins it.
    fn pin(&self, wu: &Self::Wu, addr: PageAddr);

    /// Undo one [`pin`](PageCache::pin).
    fn unpin(&self, wu: &Self::Wu, addr: PageAddr);

    /// Increment the reference count of `addr`.
    fn inc_refcount(&self, wu: &Self::Wu, addr: PageAddr);

    /// Current reference count of `addr`; at least one while the page is
    /// reachable.
    fn refcount(&self, wu: &Self::Wu, addr: PageAddr) -> u32;
}
