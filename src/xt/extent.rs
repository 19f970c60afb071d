//! Extent records and the caller-supplied arithmetic over them.

use std::cmp::Ordering;

use crate::node::ops::EntryOps;
use crate::ops::KeyOps;

/// Outcome of comparing two extents `A` and `B`.
///
/// The classification is strict and the seven cases are mutually
/// exclusive: `A=[10-13]`, `B=[10-13]` is `Equal` and nothing else.
/// Algorithms match on this exhaustively and rely on the disjointness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentCmp {
    /// `A` lies strictly below `B`: `A=[10-13]`, `B=[15-16]`.
    Smaller,
    /// `A` lies strictly above `B`: `A=[10-13]`, `B=[8-9]`.
    Greater,
    /// Identical ranges.
    Equal,
    /// `A` is covered by `B` without being equal: `A=[10-13]`, `B=[9-15]`.
    Covered,
    /// `A` covers `B` without being equal: `A=[10-13]`, `B=[11-12]`.
    FullyCovers,
    /// Partial overlap with `A` starting lower: `A=[10-13]`, `B=[12-20]`.
    PartOverlapSmaller,
    /// Partial overlap with `A` starting higher: `A=[10-13]`, `B=[5-10]`.
    PartOverlapGreater,
}

/// An extent copied out of a node: start key plus record bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedExtent {
    pub key: Vec<u8>,
    pub rcrd: Vec<u8>,
}

/// Callback table of an extent tree. An extent `(key, rcrd)` covers the
/// logical range `[key .. key + length - 1]`; the record additionally
/// carries whatever the caller needs to reach the on-disk region.
pub trait ExtentOps<Wu>: KeyOps {
    /// Seven-way strict comparison of two extents.
    fn compare_records(
        &self,
        a_key: &[u8],
        a_rcrd: &[u8],
        b_key: &[u8],
        b_rcrd: &[u8],
    ) -> ExtentCmp;

    /// Classify a point key against an extent: `Equal` when the key
    /// falls inside it.
    fn compare_key_to_record(&self, key: &[u8], r_key: &[u8], r_rcrd: &[u8]) -> Ordering;

    /// Split an extent against the bounds `[min_key, max_key]` into up
    /// to three sub-extents: before the bounds, inside them, after
    /// them. Absent parts are `None`; reassembling the present parts
    /// yields the input extent.
    fn bound_split(
        &self,
        key: &[u8],
        rcrd: &[u8],
        min_key: &[u8],
        max_key: &[u8],
    ) -> (ExtentCmp, [Option<OwnedExtent>; 3]);

    /// Write the inclusive end key of the extent into `end_key_out`.
    fn end_offset(&self, key: &[u8], rcrd: &[u8], end_key_out: &mut [u8]);

    /// Drop the first `len` units: advance the key and the record's
    /// data reference, shrink the length.
    fn chop_length(&self, key: &mut [u8], rcrd: &mut [u8], len: u64);

    /// Truncate the extent from above so that its end key sorts below
    /// `hi_key`.
    fn chop_top(&self, key: &[u8], rcrd: &mut [u8], hi_key: &[u8]);

    /// Divide the extent into `n` near-equal sub-extents whose data
    /// references derive arithmetically from the parent's, so no
    /// reallocation happens. Requires `1 < n <= length`.
    fn split_into_sub(&self, key: &[u8], rcrd: &[u8], n: usize) -> Vec<OwnedExtent>;

    /// Number of units the extent covers.
    fn length(&self, key: &[u8], rcrd: &[u8]) -> u64;

    /// Release the on-disk region behind a record; called whenever a
    /// leaf entry is logically dropped.
    fn release(&self, wu: &Wu, key: &[u8], rcrd: &[u8]);

    /// Printable representation, used in traces.
    fn format_record(&self, key: &[u8], rcrd: &[u8]) -> String;
}

/// Adapter binding an [`ExtentOps`] table to the shared node layer.
pub(crate) struct XtOps<X>(pub(crate) X);

impl<Wu, X: ExtentOps<Wu>> EntryOps<Wu> for XtOps<X> {
    fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.0.compare(a, b)
    }

    fn leaf_cmp(&self, probe: &[u8], entry_key: &[u8], entry_val: &[u8]) -> Ordering {
        self.0.compare_key_to_record(probe, entry_key, entry_val)
    }

    fn release_value(&self, wu: &Wu, key: &[u8], value: &[u8]) {
        self.0.release(wu, key, value);
    }

    fn format_key(&self, key: &[u8]) -> String {
        self.0.format(key)
    }
}
