//! Disk-backed, copy-on-write B+-trees with cheap clones.
//!
//! The crate provides two flavors that share one node layout and one
//! structural toolbox:
//!
//! * [`Bpt`] is a generic key to fixed-size-value B+-tree.
//! * [`Xt`] is an extent tree whose values describe variable-length
//!   on-disk regions; inserts overwrite overlapping extents and range
//!   reads chop partially matching ones.
//!
//! A tree can be cloned by copying its root page and bumping the
//! reference count of the root's children; afterwards both trees share
//! all pages below the root and copy-on-write relocates any shared page
//! on the path touched by a modification. Clones are isolated at the
//! point in time of the clone without any bulk copying.
//!
//! The crate owns no I/O. Pages, locks, reference counts and data
//! extents live behind the [`PageCache`] contract the caller implements;
//! the [`mock`] module carries an in-memory implementation used by the
//! test suite.

pub mod bpt;
pub mod cache;
pub mod config;
pub mod mock;
mod node;
pub mod ops;
pub mod xt;

pub use bpt::{Bpt, TreeStats};
pub use cache::{NodeHandle, PageAddr, PageCache, NO_PAGE};
pub use config::{BptConfig, ConfigError, XtConfig, ATTRIBUTES_BUF_SIZE};
pub use ops::{DataOps, KeyOps};
pub use xt::{ExtentCmp, ExtentOps, OwnedExtent, Xt, XtStats};

/// Maximal depth of any tree. Range removal keeps per-level state on the
/// stack and relies on this bound.
pub const MAX_HEIGHT: usize = 6;
