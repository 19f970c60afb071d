//! Tree configuration and derived node capacities.

use log::warn;
use thiserror::Error;

use crate::node::layout::{HDR_SIZE, ROOT_HDR_SIZE};

/// Size of the attribute buffer carried by every root node, in bytes.
/// The buffer is opaque to the core; only accessors are exposed.
pub const ATTRIBUTES_BUF_SIZE: usize = 256;

/// Errors detected while validating a configuration. A tree cannot be
/// built from a rejected configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} size must be a positive multiple of 4")]
    MisalignedSize(&'static str),
    #[error("node size {0} is smaller than the root node header")]
    NodeTooSmall(usize),
    #[error("root fanout may not exceed the non-root fanout")]
    RootFanoutExceedsNonRoot,
    #[error("node fanout of {0} is below the minimum of 5")]
    FanoutTooSmall(usize),
    #[error("minimum entries per node must be at least 2, got {0}")]
    MinEntriesTooSmall(usize),
    #[error("cannot satisfy 2b+1 <= max entries with b={min_ent}, max={max_ent}")]
    OccupancyUnsatisfiable { min_ent: usize, max_ent: usize },
}

/// Configuration of a key/value tree ([`Bpt`](crate::Bpt)).
///
/// All sizes are in bytes; key and data sizes must be multiples of 4.
/// A fanout of 0 means "no cap", a `min_num_ent` of 0 asks the library
/// to pick the minimal occupancy `b` itself.
#[derive(Debug, Clone)]
pub struct BptConfig {
    pub key_size: usize,
    pub data_size: usize,
    pub node_size: usize,
    pub root_fanout: usize,
    pub non_root_fanout: usize,
    pub min_num_ent: usize,
}

/// Configuration of an extent tree ([`Xt`](crate::Xt)). `rcrd_size` is
/// the size of one extent record.
#[derive(Debug, Clone)]
pub struct XtConfig {
    pub key_size: usize,
    pub rcrd_size: usize,
    pub node_size: usize,
    pub root_fanout: usize,
    pub non_root_fanout: usize,
    pub min_num_ent: usize,
}

/// Derived per-node capacities shared by both tree flavors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeShape {
    pub key_size: usize,
    pub val_size: usize,
    pub node_size: usize,
    pub leaf_ent_size: usize,
    pub index_ent_size: usize,
    pub max_leaf: usize,
    pub max_index: usize,
    pub max_root: usize,
    /// The minimal occupancy `b` of every non-root node.
    pub min_ent: usize,
}

impl NodeShape {
    pub(crate) fn compute(
        key_size: usize,
        val_size: usize,
        node_size: usize,
        root_fanout: usize,
        non_root_fanout: usize,
        min_num_ent: usize,
    ) -> Result<NodeShape, ConfigError> {
        if key_size == 0 || key_size % 4 != 0 {
            return Err(ConfigError::MisalignedSize("key"));
        }
        if val_size == 0 || val_size % 4 != 0 {
            return Err(ConfigError::MisalignedSize("value"));
        }
        if node_size % 4 != 0 {
            return Err(ConfigError::MisalignedSize("node"));
        }
        if node_size <= ROOT_HDR_SIZE {
            return Err(ConfigError::NodeTooSmall(node_size));
        }

        let leaf_ent_size = key_size + val_size;
        let index_ent_size = key_size + 8;

        let mut max_leaf = (node_size - HDR_SIZE) / leaf_ent_size;
        let mut max_index = (node_size - HDR_SIZE) / index_ent_size;
        let root_leaf = (node_size - ROOT_HDR_SIZE) / leaf_ent_size;
        let root_index = (node_size - ROOT_HDR_SIZE) / index_ent_size;
        let mut max_root = root_leaf.min(root_index);

        if root_fanout > non_root_fanout {
            return Err(ConfigError::RootFanoutExceedsNonRoot);
        }
        if root_fanout > 0 {
            max_root = max_root.min(root_fanout);
        }
        if non_root_fanout > 0 {
            max_leaf = max_leaf.min(non_root_fanout);
            max_index = max_index.min(non_root_fanout);
        }

        // The entry directory holds one byte per slot; anything beyond
        // 256 entries cannot be addressed.
        if max_leaf > 256 || max_index > 256 || max_root > 256 {
            warn!(
                "node fanout exceeds 256 (leaf={} index={} root={}); capping",
                max_leaf, max_index, max_root
            );
        }
        max_leaf = max_leaf.min(256);
        max_index = max_index.min(256);
        max_root = max_root.min(256);

        let smallest = max_leaf.min(max_index).min(max_root);
        if smallest < 5 {
            return Err(ConfigError::FanoutTooSmall(smallest));
        }

        // Prefer an occupancy window of [b, 3b]; fall back to [b, 2b+1].
        let mut min_ent = min_num_ent;
        if min_ent == 0 {
            min_ent = smallest / 3;
            if min_ent < 2 {
                min_ent = (smallest - 1) / 2;
            }
        }
        if min_ent < 2 {
            return Err(ConfigError::MinEntriesTooSmall(min_ent));
        }
        if 2 * min_ent + 1 > smallest {
            return Err(ConfigError::OccupancyUnsatisfiable {
                min_ent,
                max_ent: smallest,
            });
        }

        Ok(NodeShape {
            key_size,
            val_size,
            node_size,
            leaf_ent_size,
            index_ent_size,
            max_leaf,
            max_index,
            max_root,
            min_ent,
        })
    }
}

impl BptConfig {
    pub(crate) fn shape(&self) -> Result<NodeShape, ConfigError> {
        NodeShape::compute(
            self.key_size,
            self.data_size,
            self.node_size,
            self.root_fanout,
            self.non_root_fanout,
            self.min_num_ent,
        )
    }
}

impl XtConfig {
    pub(crate) fn shape(&self) -> Result<NodeShape, ConfigError> {
        NodeShape::compute(
            self.key_size,
            self.rcrd_size,
            self.node_size,
            self.root_fanout,
            self.non_root_fanout,
            self.min_num_ent,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(node_size: usize, fanout: usize) -> BptConfig {
        BptConfig {
            key_size: 4,
            data_size: 4,
            node_size,
            root_fanout: fanout,
            non_root_fanout: fanout,
            min_num_ent: 0,
        }
    }

    #[test]
    fn capacities_from_node_size() {
        let shape = cfg(1024, 0).shape().unwrap();
        assert_eq!(shape.leaf_ent_size, 8);
        assert_eq!(shape.index_ent_size, 12);
        assert_eq!(shape.max_leaf, (1024 - HDR_SIZE) / 8);
        assert_eq!(shape.max_index, (1024 - HDR_SIZE) / 12);
        assert_eq!(shape.max_root, (1024 - ROOT_HDR_SIZE) / 12);
        assert!(2 * shape.min_ent + 1 <= shape.max_root);
    }

    #[test]
    fn fanout_cap_and_auto_min() {
        let shape = cfg(1024, 5).shape().unwrap();
        assert_eq!(shape.max_leaf, 5);
        assert_eq!(shape.max_index, 5);
        assert_eq!(shape.max_root, 5);
        // 5/3 == 1 is too small, the fallback picks (5-1)/2 == 2.
        assert_eq!(shape.min_ent, 2);
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(matches!(
            BptConfig { key_size: 3, ..cfg(1024, 0) }.shape(),
            Err(ConfigError::MisalignedSize("key"))
        ));
        assert!(matches!(
            cfg(256, 0).shape(),
            Err(ConfigError::NodeTooSmall(_))
        ));
        assert!(matches!(
            cfg(1024, 4).shape(),
            Err(ConfigError::FanoutTooSmall(4))
        ));
        assert!(matches!(
            BptConfig { root_fanout: 8, non_root_fanout: 6, ..cfg(1024, 0) }.shape(),
            Err(ConfigError::RootFanoutExceedsNonRoot)
        ));
    }

    #[test]
    fn explicit_min_checked_against_capacity() {
        assert!(matches!(
            BptConfig { min_num_ent: 3, ..cfg(1024, 5) }.shape(),
            Err(ConfigError::OccupancyUnsatisfiable { .. })
        ));
        assert!(matches!(
            BptConfig { min_num_ent: 1, ..cfg(1024, 5) }.shape(),
            Err(ConfigError::MinEntriesTooSmall(1))
        ));
    }
}
