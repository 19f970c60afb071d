//! Shared harness: trees over the in-memory cache with a fanout of 5,
//! which yields the smallest legal occupancy (b = 2) and keeps node
//! shapes easy to reason about.
#![allow(dead_code)]

use cowtree::mock::{
    key_bytes, key_value, record_bytes, record_fields, ExtentStore, MemCache, OpaqueData, U32Key,
    U32ExtentOps, WorkUnit,
};
use cowtree::{Bpt, BptConfig, Xt, XtConfig};

pub type TestBpt = Bpt<MemCache, U32Key, OpaqueData>;
pub type TestXt = Xt<MemCache, U32ExtentOps>;

pub const NODE_SIZE: usize = 1024;

pub fn wu() -> WorkUnit {
    WorkUnit::default()
}

pub fn new_cache() -> MemCache {
    let _ = env_logger::builder().is_test(true).try_init();
    MemCache::new(NODE_SIZE)
}

pub fn bpt_fanout5(cache: &MemCache, tid: u64) -> TestBpt {
    let cfg = BptConfig {
        key_size: 4,
        data_size: 4,
        node_size: NODE_SIZE,
        root_fanout: 5,
        non_root_fanout: 5,
        min_num_ent: 0,
    };
    Bpt::new(cache.clone(), &cfg, U32Key, OpaqueData, tid).unwrap()
}

pub fn xt_fanout5(cache: &MemCache, store: &ExtentStore, tid: u64) -> TestXt {
    let cfg = XtConfig {
        key_size: 4,
        rcrd_size: 8,
        node_size: NODE_SIZE,
        root_fanout: 5,
        non_root_fanout: 5,
        min_num_ent: 0,
    };
    Xt::new(cache.clone(), &cfg, U32ExtentOps::new(store.clone()), tid).unwrap()
}

pub fn ins(tree: &TestBpt, wu: &WorkUnit, key: u32, val: u32) -> bool {
    tree.insert_key(wu, &key_bytes(key), &key_bytes(val))
}

pub fn get(tree: &TestBpt, wu: &WorkUnit, key: u32) -> Option<u32> {
    let mut out = [0u8; 4];
    tree.lookup_key(wu, &key_bytes(key), &mut out).then(|| key_value(&out))
}

pub fn rmv(tree: &TestBpt, wu: &WorkUnit, key: u32) -> bool {
    tree.remove_key(wu, &key_bytes(key))
}

/// Every `(key, value)` pair of the tree, in order.
pub fn contents(tree: &TestBpt, wu: &WorkUnit) -> Vec<(u32, u32)> {
    range(tree, wu, 0, u32::MAX - 1, 10_000)
}

pub fn range(
    tree: &TestBpt,
    wu: &WorkUnit,
    min: u32,
    max: u32,
    max_keys: usize,
) -> Vec<(u32, u32)> {
    let mut keys = vec![0u8; max_keys * 4];
    let mut vals = vec![0u8; max_keys * 4];
    let n = tree.lookup_range(wu, &key_bytes(min), &key_bytes(max), max_keys, &mut keys, Some(&mut vals));
    (0..n)
        .map(|i| (key_value(&keys[i * 4..(i + 1) * 4]), key_value(&vals[i * 4..(i + 1) * 4])))
        .collect()
}

pub fn remove_range(tree: &TestBpt, wu: &WorkUnit, min: u32, max: u32) -> usize {
    tree.remove_range(wu, &key_bytes(min), &key_bytes(max))
}

/// Insert an extent `[start .. start+len-1]`, allocating its backing
/// region from the store. Returns the overwritten length.
pub fn xt_ins(tree: &TestXt, wu: &WorkUnit, store: &ExtentStore, start: u32, len: u32) -> u64 {
    let data = store.alloc(len);
    tree.insert_range(wu, &key_bytes(start), &record_bytes(len, data))
}

/// Every `(start, len)` extent of the tree, in order.
pub fn xt_contents(tree: &TestXt, wu: &WorkUnit) -> Vec<(u32, u32)> {
    xt_range(tree, wu, 0, u32::MAX - 1, 10_000)
}

pub fn xt_range(
    tree: &TestXt,
    wu: &WorkUnit,
    min: u32,
    max: u32,
    max_extents: usize,
) -> Vec<(u32, u32)> {
    let mut keys = vec![0u8; max_extents * 4];
    let mut rcrds = vec![0u8; max_extents * 8];
    let n = tree.lookup_range(wu, &key_bytes(min), &key_bytes(max), max_extents, &mut keys, &mut rcrds);
    (0..n)
        .map(|i| {
            let start = key_value(&keys[i * 4..(i + 1) * 4]);
            let (len, _) = record_fields(&rcrds[i * 8..(i + 1) * 8]);
            (start, len)
        })
        .collect()
}

pub fn xt_remove_range(tree: &TestXt, wu: &WorkUnit, min: u32, max: u32) -> u64 {
    tree.remove_range(wu, &key_bytes(min), &key_bytes(max))
}
