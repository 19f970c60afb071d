//! Single-key lookup: a plain read-locked descent with lock coupling.

use crate::cache::{NodeHandle, PageCache};
use crate::node::{self, ops::Ctx, SearchOutcome};
use crate::ops::{DataOps, KeyOps};

use super::Bpt;

fn lookup_in_leaf<C: PageCache>(ctx: Ctx<C>, data: &[u8], key: &[u8], out: &mut [u8]) -> bool {
    match ctx.search_in_node(data, key) {
        SearchOutcome::Found(k) => {
            let (_, value) = node::kth_leaf_entry(ctx.shape, data, k);
            out.copy_from_slice(value);
            true
        }
        SearchOutcome::NotFound { .. } => false,
    }
}

pub(super) fn lookup<C: PageCache, K: KeyOps, D: DataOps<C::Wu>>(
    tree: &Bpt<C, K, D>,
    wu: &C::Wu,
    key: &[u8],
    out: &mut [u8],
) -> bool {
    let ctx = tree.ctx();
    let root = tree.lock_root_sl(wu);

    if node::is_leaf(root.data()) {
        let rc = lookup_in_leaf(ctx, root.data(), key, out);
        ctx.release(wu, root);
        return rc;
    }

    let Some((addr, _)) = ctx.index_lookup_key(root.data(), key) else {
        // The key is below everything in the tree.
        ctx.release(wu, root);
        return false;
    };
    let mut father = root;
    let mut child = ctx.get_for_read(wu, addr);

    loop {
        if node::is_leaf(child.data()) {
            let rc = lookup_in_leaf(ctx, child.data(), key, out);
            ctx.release(wu, father);
            ctx.release(wu, child);
            return rc;
        }
        ctx.release(wu, father);
        father = child;

        let Some((addr, _)) = ctx.index_lookup_key(father.data(), key) else {
            ctx.release(wu, father);
            return false;
        };
        child = ctx.get_for_read(wu, addr);
    }
}
