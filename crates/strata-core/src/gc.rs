//! Garbage collection of detached nodes.
//!
//! Only dirty nodes can have been detached during a transaction, so the
//! collector starts from the dirty sets instead of sweeping the whole map.
//! A detached element takes its whole subtree with it. Keys that did not
//! exist in the previous state are also dropped from the dirty sets: the
//! reconciler has nothing to create or destroy for them.
//!
//! A state installed whole has no dirty sets to start from, so
//! [`prune_unreachable`] walks it from the root instead.

use std::collections::HashSet;

use strata_model::{EditorState, NodeKey};

use crate::transaction::Transaction;
use crate::CoreResult;

/// Removes detached nodes from the pending map. Returns how many went.
pub fn collect_detached(txn: &mut Transaction) -> CoreResult<usize> {
    let prev = std::sync::Arc::clone(txn.prev_state());
    let mut doomed: Vec<NodeKey> = Vec::new();

    let dirty_elements: Vec<NodeKey> = txn.dirty_elements.keys().copied().collect();
    for key in dirty_elements {
        if key.is_root() || !txn.contains(key) || txn.is_attached(key) {
            continue;
        }
        let subtree = txn.state().preorder(key).map_err(crate::CoreError::from_model)?;
        for node in subtree {
            if !prev.contains(node) {
                txn.dirty_elements.remove(&node);
                txn.dirty_leaves.remove(&node);
            }
            doomed.push(node);
        }
    }

    let dirty_leaves: Vec<NodeKey> = txn.dirty_leaves.iter().copied().collect();
    for key in dirty_leaves {
        if !txn.contains(key) || txn.is_attached(key) {
            continue;
        }
        if !prev.contains(key) {
            txn.dirty_leaves.remove(&key);
        }
        doomed.push(key);
    }

    doomed.sort_unstable();
    doomed.dedup();
    for key in &doomed {
        txn.evict(*key)?;
    }
    if !doomed.is_empty() {
        tracing::trace!("Collected {} detached nodes", doomed.len());
    }
    Ok(doomed.len())
}

/// Drops every node the root cannot reach from an unfrozen state.
pub fn prune_unreachable(state: &mut EditorState) -> CoreResult<usize> {
    let live: HashSet<NodeKey> = state
        .preorder(NodeKey::ROOT)
        .map_err(crate::CoreError::from_model)?
        .into_iter()
        .collect();
    let nodes = state.nodes_mut().map_err(crate::CoreError::from_model)?;
    let before = nodes.len();
    nodes.retain(|key, _| live.contains(key));
    let pruned = before - nodes.len();
    if pruned > 0 {
        tracing::debug!("Pruned {} unreachable nodes", pruned);
    }
    Ok(pruned)
}
