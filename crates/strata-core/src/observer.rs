//! Folding of out-of-band render mutations.
//!
//! The platform can edit the render tree behind the engine's back (typing,
//! spellcheck, extensions). Records drained from the target are handled
//! here before a transaction runs:
//!
//! - text typed into a rendered text node becomes a `set_text` on the
//!   logical node; the render node already shows it and is left alone
//! - render nodes the engine does not own are removed again
//! - engine-owned render nodes that vanished are put back in logical order

use std::collections::BTreeSet;

use strata_model::{NodeKey, NodeKind};

use crate::reconciler::RenderCache;
use crate::render::{MutationRecord, RenderId, RenderTarget};
use crate::resolver;
use crate::transaction::Transaction;
use crate::{CoreError, CoreResult};

/// What folding did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldSummary {
    /// Text nodes updated from live render text
    pub folded_text: usize,
    /// Foreign render nodes removed
    pub removed_foreign: usize,
    /// Render parents whose owned children were restored
    pub restored_parents: usize,
}

impl FoldSummary {
    pub fn is_empty(&self) -> bool {
        *self == FoldSummary::default()
    }
}

/// Applies observed records to `txn` and reverts foreign structure.
pub fn fold_observed(
    txn: &mut Transaction,
    records: Vec<MutationRecord>,
    cache: &RenderCache,
    target: &mut dyn RenderTarget,
) -> CoreResult<FoldSummary> {
    let mut summary = FoldSummary::default();
    let mut damaged: BTreeSet<RenderId> = BTreeSet::new();

    for record in &records {
        if let MutationRecord::ChildList { target: parent, added, .. } = record {
            for node in added {
                if target.parent(*node) != Some(*parent) || is_owned(cache, &*target, *parent, *node) {
                    continue;
                }
                tracing::warn!("Reverting foreign render node {} under {}", node, parent);
                target.remove(*node)?;
                summary.removed_foreign += 1;
            }
        }
    }

    for record in records {
        match record {
            MutationRecord::CharacterData { target: node } => {
                if fold_text(txn, cache, &*target, node)? {
                    summary.folded_text += 1;
                }
            }
            MutationRecord::ChildList { target: parent, removed, .. } => {
                let lost_owned = removed.iter().any(|node| {
                    target.parent(*node).is_none() && is_owned(cache, &*target, parent, *node)
                });
                if lost_owned {
                    damaged.insert(parent);
                }
            }
        }
    }

    for parent in damaged {
        tracing::warn!("Restoring engine-owned children of {}", parent);
        restore_children(txn, cache, target, parent)?;
        summary.restored_parents += 1;
    }
    Ok(summary)
}

/// Returns true if `node` is something the engine put under `parent`.
fn is_owned(cache: &RenderCache, target: &dyn RenderTarget, parent: RenderId, node: RenderId) -> bool {
    if let Some(key) = target.key_of(node) {
        if cache.render_id(key) == Some(node) {
            return true;
        }
    }
    if cache.is_managed_break(node) {
        return true;
    }
    target
        .key_of(parent)
        .is_some_and(|key| cache.text_node(key) == Some(node))
}

/// Copies live text into the logical text node it renders.
fn fold_text(
    txn: &mut Transaction,
    cache: &RenderCache,
    target: &dyn RenderTarget,
    node: RenderId,
) -> CoreResult<bool> {
    let Some(live) = target.text(node) else {
        return Ok(false);
    };
    let Some(key) = target
        .parent(node)
        .and_then(|span| target.key_of(span))
        .filter(|key| cache.text_node(*key) == Some(node))
    else {
        return Ok(false);
    };
    if !txn.is_attached(key) || txn.text_content(key)? == live {
        return Ok(false);
    }

    tracing::debug!("Folding live text into {}", key);
    txn.set_text(key, live)?;

    let native = target.selection();
    if native.is_some_and(|range| range.anchor.node == node || range.focus.node == node) {
        if let Some(selection) = resolver::selection_from_native(txn.state(), cache, target) {
            txn.set_selection(Some(selection))?;
        }
    }
    Ok(true)
}

/// Puts the owned children of `parent` back in logical order.
fn restore_children(
    txn: &Transaction,
    cache: &RenderCache,
    target: &mut dyn RenderTarget,
    parent: RenderId,
) -> CoreResult<()> {
    let Some(key) = target.key_of(parent) else {
        return Ok(());
    };
    let committed = txn.prev_state();
    let Some(node) = committed.get(key) else {
        return Ok(());
    };

    match &node.kind {
        NodeKind::Text(_) => {
            if let Some(inner) = cache.text_node(key) {
                if target.parent(inner) != Some(parent) {
                    target.insert_before(parent, inner, None)?;
                }
            }
        }
        NodeKind::Root(_) | NodeKind::Element(_) => {
            let children: Vec<NodeKey> = committed.children(key).map_err(CoreError::from_model)?;
            for (index, child) in children.iter().enumerate() {
                let Some(dom) = cache.render_id(*child) else {
                    continue;
                };
                let live = target.children(parent);
                if live.get(index) != Some(&dom) {
                    target.insert_before(parent, dom, live.get(index).copied())?;
                }
            }
            if let Some(line_break) = cache.get(key).and_then(|entry| entry.line_break) {
                if target.children(parent).last() != Some(&line_break) {
                    target.insert_before(parent, line_break, None)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory_target::MemoryTarget;
    use crate::reconciler::{reconcile_root, ReconcileRequest};
    use crate::render::{NativePoint, NativeRange};
    use std::sync::Arc;
    use strata_model::{EditorState, KeyGenerator, Point, Selection};

    struct Fixture {
        dom: MemoryTarget,
        cache: RenderCache,
        state: Arc<EditorState>,
        para: NodeKey,
        first: NodeKey,
        second: NodeKey,
    }

    /// `<p><span>one</span><strong class="bold">two</strong></p><p><br></p>`
    fn fixture() -> Fixture {
        let mut empty = EditorState::empty();
        empty.freeze();
        let empty = Arc::new(empty);
        let mut txn = Transaction::open(Arc::clone(&empty), KeyGenerator::new(), None);
        let para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, para).unwrap();
        let first = txn.create_text("one").unwrap();
        txn.append(para, first).unwrap();
        let second = txn.create_text("two").unwrap();
        txn.set_text_format(second, strata_model::TextFormat::BOLD).unwrap();
        txn.append(para, second).unwrap();
        let empty_para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, empty_para).unwrap();
        let (mut state, summary) = txn.into_parts();
        state.freeze();

        let mut dom = MemoryTarget::new();
        let root = dom.create_container("div");
        dom.stash_key(root, NodeKey::ROOT);
        let mut cache = RenderCache::new();
        cache.mount(root);
        let request = ReconcileRequest {
            prev: &empty,
            next: &state,
            dirty_leaves: &summary.dirty_leaves,
            dirty_elements: &summary.dirty_elements,
            full: false,
        };
        reconcile_root(request, &mut dom, &mut cache, &Config::default()).unwrap();
        Fixture {
            dom,
            cache,
            state: Arc::new(state),
            para,
            first,
            second,
        }
    }

    fn fold(f: &Fixture) -> (Transaction, FoldSummary) {
        let mut txn = Transaction::open(Arc::clone(&f.state), KeyGenerator::after(f.state.max_key()), None);
        let mut dom = f.dom.clone();
        let records = dom.take_observed();
        let summary = fold_observed(&mut txn, records, &f.cache, &mut dom).unwrap();
        (txn, summary)
    }

    #[test]
    fn test_typed_text_is_folded_without_render_writes() {
        let f = fixture();
        let inner = f.cache.text_node(f.first).unwrap();
        f.dom.external_set_text(inner, "one!").unwrap();
        f.dom.external_set_selection(Some(NativeRange {
            anchor: NativePoint { node: inner, offset: 4 },
            focus: NativePoint { node: inner, offset: 4 },
        }));
        f.dom.clear_ops();

        let (txn, summary) = fold(&f);
        assert_eq!(summary.folded_text, 1);
        assert_eq!(txn.text_content(f.first).unwrap(), "one!");
        assert!(txn.dirty_leaves().contains(&f.first));
        assert_eq!(f.dom.tree_write_count(), 0);
        assert_eq!(txn.selection(), Some(&Selection::caret(Point::text(f.first, 4))));
    }

    #[test]
    fn test_unchanged_text_is_not_folded() {
        let f = fixture();
        let inner = f.cache.text_node(f.second).unwrap();
        f.dom.external_set_text(inner, "two").unwrap();
        let (txn, summary) = fold(&f);
        assert!(summary.is_empty());
        assert!(!txn.has_dirty_nodes());
    }

    #[test]
    fn test_foreign_nodes_are_removed() {
        let f = fixture();
        let para_dom = f.cache.render_id(f.para).unwrap();
        let second_dom = f.cache.render_id(f.second).unwrap();
        f.dom.external_insert_element(para_dom, "img", Some(second_dom)).unwrap();
        f.dom.external_insert_text(second_dom, "junk", None).unwrap();

        let (txn, summary) = fold(&f);
        assert_eq!(summary.removed_foreign, 2);
        assert_eq!(
            f.dom.to_html(para_dom),
            r#"<p dir="ltr"><span>one</span><strong class="bold">two</strong></p>"#
        );
        assert!(!txn.has_dirty_nodes());
    }

    #[test]
    fn test_removed_owned_nodes_are_restored_in_order() {
        let f = fixture();
        let para_dom = f.cache.render_id(f.para).unwrap();
        f.dom.external_remove(f.cache.render_id(f.first).unwrap()).unwrap();
        f.dom.external_remove(f.cache.text_node(f.second).unwrap()).unwrap();

        let (_, summary) = fold(&f);
        assert_eq!(summary.restored_parents, 2);
        assert_eq!(
            f.dom.to_html(para_dom),
            r#"<p dir="ltr"><span>one</span><strong class="bold">two</strong></p>"#
        );
    }

    #[test]
    fn test_removed_managed_break_is_restored() {
        let f = fixture();
        let root = f.cache.render_id(NodeKey::ROOT).unwrap();
        let before = f.dom.inner_html(root);
        let empty_para = f.dom.children(root)[1];
        let br = f.dom.children(empty_para)[0];
        f.dom.external_remove(br).unwrap();
        assert_ne!(f.dom.inner_html(root), before);

        fold(&f);
        assert_eq!(f.dom.inner_html(root), before);
    }
}
