//! Mapping between logical selection points and native render positions.
//!
//! Text points map onto the text render node inside a text node's format
//! element. Element points map onto a child index of the element's render
//! node; every logical child owns exactly one render child, and the
//! managed trailing break always sits after them, so indices line up.

use strata_model::{EditorState, NodeKey, NodeKind, Point, PointKind, Selection};

use crate::reconciler::RenderCache;
use crate::render::{NativePoint, NativeRange, RenderId, RenderTarget};

/// Native position of a logical point, if the point's node is rendered.
pub fn point_to_native(state: &EditorState, cache: &RenderCache, point: &Point) -> Option<NativePoint> {
    let node = state.get(point.key)?;
    match (point.kind, &node.kind) {
        (PointKind::Text, NodeKind::Text(data)) => Some(NativePoint {
            node: cache.text_node(point.key)?,
            offset: point.offset.min(data.len()),
        }),
        (PointKind::Element, NodeKind::Root(data) | NodeKind::Element(data)) => Some(NativePoint {
            node: cache.render_id(point.key)?,
            offset: point.offset.min(data.size),
        }),
        _ => None,
    }
}

/// The logical point a native position falls on.
pub fn native_to_point(
    state: &EditorState,
    cache: &RenderCache,
    target: &dyn RenderTarget,
    native: NativePoint,
) -> Option<Point> {
    let (key, owner) = owning_key(target, native.node)?;
    let node = state.get(key)?;
    if cache.render_id(key) != Some(owner) {
        return None;
    }

    match &node.kind {
        NodeKind::Text(data) => {
            let offset = if Some(native.node) == cache.text_node(key) {
                native.offset
            } else if native.offset == 0 {
                0
            } else {
                data.len()
            };
            Some(Point::text(key, offset.min(data.len())))
        }
        NodeKind::Root(_) | NodeKind::Element(_) if owner != native.node => None,
        NodeKind::Root(data) | NodeKind::Element(data) => {
            let owned_before = target
                .children(owner)
                .into_iter()
                .take(native.offset)
                .filter(|child| target.key_of(*child).is_some())
                .count();
            Some(Point::element(key, owned_before.min(data.size)))
        }
        _ => {
            // a leaf without characters: caret before or after it
            let parent = node.parent?;
            let index = state.index_in_parent(key)?;
            let after = usize::from(native.offset > 0);
            Some(Point::element(parent, index + after))
        }
    }
}

/// Nearest ancestor-or-self render node carrying a logical key.
fn owning_key(target: &dyn RenderTarget, mut node: RenderId) -> Option<(NodeKey, RenderId)> {
    loop {
        if let Some(key) = target.key_of(node) {
            return Some((key, node));
        }
        node = target.parent(node)?;
    }
}

/// Reads the native selection back as a logical one.
pub fn selection_from_native(
    state: &EditorState,
    cache: &RenderCache,
    target: &dyn RenderTarget,
) -> Option<Selection> {
    let native = target.selection()?;
    let anchor = native_to_point(state, cache, target, native.anchor)?;
    let focus = native_to_point(state, cache, target, native.focus)?;
    Some(Selection::range(anchor, focus))
}

/// Writes the logical selection of `state` to the target after a commit.
///
/// Does nothing when the native selection already matches. Failures are
/// logged and swallowed: the platform may refuse a selection at any time.
pub fn apply_selection(
    state: &EditorState,
    cache: &RenderCache,
    target: &mut dyn RenderTarget,
    scroll_into_view: bool,
) {
    let desired = match state.selection() {
        Some(Selection::Range(range)) => {
            let anchor = point_to_native(state, cache, &range.anchor);
            let focus = point_to_native(state, cache, &range.focus);
            match (anchor, focus) {
                (Some(anchor), Some(focus)) => Some(NativeRange { anchor, focus }),
                _ => {
                    tracing::debug!("Selection endpoints are not rendered; leaving native selection");
                    return;
                }
            }
        }
        Some(Selection::Node(_)) | Some(Selection::Grid(_)) | None => None,
    };

    if target.selection() == desired {
        tracing::trace!("Native selection already up to date");
        return;
    }
    match target.set_selection(desired) {
        Ok(()) => {
            if let (true, Some(range)) = (scroll_into_view, desired) {
                target.scroll_into_view(range.focus);
            }
        }
        Err(err) => tracing::debug!("Ignoring native selection write failure: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory_target::{MemoryTarget, RenderOp};
    use crate::reconciler::{reconcile_root, ReconcileRequest};
    use crate::transaction::Transaction;
    use std::sync::Arc;
    use strata_model::KeyGenerator;

    struct Rendered {
        dom: MemoryTarget,
        root: RenderId,
        cache: RenderCache,
        state: EditorState,
        para: NodeKey,
        text: NodeKey,
        br: NodeKey,
    }

    /// Renders `<p><span>hello</span><br><br></p>` with a caret in "hello".
    fn render() -> Rendered {
        let mut empty = EditorState::empty();
        empty.freeze();
        let empty = Arc::new(empty);
        let mut txn = Transaction::open(Arc::clone(&empty), KeyGenerator::new(), None);
        let para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, para).unwrap();
        let text = txn.create_text("hello").unwrap();
        txn.append(para, text).unwrap();
        let br = txn.create_line_break().unwrap();
        txn.append(para, br).unwrap();
        txn.select_text(text, 1, 3).unwrap();
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
        Rendered {
            dom,
            root,
            cache,
            state,
            para,
            text,
            br,
        }
    }

    #[test]
    fn test_text_point_maps_to_inner_text_node() {
        let r = render();
        let native = point_to_native(&r.state, &r.cache, &Point::text(r.text, 3)).unwrap();
        assert_eq!(native.node, r.cache.text_node(r.text).unwrap());
        assert_eq!(native.offset, 3);
        let back = native_to_point(&r.state, &r.cache, &r.dom, native).unwrap();
        assert_eq!(back, Point::text(r.text, 3));
    }

    #[test]
    fn test_element_offsets_skip_managed_break() {
        let r = render();
        let para_dom = r.cache.render_id(r.para).unwrap();
        // after the logical line break, before the managed one
        let point = native_to_point(&r.state, &r.cache, &r.dom, NativePoint { node: para_dom, offset: 3 }).unwrap();
        assert_eq!(point, Point::element(r.para, 2));
    }

    #[test]
    fn test_line_break_resolves_to_parent_point() {
        let r = render();
        let br_dom = r.cache.render_id(r.br).unwrap();
        let point = native_to_point(&r.state, &r.cache, &r.dom, NativePoint { node: br_dom, offset: 0 }).unwrap();
        assert_eq!(point, Point::element(r.para, 1));
    }

    #[test]
    fn test_foreign_nodes_do_not_resolve() {
        let r = render();
        let stray = r.dom.external_insert_text(r.root, "stray", None).unwrap();
        let point = native_to_point(&r.state, &r.cache, &r.dom, NativePoint { node: stray, offset: 1 });
        assert_eq!(point, None);

        let orphan = {
            let mut dom = r.dom.clone();
            dom.create_text("loose")
        };
        assert!(native_to_point(&r.state, &r.cache, &r.dom, NativePoint { node: orphan, offset: 0 }).is_none());
    }

    #[test]
    fn test_apply_selection_writes_once() {
        let r = render();
        let mut dom = r.dom.clone();
        r.dom.clear_ops();

        apply_selection(&r.state, &r.cache, &mut dom, true);
        let inner = r.cache.text_node(r.text).unwrap();
        let native = dom.selection().unwrap();
        assert_eq!(native.anchor, NativePoint { node: inner, offset: 1 });
        assert_eq!(native.focus, NativePoint { node: inner, offset: 3 });
        assert_eq!(r.dom.scrolled(), vec![native.focus]);

        apply_selection(&r.state, &r.cache, &mut dom, true);
        let writes = r.dom.ops().iter().filter(|op| **op == RenderOp::SetSelection).count();
        assert_eq!(writes, 1);
        assert_eq!(
            selection_from_native(&r.state, &r.cache, &dom),
            Some(Selection::range(Point::text(r.text, 1), Point::text(r.text, 3)))
        );
    }

    #[test]
    fn test_selection_write_failures_are_swallowed() {
        let r = render();
        let mut dom = r.dom.clone();
        dom.set_fail_selection_writes(true);
        apply_selection(&r.state, &r.cache, &mut dom, true);
        assert_eq!(dom.selection(), None);
        assert!(r.dom.scrolled().is_empty());
    }
}
