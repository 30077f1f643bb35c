//! Structural and content operations on the pending tree.
//!
//! All operations go through [`Transaction::get_writable`], keep the sibling
//! lists consistent before returning, and repair the selection so that it
//! never points at a missing key or a shifted child index.
//!
//! ## Selection repair
//!
//! - Inserting a child at index `i` shifts element points on the parent with
//!   `offset >= i` by one; removing it shifts points with `offset > i` back.
//! - A point inside a removed subtree moves to the end of the previous
//!   sibling, else the start of the next sibling, else to an element point
//!   in the parent. Siblings that are neither text nor element resolve to the
//!   parent point next to them.

use std::collections::BTreeSet;

use strata_model::{
    DecoratorData, EditorState, ElementData, ModelError, Node, NodeKey, NodeKind, Point,
    PointKind, Selection, TextData, TextFormat, TextMode,
};

use crate::transaction::Transaction;
use crate::{CoreError, CoreResult};

impl Transaction {
    // ==================== Creation ====================

    /// Creates a detached block element.
    pub fn create_element(
        &mut self,
        type_name: impl Into<String>,
        tag: impl Into<String>,
    ) -> CoreResult<NodeKey> {
        self.create_element_with(ElementData::new(type_name, tag))
    }

    pub fn create_element_with(&mut self, data: ElementData) -> CoreResult<NodeKey> {
        let data = ElementData {
            first: None,
            last: None,
            size: 0,
            ..data
        };
        let key = self.next_key();
        self.register(Node::new(key, NodeKind::Element(data)))
    }

    pub fn create_paragraph(&mut self) -> CoreResult<NodeKey> {
        self.create_element("paragraph", "p")
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> CoreResult<NodeKey> {
        self.create_text_with(TextData::new(text))
    }

    pub fn create_text_with(&mut self, data: TextData) -> CoreResult<NodeKey> {
        let key = self.next_key();
        self.register(Node::new(key, NodeKind::Text(data)))
    }

    pub fn create_line_break(&mut self) -> CoreResult<NodeKey> {
        let key = self.next_key();
        self.register(Node::new(key, NodeKind::LineBreak))
    }

    pub fn create_decorator(
        &mut self,
        type_name: impl Into<String>,
        payload: serde_json::Value,
        inline: bool,
    ) -> CoreResult<NodeKey> {
        let key = self.next_key();
        let data = DecoratorData {
            type_name: type_name.into(),
            payload,
            inline,
        };
        self.register(Node::new(key, NodeKind::Decorator(data)))
    }

    // ==================== Reads ====================

    /// Child keys of an element in order.
    pub fn children(&self, key: NodeKey) -> CoreResult<Vec<NodeKey>> {
        self.state.children(key).map_err(CoreError::from_model)
    }

    pub fn parent_of(&self, key: NodeKey) -> CoreResult<Option<NodeKey>> {
        Ok(self.get_latest(key)?.parent)
    }

    pub fn text_content(&self, key: NodeKey) -> CoreResult<String> {
        self.state.text_content(key).map_err(CoreError::from_model)
    }

    pub fn is_attached(&self, key: NodeKey) -> bool {
        self.state.is_attached(key)
    }

    // ==================== Structure ====================

    /// Appends `child` as the last child of `parent`, moving it if attached.
    pub fn append(&mut self, parent: NodeKey, child: NodeKey) -> CoreResult<()> {
        self.check_insertable(parent, child)?;
        self.detach_for_move(child)?;
        self.link(parent, child, None)
    }

    /// Inserts `node` right before `target`.
    pub fn insert_before(&mut self, target: NodeKey, node: NodeKey) -> CoreResult<()> {
        if target == node {
            return Err(CoreError::InvalidOperation(format!(
                "cannot insert {} next to itself",
                node
            )));
        }
        let parent = self.attached_parent(target)?;
        self.check_insertable(parent, node)?;
        self.detach_for_move(node)?;

        let index = self.index_of(target);
        self.link(parent, node, Some(target))?;
        self.shift_element_points(parent, index, 1)
    }

    /// Inserts `node` right after `target`.
    pub fn insert_after(&mut self, target: NodeKey, node: NodeKey) -> CoreResult<()> {
        if target == node {
            return Err(CoreError::InvalidOperation(format!(
                "cannot insert {} next to itself",
                node
            )));
        }
        let parent = self.attached_parent(target)?;
        self.check_insertable(parent, node)?;
        self.detach_for_move(node)?;

        let next = self.get_latest(target)?.next;
        let index = self.index_of(target) + 1;
        self.link(parent, node, next)?;
        self.shift_element_points(parent, index, 1)
    }

    /// Detaches `key` from the tree, repairing the selection.
    ///
    /// A parent that cannot be empty is removed as well once its last child
    /// goes. Detached nodes stay in the map until garbage collection.
    pub fn remove(&mut self, key: NodeKey) -> CoreResult<()> {
        if key.is_root() {
            return Err(CoreError::InvalidOperation("cannot remove the root".into()));
        }
        let node = self.get_latest(key)?;
        let Some(parent) = node.parent else {
            return Ok(());
        };
        let (prev, next) = (node.prev, node.next);
        let index = self.index_of(key);

        self.repair_points_on_removal(&[key], parent, prev, next, index)?;
        self.unlink(key)?;
        self.shift_element_points(parent, index, -1)?;
        self.forget_removed(key)?;

        let parent_node = self.get_latest(parent)?;
        let collapse = !parent_node.is_root()
            && parent_node
                .as_element()
                .is_some_and(|e| e.size == 0 && !e.can_be_empty);
        if collapse {
            self.remove(parent)?;
        }
        Ok(())
    }

    /// Puts `replacement` where `key` is and detaches `key`.
    ///
    /// With `include_children` the children of `key` move into the
    /// replacement, which must then be an element.
    pub fn replace(
        &mut self,
        key: NodeKey,
        replacement: NodeKey,
        include_children: bool,
    ) -> CoreResult<NodeKey> {
        if key == replacement {
            return Ok(key);
        }
        if key.is_root() {
            return Err(CoreError::InvalidOperation("cannot replace the root".into()));
        }
        if self.state.is_ancestor(key, replacement) {
            return Err(CoreError::InvalidOperation(format!(
                "{} is inside the node it replaces",
                replacement
            )));
        }
        if include_children && !self.get_latest(replacement)?.is_element() {
            return Err(CoreError::Model(ModelError::NotAnElement(replacement)));
        }
        let parent = self.attached_parent(key)?;
        self.check_insertable(parent, replacement)?;
        self.detach_for_move(replacement)?;

        let next = self.get_latest(key)?.next;
        let moved_children = if include_children {
            self.children(key)?
        } else {
            Vec::new()
        };
        self.unlink(key)?;
        self.link(parent, replacement, next)?;
        for child in moved_children {
            self.unlink(child)?;
            self.link(replacement, child, None)?;
        }

        // Points on the replaced node, or on descendants left behind, go to
        // the end of the replacement.
        let end = point_at_end(&self.state, replacement);
        let state = &self.state;
        let stranded = |k: NodeKey| k == key || (!include_children && state.is_ancestor(key, k));
        let mut selection = self.state.selection().cloned();
        match selection.as_mut() {
            Some(Selection::Range(range)) => {
                for point in [&mut range.anchor, &mut range.focus] {
                    if stranded(point.key) {
                        *point = end;
                    }
                }
            }
            Some(Selection::Node(set)) => {
                if set.keys.remove(&key) {
                    set.keys.insert(replacement);
                }
                set.keys.retain(|k| !stranded(*k));
            }
            Some(Selection::Grid(grid)) => {
                if stranded(grid.grid_key) {
                    selection = None;
                } else {
                    for cell in [&mut grid.anchor, &mut grid.focus] {
                        if *cell == key {
                            *cell = replacement;
                        }
                    }
                }
            }
            None => {}
        }
        if self.state.selection() != selection.as_ref() {
            *self.selection_slot()? = selection;
        }

        if self.composition_key == Some(key) {
            self.composition_key = Some(replacement);
        }
        // Descendants left under `key` are gone with it.
        self.forget_removed(key)?;
        Ok(replacement)
    }

    /// Removes `delete_count` children of `parent` starting at `start` and
    /// inserts `nodes` in their place.
    pub fn splice(
        &mut self,
        parent: NodeKey,
        start: usize,
        delete_count: usize,
        nodes: &[NodeKey],
    ) -> CoreResult<()> {
        let children = self.children(parent)?;
        let end = start
            .checked_add(delete_count)
            .filter(|end| *end <= children.len())
            .ok_or_else(|| {
                CoreError::InvalidOperation(format!(
                    "splice {}..{}+{} out of bounds",
                    start, start, delete_count
                ))
            })?;
        for node in nodes {
            self.check_insertable(parent, *node)?;
        }

        let inserted: BTreeSet<NodeKey> = nodes.iter().copied().collect();
        let deleted: Vec<NodeKey> = children[start..end]
            .iter()
            .copied()
            .filter(|k| !inserted.contains(k))
            .collect();
        let before = children[..start]
            .iter()
            .rev()
            .copied()
            .find(|k| !inserted.contains(k));
        let after = children[end..]
            .iter()
            .copied()
            .find(|k| !inserted.contains(k));

        if !deleted.is_empty() {
            self.repair_points_on_removal(&deleted, parent, before, after, start)?;
        }
        for key in &deleted {
            self.unlink(*key)?;
            self.forget_removed(*key)?;
        }
        for node in nodes {
            self.detach_for_move(*node)?;
            self.link(parent, *node, after)?;
        }

        let grown = nodes.len() as isize - (end - start) as isize;
        self.shift_spliced_points(parent, start, end, grown)?;

        let parent_node = self.get_latest(parent)?;
        let collapse = !parent_node.is_root()
            && parent_node
                .as_element()
                .is_some_and(|e| e.size == 0 && !e.can_be_empty);
        if collapse && !deleted.is_empty() {
            self.remove(parent)?;
        }
        Ok(())
    }

    // ==================== Content ====================

    /// Replaces the text of a text node. Text points past the end are clamped.
    pub fn set_text(&mut self, key: NodeKey, text: impl Into<String>) -> CoreResult<()> {
        let text = text.into();
        let len = text.chars().count();
        self.writable_text(key)?.text = text;

        let needs_clamp = match self.state.selection() {
            Some(Selection::Range(range)) => [range.anchor, range.focus]
                .iter()
                .any(|p| p.key == key && p.kind == PointKind::Text && p.offset > len),
            _ => false,
        };
        if needs_clamp {
            if let Some(Selection::Range(range)) = self.selection_slot()? {
                for point in [&mut range.anchor, &mut range.focus] {
                    if point.key == key && point.kind == PointKind::Text {
                        point.offset = point.offset.min(len);
                    }
                }
            }
        }
        Ok(())
    }

    /// Splits a text node at the given character offsets.
    ///
    /// The first part keeps the key; new parts are inserted after it with the
    /// same format, style and mode. Returns the keys of all parts.
    pub fn split_text(&mut self, key: NodeKey, offsets: &[usize]) -> CoreResult<Vec<NodeKey>> {
        let node = self.get_latest(key)?;
        let data = node.as_text().ok_or(CoreError::Model(ModelError::NotAText(key)))?;
        let chars: Vec<char> = data.text.chars().collect();

        let mut cuts: Vec<usize> = offsets
            .iter()
            .copied()
            .filter(|o| *o > 0 && *o < chars.len())
            .collect();
        cuts.sort_unstable();
        cuts.dedup();
        if cuts.is_empty() {
            return Ok(vec![key]);
        }

        let mut bounds = Vec::with_capacity(cuts.len() + 2);
        bounds.push(0);
        bounds.extend(cuts);
        bounds.push(chars.len());
        let pieces: Vec<String> = bounds
            .windows(2)
            .map(|w| chars[w[0]..w[1]].iter().collect())
            .collect();

        let template = data.clone();
        let parent = node.parent;
        let insert_index = self.index_of(key) + 1;

        self.writable_text(key)?.text = pieces[0].clone();
        let mut parts = vec![key];
        let mut last = key;
        for piece in &pieces[1..] {
            let part = self.create_text_with(TextData {
                text: piece.clone(),
                ..template.clone()
            })?;
            if let Some(parent) = parent {
                let next = self.get_latest(last)?.next;
                self.link(parent, part, next)?;
            }
            parts.push(part);
            last = part;
        }

        let mut selection = self.state.selection().cloned();
        if let Some(Selection::Range(range)) = selection.as_mut() {
            for point in [&mut range.anchor, &mut range.focus] {
                if point.key != key || point.kind != PointKind::Text {
                    continue;
                }
                let mut consumed = 0;
                for part in &parts {
                    let size = self.state.get(*part).and_then(Node::as_text).map_or(0, TextData::len);
                    if point.offset <= consumed + size {
                        point.key = *part;
                        point.offset -= consumed;
                        break;
                    }
                    consumed += size;
                }
            }
        }
        if self.state.selection() != selection.as_ref() {
            *self.selection_slot()? = selection;
        }
        if let Some(parent) = parent {
            self.shift_element_points(parent, insert_index, parts.len() as isize - 1)?;
        }
        Ok(parts)
    }

    pub fn set_text_format(&mut self, key: NodeKey, format: TextFormat) -> CoreResult<()> {
        self.writable_text(key)?.format = format;
        Ok(())
    }

    pub fn set_text_style(&mut self, key: NodeKey, style: impl Into<String>) -> CoreResult<()> {
        self.writable_text(key)?.style = style.into();
        Ok(())
    }

    pub fn set_text_mode(&mut self, key: NodeKey, mode: TextMode) -> CoreResult<()> {
        self.writable_text(key)?.mode = mode;
        Ok(())
    }

    pub fn set_element_tag(&mut self, key: NodeKey, tag: impl Into<String>) -> CoreResult<()> {
        self.writable_element(key)?.tag = tag.into();
        Ok(())
    }

    /// Sets or clears (`None`) a render attribute.
    pub fn set_element_attribute(
        &mut self,
        key: NodeKey,
        name: impl Into<String>,
        value: Option<String>,
    ) -> CoreResult<()> {
        let element = self.writable_element(key)?;
        let name = name.into();
        match value {
            Some(value) => element.attributes.insert(name, value),
            None => element.attributes.remove(&name),
        };
        Ok(())
    }

    pub fn set_decorator_payload(
        &mut self,
        key: NodeKey,
        payload: serde_json::Value,
    ) -> CoreResult<()> {
        match &mut self.get_writable(key)?.kind {
            NodeKind::Decorator(data) => {
                data.payload = payload;
                Ok(())
            }
            _ => Err(CoreError::InvalidOperation(format!(
                "{} is not a decorator",
                key
            ))),
        }
    }

    /// Marks a node dirty without changing it, so transforms and the
    /// reconciler visit it again.
    pub fn mark_dirty(&mut self, key: NodeKey) -> CoreResult<()> {
        self.get_writable(key)?;
        Ok(())
    }

    fn writable_text(&mut self, key: NodeKey) -> CoreResult<&mut TextData> {
        if !self.get_latest(key)?.is_text() {
            return Err(CoreError::Model(ModelError::NotAText(key)));
        }
        self.get_writable(key)?
            .as_text_mut()
            .ok_or(CoreError::Model(ModelError::NotAText(key)))
    }

    fn writable_element(&mut self, key: NodeKey) -> CoreResult<&mut ElementData> {
        if !self.get_latest(key)?.is_element() {
            return Err(CoreError::Model(ModelError::NotAnElement(key)));
        }
        self.get_writable(key)?
            .as_element_mut()
            .ok_or(CoreError::Model(ModelError::NotAnElement(key)))
    }

    // ==================== Selection Helpers ====================

    /// Selects characters `anchor..focus` of a text node.
    pub fn select_text(&mut self, key: NodeKey, anchor: usize, focus: usize) -> CoreResult<()> {
        let len = self
            .get_latest(key)?
            .as_text()
            .ok_or(CoreError::Model(ModelError::NotAText(key)))?
            .len();
        self.set_selection(Some(Selection::range(
            Point::text(key, anchor.min(len)),
            Point::text(key, focus.min(len)),
        )))
    }

    /// Selects child positions `anchor..focus` of an element.
    pub fn select_element(&mut self, key: NodeKey, anchor: usize, focus: usize) -> CoreResult<()> {
        let size = self
            .get_latest(key)?
            .as_element()
            .ok_or(CoreError::Model(ModelError::NotAnElement(key)))?
            .size;
        self.set_selection(Some(Selection::range(
            Point::element(key, anchor.min(size)),
            Point::element(key, focus.min(size)),
        )))
    }

    /// Selects whole nodes.
    pub fn select_nodes(&mut self, keys: impl IntoIterator<Item = NodeKey>) -> CoreResult<()> {
        let set = strata_model::NodeSelection::new(keys);
        for key in &set.keys {
            self.get_latest(*key)?;
        }
        self.set_selection(Some(Selection::Node(set)))
    }

    /// Nodes covered by the selection in document order, cached until the
    /// next write.
    pub fn selected_nodes(&self) -> Vec<NodeKey> {
        let Some(selection) = self.state.selection() else {
            return Vec::new();
        };
        let state = &self.state;
        selection
            .cache()
            .get_or_init(|| resolve_selected_nodes(state, selection))
            .to_vec()
    }

    // ==================== Internals ====================

    fn attached_parent(&self, key: NodeKey) -> CoreResult<NodeKey> {
        self.get_latest(key)?.parent.ok_or_else(|| {
            CoreError::InvalidOperation(format!("{} has no parent", key))
        })
    }

    fn index_of(&self, key: NodeKey) -> usize {
        self.state.index_in_parent(key).unwrap_or(0)
    }

    /// Refuses insertions that would break the tree shape.
    fn check_insertable(&self, parent: NodeKey, child: NodeKey) -> CoreResult<()> {
        let parent_node = self.get_latest(parent)?;
        let child_node = self.get_latest(child)?;
        if !parent_node.is_element() {
            return Err(CoreError::Model(ModelError::NotAnElement(parent)));
        }
        if child.is_root() {
            return Err(CoreError::InvalidOperation("cannot insert the root".into()));
        }
        if child == parent || self.state.is_ancestor(child, parent) {
            return Err(CoreError::InvalidOperation(format!(
                "inserting {} into {} would create a cycle",
                child, parent
            )));
        }
        if parent_node.is_root() && child_node.is_text() {
            return Err(CoreError::InvalidOperation(
                "text cannot be a direct child of the root".into(),
            ));
        }
        Ok(())
    }

    /// Detaches a node that is about to be reinserted elsewhere.
    fn detach_for_move(&mut self, key: NodeKey) -> CoreResult<()> {
        let Some(parent) = self.get_latest(key)?.parent else {
            return Ok(());
        };
        let index = self.index_of(key);
        self.unlink(key)?;
        self.shift_element_points(parent, index, -1)
    }

    /// Removes `key` from its parent's child list. No selection repair.
    fn unlink(&mut self, key: NodeKey) -> CoreResult<()> {
        let node = self.get_latest(key)?;
        let Some(parent) = node.parent else {
            return Ok(());
        };
        let (prev, next) = (node.prev, node.next);

        if let Some(prev) = prev {
            self.get_writable(prev)?.next = next;
        }
        if let Some(next) = next {
            self.get_writable(next)?.prev = prev;
        }
        let element = self
            .get_writable(parent)?
            .as_element_mut()
            .ok_or(CoreError::Model(ModelError::NotAnElement(parent)))?;
        if element.first == Some(key) {
            element.first = next;
        }
        if element.last == Some(key) {
            element.last = prev;
        }
        element.size = element.size.saturating_sub(1);

        let node = self.get_writable(key)?;
        node.parent = None;
        node.prev = None;
        node.next = None;
        Ok(())
    }

    /// Links a detached node into `parent` before `before` (or last).
    fn link(&mut self, parent: NodeKey, key: NodeKey, before: Option<NodeKey>) -> CoreResult<()> {
        let prev = match before {
            Some(before) => {
                let before_node = self.get_latest(before)?;
                if before_node.parent != Some(parent) {
                    return Err(CoreError::BrokenChildList {
                        key: parent,
                        detail: format!("{} is not a child", before),
                    });
                }
                before_node.prev
            }
            None => {
                self.get_latest(parent)?
                    .as_element()
                    .ok_or(CoreError::Model(ModelError::NotAnElement(parent)))?
                    .last
            }
        };

        if let Some(prev) = prev {
            self.get_writable(prev)?.next = Some(key);
        }
        if let Some(before) = before {
            self.get_writable(before)?.prev = Some(key);
        }
        {
            let node = self.get_writable(key)?;
            node.parent = Some(parent);
            node.prev = prev;
            node.next = before;
        }
        let element = self
            .get_writable(parent)?
            .as_element_mut()
            .ok_or(CoreError::Model(ModelError::NotAnElement(parent)))?;
        if prev.is_none() {
            element.first = Some(key);
        }
        if before.is_none() {
            element.last = Some(key);
        }
        element.size += 1;
        Ok(())
    }

    /// Shifts element points on `parent` for a child inserted (`delta > 0`)
    /// or removed (`delta < 0`) at `index`.
    fn shift_element_points(&mut self, parent: NodeKey, index: usize, delta: isize) -> CoreResult<()> {
        let Some(Selection::Range(range)) = self.state.selection() else {
            return Ok(());
        };
        let affected = |p: &Point| {
            p.kind == PointKind::Element
                && p.key == parent
                && if delta > 0 { index <= p.offset } else { index < p.offset }
        };
        if !affected(&range.anchor) && !affected(&range.focus) {
            return Ok(());
        }
        if let Some(Selection::Range(range)) = self.selection_slot()? {
            for point in [&mut range.anchor, &mut range.focus] {
                if affected(point) {
                    point.offset = point.offset.saturating_add_signed(delta);
                }
            }
        }
        Ok(())
    }

    /// Element points on `parent` after a splice of `start..end`.
    fn shift_spliced_points(
        &mut self,
        parent: NodeKey,
        start: usize,
        end: usize,
        grown: isize,
    ) -> CoreResult<()> {
        let Some(Selection::Range(range)) = self.state.selection() else {
            return Ok(());
        };
        let affected = |p: &Point| p.kind == PointKind::Element && p.key == parent && p.offset > start;
        if !affected(&range.anchor) && !affected(&range.focus) {
            return Ok(());
        }
        let size = self.get_latest(parent)?.child_count();
        if let Some(Selection::Range(range)) = self.selection_slot()? {
            for point in [&mut range.anchor, &mut range.focus] {
                if !affected(point) {
                    continue;
                }
                point.offset = if point.offset >= end {
                    point.offset.saturating_add_signed(grown)
                } else {
                    start
                };
                point.offset = point.offset.min(size);
            }
        }
        Ok(())
    }

    /// Moves range points that sit inside any of `removed` to a neighbour.
    fn repair_points_on_removal(
        &mut self,
        removed: &[NodeKey],
        parent: NodeKey,
        prev: Option<NodeKey>,
        next: Option<NodeKey>,
        index: usize,
    ) -> CoreResult<()> {
        let Some(Selection::Range(range)) = self.state.selection() else {
            return Ok(());
        };
        let state = &self.state;
        let inside = |k: NodeKey| removed.iter().any(|r| *r == k || state.is_ancestor(*r, k));
        if !inside(range.anchor.key) && !inside(range.focus.key) {
            return Ok(());
        }
        let target = sibling_point(state, parent, prev, next, index);
        let (move_anchor, move_focus) = (inside(range.anchor.key), inside(range.focus.key));
        if let Some(Selection::Range(range)) = self.selection_slot()? {
            if move_anchor {
                range.anchor = target;
            }
            if move_focus {
                range.focus = target;
            }
        }
        Ok(())
    }

    /// Drops a removed subtree from node and grid selections and from the
    /// composition key.
    fn forget_removed(&mut self, key: NodeKey) -> CoreResult<()> {
        let state = &self.state;
        let gone = |k: NodeKey| k == key || state.is_ancestor(key, k);

        if self.composition_key.is_some_and(gone) {
            self.composition_key = None;
        }
        let update = match state.selection() {
            Some(Selection::Node(set)) if set.keys.iter().any(|k| gone(*k)) => {
                let mut set = set.clone();
                set.keys.retain(|k| !gone(*k));
                Some(Some(Selection::Node(set)))
            }
            Some(Selection::Grid(grid))
                if gone(grid.grid_key) || gone(grid.anchor) || gone(grid.focus) =>
            {
                Some(None)
            }
            _ => None,
        };
        if let Some(selection) = update {
            *self.selection_slot()? = selection;
        }
        Ok(())
    }
}

/// Where a point lands when its node is removed.
fn sibling_point(
    state: &EditorState,
    parent: NodeKey,
    prev: Option<NodeKey>,
    next: Option<NodeKey>,
    index: usize,
) -> Point {
    let sibling = match prev {
        Some(prev) => state.get(prev).map(|node| (prev, node, true)),
        None => next.and_then(|next| state.get(next).map(|node| (next, node, false))),
    };
    match sibling {
        Some((key, node, is_prev)) => match &node.kind {
            NodeKind::Text(data) => Point::text(key, if is_prev { data.len() } else { 0 }),
            NodeKind::Element(data) | NodeKind::Root(data) => {
                Point::element(key, if is_prev { data.size } else { 0 })
            }
            _ => Point::element(parent, index),
        },
        None => Point::element(parent, index),
    }
}

/// The last caret position inside `key`.
pub(crate) fn point_at_end(state: &EditorState, key: NodeKey) -> Point {
    let last = state.last_descendant(key);
    match state.get(last).map(|n| &n.kind) {
        Some(NodeKind::Text(data)) => Point::text(last, data.len()),
        Some(NodeKind::Element(data)) | Some(NodeKind::Root(data)) => Point::element(last, data.size),
        _ => {
            let parent = state.get(last).and_then(|n| n.parent);
            match (parent, state.index_in_parent(last)) {
                (Some(parent), Some(index)) => Point::element(parent, index + 1),
                _ => Point::element(key, 0),
            }
        }
    }
}

/// The node a point addresses in document order.
fn point_node(state: &EditorState, point: &Point) -> NodeKey {
    if point.kind == PointKind::Text {
        return point.key;
    }
    match state.child_at(point.key, point.offset) {
        Some(child) => state.first_descendant(child),
        None => state.last_descendant(point.key),
    }
}

fn resolve_selected_nodes(state: &EditorState, selection: &Selection) -> Vec<NodeKey> {
    match selection {
        Selection::Node(set) => set.keys.iter().copied().collect(),
        Selection::Range(range) => {
            let Ok(order) = state.preorder(NodeKey::ROOT) else {
                return Vec::new();
            };
            let a = point_node(state, &range.anchor);
            let b = point_node(state, &range.focus);
            let ia = order.iter().position(|k| *k == a);
            let ib = order.iter().position(|k| *k == b);
            match (ia, ib) {
                (Some(ia), Some(ib)) => order[ia.min(ib)..=ia.max(ib)].to_vec(),
                _ => Vec::new(),
            }
        }
        Selection::Grid(grid) => {
            let Ok(order) = state.preorder(grid.grid_key) else {
                return Vec::new();
            };
            let ia = order.iter().position(|k| *k == grid.anchor);
            let ib = order.iter().position(|k| *k == grid.focus);
            match (ia, ib) {
                (Some(ia), Some(ib)) => order[ia.min(ib)..=ia.max(ib)].to_vec(),
                _ => Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// root > p(text "Hello", text "World")
    fn fixture() -> (Transaction, NodeKey, NodeKey, NodeKey) {
        let mut txn = Transaction::for_test();
        let para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, para).unwrap();
        let a = txn.create_text("Hello").unwrap();
        let b = txn.create_text("World").unwrap();
        txn.append(para, a).unwrap();
        txn.append(para, b).unwrap();
        (txn, para, a, b)
    }

    fn range(txn: &Transaction) -> strata_model::RangeSelection {
        txn.selection().unwrap().as_range().unwrap().clone()
    }

    #[test]
    fn test_append_and_insert_keep_links() {
        let (mut txn, para, a, b) = fixture();
        let c = txn.create_text("!").unwrap();
        txn.insert_before(b, c).unwrap();
        assert_eq!(txn.children(para).unwrap(), vec![a, c, b]);

        let d = txn.create_line_break().unwrap();
        txn.insert_after(b, d).unwrap();
        assert_eq!(txn.children(para).unwrap(), vec![a, c, b, d]);
        assert!(txn.state().validate().is_ok());
    }

    #[test]
    fn test_moving_a_node_detaches_it_first() {
        let (mut txn, para, a, b) = fixture();
        let other = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, other).unwrap();
        txn.append(other, a).unwrap();

        assert_eq!(txn.children(para).unwrap(), vec![b]);
        assert_eq!(txn.children(other).unwrap(), vec![a]);
        assert!(txn.state().validate().is_ok());
    }

    #[test]
    fn test_cycles_are_refused() {
        let (mut txn, para, a, _) = fixture();
        let inner = txn.create_element("link", "a").unwrap();
        txn.append(para, inner).unwrap();

        assert!(matches!(
            txn.append(inner, para),
            Err(CoreError::InvalidOperation(_))
        ));
        assert!(matches!(
            txn.append(para, NodeKey::ROOT),
            Err(CoreError::InvalidOperation(_))
        ));
        assert!(matches!(
            txn.append(para, para),
            Err(CoreError::InvalidOperation(_))
        ));
        assert!(matches!(txn.append(a, inner), Err(CoreError::Model(_))));
        assert!(txn.state().validate().is_ok());
    }

    #[test]
    fn test_removing_selected_leaf_moves_caret_to_sibling() {
        let (mut txn, _, a, b) = fixture();
        txn.select_text(b, 2, 2).unwrap();
        txn.remove(b).unwrap();

        assert_eq!(range(&txn).anchor, Point::text(a, 5));
        assert_eq!(range(&txn).focus, Point::text(a, 5));
    }

    #[test]
    fn test_removing_first_leaf_moves_caret_to_next_start() {
        let (mut txn, _, a, b) = fixture();
        txn.select_text(a, 1, 3).unwrap();
        txn.remove(a).unwrap();
        assert_eq!(range(&txn).anchor, Point::text(b, 0));
    }

    #[test]
    fn test_removed_leaf_next_to_line_break_resolves_to_parent() {
        let mut txn = Transaction::for_test();
        let para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, para).unwrap();
        let br = txn.create_line_break().unwrap();
        let text = txn.create_text("x").unwrap();
        txn.append(para, br).unwrap();
        txn.append(para, text).unwrap();

        txn.select_text(text, 1, 1).unwrap();
        txn.remove(text).unwrap();
        assert_eq!(range(&txn).anchor, Point::element(para, 1));
    }

    #[test]
    fn test_removing_last_child_anchors_on_parent() {
        let mut txn = Transaction::for_test();
        let para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, para).unwrap();
        let text = txn.create_text("only").unwrap();
        txn.append(para, text).unwrap();

        txn.select_text(text, 2, 2).unwrap();
        txn.remove(text).unwrap();
        assert_eq!(range(&txn).anchor, Point::element(para, 0));
    }

    #[test]
    fn test_removing_subtree_moves_points_from_descendants() {
        let (mut txn, para, _, b) = fixture();
        let second = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, second).unwrap();
        let t = txn.create_text("tail").unwrap();
        txn.append(second, t).unwrap();

        txn.select_text(t, 1, 3).unwrap();
        txn.remove(second).unwrap();
        assert_eq!(range(&txn).anchor, Point::element(para, 2));
        assert_eq!(txn.children(para).unwrap().last(), Some(&b));
    }

    #[test]
    fn test_element_points_shift_on_insert_and_remove() {
        let (mut txn, para, a, b) = fixture();
        txn.select_element(para, 1, 2).unwrap();

        let c = txn.create_text("c").unwrap();
        txn.insert_before(a, c).unwrap();
        assert_eq!(range(&txn).anchor, Point::element(para, 2));
        assert_eq!(range(&txn).focus, Point::element(para, 3));

        let d = txn.create_text("d").unwrap();
        txn.insert_after(b, d).unwrap();
        assert_eq!(range(&txn).anchor, Point::element(para, 2));
        assert_eq!(range(&txn).focus, Point::element(para, 4));

        txn.remove(c).unwrap();
        assert_eq!(range(&txn).anchor, Point::element(para, 1));
        assert_eq!(range(&txn).focus, Point::element(para, 3));
    }

    #[test]
    fn test_empty_parent_that_cannot_be_empty_is_removed() {
        let mut txn = Transaction::for_test();
        let list = txn
            .create_element_with(ElementData {
                can_be_empty: false,
                ..ElementData::new("listitem", "li")
            })
            .unwrap();
        txn.append(NodeKey::ROOT, list).unwrap();
        let text = txn.create_text("item").unwrap();
        txn.append(list, text).unwrap();

        txn.remove(text).unwrap();
        assert!(!txn.is_attached(list));
        assert!(txn.children(NodeKey::ROOT).unwrap().is_empty());
    }

    #[test]
    fn test_node_selection_drops_removed_keys() {
        let (mut txn, _, a, b) = fixture();
        txn.select_nodes([a, b]).unwrap();
        txn.remove(a).unwrap();
        match txn.selection().unwrap() {
            Selection::Node(set) => assert_eq!(set.keys.iter().copied().collect::<Vec<_>>(), vec![b]),
            other => panic!("unexpected selection {:?}", other),
        }
    }

    #[test]
    fn test_replace_moves_points_and_composition() {
        let (mut txn, para, a, b) = fixture();
        txn.select_text(a, 2, 2).unwrap();
        txn.set_composition_key(Some(a));

        let fresh = txn.create_text("Hey").unwrap();
        txn.replace(a, fresh, false).unwrap();

        assert_eq!(txn.children(para).unwrap(), vec![fresh, b]);
        assert_eq!(range(&txn).anchor, Point::text(fresh, 3));
        assert_eq!(txn.composition_key(), Some(fresh));
        assert!(!txn.is_attached(a));
    }

    #[test]
    fn test_replace_with_children() {
        let (mut txn, para, a, b) = fixture();
        let heading = txn.create_element("heading", "h1").unwrap();
        txn.select_element(para, 2, 2).unwrap();
        txn.replace(para, heading, true).unwrap();

        assert_eq!(txn.children(heading).unwrap(), vec![a, b]);
        assert_eq!(txn.children(NodeKey::ROOT).unwrap(), vec![heading]);
        assert_eq!(range(&txn).anchor, Point::text(b, 5));
        assert!(txn.state().validate().is_ok());
    }

    #[test]
    fn test_replace_without_children_drops_composition_inside() {
        let (mut txn, para, a, _) = fixture();
        txn.set_composition_key(Some(a));

        let quote = txn.create_element("quote", "blockquote").unwrap();
        txn.replace(para, quote, false).unwrap();

        assert_eq!(txn.composition_key(), None);
        assert!(!txn.is_attached(a));
    }

    #[test]
    fn test_replace_cell_keeps_grid_selection() {
        let mut txn = Transaction::for_test();
        let table = txn.create_element("table", "table").unwrap();
        txn.append(NodeKey::ROOT, table).unwrap();
        let first = txn.create_element("tablecell", "td").unwrap();
        let second = txn.create_element("tablecell", "td").unwrap();
        txn.append(table, first).unwrap();
        txn.append(table, second).unwrap();
        txn.set_selection(Some(Selection::Grid(strata_model::GridSelection {
            grid_key: table,
            anchor: first,
            focus: second,
            cache: Default::default(),
        })))
        .unwrap();

        let fresh = txn.create_element("tablecell", "td").unwrap();
        txn.replace(first, fresh, true).unwrap();

        match txn.selection().unwrap() {
            Selection::Grid(grid) => {
                assert_eq!(grid.anchor, fresh);
                assert_eq!(grid.focus, second);
            }
            other => panic!("unexpected selection {:?}", other),
        }
    }

    #[test]
    fn test_splice_removes_and_inserts() {
        let (mut txn, para, a, b) = fixture();
        let x = txn.create_text("x").unwrap();
        let y = txn.create_text("y").unwrap();
        txn.select_text(a, 1, 1).unwrap();

        txn.splice(para, 0, 1, &[x, y]).unwrap();
        assert_eq!(txn.children(para).unwrap(), vec![x, y, b]);
        assert!(!txn.is_attached(a));
        assert_eq!(range(&txn).anchor, Point::text(b, 0));
        assert!(txn.state().validate().is_ok());

        assert!(txn.splice(para, 2, 5, &[]).is_err());
    }

    #[test]
    fn test_set_text_clamps_points() {
        let (mut txn, _, a, _) = fixture();
        txn.select_text(a, 1, 5).unwrap();
        txn.set_text(a, "Hi").unwrap();
        assert_eq!(range(&txn).anchor, Point::text(a, 1));
        assert_eq!(range(&txn).focus, Point::text(a, 2));
    }

    #[test]
    fn test_split_text_moves_points_into_parts() {
        let (mut txn, para, a, b) = fixture();
        txn.select_text(a, 2, 4).unwrap();
        txn.set_text_format(a, TextFormat::BOLD).unwrap();

        let parts = txn.split_text(a, &[2, 3]).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], a);

        let texts: Vec<String> = parts.iter().map(|k| txn.text_content(*k).unwrap()).collect();
        assert_eq!(texts, vec!["He", "l", "lo"]);
        assert_eq!(txn.children(para).unwrap(), vec![a, parts[1], parts[2], b]);
        assert_eq!(
            txn.get_latest(parts[2]).unwrap().as_text().unwrap().format,
            TextFormat::BOLD
        );

        // the boundary offset stays on the earlier part
        assert_eq!(range(&txn).anchor, Point::text(a, 2));
        assert_eq!(range(&txn).focus, Point::text(parts[2], 1));
    }

    #[test]
    fn test_split_text_uses_char_offsets() {
        let mut txn = Transaction::for_test();
        let para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, para).unwrap();
        let t = txn.create_text("héllo").unwrap();
        txn.append(para, t).unwrap();

        let parts = txn.split_text(t, &[2]).unwrap();
        assert_eq!(txn.text_content(parts[0]).unwrap(), "hé");
        assert_eq!(txn.text_content(parts[1]).unwrap(), "llo");
    }

    #[test]
    fn test_selected_nodes_are_cached_until_write() {
        let (mut txn, _, a, b) = fixture();
        txn.set_selection(Some(Selection::range(Point::text(a, 1), Point::text(b, 2))))
            .unwrap();
        assert_eq!(txn.selected_nodes(), vec![a, b]);
        assert!(txn.selection().unwrap().cache().get().is_some());

        txn.mark_dirty(a).unwrap();
        assert!(txn.selection().unwrap().cache().get().is_none());
    }

    #[test]
    fn test_text_on_root_is_refused() {
        let mut txn = Transaction::for_test();
        let t = txn.create_text("loose").unwrap();
        assert!(matches!(
            txn.append(NodeKey::ROOT, t),
            Err(CoreError::InvalidOperation(_))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        AppendParagraph,
        AppendText(usize),
        InsertBefore(usize, usize),
        InsertAfter(usize, usize),
        Remove(usize),
        Move(usize, usize),
        Replace(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::AppendParagraph),
            any::<usize>().prop_map(Op::AppendText),
            (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::InsertBefore(a, b)),
            (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::InsertAfter(a, b)),
            any::<usize>().prop_map(Op::Remove),
            (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Move(a, b)),
            any::<usize>().prop_map(Op::Replace),
        ]
    }

    proptest! {
        #[test]
        fn prop_random_operations_keep_the_tree_valid(ops in prop::collection::vec(op(), 1..40)) {
            let mut txn = Transaction::for_test();
            for op in ops {
                let attached: Vec<NodeKey> = txn
                    .state()
                    .preorder(NodeKey::ROOT)
                    .unwrap()
                    .into_iter()
                    .filter(|k| !k.is_root())
                    .collect();
                let pick = |i: usize| (!attached.is_empty()).then(|| attached[i % attached.len()]);
                let elements: Vec<NodeKey> = attached
                    .iter()
                    .copied()
                    .filter(|k| txn.get_latest(*k).unwrap().is_element())
                    .collect();
                let pick_element = |i: usize| (!elements.is_empty()).then(|| elements[i % elements.len()]);

                // Rejected operations must leave the tree intact too.
                let _ = match op {
                    Op::AppendParagraph => {
                        let p = txn.create_paragraph().unwrap();
                        txn.append(NodeKey::ROOT, p)
                    }
                    Op::AppendText(i) => match pick_element(i) {
                        Some(parent) => {
                            let t = txn.create_text("t").unwrap();
                            txn.append(parent, t)
                        }
                        None => Ok(()),
                    },
                    Op::InsertBefore(i, j) | Op::InsertAfter(i, j) => match (pick(i), pick(j)) {
                        (Some(target), Some(node)) => {
                            if matches!(op, Op::InsertBefore(..)) {
                                txn.insert_before(target, node)
                            } else {
                                txn.insert_after(target, node)
                            }
                        }
                        _ => Ok(()),
                    },
                    Op::Remove(i) => match pick(i) {
                        Some(key) => txn.remove(key),
                        None => Ok(()),
                    },
                    Op::Move(i, j) => match (pick_element(i), pick(j)) {
                        (Some(parent), Some(node)) => txn.append(parent, node),
                        _ => Ok(()),
                    },
                    Op::Replace(i) => match pick(i) {
                        Some(key) => {
                            let fresh = txn.create_element("quote", "blockquote").unwrap();
                            txn.replace(key, fresh, txn.get_latest(key).unwrap().is_element())
                                .map(|_| ())
                        }
                        None => Ok(()),
                    },
                };
                prop_assert!(txn.state().validate().is_ok());
            }
        }
    }
}
