//! Keyed reconciliation of the logical tree against a render target.
//!
//! ## Design
//!
//! The reconciler walks from the root comparing the committed state with
//! the next one. Nodes that are the same allocation in both states and are
//! not dirty are skipped in O(1): their subtree text comes from the
//! [`RenderCache`]. Everything else is patched in place, or destroyed and
//! recreated when the render shape has to change.
//!
//! ```text
//!   prev children:  A  B  C         next children:  A  C  B
//!                   ▲                               ▲
//!                   └── two cursors move from the front ──┘
//!
//!   same key          → reconcile in place
//!   only in next      → create at the cursor
//!   only in prev      → destroy
//!   in both, moved    → move the existing render node
//! ```
//!
//! ## Learning: returning what a recursion accumulates
//!
//! Each call returns the subtree text it produced instead of writing into
//! shared accumulators, so a subtree's contribution is whatever its call
//! returned and nothing has to be saved and restored around recursion.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use strata_model::{EditorState, Node, NodeKey, NodeKind};

use crate::config::Config;
use crate::direction::{self, Direction};
use crate::listener::MutationKind;
use crate::render::{RenderError, RenderId, RenderTarget};
use crate::transaction::DirtyCause;
use crate::{CoreError, CoreResult};

/// Render-side bookkeeping for one logical node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEntry {
    /// Outer render node
    pub id: RenderId,
    /// Text render node inside a text node's format element
    pub inner: Option<RenderId>,
    /// Subtree text, without the trailing block separator
    pub text: String,
    /// Text that decides the writing direction
    pub dir_text: String,
    /// Synthetic trailing break owned by this element
    pub line_break: Option<RenderId>,
    pub direction: Option<Direction>,
}

impl RenderEntry {
    fn new(id: RenderId) -> Self {
        Self {
            id,
            inner: None,
            text: String::new(),
            dir_text: String::new(),
            line_break: None,
            direction: None,
        }
    }
}

/// Logical key to render node map kept across commits.
#[derive(Debug, Clone, Default)]
pub struct RenderCache {
    entries: HashMap<NodeKey, RenderEntry>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts over with `root` as the render node of the root.
    pub fn mount(&mut self, root: RenderId) {
        self.entries.clear();
        self.entries.insert(NodeKey::ROOT, RenderEntry::new(root));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, key: NodeKey) -> Option<&RenderEntry> {
        self.entries.get(&key)
    }

    /// Outer render node of `key`.
    pub fn render_id(&self, key: NodeKey) -> Option<RenderId> {
        self.entries.get(&key).map(|e| e.id)
    }

    /// Text render node of a text node.
    pub fn text_node(&self, key: NodeKey) -> Option<RenderId> {
        self.entries.get(&key).and_then(|e| e.inner)
    }

    /// Returns true if `id` is the managed trailing break of some element.
    pub fn is_managed_break(&self, id: RenderId) -> bool {
        self.entries.values().any(|e| e.line_break == Some(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What changed on the render side during one pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Per node type, per key
    pub mutations: BTreeMap<String, BTreeMap<NodeKey, MutationKind>>,
    /// Decorators created, destroyed or given a new payload
    pub decorators_changed: BTreeSet<NodeKey>,
    /// Text content of the whole document
    pub text_content: String,
}

/// The two states to diff and what changed between them.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileRequest<'a> {
    pub prev: &'a EditorState,
    pub next: &'a EditorState,
    pub dirty_leaves: &'a BTreeSet<NodeKey>,
    pub dirty_elements: &'a BTreeMap<NodeKey, DirtyCause>,
    /// Treat every node as dirty and repair drifted render content
    pub full: bool,
}

/// Brings the render tree under the cached root in line with `request.next`.
pub fn reconcile_root(
    request: ReconcileRequest<'_>,
    target: &mut dyn RenderTarget,
    cache: &mut RenderCache,
    config: &Config,
) -> CoreResult<ReconcileOutcome> {
    let prev_ids = cache.entries.iter().map(|(k, e)| (*k, e.id)).collect();
    let mut pass = Pass {
        prev: request.prev,
        next: request.next,
        dirty_leaves: request.dirty_leaves,
        dirty_elements: request.dirty_elements,
        full: request.full,
        target,
        cache,
        config,
        prev_ids,
        outcome: ReconcileOutcome::default(),
    };
    let rendered = pass.reconcile_node(NodeKey::ROOT, None)?;
    let mut outcome = pass.outcome;
    outcome.text_content = rendered.text;
    tracing::debug!(
        "Reconciled {} node types, {} decorator changes{}",
        outcome.mutations.len(),
        outcome.decorators_changed.len(),
        if request.full { " (full)" } else { "" }
    );
    Ok(outcome)
}

/// What a reconciled subtree hands to its parent.
struct Rendered {
    dom: RenderId,
    /// Subtree text including the trailing block separator
    text: String,
    /// Directioned text the parent inherits
    dir_text: String,
}

struct Pass<'a> {
    prev: &'a EditorState,
    next: &'a EditorState,
    dirty_leaves: &'a BTreeSet<NodeKey>,
    dirty_elements: &'a BTreeMap<NodeKey, DirtyCause>,
    full: bool,
    target: &'a mut dyn RenderTarget,
    cache: &'a mut RenderCache,
    config: &'a Config,
    /// Render nodes as they were when the pass started
    prev_ids: HashMap<NodeKey, RenderId>,
    outcome: ReconcileOutcome,
}

impl<'a> Pass<'a> {
    fn is_dirty(&self, key: NodeKey) -> bool {
        self.full || self.dirty_leaves.contains(&key) || self.dirty_elements.contains_key(&key)
    }

    fn entry(&self, key: NodeKey) -> CoreResult<RenderEntry> {
        self.cache
            .entries
            .get(&key)
            .cloned()
            .ok_or(CoreError::Render(RenderError::Unrendered(key)))
    }

    fn current_dom(&self, key: NodeKey) -> CoreResult<RenderId> {
        self.cache
            .render_id(key)
            .ok_or(CoreError::Render(RenderError::Unrendered(key)))
    }

    fn prev_dom(&self, key: NodeKey) -> CoreResult<RenderId> {
        self.prev_ids
            .get(&key)
            .copied()
            .ok_or(CoreError::Render(RenderError::Unrendered(key)))
    }

    // ==================== Node Reconciliation ====================

    fn reconcile_node(&mut self, key: NodeKey, parent_dom: Option<RenderId>) -> CoreResult<Rendered> {
        let (prev, next) = (self.prev, self.next);
        let next_arc = next.node_arc(key).ok_or(CoreError::NodeNotFound(key))?;
        let next_node: &'a Node = next_arc.as_ref();
        let prev_arc = prev.node_arc(key);
        let same = prev_arc.is_some_and(|p| std::sync::Arc::ptr_eq(p, next_arc));
        let dirty = self.is_dirty(key);
        let mut entry = self.entry(key)?;

        if same && !dirty {
            tracing::trace!("Reusing {}", key);
            return Ok(Rendered {
                dom: entry.id,
                text: entry.text.clone() + block_separator(next_node),
                dir_text: inherited_dir_text(next_node, &entry),
            });
        }

        let prev_node: &'a Node = match prev_arc {
            Some(arc) => arc.as_ref(),
            None => return Err(CoreError::Render(RenderError::Unrendered(key))),
        };
        if !same && dirty {
            self.record(next_node, MutationKind::Updated);
        }

        if requires_replace(prev_node, next_node) {
            let parent_dom = parent_dom.ok_or_else(|| {
                CoreError::InvalidOperation(format!("render node of {} cannot be replaced", key))
            })?;
            tracing::trace!("Replacing render node of {}", key);
            let rendered = self.create_node(key, None, None)?;
            self.target.replace(parent_dom, rendered.dom, entry.id)?;
            self.destroy_node(key, None)?;
            return Ok(rendered);
        }

        let dom = entry.id;
        match (&prev_node.kind, &next_node.kind) {
            (NodeKind::Root(prev_data) | NodeKind::Element(prev_data), NodeKind::Root(next_data) | NodeKind::Element(next_data)) => {
                for (name, value) in &next_data.attributes {
                    if prev_data.attributes.get(name) != Some(value) {
                        self.target.set_attribute(dom, name, Some(value.as_str()))?;
                    }
                }
                for name in prev_data.attributes.keys() {
                    if !next_data.attributes.contains_key(name) {
                        self.target.set_attribute(dom, name, None)?;
                    }
                }

                if dirty {
                    let previous_dir_text = std::mem::take(&mut entry.dir_text);
                    let (text, dir_text) = self.reconcile_children(prev_node, next_node, dom)?;
                    entry.text = text;
                    entry.dir_text = dir_text;
                    if is_block(next_node) {
                        self.sync_line_break(next_node, &mut entry)?;
                        self.sync_direction(&mut entry, Some(&previous_dir_text))?;
                    }
                }
                if self.full {
                    self.evict_foreign_children(&entry)?;
                }
            }
            (NodeKind::Text(prev_data), NodeKind::Text(next_data)) => {
                let inner = entry
                    .inner
                    .ok_or(CoreError::Render(RenderError::Unrendered(key)))?;
                // live text may already match when it was folded from the target
                let stale = (self.full || prev_data.text != next_data.text)
                    && self.target.text(inner).as_deref() != Some(next_data.text.as_str());
                if stale {
                    self.target.set_text(inner, &next_data.text)?;
                }
                if prev_data.style != next_data.style {
                    let style = (!next_data.style.is_empty()).then_some(next_data.style.as_str());
                    self.target.set_attribute(dom, "style", style)?;
                }
                // formats sharing a tag differ only in their class
                if prev_data.format != next_data.format {
                    let classes = next_data.format.class_names();
                    let class = (!classes.is_empty()).then_some(classes.as_str());
                    self.target.set_attribute(dom, "class", class)?;
                }
                entry.text = next_data.text.clone();
                entry.dir_text = next_data.text.clone();
            }
            (NodeKind::Decorator(prev_data), NodeKind::Decorator(next_data)) => {
                if prev_data.payload != next_data.payload {
                    self.outcome.decorators_changed.insert(key);
                }
            }
            _ => {}
        }

        let rendered = Rendered {
            dom,
            text: entry.text.clone() + block_separator(next_node),
            dir_text: inherited_dir_text(next_node, &entry),
        };
        self.cache.entries.insert(key, entry);
        Ok(rendered)
    }

    fn reconcile_children(&mut self, prev_node: &'a Node, next_node: &'a Node, dom: RenderId) -> CoreResult<(String, String)> {
        let key = next_node.key;
        let prev_size = prev_node.child_count();
        let next_size = next_node.child_count();
        let mut acc = Accumulated::default();

        if prev_size == 1 && next_size == 1 {
            let prev_first = first_child(prev_node)?;
            let next_first = first_child(next_node)?;
            if prev_first == next_first {
                let rendered = self.reconcile_node(next_first, Some(dom))?;
                acc.push(&rendered);
            } else {
                let old = self.prev_dom(prev_first)?;
                let rendered = self.create_node(next_first, None, None)?;
                self.target.replace(dom, rendered.dom, old)?;
                self.destroy_node(prev_first, None)?;
                acc.push(&rendered);
            }
            return Ok(acc.finish());
        }

        let prev_children = self.prev.children(key).map_err(CoreError::from_model)?;
        let next_children = self.next.children(key).map_err(CoreError::from_model)?;
        if prev_size == 0 {
            self.create_children(&next_children, dom, None, &mut acc)?;
        } else if next_size == 0 {
            for child in prev_children {
                self.destroy_node(child, Some(dom))?;
            }
        } else {
            self.reconcile_node_children(&prev_children, &next_children, dom, &mut acc)?;
        }
        Ok(acc.finish())
    }

    fn reconcile_node_children(
        &mut self,
        prev_children: &[NodeKey],
        next_children: &[NodeKey],
        dom: RenderId,
        acc: &mut Accumulated,
    ) -> CoreResult<()> {
        let mut prev_set: Option<HashSet<NodeKey>> = None;
        let mut next_set: Option<HashSet<NodeKey>> = None;
        let mut sibling = self.target.children(dom).first().copied();
        let (mut prev_index, mut next_index) = (0, 0);

        while prev_index < prev_children.len() && next_index < next_children.len() {
            let prev_key = prev_children[prev_index];
            let next_key = next_children[next_index];

            if prev_key == next_key {
                let rendered = self.reconcile_node(next_key, Some(dom))?;
                sibling = self.target.next_sibling(rendered.dom);
                acc.push(&rendered);
                prev_index += 1;
                next_index += 1;
                continue;
            }

            let prev_set = prev_set.get_or_insert_with(|| prev_children.iter().copied().collect());
            let next_set = next_set.get_or_insert_with(|| next_children.iter().copied().collect());
            let next_has_prev = next_set.contains(&prev_key);
            let prev_has_next = prev_set.contains(&next_key);

            if !next_has_prev {
                let old = self.prev_dom(prev_key)?;
                sibling = self.target.next_sibling(old);
                self.destroy_node(prev_key, Some(dom))?;
                prev_index += 1;
            } else if !prev_has_next {
                let rendered = self.create_node(next_key, Some(dom), sibling)?;
                acc.push(&rendered);
                next_index += 1;
            } else {
                let child_dom = self.current_dom(next_key)?;
                if Some(child_dom) == sibling {
                    let rendered = self.reconcile_node(next_key, Some(dom))?;
                    sibling = self.target.next_sibling(rendered.dom);
                    acc.push(&rendered);
                } else {
                    tracing::trace!("Moving render node of {}", next_key);
                    self.insert_child(dom, child_dom, sibling)?;
                    let rendered = self.reconcile_node(next_key, Some(dom))?;
                    acc.push(&rendered);
                }
                prev_index += 1;
                next_index += 1;
            }
        }

        if prev_index >= prev_children.len() && next_index < next_children.len() {
            self.create_children(&next_children[next_index..], dom, None, acc)?;
        } else if next_index >= next_children.len() {
            for child in &prev_children[prev_index..] {
                self.destroy_node(*child, Some(dom))?;
            }
        }
        Ok(())
    }

    // ==================== Creation ====================

    fn create_children(
        &mut self,
        children: &[NodeKey],
        dom: RenderId,
        before: Option<RenderId>,
        acc: &mut Accumulated,
    ) -> CoreResult<()> {
        for child in children {
            let rendered = self.create_node(*child, Some(dom), before)?;
            acc.push(&rendered);
        }
        Ok(())
    }

    fn create_node(&mut self, key: NodeKey, parent_dom: Option<RenderId>, before: Option<RenderId>) -> CoreResult<Rendered> {
        let next = self.next;
        let node = next.node(key).map_err(CoreError::from_model)?;
        let mut entry = self.create_dom(node)?;
        self.target.stash_key(entry.id, key);

        match &node.kind {
            NodeKind::Root(_) | NodeKind::Element(_) => {
                let children = next.children(key).map_err(CoreError::from_model)?;
                let mut acc = Accumulated::default();
                self.create_children(&children, entry.id, None, &mut acc)?;
                (entry.text, entry.dir_text) = acc.finish();
                if is_block(node) {
                    self.sync_line_break(node, &mut entry)?;
                    self.sync_direction(&mut entry, None)?;
                }
            }
            NodeKind::Text(data) => {
                entry.text = data.text.clone();
                entry.dir_text = data.text.clone();
            }
            NodeKind::LineBreak => entry.text = "\n".to_string(),
            NodeKind::Decorator(_) => {
                self.outcome.decorators_changed.insert(key);
            }
        }

        let rendered = Rendered {
            dom: entry.id,
            text: entry.text.clone() + block_separator(node),
            dir_text: inherited_dir_text(node, &entry),
        };
        self.cache.entries.insert(key, entry);
        if let Some(parent_dom) = parent_dom {
            self.insert_child(parent_dom, rendered.dom, before)?;
        }
        self.record(node, MutationKind::Created);
        Ok(rendered)
    }

    /// Creates the detached render node(s) of a single logical node.
    fn create_dom(&mut self, node: &Node) -> CoreResult<RenderEntry> {
        match &node.kind {
            NodeKind::Root(data) | NodeKind::Element(data) => {
                let dom = self.target.create_element(&data.tag);
                for (name, value) in &data.attributes {
                    self.target.set_attribute(dom, name, Some(value.as_str()))?;
                }
                if let Some(class) = self.config.theme.class_for(&data.type_name) {
                    self.target.set_attribute(dom, "class", Some(class))?;
                }
                Ok(RenderEntry::new(dom))
            }
            NodeKind::Text(data) => {
                let dom = self.target.create_element(data.format.tag());
                let inner = self.target.create_text(&data.text);
                self.target.insert_before(dom, inner, None)?;
                if !data.style.is_empty() {
                    self.target.set_attribute(dom, "style", Some(data.style.as_str()))?;
                }
                let classes = data.format.class_names();
                if !classes.is_empty() {
                    self.target.set_attribute(dom, "class", Some(classes.as_str()))?;
                }
                let mut entry = RenderEntry::new(dom);
                entry.inner = Some(inner);
                Ok(entry)
            }
            NodeKind::LineBreak => Ok(RenderEntry::new(self.target.create_element("br"))),
            NodeKind::Decorator(data) => {
                let dom = self.target.create_element(if data.inline { "span" } else { "div" });
                self.target.set_attribute(dom, "data-decorator", Some(data.type_name.as_str()))?;
                self.target.set_attribute(dom, "contenteditable", Some("false"))?;
                Ok(RenderEntry::new(dom))
            }
        }
    }

    /// Inserts before `before`, or before the parent's managed break.
    fn insert_child(&mut self, parent_dom: RenderId, child: RenderId, before: Option<RenderId>) -> CoreResult<()> {
        let before = before.or_else(|| {
            let parent_key = self.target.key_of(parent_dom)?;
            let line_break = self.cache.entries.get(&parent_key)?.line_break?;
            (self.target.parent(line_break) == Some(parent_dom)).then_some(line_break)
        });
        self.target.insert_before(parent_dom, child, before)?;
        Ok(())
    }

    // ==================== Destruction ====================

    /// Removes the render node the pass started with from `parent_dom` and
    /// forgets keys that no longer exist.
    fn destroy_node(&mut self, key: NodeKey, parent_dom: Option<RenderId>) -> CoreResult<()> {
        let prev = self.prev;
        if let (Some(parent_dom), Some(old)) = (parent_dom, self.prev_ids.get(&key).copied()) {
            if self.target.parent(old) == Some(parent_dom) {
                self.target.remove(old)?;
            }
        }
        if !self.next.contains(key) {
            self.cache.entries.remove(&key);
        }

        let Some(node) = prev.get(key) else {
            return Ok(());
        };
        if node.is_element() {
            for child in prev.children(key).map_err(CoreError::from_model)? {
                self.destroy_node(child, None)?;
            }
        }
        if node.is_decorator() {
            self.outcome.decorators_changed.insert(key);
        }
        self.record(node, MutationKind::Destroyed);
        Ok(())
    }

    // ==================== Element Decorations ====================

    /// Keeps the synthetic trailing break in step with the last child.
    fn sync_line_break(&mut self, node: &Node, entry: &mut RenderEntry) -> CoreResult<()> {
        let wants_break = ends_with_break(self.next, node);
        match (entry.line_break, wants_break) {
            (None, true) => {
                let br = self.target.create_element("br");
                self.target.insert_before(entry.id, br, None)?;
                entry.line_break = Some(br);
            }
            (Some(br), false) => {
                if self.target.parent(br) == Some(entry.id) {
                    self.target.remove(br)?;
                }
                entry.line_break = None;
            }
            (Some(br), true) if self.target.parent(br) != Some(entry.id) => {
                self.target.insert_before(entry.id, br, None)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Rewrites `dir` only when the direction actually changed.
    fn sync_direction(&mut self, entry: &mut RenderEntry, previous_dir_text: Option<&str>) -> CoreResult<()> {
        if !self.config.reconciler.writing_direction || previous_dir_text == Some(entry.dir_text.as_str()) {
            return Ok(());
        }
        let direction = direction::detect(&entry.dir_text);
        if direction != entry.direction {
            self.target
                .set_attribute(entry.id, "dir", direction.map(Direction::as_attr))?;
            entry.direction = direction;
        }
        Ok(())
    }

    /// Drops render children the engine does not own.
    fn evict_foreign_children(&mut self, entry: &RenderEntry) -> CoreResult<()> {
        for child in self.target.children(entry.id) {
            if Some(child) == entry.line_break {
                continue;
            }
            let owned = self
                .target
                .key_of(child)
                .and_then(|key| self.cache.render_id(key))
                == Some(child);
            if !owned {
                tracing::debug!("Evicting foreign render node {}", child);
                self.target.remove(child)?;
            }
        }
        Ok(())
    }

    // ==================== Mutations ====================

    fn record(&mut self, node: &Node, kind: MutationKind) {
        let by_key = self
            .outcome
            .mutations
            .entry(node.type_name().to_string())
            .or_default();
        match by_key.get(&node.key).copied() {
            None => {
                by_key.insert(node.key, kind);
            }
            Some(MutationKind::Created) if kind == MutationKind::Destroyed => {
                by_key.insert(node.key, MutationKind::Updated);
            }
            Some(MutationKind::Destroyed) if kind == MutationKind::Created => {
                by_key.insert(node.key, MutationKind::Updated);
            }
            Some(_) => {}
        }
    }
}

/// Text gathered from a run of children.
#[derive(Default)]
struct Accumulated {
    text: String,
    dir_text: String,
}

impl Accumulated {
    fn push(&mut self, rendered: &Rendered) {
        self.text.push_str(&rendered.text);
        self.dir_text.push_str(&rendered.dir_text);
    }

    fn finish(self) -> (String, String) {
        (self.text, self.dir_text)
    }
}

fn is_block(node: &Node) -> bool {
    matches!(node.kind, NodeKind::Element(_)) && !node.is_inline()
}

fn block_separator(node: &Node) -> &'static str {
    if node.is_element() && !node.is_inline() && node.next.is_some() {
        "\n\n"
    } else {
        ""
    }
}

/// Blocks keep their directioned text to themselves.
fn inherited_dir_text(node: &Node, entry: &RenderEntry) -> String {
    match node.kind {
        NodeKind::Text(_) => entry.dir_text.clone(),
        NodeKind::Element(_) if node.is_inline() => entry.dir_text.clone(),
        _ => String::new(),
    }
}

fn first_child(node: &Node) -> CoreResult<NodeKey> {
    node.as_element()
        .and_then(|e| e.first)
        .ok_or_else(|| CoreError::BrokenChildList {
            key: node.key,
            detail: "size is 1 but first is unset".to_string(),
        })
}

/// Empty, or last child is a line break or inline decorator.
fn ends_with_break(state: &EditorState, node: &Node) -> bool {
    let Some(data) = node.as_element() else {
        return false;
    };
    match data.last.and_then(|last| state.get(last)) {
        None => true,
        Some(last) => last.is_line_break() || (last.is_decorator() && last.is_inline()),
    }
}

/// Returns true when the render node cannot be patched into the new shape.
fn requires_replace(prev: &Node, next: &Node) -> bool {
    match (&prev.kind, &next.kind) {
        (NodeKind::Root(_), NodeKind::Root(_)) => false,
        (NodeKind::Element(a), NodeKind::Element(b)) => a.tag != b.tag,
        (NodeKind::Text(a), NodeKind::Text(b)) => a.format.tag() != b.format.tag(),
        (NodeKind::LineBreak, NodeKind::LineBreak) => false,
        (NodeKind::Decorator(a), NodeKind::Decorator(b)) => a.inline != b.inline,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::collect_detached;
    use crate::memory_target::{MemoryTarget, RenderOp};
    use crate::transaction::Transaction;
    use std::sync::Arc;
    use strata_model::{KeyGenerator, TextFormat};

    struct Harness {
        dom: MemoryTarget,
        root: RenderId,
        cache: RenderCache,
        state: Arc<EditorState>,
        config: Config,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(Config::default())
        }

        fn with_config(config: Config) -> Self {
            let mut dom = MemoryTarget::new();
            let root = dom.create_container("div");
            dom.stash_key(root, NodeKey::ROOT);
            let mut cache = RenderCache::new();
            cache.mount(root);
            let mut state = EditorState::empty();
            state.freeze();
            Self {
                dom,
                root,
                cache,
                state: Arc::new(state),
                config,
            }
        }

        fn update<T>(&mut self, f: impl FnOnce(&mut Transaction) -> T) -> (T, ReconcileOutcome) {
            self.run(f, false)
        }

        fn run<T>(&mut self, f: impl FnOnce(&mut Transaction) -> T, full: bool) -> (T, ReconcileOutcome) {
            let keys = KeyGenerator::after(self.state.max_key());
            let mut txn = Transaction::open(Arc::clone(&self.state), keys, None);
            let value = f(&mut txn);
            collect_detached(&mut txn).unwrap();
            let (mut next, summary) = txn.into_parts();
            next.freeze();

            self.dom.clear_ops();
            let mut target = self.dom.clone();
            let request = ReconcileRequest {
                prev: &self.state,
                next: &next,
                dirty_leaves: &summary.dirty_leaves,
                dirty_elements: &summary.dirty_elements,
                full,
            };
            let outcome = reconcile_root(request, &mut target, &mut self.cache, &self.config).unwrap();
            self.state = Arc::new(next);
            (value, outcome)
        }

        fn html(&self) -> String {
            self.dom.inner_html(self.root)
        }
    }

    fn paragraph_with(txn: &mut Transaction, text: &str) -> (NodeKey, NodeKey) {
        let p = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, p).unwrap();
        let t = txn.create_text(text).unwrap();
        txn.append(p, t).unwrap();
        (p, t)
    }

    #[test]
    fn test_initial_mount() {
        let mut h = Harness::new();
        let (_, outcome) = h.update(|txn| {
            paragraph_with(txn, "Hello");
            let empty = txn.create_paragraph().unwrap();
            txn.append(NodeKey::ROOT, empty).unwrap();
        });

        assert_eq!(h.html(), r#"<p dir="ltr"><span>Hello</span></p><p><br></p>"#);
        assert_eq!(outcome.text_content, "Hello\n\n");
        assert_eq!(outcome.text_content, h.state.text_content(NodeKey::ROOT).unwrap());
        assert_eq!(outcome.mutations["paragraph"].len(), 2);
        assert!(outcome.mutations["paragraph"].values().all(|m| *m == MutationKind::Created));
    }

    #[test]
    fn test_no_op_update_writes_nothing() {
        let mut h = Harness::new();
        h.update(|txn| {
            paragraph_with(txn, "a");
            paragraph_with(txn, "b");
        });
        let before = h.html();

        let (_, outcome) = h.update(|_| ());
        assert_eq!(h.dom.tree_write_count(), 0);
        assert_eq!(h.html(), before);
        assert_eq!(outcome.text_content, "a\n\nb");
        assert!(outcome.mutations.is_empty());
    }

    #[test]
    fn test_reorder_is_a_single_move() {
        let mut h = Harness::new();
        let (keys, _) = h.update(|txn| {
            let (a, _) = paragraph_with(txn, "A");
            let (b, _) = paragraph_with(txn, "B");
            let (c, _) = paragraph_with(txn, "C");
            (a, b, c)
        });
        let (a, b, c) = keys;
        let ids: Vec<_> = [a, b, c].iter().map(|k| h.cache.render_id(*k).unwrap()).collect();

        let (_, outcome) = h.update(|txn| txn.insert_before(b, c).unwrap());

        let ops = h.dom.ops();
        assert_eq!(ops.len(), 1, "{ops:?}");
        assert!(matches!(ops[0], RenderOp::Insert { child, .. } if child == ids[2]));
        assert_eq!(
            h.html(),
            r#"<p dir="ltr"><span>A</span></p><p dir="ltr"><span>C</span></p><p dir="ltr"><span>B</span></p>"#
        );
        let new_ids: Vec<_> = [a, b, c].iter().map(|k| h.cache.render_id(*k).unwrap()).collect();
        assert_eq!(ids, new_ids);
        assert!(outcome.mutations["paragraph"].values().all(|m| *m == MutationKind::Updated));
    }

    #[test]
    fn test_removed_child_is_destroyed() {
        let mut h = Harness::new();
        let ((_, t), _) = h.update(|txn| {
            let pair = paragraph_with(txn, "gone");
            paragraph_with(txn, "kept");
            pair
        });
        let (_, outcome) = h.update(|txn| {
            let p = txn.parent_of(t).unwrap().unwrap();
            txn.remove(p).unwrap();
        });

        assert_eq!(h.html(), r#"<p dir="ltr"><span>kept</span></p>"#);
        assert_eq!(outcome.mutations["text"][&t], MutationKind::Destroyed);
        assert!(h.cache.get(t).is_none());
    }

    #[test]
    fn test_managed_break_follows_last_child() {
        let mut h = Harness::new();
        let ((p, t), _) = h.update(|txn| paragraph_with(txn, "a"));
        assert_eq!(h.html(), r#"<p dir="ltr"><span>a</span></p>"#);

        let (br, _) = h.update(|txn| {
            let br = txn.create_line_break().unwrap();
            txn.append(p, br).unwrap();
            br
        });
        assert_eq!(h.html(), r#"<p dir="ltr"><span>a</span><br><br></p>"#);

        // new children go before the managed break
        h.update(|txn| {
            let more = txn.create_text_with(strata_model::TextData {
                format: TextFormat::BOLD,
                ..strata_model::TextData::new("b")
            })
            .unwrap();
            txn.append(p, more).unwrap();
            let br2 = txn.create_line_break().unwrap();
            txn.append(p, br2).unwrap();
        });
        assert_eq!(
            h.html(),
            r#"<p dir="ltr"><span>a</span><br><strong class="bold">b</strong><br><br></p>"#
        );

        h.update(|txn| {
            let children = txn.children(p).unwrap();
            for child in children {
                if child != t && child != br {
                    txn.remove(child).unwrap();
                }
            }
            txn.remove(br).unwrap();
        });
        assert_eq!(h.html(), r#"<p dir="ltr"><span>a</span></p>"#);

        h.update(|txn| txn.remove(t).unwrap());
        assert_eq!(h.html(), r#"<p><br></p>"#);
    }

    #[test]
    fn test_direction_written_only_on_change() {
        let mut h = Harness::new();
        let ((p, t), _) = h.update(|txn| paragraph_with(txn, "hello"));

        h.update(|txn| txn.set_text(t, "hello world").unwrap());
        let dir_writes = |ops: &[RenderOp]| {
            ops.iter()
                .filter(|op| matches!(op, RenderOp::SetAttribute { name, .. } if name == "dir"))
                .count()
        };
        assert_eq!(dir_writes(&h.dom.ops()), 0);
        assert_eq!(h.dom.tree_write_count(), 1);

        h.update(|txn| txn.set_text(t, "שלום").unwrap());
        assert_eq!(dir_writes(&h.dom.ops()), 1);
        let dom = h.cache.render_id(p).unwrap();
        assert_eq!(h.dom.attribute(dom, "dir").as_deref(), Some("rtl"));
        assert_eq!(h.cache.get(p).unwrap().direction, Some(Direction::Rtl));

        h.update(|txn| txn.set_text(t, "123").unwrap());
        assert_eq!(h.dom.attribute(dom, "dir"), None);
    }

    #[test]
    fn test_direction_can_be_disabled() {
        let mut config = Config::default();
        config.reconciler.writing_direction = false;
        let mut h = Harness::with_config(config);
        h.update(|txn| paragraph_with(txn, "hello"));
        assert_eq!(h.html(), "<p><span>hello</span></p>");
    }

    #[test]
    fn test_format_change_replaces_render_node() {
        let mut h = Harness::new();
        let ((_, t), _) = h.update(|txn| paragraph_with(txn, "x"));
        let old = h.cache.render_id(t).unwrap();

        let (_, outcome) = h.update(|txn| txn.set_text_format(t, TextFormat::BOLD).unwrap());
        assert_eq!(h.html(), r#"<p dir="ltr"><strong class="bold">x</strong></p>"#);
        assert_ne!(h.cache.render_id(t).unwrap(), old);
        assert_eq!(outcome.mutations["text"][&t], MutationKind::Updated);

        h.dom.clear_ops();
        h.update(|txn| txn.set_text_format(t, TextFormat::BOLD.with(TextFormat::UNDERLINE)).unwrap());
        assert!(h.dom.ops().iter().all(|op| !matches!(op, RenderOp::Replace { .. })));
        assert_eq!(h.html(), r#"<p dir="ltr"><strong class="bold underline">x</strong></p>"#);
    }

    #[test]
    fn test_move_between_parents_reports_update() {
        let mut h = Harness::new();
        let ((p1, t1, p2), _) = h.update(|txn| {
            let (p1, t1) = paragraph_with(txn, "one");
            let (p2, _) = paragraph_with(txn, "two");
            (p1, t1, p2)
        });

        let (_, outcome) = h.update(|txn| txn.append(p2, t1).unwrap());
        assert_eq!(outcome.mutations["text"][&t1], MutationKind::Updated);
        assert_eq!(
            h.html(),
            r#"<p><br></p><p dir="ltr"><span>two</span><span>one</span></p>"#
        );
        assert_eq!(h.dom.find_by_key(h.root, t1), h.cache.render_id(t1));
        assert!(h.cache.get(p1).unwrap().line_break.is_some());
    }

    #[test]
    fn test_theme_class_and_attributes() {
        let mut config = Config::default();
        config.theme.classes.insert("paragraph".into(), "editor-p".into());
        let mut h = Harness::with_config(config);
        let ((p, _), _) = h.update(|txn| paragraph_with(txn, "x"));
        assert_eq!(h.html(), r#"<p class="editor-p" dir="ltr"><span>x</span></p>"#);

        h.update(|txn| {
            txn.set_element_attribute(p, "data-id", Some("7".to_string()))
                .unwrap()
        });
        let dom = h.cache.render_id(p).unwrap();
        assert_eq!(h.dom.attribute(dom, "data-id").as_deref(), Some("7"));

        h.update(|txn| txn.set_element_attribute(p, "data-id", None).unwrap());
        assert_eq!(h.dom.attribute(dom, "data-id"), None);
    }

    #[test]
    fn test_decorator_changes_are_reported() {
        let mut h = Harness::new();
        let (d, outcome) = h.update(|txn| {
            let p = txn.create_paragraph().unwrap();
            txn.append(NodeKey::ROOT, p).unwrap();
            let d = txn
                .create_decorator("mention", serde_json::json!({"user": 1}), true)
                .unwrap();
            txn.append(p, d).unwrap();
            d
        });
        assert!(outcome.decorators_changed.contains(&d));
        assert_eq!(
            h.html(),
            r#"<p><span contenteditable="false" data-decorator="mention"></span><br></p>"#
        );

        let (_, outcome) = h.update(|txn| {
            txn.set_decorator_payload(d, serde_json::json!({"user": 2}))
                .unwrap()
        });
        assert!(outcome.decorators_changed.contains(&d));

        let (_, outcome) = h.update(|txn| txn.mark_dirty(d).unwrap());
        assert!(outcome.decorators_changed.is_empty());
    }

    #[test]
    fn test_full_reconcile_repairs_drift() {
        let mut h = Harness::new();
        let ((p, t), _) = h.update(|txn| paragraph_with(txn, "truth"));
        let inner = h.cache.text_node(t).unwrap();
        let p_dom = h.cache.render_id(p).unwrap();
        h.dom.external_set_text(inner, "drifted").unwrap();
        h.dom.external_insert_element(p_dom, "img", None).unwrap();
        h.dom.external_insert_text(h.root, "stray", None).unwrap();

        h.run(|_| (), true);
        assert_eq!(h.html(), r#"<p dir="ltr"><span>truth</span></p>"#);
    }
}
