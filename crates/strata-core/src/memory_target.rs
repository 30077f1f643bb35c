//! In-memory render target.
//!
//! `MemoryTarget` is a cheap shared handle (`Rc<RefCell<..>>`): the editor
//! owns one clone as its `Box<dyn RenderTarget>`, the host keeps another to
//! inspect the tree, read the operation log or simulate platform edits with
//! the `external_*` helpers. Only `external_*` calls produce mutation
//! records; the engine's own writes are never observed.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use strata_model::NodeKey;

use crate::render::{
    MutationRecord, NativePoint, NativeRange, RenderError, RenderId, RenderResult, RenderTarget,
};

/// One write issued by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOp {
    CreateElement { node: RenderId, tag: String },
    CreateText { node: RenderId },
    Insert {
        parent: RenderId,
        child: RenderId,
        before: Option<RenderId>,
    },
    Remove { node: RenderId },
    Replace { parent: RenderId, new: RenderId, old: RenderId },
    SetAttribute {
        node: RenderId,
        name: String,
        value: Option<String>,
    },
    SetText { node: RenderId },
    SetSelection,
}

impl RenderOp {
    /// Returns true for operations that change the tree or its content.
    pub fn is_tree_write(&self) -> bool {
        !matches!(self, RenderOp::SetSelection)
    }
}

#[derive(Debug, Clone)]
enum Content {
    Element {
        tag: String,
        attributes: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct RenderNode {
    content: Content,
    parent: Option<RenderId>,
    children: Vec<RenderId>,
    key: Option<NodeKey>,
}

#[derive(Debug, Default)]
struct MemoryDom {
    nodes: HashMap<RenderId, RenderNode>,
    next_id: u64,
    ops: Vec<RenderOp>,
    selection: Option<NativeRange>,
    observed: Vec<MutationRecord>,
    scrolled: Vec<NativePoint>,
    fail_selection_writes: bool,
}

impl MemoryDom {
    fn alloc(&mut self, content: Content) -> RenderId {
        let id = RenderId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            RenderNode {
                content,
                parent: None,
                children: Vec::new(),
                key: None,
            },
        );
        id
    }

    fn node(&self, id: RenderId) -> RenderResult<&RenderNode> {
        self.nodes.get(&id).ok_or(RenderError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: RenderId) -> RenderResult<&mut RenderNode> {
        self.nodes.get_mut(&id).ok_or(RenderError::UnknownNode(id))
    }

    fn detach(&mut self, id: RenderId) -> RenderResult<Option<RenderId>> {
        let parent = self.node(id)?.parent;
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.retain(|c| *c != id);
            self.node_mut(id)?.parent = None;
        }
        Ok(parent)
    }

    fn insert(&mut self, parent: RenderId, child: RenderId, before: Option<RenderId>) -> RenderResult<()> {
        if !matches!(self.node(parent)?.content, Content::Element { .. }) {
            return Err(RenderError::NotAnElement(parent));
        }
        self.node(child)?;
        if let Some(before) = before {
            if self.node(before)?.parent != Some(parent) {
                return Err(RenderError::NotAChild { parent, child: before });
            }
        }
        self.detach(child)?;
        let children = &mut self.node_mut(parent)?.children;
        let index = before
            .and_then(|b| children.iter().position(|c| *c == b))
            .unwrap_or(children.len());
        children.insert(index, child);
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    fn write_html(&self, id: RenderId, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        match &node.content {
            Content::Text(text) => escape_into(text, out),
            Content::Element { tag, attributes } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    escape_into(value, out);
                    out.push('"');
                }
                out.push('>');
                if tag == "br" && node.children.is_empty() {
                    return;
                }
                for child in &node.children {
                    self.write_html(*child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

/// Shared handle to an in-memory render tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget(Rc<RefCell<MemoryDom>>);

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a host container to mount an editor into. Not logged.
    pub fn create_container(&self, tag: &str) -> RenderId {
        self.0.borrow_mut().alloc(Content::Element {
            tag: tag.to_string(),
            attributes: BTreeMap::new(),
        })
    }

    /// Operations issued by the engine so far.
    pub fn ops(&self) -> Vec<RenderOp> {
        self.0.borrow().ops.clone()
    }

    /// Number of tree writes (selection writes excluded).
    pub fn tree_write_count(&self) -> usize {
        self.0.borrow().ops.iter().filter(|op| op.is_tree_write()).count()
    }

    pub fn clear_ops(&self) {
        self.0.borrow_mut().ops.clear();
    }

    /// Makes every later selection write fail.
    pub fn set_fail_selection_writes(&self, fail: bool) {
        self.0.borrow_mut().fail_selection_writes = fail;
    }

    /// Points passed to `scroll_into_view`.
    pub fn scrolled(&self) -> Vec<NativePoint> {
        self.0.borrow().scrolled.clone()
    }

    /// Serializes the subtree under `node` as markup.
    pub fn to_html(&self, node: RenderId) -> String {
        let mut out = String::new();
        self.0.borrow().write_html(node, &mut out);
        out
    }

    /// Serializes the children of `node` as markup.
    pub fn inner_html(&self, node: RenderId) -> String {
        let dom = self.0.borrow();
        let mut out = String::new();
        if let Some(n) = dom.nodes.get(&node) {
            for child in &n.children {
                dom.write_html(*child, &mut out);
            }
        }
        out
    }

    /// Finds the render node of a logical key below `root`.
    pub fn find_by_key(&self, root: RenderId, key: NodeKey) -> Option<RenderId> {
        let dom = self.0.borrow();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = dom.nodes.get(&id)?;
            if node.key == Some(key) {
                return Some(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        None
    }

    // ==================== Platform Simulation ====================

    /// Edits text the way typing would, recording the change.
    pub fn external_set_text(&self, node: RenderId, text: &str) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        match &mut dom.node_mut(node)?.content {
            Content::Text(current) => *current = text.to_string(),
            Content::Element { .. } => return Err(RenderError::NotText(node)),
        }
        dom.observed.push(MutationRecord::CharacterData { target: node });
        Ok(())
    }

    /// Inserts a foreign element (e.g. from a browser extension).
    pub fn external_insert_element(
        &self,
        parent: RenderId,
        tag: &str,
        before: Option<RenderId>,
    ) -> RenderResult<RenderId> {
        let mut dom = self.0.borrow_mut();
        let id = dom.alloc(Content::Element {
            tag: tag.to_string(),
            attributes: BTreeMap::new(),
        });
        dom.insert(parent, id, before)?;
        dom.observed.push(MutationRecord::ChildList {
            target: parent,
            added: vec![id],
            removed: Vec::new(),
        });
        Ok(id)
    }

    /// Inserts a foreign text node.
    pub fn external_insert_text(
        &self,
        parent: RenderId,
        text: &str,
        before: Option<RenderId>,
    ) -> RenderResult<RenderId> {
        let mut dom = self.0.borrow_mut();
        let id = dom.alloc(Content::Text(text.to_string()));
        dom.insert(parent, id, before)?;
        dom.observed.push(MutationRecord::ChildList {
            target: parent,
            added: vec![id],
            removed: Vec::new(),
        });
        Ok(id)
    }

    /// Removes a node the way a platform edit would.
    pub fn external_remove(&self, node: RenderId) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        if let Some(parent) = dom.detach(node)? {
            dom.observed.push(MutationRecord::ChildList {
                target: parent,
                added: Vec::new(),
                removed: vec![node],
            });
        }
        Ok(())
    }

    /// Moves the platform selection without going through the engine.
    pub fn external_set_selection(&self, range: Option<NativeRange>) {
        self.0.borrow_mut().selection = range;
    }
}

impl RenderTarget for MemoryTarget {
    fn create_element(&mut self, tag: &str) -> RenderId {
        let mut dom = self.0.borrow_mut();
        let node = dom.alloc(Content::Element {
            tag: tag.to_string(),
            attributes: BTreeMap::new(),
        });
        dom.ops.push(RenderOp::CreateElement {
            node,
            tag: tag.to_string(),
        });
        node
    }

    fn create_text(&mut self, text: &str) -> RenderId {
        let mut dom = self.0.borrow_mut();
        let node = dom.alloc(Content::Text(text.to_string()));
        dom.ops.push(RenderOp::CreateText { node });
        node
    }

    fn insert_before(
        &mut self,
        parent: RenderId,
        child: RenderId,
        before: Option<RenderId>,
    ) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        dom.insert(parent, child, before)?;
        dom.ops.push(RenderOp::Insert {
            parent,
            child,
            before,
        });
        Ok(())
    }

    fn remove(&mut self, node: RenderId) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        dom.detach(node)?;
        dom.ops.push(RenderOp::Remove { node });
        Ok(())
    }

    fn replace(&mut self, parent: RenderId, new: RenderId, old: RenderId) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        if dom.node(old)?.parent != Some(parent) {
            return Err(RenderError::NotAChild { parent, child: old });
        }
        dom.insert(parent, new, Some(old))?;
        dom.detach(old)?;
        dom.ops.push(RenderOp::Replace { parent, new, old });
        Ok(())
    }

    fn set_attribute(&mut self, node: RenderId, name: &str, value: Option<&str>) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        match &mut dom.node_mut(node)?.content {
            Content::Element { attributes, .. } => match value {
                Some(value) => {
                    attributes.insert(name.to_string(), value.to_string());
                }
                None => {
                    attributes.remove(name);
                }
            },
            Content::Text(_) => return Err(RenderError::NotAnElement(node)),
        }
        dom.ops.push(RenderOp::SetAttribute {
            node,
            name: name.to_string(),
            value: value.map(str::to_string),
        });
        Ok(())
    }

    fn set_text(&mut self, node: RenderId, text: &str) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        match &mut dom.node_mut(node)?.content {
            Content::Text(current) => *current = text.to_string(),
            Content::Element { .. } => return Err(RenderError::NotText(node)),
        }
        dom.ops.push(RenderOp::SetText { node });
        Ok(())
    }

    fn stash_key(&mut self, node: RenderId, key: NodeKey) {
        if let Some(n) = self.0.borrow_mut().nodes.get_mut(&node) {
            n.key = Some(key);
        }
    }

    fn key_of(&self, node: RenderId) -> Option<NodeKey> {
        self.0.borrow().nodes.get(&node).and_then(|n| n.key)
    }

    fn children(&self, node: RenderId) -> Vec<RenderId> {
        self.0
            .borrow()
            .nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn parent(&self, node: RenderId) -> Option<RenderId> {
        self.0.borrow().nodes.get(&node).and_then(|n| n.parent)
    }

    fn next_sibling(&self, node: RenderId) -> Option<RenderId> {
        let dom = self.0.borrow();
        let parent = dom.nodes.get(&node)?.parent?;
        let siblings = &dom.nodes.get(&parent)?.children;
        let index = siblings.iter().position(|c| *c == node)?;
        siblings.get(index + 1).copied()
    }

    fn text(&self, node: RenderId) -> Option<String> {
        match &self.0.borrow().nodes.get(&node)?.content {
            Content::Text(text) => Some(text.clone()),
            Content::Element { .. } => None,
        }
    }

    fn tag(&self, node: RenderId) -> Option<String> {
        match &self.0.borrow().nodes.get(&node)?.content {
            Content::Element { tag, .. } => Some(tag.clone()),
            Content::Text(_) => None,
        }
    }

    fn attribute(&self, node: RenderId, name: &str) -> Option<String> {
        match &self.0.borrow().nodes.get(&node)?.content {
            Content::Element { attributes, .. } => attributes.get(name).cloned(),
            Content::Text(_) => None,
        }
    }

    fn selection(&self) -> Option<NativeRange> {
        self.0.borrow().selection
    }

    fn set_selection(&mut self, range: Option<NativeRange>) -> RenderResult<()> {
        let mut dom = self.0.borrow_mut();
        if dom.fail_selection_writes {
            return Err(RenderError::SelectionRejected("selection writes disabled".into()));
        }
        dom.selection = range;
        dom.ops.push(RenderOp::SetSelection);
        Ok(())
    }

    fn scroll_into_view(&mut self, point: NativePoint) {
        self.0.borrow_mut().scrolled.push(point);
    }

    fn take_observed(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.0.borrow_mut().observed)
    }
}
