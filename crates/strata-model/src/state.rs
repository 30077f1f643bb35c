//! Editor state snapshots.
//!
//! ## Learning: structural sharing
//!
//! `EditorState` derives `Clone`, and cloning copies the map of `Arc<Node>`
//! handles, never the nodes. A pending state therefore starts out sharing
//! every node with the committed one; only nodes touched by a transaction are
//! replaced by fresh allocations under the same key.
//!
//! A committed state is frozen. All mutable accessors check the flag, so a
//! published snapshot cannot be written through even by accident.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{ModelError, ModelResult, Node, NodeKey, Selection};

/// Arena of nodes owned by one state.
pub type NodeMap = HashMap<NodeKey, Arc<Node>>;

/// An immutable (once frozen) snapshot of the document and its selection.
#[derive(Debug, Clone)]
pub struct EditorState {
    nodes: NodeMap,
    selection: Option<Selection>,
    frozen: bool,
}

impl EditorState {
    /// Creates a state holding only the root.
    pub fn empty() -> Self {
        let mut nodes = NodeMap::new();
        nodes.insert(NodeKey::ROOT, Arc::new(Node::root()));
        Self {
            nodes,
            selection: None,
            frozen: false,
        }
    }

    // ==================== Lookup ====================

    /// Returns the node under `key`.
    pub fn node(&self, key: NodeKey) -> ModelResult<&Node> {
        self.get(key).ok_or(ModelError::NodeNotFound(key))
    }

    pub fn get(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(&key).map(Arc::as_ref)
    }

    /// Returns the shared handle, used for identity checks.
    pub fn node_arc(&self, key: NodeKey) -> Option<&Arc<Node>> {
        self.nodes.get(&key)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn root(&self) -> ModelResult<&Node> {
        self.node(NodeKey::ROOT)
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    /// Number of nodes in the map, attached or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// The highest key in use.
    pub fn max_key(&self) -> NodeKey {
        self.nodes.keys().copied().max().unwrap_or(NodeKey::ROOT)
    }

    // ==================== Tree Navigation ====================

    /// Child keys of an element in order.
    pub fn children(&self, key: NodeKey) -> ModelResult<Vec<NodeKey>> {
        let node = self.node(key)?;
        let element = node.as_element().ok_or(ModelError::NotAnElement(key))?;
        let mut out = Vec::with_capacity(element.size);
        let mut cursor = element.first;
        while let Some(child) = cursor {
            if out.len() > self.nodes.len() {
                return Err(ModelError::BrokenChildList {
                    key,
                    detail: "sibling links form a cycle".into(),
                });
            }
            out.push(child);
            cursor = self.node(child)?.next;
        }
        Ok(out)
    }

    pub fn child_at(&self, key: NodeKey, index: usize) -> Option<NodeKey> {
        let mut cursor = self.get(key)?.as_element()?.first;
        for _ in 0..index {
            cursor = self.get(cursor?)?.next;
        }
        cursor
    }

    /// Position of a node among its siblings.
    pub fn index_in_parent(&self, key: NodeKey) -> Option<usize> {
        let mut index = 0;
        let mut cursor = self.get(key)?.prev;
        while let Some(prev) = cursor {
            index += 1;
            cursor = self.get(prev)?.prev;
        }
        Some(index)
    }

    /// Returns true if the parent chain of `key` reaches the root.
    pub fn is_attached(&self, key: NodeKey) -> bool {
        let mut cursor = Some(key);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current.is_root() {
                return self.contains(current);
            }
            if steps > self.nodes.len() {
                return false;
            }
            steps += 1;
            cursor = match self.get(current) {
                Some(node) => node.parent,
                None => return false,
            };
        }
        false
    }

    /// Returns true if `ancestor` is a strict ancestor of `key`.
    pub fn is_ancestor(&self, ancestor: NodeKey, key: NodeKey) -> bool {
        let mut cursor = self.get(key).and_then(|n| n.parent);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            if steps > self.nodes.len() {
                return false;
            }
            steps += 1;
            cursor = self.get(current).and_then(|n| n.parent);
        }
        false
    }

    /// Deepest first descendant, or `key` itself when it has no children.
    pub fn first_descendant(&self, key: NodeKey) -> NodeKey {
        let mut current = key;
        while let Some(first) = self.get(current).and_then(Node::as_element).and_then(|e| e.first) {
            current = first;
        }
        current
    }

    /// Deepest last descendant, or `key` itself when it has no children.
    pub fn last_descendant(&self, key: NodeKey) -> NodeKey {
        let mut current = key;
        while let Some(last) = self.get(current).and_then(Node::as_element).and_then(|e| e.last) {
            current = last;
        }
        current
    }

    /// `key` and all its descendants in document order.
    pub fn preorder(&self, key: NodeKey) -> ModelResult<Vec<NodeKey>> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            out.push(current);
            if self.node(current)?.is_element() {
                let children = self.children(current)?;
                stack.extend(children.into_iter().rev());
            }
        }
        Ok(out)
    }

    // ==================== Content ====================

    /// Plain text of a subtree.
    ///
    /// Block element children are separated by a blank line and line breaks
    /// contribute a single newline.
    pub fn text_content(&self, key: NodeKey) -> ModelResult<String> {
        let mut out = String::new();
        self.collect_text(key, &mut out)?;
        Ok(out)
    }

    fn collect_text(&self, key: NodeKey, out: &mut String) -> ModelResult<()> {
        let node = self.node(key)?;
        if !node.is_element() {
            out.push_str(node.leaf_text());
            return Ok(());
        }
        let children = self.children(key)?;
        let count = children.len();
        for (i, child) in children.into_iter().enumerate() {
            self.collect_text(child, out)?;
            let child_node = self.node(child)?;
            if child_node.is_element() && !child_node.is_inline() && i + 1 < count {
                out.push_str("\n\n");
            }
        }
        Ok(())
    }

    /// Checks the linkage invariants of every element in the map.
    pub fn validate(&self) -> ModelResult<()> {
        let mut listed = std::collections::HashSet::new();

        for (key, node) in &self.nodes {
            let Some(element) = node.as_element() else {
                continue;
            };
            let broken = |detail: String| ModelError::BrokenChildList { key: *key, detail };

            let mut count = 0;
            let mut prev: Option<NodeKey> = None;
            let mut cursor = element.first;
            while let Some(child_key) = cursor {
                count += 1;
                if count > element.size {
                    return Err(broken(format!("more than {} children", element.size)));
                }
                let child = self
                    .get(child_key)
                    .ok_or_else(|| broken(format!("child {} is missing", child_key)))?;
                if child.parent != Some(*key) {
                    return Err(broken(format!("child {} has another parent", child_key)));
                }
                if child.prev != prev {
                    return Err(broken(format!("prev link of {} does not mirror next", child_key)));
                }
                listed.insert(child_key);
                prev = Some(child_key);
                cursor = child.next;
            }

            if count != element.size {
                return Err(broken(format!("walked {} children, size is {}", count, element.size)));
            }
            if prev != element.last {
                return Err(broken("walk does not end at last".into()));
            }
        }

        for (key, node) in &self.nodes {
            if let Some(parent) = node.parent {
                if !listed.contains(key) {
                    return Err(ModelError::BrokenChildList {
                        key: parent,
                        detail: format!("{} claims this parent but is not listed", key),
                    });
                }
            } else if node.prev.is_some() || node.next.is_some() {
                return Err(ModelError::BrokenChildList {
                    key: *key,
                    detail: "detached node keeps sibling links".into(),
                });
            }
        }
        Ok(())
    }

    // ==================== Write Access ====================

    /// Publishes the state; no further writes are accepted.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn nodes_mut(&mut self) -> ModelResult<&mut NodeMap> {
        if self.frozen {
            return Err(ModelError::Frozen);
        }
        Ok(&mut self.nodes)
    }

    pub fn selection_mut(&mut self) -> ModelResult<&mut Option<Selection>> {
        if self.frozen {
            return Err(ModelError::Frozen);
        }
        Ok(&mut self.selection)
    }

    /// An unfrozen copy sharing every node with `self`.
    pub fn clone_pending(&self) -> Self {
        let mut selection = self.selection.clone();
        if let Some(selection) = selection.as_mut() {
            selection.invalidate_cache();
        }
        Self {
            nodes: self.nodes.clone(),
            selection,
            frozen: false,
        }
    }
}

impl Default for EditorState {
    fn default() -> Self {
        Self::empty()
    }
}
