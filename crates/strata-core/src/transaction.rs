//! The pending state and its copy-on-write node store.
//!
//! ## Learning: `Arc::make_mut`
//!
//! The pending state starts as a shallow copy of the committed one, so every
//! `Arc<Node>` in it is shared. `get_writable` replaces the shared handle with
//! a freshly cloned node the first time a key is written in a transaction and
//! remembers the key; later calls hand out the same allocation. The committed
//! state never sees the write.
//!
//! ## Dirty tracking
//!
//! Every writable access marks the node dirty. Leaves go to `dirty_leaves`;
//! elements go to `dirty_elements` as [`DirtyCause::Intentional`]. Ancestors
//! of any dirtied node are marked [`DirtyCause::Transitive`] so that the
//! reconciler knows to descend into them, without making them eligible for
//! element transforms.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use strata_model::{EditorState, KeyGenerator, Node, NodeKey, Selection};

use crate::update::UpdateOptions;
use crate::{CoreError, CoreResult};

/// A nested update queued from inside a running one.
pub type QueuedUpdate = Box<dyn FnOnce(&mut Transaction) -> anyhow::Result<()>>;

/// Callback run after the transaction commits.
pub type DeferredCallback = Box<dyn FnOnce()>;

/// Why an element is in the dirty map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirtyCause {
    /// Only a descendant changed
    Transitive,
    /// The element itself was written
    Intentional,
}

/// How much reconciliation a commit needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DirtyType {
    #[default]
    None,
    HasDirtyNodes,
    /// Walk and rewrite the whole tree
    FullReconcile,
}

/// An open update over the pending state.
pub struct Transaction {
    pub(crate) state: EditorState,
    prev: Arc<EditorState>,
    cloned: HashSet<NodeKey>,
    pub(crate) dirty_leaves: BTreeSet<NodeKey>,
    pub(crate) dirty_elements: BTreeMap<NodeKey, DirtyCause>,
    pub(crate) dirty_type: DirtyType,
    pub(crate) keys: KeyGenerator,
    pub(crate) composition_key: Option<NodeKey>,
    prev_composition_key: Option<NodeKey>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) queued: VecDeque<(QueuedUpdate, UpdateOptions)>,
    pub(crate) deferred: Vec<DeferredCallback>,
    pub(crate) skip_transforms: bool,
    pub(crate) discrete: bool,
}

impl Transaction {
    /// Opens a transaction on a pending copy of `current`.
    pub(crate) fn open(
        current: Arc<EditorState>,
        keys: KeyGenerator,
        composition_key: Option<NodeKey>,
    ) -> Self {
        Self {
            state: current.clone_pending(),
            prev: current,
            cloned: HashSet::new(),
            dirty_leaves: BTreeSet::new(),
            dirty_elements: BTreeMap::new(),
            dirty_type: DirtyType::None,
            keys,
            composition_key,
            prev_composition_key: composition_key,
            tags: BTreeSet::new(),
            queued: VecDeque::new(),
            deferred: Vec::new(),
            skip_transforms: false,
            discrete: false,
        }
    }

    // ==================== Node Store ====================

    /// The pending state.
    pub fn state(&self) -> &EditorState {
        &self.state
    }

    /// The committed state this transaction started from.
    pub fn prev_state(&self) -> &Arc<EditorState> {
        &self.prev
    }

    /// The most recent version of a node.
    pub fn get_latest(&self, key: NodeKey) -> CoreResult<&Node> {
        self.state.get(key).ok_or(CoreError::NodeNotFound(key))
    }

    /// Returns true if `key` exists in the pending state.
    pub fn contains(&self, key: NodeKey) -> bool {
        self.state.contains(key)
    }

    /// A writable copy of a node, cloned at most once per transaction.
    pub fn get_writable(&mut self, key: NodeKey) -> CoreResult<&mut Node> {
        if self.state.is_frozen() {
            return Err(CoreError::FrozenState);
        }
        if !self.state.contains(key) {
            return Err(CoreError::NodeNotFound(key));
        }
        self.mark_dirty_internal(key);
        self.invalidate_selection_cache();

        let nodes = self.state.nodes_mut().map_err(CoreError::from_model)?;
        let slot = nodes.get_mut(&key).ok_or(CoreError::NodeNotFound(key))?;
        if self.cloned.insert(key) {
            *slot = Arc::new(Node::clone(&**slot));
        }
        Ok(Arc::make_mut(slot))
    }

    /// Registers a node created in this transaction and marks it dirty.
    pub(crate) fn register(&mut self, node: Node) -> CoreResult<NodeKey> {
        let key = node.key;
        let nodes = self.state.nodes_mut().map_err(CoreError::from_model)?;
        nodes.insert(key, Arc::new(node));
        self.cloned.insert(key);
        self.mark_dirty_internal(key);
        Ok(key)
    }

    /// Drops a node from the pending map. Used by garbage collection.
    pub(crate) fn evict(&mut self, key: NodeKey) -> CoreResult<()> {
        let nodes = self.state.nodes_mut().map_err(CoreError::from_model)?;
        nodes.remove(&key);
        self.cloned.remove(&key);
        Ok(())
    }

    /// Issues a fresh key.
    pub(crate) fn next_key(&mut self) -> NodeKey {
        self.keys.next_key()
    }

    /// Returns true if `key` was written or created in this transaction.
    pub fn is_cloned(&self, key: NodeKey) -> bool {
        self.cloned.contains(&key)
    }

    // ==================== Dirty Tracking ====================

    fn mark_dirty_internal(&mut self, key: NodeKey) {
        let Some(node) = self.state.get(key) else {
            return;
        };
        if node.is_element() {
            self.dirty_elements.insert(key, DirtyCause::Intentional);
        } else {
            self.dirty_leaves.insert(key);
        }

        let mut parent = node.parent;
        while let Some(parent_key) = parent {
            if self.dirty_elements.contains_key(&parent_key) {
                break;
            }
            self.dirty_elements.insert(parent_key, DirtyCause::Transitive);
            parent = self.state.get(parent_key).and_then(|p| p.parent);
        }

        if self.dirty_type < DirtyType::HasDirtyNodes {
            self.dirty_type = DirtyType::HasDirtyNodes;
        }
    }

    pub fn dirty_leaves(&self) -> &BTreeSet<NodeKey> {
        &self.dirty_leaves
    }

    pub fn dirty_elements(&self) -> &BTreeMap<NodeKey, DirtyCause> {
        &self.dirty_elements
    }

    pub fn dirty_type(&self) -> DirtyType {
        self.dirty_type
    }

    /// Forces the next commit to walk and rewrite the whole tree.
    pub fn mark_full_reconcile(&mut self) {
        self.dirty_type = DirtyType::FullReconcile;
    }

    /// Returns true if any node was touched.
    pub fn has_dirty_nodes(&self) -> bool {
        !self.dirty_leaves.is_empty() || !self.dirty_elements.is_empty()
    }

    /// Returns true if the pending selection differs from the committed one.
    pub fn selection_changed(&self) -> bool {
        self.state.selection() != self.prev.selection()
    }

    // ==================== Selection ====================

    pub fn selection(&self) -> Option<&Selection> {
        self.state.selection()
    }

    /// Replaces the pending selection.
    pub fn set_selection(&mut self, selection: Option<Selection>) -> CoreResult<()> {
        *self.selection_slot()? = selection;
        Ok(())
    }

    pub(crate) fn selection_slot(&mut self) -> CoreResult<&mut Option<Selection>> {
        let slot = self.state.selection_mut().map_err(CoreError::from_model)?;
        if let Some(selection) = slot.as_mut() {
            selection.invalidate_cache();
        }
        Ok(slot)
    }

    fn invalidate_selection_cache(&mut self) {
        if let Ok(Some(selection)) = self.state.selection_mut() {
            selection.invalidate_cache();
        }
    }

    // ==================== Composition ====================

    /// The text node an input method is composing into.
    pub fn composition_key(&self) -> Option<NodeKey> {
        self.composition_key
    }

    pub fn set_composition_key(&mut self, key: Option<NodeKey>) {
        self.composition_key = key;
    }

    pub(crate) fn composition_changed(&self) -> bool {
        self.composition_key != self.prev_composition_key
    }

    // ==================== Scheduling ====================

    /// Queues a nested update; it runs after the current callback returns.
    pub fn update<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Transaction) -> anyhow::Result<()> + 'static,
    {
        self.update_with(f, UpdateOptions::default());
    }

    pub fn update_with<F>(&mut self, f: F, options: UpdateOptions)
    where
        F: FnOnce(&mut Transaction) -> anyhow::Result<()> + 'static,
    {
        self.queued.push_back((Box::new(f), options));
    }

    /// Runs `f` once the transaction has committed.
    pub fn defer<F: FnOnce() + 'static>(&mut self, f: F) {
        self.deferred.push(Box::new(f));
    }

    /// Tags the transaction (e.g. "history-merge", "skip-dom-selection").
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Folds an update's options into the transaction.
    pub(crate) fn absorb_options(&mut self, options: UpdateOptions) {
        if let Some(tag) = options.tag {
            self.tags.insert(tag);
        }
        self.skip_transforms |= options.skip_transforms;
        self.discrete |= options.discrete;
        if let Some(on_update) = options.on_update {
            self.deferred.push(on_update);
        }
    }

    /// Hands the pending state over for commit.
    pub(crate) fn into_parts(self) -> (EditorState, TransactionSummary) {
        let summary = TransactionSummary {
            prev: self.prev,
            dirty_leaves: self.dirty_leaves,
            dirty_elements: self.dirty_elements,
            dirty_type: self.dirty_type,
            keys: self.keys,
            composition_key: self.composition_key,
            tags: self.tags,
            deferred: self.deferred,
        };
        (self.state, summary)
    }
}

/// What a settled transaction hands to the commit phase.
pub(crate) struct TransactionSummary {
    pub prev: Arc<EditorState>,
    pub dirty_leaves: BTreeSet<NodeKey>,
    pub dirty_elements: BTreeMap<NodeKey, DirtyCause>,
    pub dirty_type: DirtyType,
    pub keys: KeyGenerator,
    pub composition_key: Option<NodeKey>,
    pub tags: BTreeSet<String>,
    pub deferred: Vec<DeferredCallback>,
}

#[cfg(test)]
impl Transaction {
    /// A transaction over a frozen root-only state.
    pub(crate) fn for_test() -> Self {
        let mut current = EditorState::empty();
        current.freeze();
        Transaction::open(Arc::new(current), KeyGenerator::new(), None)
    }
}
