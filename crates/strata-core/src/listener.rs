//! Synchronous listeners fired after a commit.
//!
//! Listeners are plain boxed closures stored per kind. Every registration
//! hands back a [`ListenerId`]; `unregister` searches all kinds, so callers
//! never need to remember which kind an id belongs to.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use strata_model::{EditorState, NodeKey};

use crate::render::RenderId;
use crate::transaction::DirtyCause;
use crate::CoreError;

/// Handle returned by every listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// What happened to a node's render counterpart during a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Created,
    Updated,
    Destroyed,
}

/// Everything an update listener learns about a commit.
#[derive(Debug, Clone)]
pub struct UpdatePayload {
    pub prev: Arc<EditorState>,
    pub next: Arc<EditorState>,
    pub dirty_leaves: BTreeSet<NodeKey>,
    pub dirty_elements: BTreeMap<NodeKey, DirtyCause>,
    pub tags: BTreeSet<String>,
}

pub type UpdateListener = Box<dyn FnMut(&UpdatePayload)>;
pub type MutationListener = Box<dyn FnMut(&BTreeMap<NodeKey, MutationKind>, &UpdatePayload)>;
pub type TextContentListener = Box<dyn FnMut(&str)>;
pub type DecoratorListener = Box<dyn FnMut(&BTreeMap<NodeKey, serde_json::Value>)>;
pub type RootListener = Box<dyn FnMut(Option<RenderId>, Option<RenderId>)>;
pub type EditableListener = Box<dyn FnMut(bool)>;
pub type ErrorHandler = Box<dyn FnMut(&CoreError)>;

/// All listeners of one editor.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    update: Vec<(ListenerId, UpdateListener)>,
    mutation: Vec<(ListenerId, String, MutationListener)>,
    text_content: Vec<(ListenerId, TextContentListener)>,
    decorator: Vec<(ListenerId, DecoratorListener)>,
    root: Vec<(ListenerId, RootListener)>,
    editable: Vec<(ListenerId, EditableListener)>,
    error_handler: Option<ErrorHandler>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&mut self) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        id
    }

    // ==================== Registration ====================

    pub fn on_update(&mut self, listener: UpdateListener) -> ListenerId {
        let id = self.issue();
        self.update.push((id, listener));
        id
    }

    /// Fires with the mutations of nodes of `type_name` only.
    pub fn on_mutation(&mut self, type_name: impl Into<String>, listener: MutationListener) -> ListenerId {
        let id = self.issue();
        self.mutation.push((id, type_name.into(), listener));
        id
    }

    pub fn on_text_content(&mut self, listener: TextContentListener) -> ListenerId {
        let id = self.issue();
        self.text_content.push((id, listener));
        id
    }

    pub fn on_decorators(&mut self, listener: DecoratorListener) -> ListenerId {
        let id = self.issue();
        self.decorator.push((id, listener));
        id
    }

    pub fn on_root(&mut self, listener: RootListener) -> ListenerId {
        let id = self.issue();
        self.root.push((id, listener));
        id
    }

    pub fn on_editable(&mut self, listener: EditableListener) -> ListenerId {
        let id = self.issue();
        self.editable.push((id, listener));
        id
    }

    /// Replaces the error handler.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    /// Removes a listener of any kind. Returns false if `id` is unknown.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        fn drop_from<T>(list: &mut Vec<(ListenerId, T)>, id: ListenerId) -> bool {
            let before = list.len();
            list.retain(|(listener_id, _)| *listener_id != id);
            list.len() != before
        }

        let before = self.mutation.len();
        self.mutation.retain(|(listener_id, _, _)| *listener_id != id);
        if self.mutation.len() != before {
            return true;
        }
        drop_from(&mut self.update, id)
            || drop_from(&mut self.text_content, id)
            || drop_from(&mut self.decorator, id)
            || drop_from(&mut self.root, id)
            || drop_from(&mut self.editable, id)
    }

    /// Returns true if some mutation listener watches `type_name`.
    pub fn watches_type(&self, type_name: &str) -> bool {
        self.mutation.iter().any(|(_, name, _)| name == type_name)
    }

    // ==================== Triggering ====================

    pub(crate) fn fire_update(&mut self, payload: &UpdatePayload) {
        for (_, listener) in &mut self.update {
            listener(payload);
        }
    }

    pub(crate) fn fire_mutations(
        &mut self,
        mutations: &BTreeMap<String, BTreeMap<NodeKey, MutationKind>>,
        payload: &UpdatePayload,
    ) {
        for (_, type_name, listener) in &mut self.mutation {
            if let Some(by_key) = mutations.get(type_name.as_str()) {
                if !by_key.is_empty() {
                    listener(by_key, payload);
                }
            }
        }
    }

    pub(crate) fn fire_text_content(&mut self, text: &str) {
        for (_, listener) in &mut self.text_content {
            listener(text);
        }
    }

    pub(crate) fn fire_decorators(&mut self, decorators: &BTreeMap<NodeKey, serde_json::Value>) {
        for (_, listener) in &mut self.decorator {
            listener(decorators);
        }
    }

    pub(crate) fn fire_root(&mut self, prev: Option<RenderId>, next: Option<RenderId>) {
        for (_, listener) in &mut self.root {
            listener(prev, next);
        }
    }

    pub(crate) fn fire_editable(&mut self, editable: bool) {
        for (_, listener) in &mut self.editable {
            listener(editable);
        }
    }

    /// Reports an error to the registered handler, or logs it.
    pub(crate) fn report_error(&mut self, err: &CoreError) {
        match self.error_handler.as_mut() {
            Some(handler) => handler(err),
            None => tracing::error!("Editor update failed: {}", err),
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("update", &self.update.len())
            .field("mutation", &self.mutation.len())
            .field("text_content", &self.text_content.len())
            .field("decorator", &self.decorator.len())
            .field("root", &self.root.len())
            .field("editable", &self.editable.len())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}
