//! Editor orchestration.
//!
//! ## Learning: The Facade Pattern
//!
//! `Editor` is a facade over the update pipeline: external code hands it
//! callbacks and a render target, and never touches transactions, the
//! reconciler or the resolver directly.
//!
//! ```text
//!   update(f) ──▶ open / reuse transaction (fold observed records)
//!                    │
//!                    ▼
//!               f(txn) → queued updates → transforms → queued updates
//!                    │
//!                    ▼
//!               gc → selection check ──▶ discard | defer | commit
//!
//!   commit ──▶ freeze → reconcile → native selection → listeners → deferred
//! ```
//!
//! ## Error flow
//!
//! A failing callback or a broken invariant discards the pending state,
//! reports the error, and runs one recovery commit that fully resyncs the
//! render target with the last good state. The original error is returned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use strata_model::{EditorState, KeyGenerator, NodeKey};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::command::CommandRegistry;
use crate::config::Config;
use crate::direction::Direction;
use crate::event::{EditorEvent, EventBus};
use crate::gc;
use crate::listener::{ListenerId, Listeners, MutationKind, UpdatePayload};
use crate::observer::{self, FoldSummary};
use crate::reconciler::{reconcile_root, ReconcileOutcome, ReconcileRequest, RenderCache};
use crate::render::{MutationRecord, RenderId, RenderTarget};
use crate::resolver;
use crate::transaction::{DirtyCause, DirtyType, Transaction, TransactionSummary};
use crate::transform::{self, TransformId};
use crate::update::{UpdateOptions, SKIP_DOM_SELECTION};
use crate::{CoreError, CoreResult};

/// Unique identifier of an editor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditorId(Uuid);

impl EditorId {
    /// Creates a new unique editor ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EditorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EditorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document tree kept in sync with an optional render target.
///
/// ## Thread Safety
///
/// `Editor` is owned by a single thread. All mutation goes through
/// `&mut self`, so two transactions can never interleave; observers on
/// other tasks use [`Editor::subscribe`].
pub struct Editor {
    id: EditorId,
    config: Config,

    /// Last committed state
    current: Arc<EditorState>,
    /// Transaction waiting for the next checkpoint
    pending: Option<Transaction>,
    keys: KeyGenerator,
    composition_key: Option<NodeKey>,

    target: Option<Box<dyn RenderTarget>>,
    root: Option<RenderId>,
    cache: RenderCache,
    /// False until the current state has been rendered under `root`
    mounted: bool,

    transforms: transform::TransformRegistry,
    listeners: Listeners,
    commands: CommandRegistry,
    event_bus: EventBus,

    editable: bool,
    text_content: String,
    decorators: BTreeMap<NodeKey, serde_json::Value>,
    recovering: bool,
}

impl Editor {
    /// Creates an editor holding an empty document.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an editor with custom configuration.
    pub fn with_config(config: Config) -> Self {
        let mut state = EditorState::empty();
        state.freeze();
        Self {
            id: EditorId::new(),
            config,
            current: Arc::new(state),
            pending: None,
            keys: KeyGenerator::new(),
            composition_key: None,
            target: None,
            root: None,
            cache: RenderCache::new(),
            mounted: false,
            transforms: transform::TransformRegistry::new(),
            listeners: Listeners::new(),
            commands: CommandRegistry::new(),
            event_bus: EventBus::new(),
            editable: true,
            text_content: String::new(),
            decorators: BTreeMap::new(),
            recovering: false,
        }
    }

    pub fn id(&self) -> EditorId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== Updates ====================

    /// Runs `f` against the pending state.
    ///
    /// The commit happens right away for discrete updates and composition
    /// changes, otherwise at the next [`Editor::flush`] or [`Editor::read`].
    pub fn update<F>(&mut self, f: F, options: UpdateOptions) -> CoreResult<()>
    where
        F: FnOnce(&mut Transaction) -> anyhow::Result<()>,
    {
        self.run_update(|_, txn| f(txn).map_err(callback_error), options)
    }

    /// Commits the pending transaction, if any.
    pub fn flush(&mut self) -> CoreResult<()> {
        self.commit()
    }

    /// Flushes, then reads the committed state.
    pub fn read<R>(&mut self, f: impl FnOnce(&EditorState) -> R) -> CoreResult<R> {
        self.flush()?;
        Ok(f(&self.current))
    }

    /// The last committed state.
    pub fn editor_state(&self) -> Arc<EditorState> {
        Arc::clone(&self.current)
    }

    /// Replaces the whole document and re-renders it.
    pub fn set_editor_state(&mut self, state: EditorState) -> CoreResult<()> {
        state.validate().map_err(CoreError::from_model)?;
        let mut state = state.clone_pending();
        gc::prune_unreachable(&mut state)?;
        if let Some(selection) = state.selection() {
            if let Some(key) = selection.referenced_keys().into_iter().find(|key| !state.contains(*key)) {
                return Err(CoreError::DeadSelection(key));
            }
        }
        self.flush()?;

        let highest = self.current.max_key().max(state.max_key());
        let mut txn = Transaction::open(Arc::clone(&self.current), KeyGenerator::after(highest), None);
        txn.state = state;
        txn.mark_full_reconcile();
        self.pending = Some(txn);
        self.commit()
    }

    fn run_update<F>(&mut self, f: F, options: UpdateOptions) -> CoreResult<()>
    where
        F: FnOnce(&mut Editor, &mut Transaction) -> CoreResult<()>,
    {
        let (mut txn, fresh) = match self.pending.take() {
            Some(txn) => (txn, false),
            None => (
                Transaction::open(Arc::clone(&self.current), self.keys, self.composition_key),
                true,
            ),
        };

        if let Err(err) = self.settle(&mut txn, fresh, f, options) {
            self.keys = txn.keys;
            return self.recover(err);
        }

        let changed = txn.has_dirty_nodes()
            || txn.selection_changed()
            || txn.composition_changed()
            || txn.dirty_type() == DirtyType::FullReconcile;
        if !changed {
            tracing::trace!("Discarding update without changes");
            self.keys = txn.keys;
            return Ok(());
        }

        let sync = txn.discrete || self.config.engine.discrete_by_default || txn.composition_changed();
        self.pending = Some(txn);
        if sync {
            self.commit()
        } else {
            Ok(())
        }
    }

    /// Runs the callback and everything that settles the pending state.
    fn settle<F>(
        &mut self,
        txn: &mut Transaction,
        fresh: bool,
        f: F,
        options: UpdateOptions,
    ) -> CoreResult<()>
    where
        F: FnOnce(&mut Editor, &mut Transaction) -> CoreResult<()>,
    {
        if fresh {
            self.fold_records(txn, Vec::new())?;
        }
        txn.skip_transforms = false;
        txn.absorb_options(options);

        f(self, txn)?;
        drain_queued(txn)?;

        if !txn.skip_transforms {
            let passes = transform::apply_all_transforms(
                txn,
                &self.transforms,
                self.config.engine.max_transform_passes,
                self.config.engine.normalize_text,
            )?;
            tracing::trace!("Transforms settled after {} passes", passes);
            drain_queued(txn)?;
        }

        gc::collect_detached(txn)?;
        validate_selection(txn)
    }

    // ==================== Commit ====================

    fn commit(&mut self) -> CoreResult<()> {
        let Some(txn) = self.pending.take() else {
            return Ok(());
        };
        let (mut next, summary) = txn.into_parts();
        next.freeze();
        let next = Arc::new(next);
        let TransactionSummary {
            prev,
            dirty_leaves,
            dirty_elements,
            dirty_type,
            keys,
            composition_key,
            tags,
            deferred,
        } = summary;
        self.keys = keys;

        let full = dirty_type == DirtyType::FullReconcile;
        let outcome = match self.reconcile(&prev, &next, &dirty_leaves, &dirty_elements, full) {
            Ok(outcome) => outcome,
            Err(err) => return self.recover_render(err),
        };

        self.current = Arc::clone(&next);
        self.composition_key = composition_key;
        tracing::debug!(
            "Committed {} dirty leaves, {} dirty elements{}",
            dirty_leaves.len(),
            dirty_elements.len(),
            if full { " (full reconcile)" } else { "" }
        );

        if self.editable && !tags.contains(SKIP_DOM_SELECTION) {
            if let Some(target) = self.target.as_mut() {
                resolver::apply_selection(
                    &next,
                    &self.cache,
                    target.as_mut(),
                    self.config.reconciler.scroll_into_view,
                );
            }
        }

        let text = match &outcome {
            Some(outcome) => outcome.text_content.clone(),
            None => next.text_content(NodeKey::ROOT).map_err(CoreError::from_model)?,
        };
        let decorators_changed = self.refresh_decorators(&next, outcome.as_ref(), &dirty_leaves);

        let payload = UpdatePayload {
            prev,
            next: Arc::clone(&next),
            dirty_leaves,
            dirty_elements,
            tags,
        };
        self.notify(outcome, decorators_changed, text, &payload);

        for callback in deferred {
            callback();
        }
        Ok(())
    }

    fn reconcile(
        &mut self,
        prev: &EditorState,
        next: &EditorState,
        dirty_leaves: &BTreeSet<NodeKey>,
        dirty_elements: &BTreeMap<NodeKey, DirtyCause>,
        full: bool,
    ) -> CoreResult<Option<ReconcileOutcome>> {
        let Some(target) = self.target.as_mut() else {
            return Ok(None);
        };
        let empty = EditorState::empty();
        // nothing rendered yet: diff against an empty document
        let (prev, full) = if self.mounted { (prev, full) } else { (&empty, true) };
        let request = ReconcileRequest {
            prev,
            next,
            dirty_leaves,
            dirty_elements,
            full,
        };
        let outcome = reconcile_root(request, target.as_mut(), &mut self.cache, &self.config)?;
        self.mounted = true;
        Ok(Some(outcome))
    }

    /// Fires listeners and events for a finished commit.
    fn notify(
        &mut self,
        outcome: Option<ReconcileOutcome>,
        decorators_changed: bool,
        text: String,
        payload: &UpdatePayload,
    ) {
        if let Some(outcome) = &outcome {
            self.listeners.fire_mutations(&outcome.mutations, payload);
        }
        if decorators_changed {
            self.listeners.fire_decorators(&self.decorators);
        }
        if text != self.text_content {
            self.text_content = text;
            self.listeners.fire_text_content(&self.text_content);
            self.event_bus.emit(EditorEvent::TextContentChanged {
                editor: self.id,
                text: self.text_content.clone(),
            });
        }
        self.listeners.fire_update(payload);
        self.event_bus.emit(EditorEvent::Committed {
            editor: self.id,
            state: Arc::clone(&payload.next),
            tags: payload.tags.clone(),
        });
    }

    /// Brings the decorator map up to date. Returns true if it changed.
    fn refresh_decorators(
        &mut self,
        next: &EditorState,
        outcome: Option<&ReconcileOutcome>,
        dirty_leaves: &BTreeSet<NodeKey>,
    ) -> bool {
        let candidates: BTreeSet<NodeKey> = match outcome {
            Some(outcome) => outcome.decorators_changed.clone(),
            None => dirty_leaves
                .iter()
                .chain(self.decorators.keys())
                .copied()
                .collect(),
        };

        let mut changed = false;
        for key in candidates {
            let payload = next
                .get(key)
                .and_then(|node| node.as_decorator())
                .map(|data| data.payload.clone());
            match payload {
                Some(payload) => {
                    if self.decorators.get(&key) != Some(&payload) {
                        self.decorators.insert(key, payload);
                        changed = true;
                    }
                }
                None => changed |= self.decorators.remove(&key).is_some(),
            }
        }
        changed
    }

    // ==================== Recovery ====================

    /// Handles a failed update: report, discard, resync, return the error.
    fn recover(&mut self, err: CoreError) -> CoreResult<()> {
        self.listeners.report_error(&err);
        tracing::warn!("Update failed, resynchronizing: {}", err);
        self.commit_recovery()?;
        Err(err)
    }

    /// Handles a failed reconcile: reset the render tree and re-render the
    /// last good state from scratch.
    fn recover_render(&mut self, err: CoreError) -> CoreResult<()> {
        if self.recovering {
            return Err(err);
        }
        self.listeners.report_error(&err);
        tracing::warn!("Reconcile failed, re-rendering: {}", err);
        self.reset_render_tree()
            .map_err(|reset| CoreError::RecoveryFailed(Box::new(reset)))?;
        self.commit_recovery()?;
        Err(err)
    }

    /// Commits the current state again with a full reconcile.
    fn commit_recovery(&mut self) -> CoreResult<()> {
        self.recovering = true;
        let result = self.commit_full();
        self.recovering = false;
        result.map_err(|err| match err {
            CoreError::RecoveryFailed(_) => err,
            other => CoreError::RecoveryFailed(Box::new(other)),
        })
    }

    fn commit_full(&mut self) -> CoreResult<()> {
        let mut txn = Transaction::open(Arc::clone(&self.current), self.keys, self.composition_key);
        txn.mark_full_reconcile();
        self.pending = Some(txn);
        self.commit()
    }

    fn reset_render_tree(&mut self) -> CoreResult<()> {
        if let (Some(target), Some(root)) = (self.target.as_mut(), self.root) {
            for child in target.children(root) {
                target.remove(child)?;
            }
            self.cache.mount(root);
        }
        self.mounted = false;
        Ok(())
    }

    // ==================== Render Target ====================

    /// Attaches a render target and renders the current document under `root`.
    pub fn attach(&mut self, mut target: Box<dyn RenderTarget>, root: RenderId) -> CoreResult<()> {
        self.flush()?;
        let previous = self.root;

        target.stash_key(root, NodeKey::ROOT);
        let stale = target.take_observed();
        if !stale.is_empty() {
            tracing::debug!("Dropping {} mutation records observed before attach", stale.len());
        }
        self.cache.mount(root);
        self.mounted = false;
        self.target = Some(target);
        self.root = Some(root);

        self.listeners.fire_root(previous, Some(root));
        self.event_bus.emit(EditorEvent::RootChanged {
            editor: self.id,
            root: Some(root),
        });
        self.commit_full()
    }

    /// Detaches the render target and hands it back.
    pub fn detach(&mut self) -> CoreResult<Option<Box<dyn RenderTarget>>> {
        self.flush()?;
        let previous = self.root.take();
        let target = self.target.take();
        self.cache.clear();
        self.mounted = false;

        if previous.is_some() {
            self.listeners.fire_root(previous, None);
            self.event_bus.emit(EditorEvent::RootChanged {
                editor: self.id,
                root: None,
            });
        }
        Ok(target)
    }

    pub fn root(&self) -> Option<RenderId> {
        self.root
    }

    /// Folds render mutations made behind the engine's back.
    ///
    /// Records still buffered in the target are drained too.
    pub fn reconcile_observed_changes(&mut self, mut records: Vec<MutationRecord>) -> CoreResult<FoldSummary> {
        if let Some(target) = self.target.as_mut() {
            records.extend(target.take_observed());
        }
        let mut folded = FoldSummary::default();
        self.run_update(
            |editor, txn| {
                folded = editor.fold_records(txn, records)?;
                Ok(())
            },
            UpdateOptions::default(),
        )?;
        Ok(folded)
    }

    /// Copies the native selection into the document.
    ///
    /// A native selection outside the engine's render nodes is ignored.
    pub fn sync_selection_from_native(&mut self) -> CoreResult<()> {
        self.run_update(
            |editor, txn| {
                let Some(target) = editor.target.as_ref() else {
                    return Ok(());
                };
                let selection = match target.selection() {
                    None => None,
                    Some(_) => match resolver::selection_from_native(txn.state(), &editor.cache, target.as_ref()) {
                        Some(selection) => Some(selection),
                        None => return Ok(()),
                    },
                };
                if txn.selection() != selection.as_ref() {
                    txn.set_selection(selection)?;
                }
                Ok(())
            },
            UpdateOptions::default().with_tag(SKIP_DOM_SELECTION),
        )
    }

    fn fold_records(&mut self, txn: &mut Transaction, mut records: Vec<MutationRecord>) -> CoreResult<FoldSummary> {
        let Some(target) = self.target.as_mut() else {
            return Ok(FoldSummary::default());
        };
        records.extend(target.take_observed());
        if records.is_empty() {
            return Ok(FoldSummary::default());
        }
        let summary = observer::fold_observed(txn, records, &self.cache, target.as_mut())?;
        if !summary.is_empty() {
            tracing::debug!("Folded observed mutations: {:?}", summary);
        }
        Ok(summary)
    }

    // ==================== Queries ====================

    /// Text of the committed document.
    pub fn text_content(&self) -> &str {
        &self.text_content
    }

    /// Payloads of all attached decorators.
    pub fn decorators(&self) -> &BTreeMap<NodeKey, serde_json::Value> {
        &self.decorators
    }

    /// Writing direction last written for a block element.
    pub fn direction_of(&self, key: NodeKey) -> Option<Direction> {
        self.cache.get(key).and_then(|entry| entry.direction)
    }

    pub fn is_composing(&self) -> bool {
        match &self.pending {
            Some(txn) => txn.composition_key().is_some(),
            None => self.composition_key.is_some(),
        }
    }

    pub fn has_pending_update(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn set_editable(&mut self, editable: bool) {
        if self.editable == editable {
            return;
        }
        self.editable = editable;
        self.listeners.fire_editable(editable);
        self.event_bus.emit(EditorEvent::EditableChanged {
            editor: self.id,
            editable,
        });
    }

    // ==================== Registration ====================

    /// Registers a transform rule and marks existing nodes of the type dirty
    /// so the rule sees them.
    pub fn register_transform<F>(&mut self, type_name: &str, rule: F) -> CoreResult<TransformId>
    where
        F: Fn(&mut Transaction, NodeKey) -> CoreResult<()> + 'static,
    {
        let id = self.transforms.register(type_name, rule);
        let existing: Vec<NodeKey> = self
            .current
            .nodes()
            .values()
            .filter(|node| node.type_name() == type_name)
            .map(|node| node.key)
            .collect();
        if !existing.is_empty() {
            self.update(
                move |txn| {
                    for key in existing {
                        txn.mark_dirty(key)?;
                    }
                    Ok(())
                },
                UpdateOptions::default(),
            )?;
        }
        Ok(id)
    }

    pub fn unregister_transform(&mut self, id: TransformId) -> bool {
        self.transforms.unregister(id)
    }

    pub fn on_update(&mut self, listener: impl FnMut(&UpdatePayload) + 'static) -> ListenerId {
        self.listeners.on_update(Box::new(listener))
    }

    pub fn on_mutation(
        &mut self,
        type_name: &str,
        listener: impl FnMut(&BTreeMap<NodeKey, MutationKind>, &UpdatePayload) + 'static,
    ) -> ListenerId {
        self.listeners.on_mutation(type_name, Box::new(listener))
    }

    pub fn on_text_content(&mut self, listener: impl FnMut(&str) + 'static) -> ListenerId {
        self.listeners.on_text_content(Box::new(listener))
    }

    pub fn on_decorators(
        &mut self,
        listener: impl FnMut(&BTreeMap<NodeKey, serde_json::Value>) + 'static,
    ) -> ListenerId {
        self.listeners.on_decorators(Box::new(listener))
    }

    pub fn on_root(&mut self, listener: impl FnMut(Option<RenderId>, Option<RenderId>) + 'static) -> ListenerId {
        self.listeners.on_root(Box::new(listener))
    }

    pub fn on_editable(&mut self, listener: impl FnMut(bool) + 'static) -> ListenerId {
        self.listeners.on_editable(Box::new(listener))
    }

    /// Replaces the handler that receives update and reconcile failures.
    pub fn set_error_handler(&mut self, handler: impl FnMut(&CoreError) + 'static) {
        self.listeners.set_error_handler(Box::new(handler));
    }

    pub fn unregister_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandRegistry {
        &mut self.commands
    }

    /// Subscribes to editor events.
    pub fn subscribe(&self) -> broadcast::Receiver<EditorEvent> {
        self.event_bus.subscribe()
    }
}

impl Default for Editor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("id", &self.id)
            .field("nodes", &self.current.len())
            .field("pending", &self.pending.is_some())
            .field("root", &self.root)
            .field("editable", &self.editable)
            .finish()
    }
}

/// Keeps engine errors raised inside callbacks recognizable.
fn callback_error(err: anyhow::Error) -> CoreError {
    match err.downcast::<CoreError>() {
        Ok(core) => core,
        Err(other) => CoreError::Callback(other),
    }
}

fn drain_queued(txn: &mut Transaction) -> CoreResult<()> {
    while let Some((update, options)) = txn.queued.pop_front() {
        txn.absorb_options(options);
        update(txn).map_err(callback_error)?;
    }
    Ok(())
}

fn validate_selection(txn: &Transaction) -> CoreResult<()> {
    let Some(selection) = txn.selection() else {
        return Ok(());
    };
    match selection.referenced_keys().into_iter().find(|key| !txn.contains(*key)) {
        Some(key) => Err(CoreError::DeadSelection(key)),
        None => Ok(()),
    }
}
