//! Event bus for asynchronous observers.
//!
//! ## Learning: Observer Pattern in Rust
//!
//! Synchronous listeners (see [`crate::listener`]) run inside the commit and
//! borrow the states they are handed. Observers that live on another task
//! subscribe here instead: events are owned values, so a subscriber holds
//! an `Arc` of the committed state rather than a borrow into the editor.

use std::collections::BTreeSet;
use std::sync::Arc;

use strata_model::EditorState;
use tokio::sync::broadcast;

use crate::editor::EditorId;
use crate::render::RenderId;

/// Events emitted by an editor after it commits.
#[derive(Debug, Clone)]
pub enum EditorEvent {
    /// A transaction was committed
    Committed {
        editor: EditorId,
        state: Arc<EditorState>,
        tags: BTreeSet<String>,
    },
    /// The document's text content changed
    TextContentChanged { editor: EditorId, text: String },
    /// The editable flag was toggled
    EditableChanged { editor: EditorId, editable: bool },
    /// A render root was attached (`Some`) or detached (`None`)
    RootChanged {
        editor: EditorId,
        root: Option<RenderId>,
    },
}

impl EditorEvent {
    /// The editor that emitted the event.
    pub fn editor(&self) -> EditorId {
        match self {
            EditorEvent::Committed { editor, .. }
            | EditorEvent::TextContentChanged { editor, .. }
            | EditorEvent::EditableChanged { editor, .. }
            | EditorEvent::RootChanged { editor, .. } => *editor,
        }
    }
}

/// Event bus for broadcasting editor events.
///
/// ## Design
///
/// Using a broadcast channel allows:
/// - Multiple subscribers on any task
/// - No coupling between the editor and its observers
/// - Lagged receivers don't block the committing editor
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EditorEvent>,
}

impl EventBus {
    /// Creates a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Emits an event to all subscribers.
    pub fn emit(&self, event: EditorEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EditorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Helper for processing events asynchronously.
///
/// ## Example
///
/// ```ignore
/// let mut handler = EventHandler::new(editor.subscribe());
///
/// tokio::spawn(async move {
///     while let Some(event) = handler.next().await {
///         if let EditorEvent::TextContentChanged { text, .. } = event {
///             println!("{text}");
///         }
///     }
/// });
/// ```
pub struct EventHandler {
    receiver: broadcast::Receiver<EditorEvent>,
}

impl EventHandler {
    pub fn new(receiver: broadcast::Receiver<EditorEvent>) -> Self {
        Self { receiver }
    }

    /// Waits for the next event, skipping over any that were missed.
    pub async fn next(&mut self) -> Option<EditorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event handler lagged, missed {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
