//! # Strata Core
//!
//! Transactions over the document tree and their synchronization with a
//! render target.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Editor                              │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌─────────┐ │
//! │  │   Config   │  │ Transforms │  │ Listeners  │  │Commands │ │
//! │  └────────────┘  └────────────┘  └────────────┘  └─────────┘ │
//! │        │                                                      │
//! │  ┌─────┴────────────── update pipeline ───────────────────┐   │
//! │  │ Transaction → normalize/transforms → gc → commit       │   │
//! │  └────────────────────────────┬───────────────────────────┘   │
//! │                               ▼                               │
//! │  ┌────────────┐     ┌──────────────────┐                      │
//! │  │ Reconciler │ ──▶ │ Selection        │ ──▶ dyn RenderTarget │
//! │  └────────────┘     │ Resolver         │                      │
//! │                     └──────────────────┘                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Learning: explicit context
//!
//! Every tree operation takes the [`Transaction`] as `&mut self` instead of
//! reaching for a global "active editor". The borrow checker then guarantees
//! that nothing outside the running update can touch the pending state.

pub mod command;
pub mod config;
pub mod direction;
pub mod editor;
pub mod event;
pub mod gc;
pub mod listener;
pub mod memory_target;
pub mod normalize;
pub mod observer;
pub mod ops;
pub mod reconciler;
pub mod render;
pub mod resolver;
pub mod transaction;
pub mod transform;
pub mod update;

pub use command::{CommandPriority, CommandRegistry};
pub use config::Config;
pub use direction::Direction;
pub use editor::{Editor, EditorId};
pub use event::{EditorEvent, EventBus, EventHandler};
pub use listener::{ListenerId, MutationKind, UpdatePayload};
pub use memory_target::MemoryTarget;
pub use reconciler::RenderCache;
pub use render::{MutationRecord, NativePoint, NativeRange, RenderError, RenderId, RenderTarget};
pub use transaction::{DirtyCause, DirtyType, Transaction};
pub use transform::TransformRegistry;
pub use update::UpdateOptions;

pub use strata_model::{
    EditorState, ElementData, ModelError, Node, NodeKey, NodeKind, Point, PointKind, Selection,
    TextData, TextFormat, TextMode,
};

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeKey),

    #[error("Broken child list on {key}: {detail}")]
    BrokenChildList { key: NodeKey, detail: String },

    #[error("Selection references missing node {0}")]
    DeadSelection(NodeKey),

    #[error("Transforms did not settle after {passes} passes")]
    TransformLoop { passes: usize },

    #[error("Editor state is frozen")]
    FrozenState,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Update callback failed: {0}")]
    Callback(anyhow::Error),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Recovery commit failed: {0}")]
    RecoveryFailed(Box<CoreError>),
}

impl CoreError {
    /// Errors that mean the pending tree can no longer be trusted.
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            CoreError::Model(err) => !matches!(err, ModelError::Frozen),
            CoreError::NodeNotFound(_)
            | CoreError::BrokenChildList { .. }
            | CoreError::DeadSelection(_)
            | CoreError::TransformLoop { .. }
            | CoreError::FrozenState
            | CoreError::InvalidOperation(_) => true,
            _ => false,
        }
    }

    /// Maps model errors onto their core counterparts.
    pub(crate) fn from_model(err: ModelError) -> Self {
        match err {
            ModelError::NodeNotFound(key) => CoreError::NodeNotFound(key),
            ModelError::BrokenChildList { key, detail } => {
                CoreError::BrokenChildList { key, detail }
            }
            ModelError::Frozen => CoreError::FrozenState,
            other => CoreError::Model(other),
        }
    }
}
