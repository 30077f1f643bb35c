//! # Strata Model
//!
//! The logical document tree and the immutable snapshots built from it.
//!
//! ## Key Concepts
//!
//! ### Arena, not pointers
//! - Every node lives in a [`NodeMap`] keyed by [`NodeKey`]
//! - `parent`, `prev`, `next`, `first` and `last` are key handles, never references
//! - The map owns the nodes; the links only describe relations
//!
//! ### Structural sharing
//! - Nodes are stored behind `Arc`, so cloning an [`EditorState`] copies
//!   handles, not nodes
//! - A committed state is frozen; mutation always happens on a fresh copy
//!   held by the pending state (see `strata-core`)

mod key;
mod node;
mod selection;
mod state;

pub use key::{KeyGenerator, NodeKey};
pub use node::{
    DecoratorData, ElementData, Node, NodeKind, TextData, TextFormat, TextMode,
};
pub use selection::{
    GridSelection, NodeListCache, NodeSelection, Point, PointKind, RangeSelection, Selection,
};
pub use state::{EditorState, NodeMap};

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while reading or validating a document tree
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeKey),

    #[error("Node {0} is not an element")]
    NotAnElement(NodeKey),

    #[error("Node {0} is not a text node")]
    NotAText(NodeKey),

    #[error("Broken child list on {key}: {detail}")]
    BrokenChildList { key: NodeKey, detail: String },

    #[error("Editor state is frozen")]
    Frozen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_has_only_root() {
        let state = EditorState::empty();
        assert_eq!(state.len(), 1);
        assert!(state.root().unwrap().is_root());
        assert_eq!(state.text_content(NodeKey::ROOT).unwrap(), "");
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let state = EditorState::empty();
        let err = state.node(NodeKey::from_raw(42)).unwrap_err();
        assert_eq!(err, ModelError::NodeNotFound(NodeKey::from_raw(42)));
    }
}
