//! The render target interface.
//!
//! ## Learning: trait objects at the seam
//!
//! The reconciler and the selection resolver only talk to `dyn RenderTarget`.
//! A browser DOM, a terminal grid or the in-memory [`MemoryTarget`] can sit
//! behind it. Render nodes are addressed by opaque [`RenderId`]s owned by the
//! target, mirroring how logical nodes are addressed by `NodeKey`.
//!
//! [`MemoryTarget`]: crate::memory_target::MemoryTarget

use strata_model::NodeKey;

/// Opaque handle of a render node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderId(pub u64);

impl std::fmt::Display for RenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A position in the render tree.
///
/// For text render nodes `offset` counts characters; for elements it is a
/// child index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePoint {
    pub node: RenderId,
    pub offset: usize,
}

/// The platform selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeRange {
    pub anchor: NativePoint,
    pub focus: NativePoint,
}

/// A change to the render tree made outside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRecord {
    /// Text of a text render node changed
    CharacterData { target: RenderId },
    /// Children were added to or removed from `target`
    ChildList {
        target: RenderId,
        added: Vec<RenderId>,
        removed: Vec<RenderId>,
    },
}

/// Result type for render target calls
pub type RenderResult<T> = Result<T, RenderError>;

/// Errors reported by a render target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Unknown render node: {0}")]
    UnknownNode(RenderId),

    #[error("Render node {0} is not an element")]
    NotAnElement(RenderId),

    #[error("Render node {0} is not text")]
    NotText(RenderId),

    #[error("Render node {child} is not a child of {parent}")]
    NotAChild { parent: RenderId, child: RenderId },

    #[error("Selection rejected: {0}")]
    SelectionRejected(String),

    #[error("Logical node {0} has no render node")]
    Unrendered(NodeKey),

    #[error("No render target attached")]
    Detached,
}

/// A mutable render tree the engine keeps in sync with the logical tree.
pub trait RenderTarget {
    /// Creates a detached element render node.
    fn create_element(&mut self, tag: &str) -> RenderId;

    /// Creates a detached text render node.
    fn create_text(&mut self, text: &str) -> RenderId;

    /// Inserts (or moves) `child` into `parent` before `before`, or last.
    fn insert_before(
        &mut self,
        parent: RenderId,
        child: RenderId,
        before: Option<RenderId>,
    ) -> RenderResult<()>;

    /// Detaches `node` from its parent.
    fn remove(&mut self, node: RenderId) -> RenderResult<()>;

    /// Puts `new` where `old` is inside `parent`.
    fn replace(&mut self, parent: RenderId, new: RenderId, old: RenderId) -> RenderResult<()>;

    /// Sets (`Some`) or removes (`None`) an attribute.
    fn set_attribute(&mut self, node: RenderId, name: &str, value: Option<&str>) -> RenderResult<()>;

    fn set_text(&mut self, node: RenderId, text: &str) -> RenderResult<()>;

    /// Records which logical node a render node belongs to.
    fn stash_key(&mut self, node: RenderId, key: NodeKey);

    fn key_of(&self, node: RenderId) -> Option<NodeKey>;

    fn children(&self, node: RenderId) -> Vec<RenderId>;

    fn parent(&self, node: RenderId) -> Option<RenderId>;

    fn next_sibling(&self, node: RenderId) -> Option<RenderId>;

    /// Text of a text render node.
    fn text(&self, node: RenderId) -> Option<String>;

    /// Tag of an element render node.
    fn tag(&self, node: RenderId) -> Option<String>;

    fn attribute(&self, node: RenderId, name: &str) -> Option<String>;

    /// The current platform selection.
    fn selection(&self) -> Option<NativeRange>;

    fn set_selection(&mut self, range: Option<NativeRange>) -> RenderResult<()>;

    /// Best effort; targets without scrolling ignore it.
    fn scroll_into_view(&mut self, _point: NativePoint) {}

    /// Drains mutation records observed since the last call.
    fn take_observed(&mut self) -> Vec<MutationRecord>;
}
