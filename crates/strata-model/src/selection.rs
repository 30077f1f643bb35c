//! Logical selections.
//!
//! ## Design
//!
//! A selection is one of three shapes: a range between two [`Point`]s, a set
//! of whole nodes, or a rectangle of grid cells. Each shape caches the node
//! list it resolves to. The cache is filled lazily by readers and reset by
//! every point mutation; the transaction also resets it whenever a node
//! becomes writable, since any write may change what a range covers.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::NodeKey;

/// Whether a point addresses characters or children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind {
    /// Offset is a character index into a text node
    Text,
    /// Offset is a child index into an element
    Element,
}

/// One end of a range selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub key: NodeKey,
    pub offset: usize,
    pub kind: PointKind,
}

impl Point {
    pub const fn text(key: NodeKey, offset: usize) -> Self {
        Self {
            key,
            offset,
            kind: PointKind::Text,
        }
    }

    pub const fn element(key: NodeKey, offset: usize) -> Self {
        Self {
            key,
            offset,
            kind: PointKind::Element,
        }
    }
}

/// Lazily resolved node list. Never part of equality.
#[derive(Debug, Clone, Default)]
pub struct NodeListCache(OnceLock<Vec<NodeKey>>);

impl NodeListCache {
    pub fn get(&self) -> Option<&[NodeKey]> {
        self.0.get().map(Vec::as_slice)
    }

    pub fn get_or_init(&self, f: impl FnOnce() -> Vec<NodeKey>) -> &[NodeKey] {
        self.0.get_or_init(f)
    }

    pub fn clear(&mut self) {
        self.0 = OnceLock::new();
    }
}

impl PartialEq for NodeListCache {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// A selection spanning from `anchor` to `focus`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSelection {
    pub anchor: Point,
    pub focus: Point,
    /// Format applied to text typed at a collapsed caret
    pub format: crate::TextFormat,
    pub cache: NodeListCache,
}

impl RangeSelection {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self {
            anchor,
            focus,
            format: crate::TextFormat::empty(),
            cache: NodeListCache::default(),
        }
    }

    /// A caret at `point`.
    pub fn collapsed(point: Point) -> Self {
        Self::new(point, point)
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

/// A set of whole nodes (images, tables) selected as units.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSelection {
    pub keys: BTreeSet<NodeKey>,
    pub cache: NodeListCache,
}

impl NodeSelection {
    pub fn new(keys: impl IntoIterator<Item = NodeKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            cache: NodeListCache::default(),
        }
    }
}

/// A rectangle of cells inside one grid node.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSelection {
    pub grid_key: NodeKey,
    /// Anchor cell
    pub anchor: NodeKey,
    /// Focus cell
    pub focus: NodeKey,
    pub cache: NodeListCache,
}

/// The logical selection of a state.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Range(RangeSelection),
    Node(NodeSelection),
    Grid(GridSelection),
}

impl Selection {
    /// A collapsed caret at `point`.
    pub fn caret(point: Point) -> Self {
        Selection::Range(RangeSelection::collapsed(point))
    }

    pub fn range(anchor: Point, focus: Point) -> Self {
        Selection::Range(RangeSelection::new(anchor, focus))
    }

    pub fn as_range(&self) -> Option<&RangeSelection> {
        match self {
            Selection::Range(range) => Some(range),
            _ => None,
        }
    }

    pub fn as_range_mut(&mut self) -> Option<&mut RangeSelection> {
        match self {
            Selection::Range(range) => Some(range),
            _ => None,
        }
    }

    /// Every key the selection refers to directly.
    pub fn referenced_keys(&self) -> Vec<NodeKey> {
        match self {
            Selection::Range(range) => vec![range.anchor.key, range.focus.key],
            Selection::Node(set) => set.keys.iter().copied().collect(),
            Selection::Grid(grid) => vec![grid.grid_key, grid.anchor, grid.focus],
        }
    }

    pub fn cache(&self) -> &NodeListCache {
        match self {
            Selection::Range(range) => &range.cache,
            Selection::Node(set) => &set.cache,
            Selection::Grid(grid) => &grid.cache,
        }
    }

    /// Forgets the resolved node list.
    pub fn invalidate_cache(&mut self) {
        match self {
            Selection::Range(range) => range.cache.clear(),
            Selection::Node(set) => set.cache.clear(),
            Selection::Grid(grid) => grid.cache.clear(),
        }
    }
}
