//! Logical nodes.
//!
//! ## Design
//!
//! A node is one struct with the linkage every node shares (`key`, `parent`,
//! `prev`, `next`) and a [`NodeKind`] sum type carrying the per-kind data.
//! Copy-on-write uses the derived `Clone`: a copy keeps the key and every
//! raw link, which is exactly what a writable clone needs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::NodeKey;

/// A logical document node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier
    pub key: NodeKey,
    /// Owning element (None for the root and for detached nodes)
    pub parent: Option<NodeKey>,
    /// Previous sibling
    pub prev: Option<NodeKey>,
    /// Next sibling
    pub next: Option<NodeKey>,
    /// Kind-specific data
    pub kind: NodeKind,
}

/// The node variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Root(ElementData),
    Element(ElementData),
    Text(TextData),
    LineBreak,
    Decorator(DecoratorData),
}

/// Child-list handles and presentation data of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementData {
    /// Registered type name ("paragraph", "heading", ...)
    pub type_name: String,
    /// Render tag ("p", "h1", ...)
    pub tag: String,
    /// Inline elements (links, marks) flow inside a block
    pub inline: bool,
    /// When false, removing the last child also removes the element
    pub can_be_empty: bool,
    /// Render attributes
    pub attributes: BTreeMap<String, String>,
    /// First child
    pub first: Option<NodeKey>,
    /// Last child
    pub last: Option<NodeKey>,
    /// Number of children
    pub size: usize,
}

impl ElementData {
    /// Creates an empty block element.
    pub fn new(type_name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            tag: tag.into(),
            inline: false,
            can_be_empty: true,
            attributes: BTreeMap::new(),
            first: None,
            last: None,
            size: 0,
        }
    }
}

/// Content of a text leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextData {
    pub text: String,
    pub format: TextFormat,
    /// Inline CSS, compared verbatim when merging siblings
    pub style: String,
    pub mode: TextMode,
}

impl TextData {
    /// Creates unformatted text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::default(),
            style: String::new(),
            mode: TextMode::Normal,
        }
    }

    /// Length in characters; offsets into text are character offsets.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    /// Returns true for empty text.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Simple text can be merged with and split freely.
    pub fn is_simple(&self) -> bool {
        self.mode == TextMode::Normal
    }
}

/// How text behaves under normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMode {
    /// Merges with compatible neighbours
    #[default]
    Normal,
    /// Treated as one unit (mentions, hashtags)
    Token,
    /// Deleted segment by segment
    Segmented,
}

/// Bit set of inline text formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TextFormat(u32);

impl TextFormat {
    pub const BOLD: TextFormat = TextFormat(1);
    pub const ITALIC: TextFormat = TextFormat(1 << 1);
    pub const STRIKETHROUGH: TextFormat = TextFormat(1 << 2);
    pub const UNDERLINE: TextFormat = TextFormat(1 << 3);
    pub const CODE: TextFormat = TextFormat(1 << 4);
    pub const SUBSCRIPT: TextFormat = TextFormat(1 << 5);
    pub const SUPERSCRIPT: TextFormat = TextFormat(1 << 6);
    pub const HIGHLIGHT: TextFormat = TextFormat(1 << 7);

    /// No formatting.
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: TextFormat) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: TextFormat) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: TextFormat) -> Self {
        Self(self.0 & !other.0)
    }

    /// Space separated names of the set formats.
    pub fn class_names(self) -> String {
        const NAMES: [(TextFormat, &str); 8] = [
            (TextFormat::BOLD, "bold"),
            (TextFormat::ITALIC, "italic"),
            (TextFormat::STRIKETHROUGH, "strikethrough"),
            (TextFormat::UNDERLINE, "underline"),
            (TextFormat::CODE, "code"),
            (TextFormat::SUBSCRIPT, "subscript"),
            (TextFormat::SUPERSCRIPT, "superscript"),
            (TextFormat::HIGHLIGHT, "highlight"),
        ];
        NAMES
            .iter()
            .filter(|(format, _)| self.contains(*format))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The render tag a text node with this format uses.
    pub fn tag(self) -> &'static str {
        if self.contains(Self::CODE) {
            "code"
        } else if self.contains(Self::BOLD) {
            "strong"
        } else if self.contains(Self::ITALIC) {
            "em"
        } else if self.contains(Self::SUBSCRIPT) {
            "sub"
        } else if self.contains(Self::SUPERSCRIPT) {
            "sup"
        } else {
            "span"
        }
    }
}

/// Payload of an embedded widget; rendering is left to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoratorData {
    pub type_name: String,
    pub payload: serde_json::Value,
    pub inline: bool,
}

impl Node {
    /// Creates the root node.
    pub fn root() -> Self {
        Self {
            key: NodeKey::ROOT,
            parent: None,
            prev: None,
            next: None,
            kind: NodeKind::Root(ElementData::new("root", "div")),
        }
    }

    /// Creates a detached node of the given kind.
    pub fn new(key: NodeKey, kind: NodeKind) -> Self {
        Self {
            key,
            parent: None,
            prev: None,
            next: None,
            kind,
        }
    }

    /// The type name transforms and mutation listeners are registered under.
    pub fn type_name(&self) -> &str {
        match &self.kind {
            NodeKind::Root(_) => "root",
            NodeKind::Element(data) => &data.type_name,
            NodeKind::Text(_) => "text",
            NodeKind::LineBreak => "linebreak",
            NodeKind::Decorator(data) => &data.type_name,
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root(_))
    }

    /// Elements and the root hold children.
    pub fn is_element(&self) -> bool {
        matches!(self.kind, NodeKind::Root(_) | NodeKind::Element(_))
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, NodeKind::Text(_))
    }

    pub fn is_line_break(&self) -> bool {
        matches!(self.kind, NodeKind::LineBreak)
    }

    pub fn is_decorator(&self) -> bool {
        matches!(self.kind, NodeKind::Decorator(_))
    }

    /// Returns true if the node flows inside a block.
    pub fn is_inline(&self) -> bool {
        match &self.kind {
            NodeKind::Root(_) => false,
            NodeKind::Element(data) => data.inline,
            NodeKind::Text(_) | NodeKind::LineBreak => true,
            NodeKind::Decorator(data) => data.inline,
        }
    }

    pub fn as_element(&self) -> Option<&ElementData> {
        match &self.kind {
            NodeKind::Root(data) | NodeKind::Element(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut ElementData> {
        match &mut self.kind {
            NodeKind::Root(data) | NodeKind::Element(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextData> {
        match &self.kind {
            NodeKind::Text(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_text_mut(&mut self) -> Option<&mut TextData> {
        match &mut self.kind {
            NodeKind::Text(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_decorator(&self) -> Option<&DecoratorData> {
        match &self.kind {
            NodeKind::Decorator(data) => Some(data),
            _ => None,
        }
    }

    /// Number of children, zero for leaves.
    pub fn child_count(&self) -> usize {
        self.as_element().map_or(0, |e| e.size)
    }

    /// Text contributed by this node alone (leaves only).
    pub fn leaf_text(&self) -> &str {
        match &self.kind {
            NodeKind::Text(data) => &data.text,
            NodeKind::LineBreak => "\n",
            _ => "",
        }
    }
}
