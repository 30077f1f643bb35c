//! Node keys.
//!
//! A `NodeKey` is a newtype over a counter value. Keys are only meaningful
//! inside the editor instance that issued them; they survive copy-on-write
//! clones because a clone is registered under the same key.

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier for a logical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(u32);

impl NodeKey {
    /// The key of the root node, identical in every state.
    pub const ROOT: NodeKey = NodeKey(0);

    /// Builds a key from its raw value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Returns true for the root key.
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Issues fresh keys for one editor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyGenerator {
    next: u32,
}

impl KeyGenerator {
    /// Creates a generator whose first key follows the root.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Creates a generator that never reissues any key up to `highest`.
    pub fn after(highest: NodeKey) -> Self {
        Self {
            next: highest.0.saturating_add(1).max(1),
        }
    }

    /// Returns the next unused key.
    pub fn next_key(&mut self) -> NodeKey {
        let key = NodeKey(self.next);
        self.next += 1;
        key
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}
