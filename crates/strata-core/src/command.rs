//! Command registration.
//!
//! ## Learning: Trait Objects
//!
//! Handlers are stored as `Rc<dyn CommandHandler>` so closures and
//! hand-written handler types can share one list. Any
//! `Fn(&serde_json::Value) -> bool` is a handler through the blanket impl.
//!
//! The registry only knows which handlers exist and in which order they
//! should be consulted; deciding what a command does is the host's job.

use std::collections::HashMap;
use std::rc::Rc;

/// Priority band of a handler. Higher bands are consulted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandPriority {
    Editor,
    Low,
    Normal,
    High,
    Critical,
}

impl CommandPriority {
    const ALL: [CommandPriority; 5] = [
        CommandPriority::Editor,
        CommandPriority::Low,
        CommandPriority::Normal,
        CommandPriority::High,
        CommandPriority::Critical,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Something that can handle a command payload.
pub trait CommandHandler {
    /// Returns true if the command was handled and lower bands should be skipped.
    fn handle(&self, payload: &serde_json::Value) -> bool;
}

impl<F> CommandHandler for F
where
    F: Fn(&serde_json::Value) -> bool,
{
    fn handle(&self, payload: &serde_json::Value) -> bool {
        self(payload)
    }
}

/// Handle returned by [`CommandRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(u64);

type Bands = [Vec<(CommandId, Rc<dyn CommandHandler>)>; 5];

/// Handlers per command name, per priority band.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Bands>,
    next_id: u64,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `command` in a priority band.
    pub fn register<H>(&mut self, command: impl Into<String>, priority: CommandPriority, handler: H) -> CommandId
    where
        H: CommandHandler + 'static,
    {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        let bands = self.commands.entry(command.into()).or_default();
        bands[priority.index()].push((id, Rc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not registered.
    pub fn unregister(&mut self, id: CommandId) -> bool {
        let mut found = false;
        self.commands.retain(|_, bands| {
            for band in bands.iter_mut() {
                let before = band.len();
                band.retain(|(handler_id, _)| *handler_id != id);
                found |= band.len() != before;
            }
            bands.iter().any(|band| !band.is_empty())
        });
        found
    }

    /// Handlers of `command`, highest band first, registration order within a band.
    pub fn handlers(&self, command: &str) -> Vec<Rc<dyn CommandHandler>> {
        let Some(bands) = self.commands.get(command) else {
            return Vec::new();
        };
        CommandPriority::ALL
            .iter()
            .rev()
            .flat_map(|priority| bands[priority.index()].iter())
            .map(|(_, handler)| Rc::clone(handler))
            .collect()
    }

    pub fn has(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    /// Returns all command names with at least one handler.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.list())
            .finish()
    }
}
