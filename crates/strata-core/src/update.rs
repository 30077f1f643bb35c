//! Options for a single update.

/// Tag that keeps a commit from writing the native selection.
pub const SKIP_DOM_SELECTION: &str = "skip-dom-selection";

/// How an update request is run and committed.
#[derive(Default)]
pub struct UpdateOptions {
    /// Tag added to the transaction
    pub tag: Option<String>,
    /// Skip normalization and transforms for this update
    pub skip_transforms: bool,
    /// Commit synchronously instead of at the next checkpoint
    pub discrete: bool,
    /// Runs after the commit that includes this update
    pub on_update: Option<Box<dyn FnOnce()>>,
}

impl UpdateOptions {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn discrete(mut self) -> Self {
        self.discrete = true;
        self
    }

    pub fn skip_transforms(mut self) -> Self {
        self.skip_transforms = true;
        self
    }

    pub fn on_update<F: FnOnce() + 'static>(mut self, f: F) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for UpdateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOptions")
            .field("tag", &self.tag)
            .field("skip_transforms", &self.skip_transforms)
            .field("discrete", &self.discrete)
            .field("on_update", &self.on_update.is_some())
            .finish()
    }
}
