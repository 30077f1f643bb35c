//! Editor configuration.
//!
//! ## Learning: Serde defaults
//!
//! Every section is `#[serde(default)]`, so a config file only needs the
//! keys it wants to change and older files keep loading when new knobs
//! are added.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main editor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Update pipeline settings
    pub engine: EngineConfig,

    /// Render synchronization settings
    pub reconciler: ReconcilerConfig,

    /// Classes applied to rendered elements
    pub theme: ThemeConfig,
}

impl Config {
    /// Loads config from the default location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from_default_path().unwrap_or_else(|err| {
            tracing::debug!("Using default config: {}", err);
            Self::default()
        })
    }

    /// Loads config from a file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    fn load_from_default_path() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Returns the default config file path.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("strata").join("config.toml"))
    }

    /// Writes the config as TOML.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Update pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on transform passes before `TransformLoop`
    pub max_transform_passes: usize,

    /// Merge adjacent simple text and drop empty text before transforms
    pub normalize_text: bool,

    /// Commit every update synchronously
    pub discrete_by_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transform_passes: 100,
            normalize_text: true,
            discrete_by_default: false,
        }
    }
}

/// Render synchronization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Scroll the selection focus into view after writing it
    pub scroll_into_view: bool,

    /// Maintain `dir` attributes on block elements
    pub writing_direction: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scroll_into_view: true,
            writing_direction: true,
        }
    }
}

/// Node type name to CSS class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub classes: HashMap<String, String>,
}

impl ThemeConfig {
    pub fn class_for(&self, type_name: &str) -> Option<&str> {
        self.classes.get(type_name).map(String::as_str)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config directory not found")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.max_transform_passes, 100);
        assert!(config.engine.normalize_text);
        assert!(!config.engine.discrete_by_default);
        assert!(config.reconciler.writing_direction);
        assert!(config.theme.classes.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            max_transform_passes = 7

            [theme.classes]
            paragraph = "editor-paragraph"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.max_transform_passes, 7);
        assert!(config.engine.normalize_text);
        assert!(config.reconciler.scroll_into_view);
        assert_eq!(config.theme.class_for("paragraph"), Some("editor-paragraph"));
        assert_eq!(config.theme.class_for("heading"), None);
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.reconciler.scroll_into_view = false;
        config.theme.classes.insert("quote".into(), "q".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_bad_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\nmax_transform_passes = \"many\"").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
