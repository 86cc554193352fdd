//! Execution limits and trust settings for a `Vm`.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A zero limit is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub max_steps: usize,
    pub max_allocations: usize,
    pub max_frames: usize,
    /// Grants every permission regardless of the program's directives.
    pub trusted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Json { path: String, source: serde_json::Error },
}

impl VmConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: display.clone(), source })?;
        VmConfig::from_json(&text).map_err(|source| ConfigError::Json { path: display, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_disabled() {
        let config = VmConfig::from_json(r#"{"max_steps": 100}"#).unwrap();
        assert_eq!(config, VmConfig { max_steps: 100, ..VmConfig::default() });
    }

    #[test]
    fn unreadable_file() {
        let err = VmConfig::load(Path::new("/nonexistent/gale.json")).unwrap_err();
        assert!(err.to_string().starts_with("cannot read config /nonexistent/gale.json"));
    }

    #[test]
    fn invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gale.json");
        std::fs::write(&path, "{ max_steps: }").unwrap();
        assert!(matches!(VmConfig::load(&path), Err(ConfigError::Json { .. })));
    }
}
