//! Per-session configuration supplied on create.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Options for a new session. Unknown keys are kept in `extra` and handed
/// to the engine factory untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub weak_model: Option<String>,

    #[serde(default)]
    pub editor_model: Option<String>,

    #[serde(default)]
    pub editor_edit_format: Option<String>,

    #[serde(default)]
    pub edit_format: Option<String>,

    #[serde(default = "default_true")]
    pub yes_always: bool,

    #[serde(default = "default_true")]
    pub pretty: bool,

    #[serde(default)]
    pub git: bool,

    #[serde(default)]
    pub verbose: bool,

    /// Legacy v1 flag. Recorded on the session; has no effect.
    #[serde(default)]
    pub mode: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            model: None,
            weak_model: None,
            editor_model: None,
            editor_edit_format: None,
            edit_format: None,
            yes_always: true,
            pretty: true,
            git: false,
            verbose: false,
            mode: None,
            extra: Map::new(),
        }
    }
}

impl SessionConfig {
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// `work_dir` if present and non-blank.
    pub fn work_dir(&self) -> Option<&PathBuf> {
        self.work_dir
            .as_ref()
            .filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty())
    }

    /// `model` if present and non-blank, trimmed.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().map(str::trim).filter(|m| !m.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert!(config.yes_always);
        assert!(config.pretty);
        assert!(!config.git);
    }

    #[test]
    fn unknown_keys_land_in_extra() {
        let config: SessionConfig = serde_json::from_value(serde_json::json!({
            "work_dir": "/tmp/project",
            "model": "gpt-4o",
            "git": true,
            "lint_cmd": "ruff check",
            "read": ["README.md"]
        }))
        .unwrap();

        assert_eq!(config.work_dir(), Some(&PathBuf::from("/tmp/project")));
        assert_eq!(config.model.as_deref(), Some("gpt-4o"));
        assert!(config.git);
        assert_eq!(config.extra["lint_cmd"], "ruff check");
        assert_eq!(config.extra["read"][0], "README.md");
        assert!(!config.extra.contains_key("model"));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let result: Result<SessionConfig, _> =
            serde_json::from_value(serde_json::json!({"git": "yes"}));
        assert!(result.is_err());
    }

    #[test]
    fn blank_work_dir_is_missing() {
        let config = SessionConfig::default().with_work_dir("  ");
        assert!(config.work_dir().is_none());
    }

    #[test]
    fn blank_model_is_missing() {
        let config: SessionConfig =
            serde_json::from_value(serde_json::json!({"model": "  "})).unwrap();
        assert_eq!(config.model(), None);

        let config: SessionConfig =
            serde_json::from_value(serde_json::json!({"model": " gpt-4o "})).unwrap();
        assert_eq!(config.model(), Some("gpt-4o"));
    }
}
