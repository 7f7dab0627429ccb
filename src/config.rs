//! Runner configuration.
//!
//! Loaded from JSON, with every field optional:
//!
//! ```json
//! { "optimization_profile": 1, "use_cuda_graphs": true }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Profile selected right after activation. `None` keeps the context's
    /// current profile.
    pub optimization_profile: Option<usize>,
    /// Capture execution into a graph and replay it while the binding is
    /// unchanged.
    pub use_cuda_graphs: bool,
}

impl RunnerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, RunnerError> {
        serde_json::from_str(json).map_err(|e| RunnerError::Config(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert!(!config.use_cuda_graphs);
        assert_eq!(config.optimization_profile, None);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(&path, r#"{"optimization_profile": 2, "use_cuda_graphs": true}"#).unwrap();
        let config = RunnerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.optimization_profile, Some(2));
        assert!(config.use_cuda_graphs);
    }

    #[test]
    fn test_missing_file() {
        let err = RunnerConfig::from_json_file(Path::new("/nonexistent/runner.json")).unwrap_err();
        assert!(matches!(err, RunnerError::Config(ref m) if m.contains("Failed to read")));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = RunnerConfig::from_json_str(r#"{"use_graphs": true}"#).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }
}
