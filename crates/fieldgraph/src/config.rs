//! Engine configuration.
//!
//! Configuration is stored as YAML:
//!
//! ```yaml
//! max-field-reference-depth: 50
//! max-formula-nesting-depth: 100
//! event-capacity: 256
//! formula-version: 1
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Default bound on dependency traversal depth
pub const DEFAULT_MAX_FIELD_REFERENCE_DEPTH: usize = 50;

/// Default bound on parenthesis nesting inside one expression
pub const DEFAULT_MAX_FORMULA_NESTING_DEPTH: usize = 100;

/// Default capacity of the dependency event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Formula version stamped on newly created formula fields
pub const DEFAULT_FORMULA_VERSION: u32 = 1;

/// Configuration for the dependency engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Deepest dependency level included in a closure. Fields further away
    /// are silently left out.
    pub max_field_reference_depth: usize,

    /// Deepest parenthesis nesting accepted in a formula expression
    pub max_formula_nesting_depth: usize,

    /// Buffered events per subscriber before lagging receivers drop events
    pub event_capacity: usize,

    /// Version stamped on formula-type fields when they are created
    pub formula_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_field_reference_depth: DEFAULT_MAX_FIELD_REFERENCE_DEPTH,
            max_formula_nesting_depth: DEFAULT_MAX_FORMULA_NESTING_DEPTH,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            formula_version: DEFAULT_FORMULA_VERSION,
        }
    }
}

impl EngineConfig {
    /// Config with a custom reference depth, other values default
    pub fn with_max_depth(max_field_reference_depth: usize) -> Self {
        Self {
            max_field_reference_depth,
            ..Self::default()
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_field_reference_depth == 0 {
            return Err(Error::Config(
                "max-field-reference-depth must be at least 1".to_string(),
            ));
        }
        if self.max_formula_nesting_depth == 0 {
            return Err(Error::Config(
                "max-formula-nesting-depth must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config(
                "event-capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a YAML file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::Config(format!("YAML error: {}", e)))?;
        fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: EngineConfig = serde_yaml::from_str("max-field-reference-depth: 3\n").unwrap();
        assert_eq!(config.max_field_reference_depth, 3);
        assert_eq!(
            config.max_formula_nesting_depth,
            DEFAULT_MAX_FORMULA_NESTING_DEPTH
        );
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.formula_version, DEFAULT_FORMULA_VERSION);
    }

    #[test]
    fn test_zero_depth_is_rejected() {
        let config = EngineConfig::with_max_depth(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");

        let config = EngineConfig {
            max_field_reference_depth: 7,
            max_formula_nesting_depth: 12,
            event_capacity: 4,
            formula_version: 3,
        };
        config.save(&path).await.unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        tokio::fs::write(&path, "max-field-reference-depth: [oops")
            .await
            .unwrap();

        assert!(matches!(
            EngineConfig::load(&path).await,
            Err(Error::Config(_))
        ));
    }
}
