// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Boundary configuration
//
// Loaded from YAML, with discovery and environment overrides:
// - caller type name used when defining synthesized callers
// - soft reference idle threshold for reclaiming cached callers
// - metrics recording toggle

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Fully qualified name synthesized caller types are defined under
    #[serde(default = "default_caller_type_name")]
    pub caller_type_name: String,

    /// Caller cache behaviour
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cached callers not used for this long are cleared by
    /// `CallerCache::reclaim_idle`. `None` keeps them until memory pressure
    /// is signalled explicitly.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub soft_reference_idle: Option<Duration>,

    /// Emit cache counters through the `metrics` facade
    #[serde(default = "default_true")]
    pub record_metrics: bool,
}

fn default_caller_type_name() -> String {
    "boundary/CallerImpl".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            soft_reference_idle: None,
            record_metrics: true,
        }
    }
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            caller_type_name: default_caller_type_name(),
            cache: CacheConfig::default(),
        }
    }
}

impl BoundaryConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Candidate configuration files, highest precedence first:
    /// `$BOUNDARY_CONFIG_PATH`, `./boundary-config.yaml`,
    /// `~/.boundary/config.yaml`, then the system-wide file.
    fn config_candidates() -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = std::env::var_os("BOUNDARY_CONFIG_PATH")
            .map(PathBuf::from)
            .into_iter()
            .collect();
        candidates.push(PathBuf::from("boundary-config.yaml"));
        candidates.extend(dirs::home_dir().map(|home| home.join(".boundary").join("config.yaml")));
        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/boundary/config.yaml"));
        #[cfg(windows)]
        candidates.push(PathBuf::from("C:\\ProgramData\\Boundary\\config.yaml"));
        candidates
    }

    /// First existing file among the configuration candidates.
    pub fn discover_config() -> Option<PathBuf> {
        Self::config_candidates().into_iter().find(|path| path.is_file())
    }

    /// Load `explicit_path`, or the discovered file, or defaults; then apply
    /// environment overrides and validate. A missing explicit file is an error.
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let source = explicit_path.or_else(Self::discover_config);
        let mut config = match &source {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading boundary configuration");
                Self::from_yaml_file(path).with_context(|| {
                    format!("Failed to load boundary config at {}", path.display())
                })?
            }
            None => {
                tracing::debug!("No boundary configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BOUNDARY_RECORD_METRICS") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: BOUNDARY_RECORD_METRICS=true");
                    self.cache.record_metrics = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: BOUNDARY_RECORD_METRICS=false");
                    self.cache.record_metrics = false;
                }
                _ => {
                    tracing::warn!(
                        value = %val,
                        "Invalid value for BOUNDARY_RECORD_METRICS, expected true/false; ignoring"
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.caller_type_name.is_empty() {
            anyhow::bail!("caller_type_name cannot be empty");
        }

        if self.caller_type_name.chars().any(char::is_whitespace) {
            anyhow::bail!(
                "caller_type_name '{}' must not contain whitespace",
                self.caller_type_name
            );
        }

        if self.cache.soft_reference_idle == Some(Duration::ZERO) {
            anyhow::bail!("cache.soft_reference_idle must be greater than zero when set");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = BoundaryConfig::default();
        assert_eq!(config.caller_type_name, "boundary/CallerImpl");
        assert!(config.cache.record_metrics);
        assert!(config.cache.soft_reference_idle.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        let yaml = r#"
caller_type_name: "engine/SecureCallerImpl"
cache:
  soft_reference_idle: 5m
  record_metrics: false
"#;
        let config = BoundaryConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.caller_type_name, "engine/SecureCallerImpl");
        assert_eq!(config.cache.soft_reference_idle, Some(Duration::from_secs(300)));
        assert!(!config.cache.record_metrics);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = BoundaryConfig::from_yaml_str("cache: {}").unwrap();
        assert_eq!(config, BoundaryConfig::default());
    }

    #[test]
    fn test_validation() {
        let mut config = BoundaryConfig::default();
        config.caller_type_name = String::new();
        assert!(config.validate().is_err());

        config.caller_type_name = "has space".to_string();
        assert!(config.validate().is_err());

        config.caller_type_name = "boundary/CallerImpl".to_string();
        config.cache.soft_reference_idle = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache:\n  soft_reference_idle: 30s").unwrap();

        let config = BoundaryConfig::load_or_default(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.cache.soft_reference_idle, Some(Duration::from_secs(30)));
    }

    #[cfg(unix)]
    #[test]
    fn test_candidates_fall_back_to_system_file() {
        let candidates = BoundaryConfig::config_candidates();
        let local = candidates
            .iter()
            .position(|path| path == Path::new("boundary-config.yaml"))
            .unwrap();
        assert_eq!(candidates.last(), Some(&PathBuf::from("/etc/boundary/config.yaml")));
        assert!(local < candidates.len() - 1);
    }

    #[test]
    fn test_load_from_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(BoundaryConfig::load_or_default(Some(missing)).is_err());
    }
}
