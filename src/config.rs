//! Configuration file support
//!
//! Looked up as `.leaktrace.toml`, `.leaktrace.yml` or `.leaktrace.yaml`
//! unless a path is given explicitly. Every section is optional.

use crate::analysis::{ExclusionError, ExclusionRule, ExclusionTable, DEFAULT_REFERENCE_CLASS};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// File names checked by [`Config::from_default_locations`], in order
pub const DEFAULT_CONFIG_FILES: &[&str] = &[".leaktrace.toml", ".leaktrace.yml", ".leaktrace.yaml"];

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    #[diagnostic(code(leaktrace::config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", path.display())]
    #[diagnostic(code(leaktrace::config::toml))]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid YAML in {}: {source}", path.display())]
    #[diagnostic(code(leaktrace::config::yaml))]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(leaktrace::config::exclusions), help("each class and field pair may only be listed once"))]
    Exclusion(#[from] ExclusionError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch: WatchConfig,
    pub analysis: AnalysisConfig,
    pub exclusions: ExclusionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Delay between `watch` and the first retention check
    pub grace_period_ms: u64,
    /// Where heap dumps are written; the system temp directory when unset
    pub dump_directory: Option<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
            dump_directory: None,
        }
    }
}

impl WatchConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn dump_directory(&self) -> PathBuf {
        self.dump_directory.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Class of the keyed weak references in the dump
    pub reference_class: String,
    pub ignore_strings: bool,
    /// Use all cores for retained size accounting
    pub parallel: bool,
    /// Class whose instances may be held through native roots
    pub ignored_class: String,
    pub buffer_field: String,
    /// Anonymous class name to implemented interface
    pub anonymous_interfaces: HashMap<String, String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            reference_class: DEFAULT_REFERENCE_CLASS.to_string(),
            ignore_strings: true,
            parallel: true,
            ignored_class: "android.graphics.Bitmap".to_string(),
            buffer_field: "mBuffer".to_string(),
            anonymous_interfaces: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionConfig {
    pub use_android_defaults: bool,
    pub rules: Vec<ExclusionRule>,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            use_android_defaults: true,
            rules: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => {
                serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => toml::from_str(&content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
        };

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the first config file found in `dir`, or the defaults
    pub fn from_default_locations(dir: &Path) -> Result<Self, ConfigError> {
        for name in DEFAULT_CONFIG_FILES {
            let path = dir.join(name);
            if path.is_file() {
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    /// Built-in rules (unless disabled) followed by the configured ones
    pub fn exclusion_table(&self) -> Result<ExclusionTable, ConfigError> {
        let mut table = if self.exclusions.use_android_defaults {
            ExclusionTable::android_defaults()
        } else {
            ExclusionTable::new()
        };
        table.extend(self.exclusions.rules.iter().cloned())?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ExclusionMatcher;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_default_locations(dir.path()).unwrap();
        assert_eq!(config.watch.grace_period(), Duration::from_secs(5));
        assert!(config.analysis.ignore_strings);
        assert!(config.exclusions.use_android_defaults);
    }

    #[test]
    fn test_toml_sections() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".leaktrace.toml"),
            r#"
[watch]
grace_period_ms = 250

[analysis]
reference_class = "com.example.Watched"
parallel = false

[analysis.anonymous_interfaces]
"com.example.Main$1" = "java.lang.Runnable"

[exclusions]
use_android_defaults = false

[[exclusions.rules]]
reason = "pooled"
matcher = { type = "thread", name = "pool-*" }
"#,
        )
        .unwrap();

        let config = Config::from_default_locations(dir.path()).unwrap();
        assert_eq!(config.watch.grace_period_ms, 250);
        assert_eq!(config.analysis.reference_class, "com.example.Watched");
        assert!(!config.analysis.parallel);
        assert_eq!(
            config.analysis.anonymous_interfaces["com.example.Main$1"],
            "java.lang.Runnable"
        );

        let table = config.exclusion_table().unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.match_thread("pool-3").is_some());
    }

    #[test]
    fn test_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.yaml");
        std::fs::write(
            &path,
            r#"
exclusions:
  rules:
    - reason: cache is trimmed
      priority: 3
      matcher:
        type: static_field
        class: com.example.Cache
        field: sEntries
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        let table = config.exclusion_table().unwrap();
        assert!(table.len() > 1);
        assert!(table
            .match_static_field("com.example.Cache", "sEntries")
            .is_some());
    }

    #[test]
    fn test_rule_clashing_with_default_is_rejected() {
        let mut config = Config::default();
        config.exclusions.rules.push(ExclusionRule::new(
            ExclusionMatcher::static_field("android.text.TextLine", "sCached"),
            "again",
            1,
        ));
        assert!(matches!(
            config.exclusion_table(),
            Err(ConfigError::Exclusion(_))
        ));
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[watch\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
