//! Configuration for drift.
//!
//! Configuration is read from TOML. Every field has a default, so an empty file (or no file at
//! all) yields a working setup:
//!
//! ```toml
//! [logging]
//! level = "drift.refresh=debug,info"
//! json = false
//!
//! [refresh]
//! queue_capacity = 64
//! ignored_names = [".git", "*~", ".DS_Store"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use thiserror::Error;

mod ignored;
mod logging;

pub use ignored::IgnoredNames;
pub use logging::init_tracing;

/// Environment variable overriding config discovery.
pub const DRIFT_CONFIG_ENV_VAR: &str = "DRIFT_CONFIG_PATH";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriftConfig {
    /// Global logging settings for drift crates.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// File-system refresh settings.
    #[serde(default)]
    pub refresh: RefreshConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level for all drift crates.
    ///
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Create the effective `EnvFilter`, merging `RUST_LOG` when it is set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshConfig {
    /// Capacity of the asynchronous refresh queue.
    ///
    /// Submitting an async session while the queue is full blocks the caller until the worker
    /// catches up.
    #[serde(default = "RefreshConfig::default_queue_capacity")]
    pub queue_capacity: usize,

    /// Name of the single background refresh thread.
    #[serde(default = "RefreshConfig::default_worker_thread_name")]
    pub worker_thread_name: String,

    /// Glob patterns matched against entry names. Matching entries are invisible to the VFS.
    #[serde(default = "RefreshConfig::default_ignored_names")]
    pub ignored_names: Vec<String>,

    /// Maximum number of open archive handlers kept in memory.
    #[serde(default = "RefreshConfig::default_archive_cache_capacity")]
    pub archive_cache_capacity: usize,
}

impl RefreshConfig {
    fn default_queue_capacity() -> usize {
        64
    }

    fn default_worker_thread_name() -> String {
        "drift-refresh".to_owned()
    }

    fn default_ignored_names() -> Vec<String> {
        [".git", ".hg", ".svn", "__pycache__", ".DS_Store", "*~", "*.swp"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    fn default_archive_cache_capacity() -> usize {
        32
    }

    /// Compiles [`RefreshConfig::ignored_names`] into a matcher.
    pub fn ignored_matcher(&self) -> Result<IgnoredNames, ConfigError> {
        IgnoredNames::new(&self.ignored_names)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            worker_thread_name: Self::default_worker_thread_name(),
            ignored_names: Self::default_ignored_names(),
            archive_cache_capacity: Self::default_archive_cache_capacity(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid ignore pattern: {0}")]
    InvalidPattern(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a source snippet; keep just the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl DriftConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    /// Load a config from a TOML string, validating ignore patterns.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: DriftConfig = toml::from_str(text)?;
        config.refresh.ignored_matcher()?;
        Ok(config)
    }
}

/// Discover the drift configuration file for a workspace root.
///
/// Search order:
/// 1) `DRIFT_CONFIG_PATH` (absolute or relative to `workspace_root`)
/// 2) `drift.toml` in `workspace_root`
/// 3) `.drift.toml` in `workspace_root`
/// 4) `.drift/config.toml` in `workspace_root`
pub fn discover_config_path(workspace_root: &Path) -> Option<PathBuf> {
    if let Some(value) = std::env::var_os(DRIFT_CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(value);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            workspace_root.join(candidate)
        };
        return Some(path);
    }

    ["drift.toml", ".drift.toml", ".drift/config.toml"]
        .into_iter()
        .map(|name| workspace_root.join(name))
        .find(|path| path.is_file())
}

/// Load the drift configuration for a workspace root.
///
/// If no config is present, returns [`DriftConfig::default`] and `None`.
pub fn load_for_workspace(
    workspace_root: &Path,
) -> Result<(DriftConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(workspace_root) else {
        return Ok((DriftConfig::default(), None));
    };

    let config = DriftConfig::load_from_path(&path)?;
    tracing::debug!(target: "drift.config", path = %path.display(), "loaded config");
    Ok((config, Some(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = DriftConfig::load_from_str("").unwrap();
        assert_eq!(config, DriftConfig::default());
        assert_eq!(config.refresh.queue_capacity, 64);
        assert_eq!(config.refresh.worker_thread_name, "drift-refresh");
    }

    #[test]
    fn parses_refresh_section() {
        let config = DriftConfig::load_from_str(
            r#"
            [refresh]
            queue_capacity = 4
            ignored_names = ["target", "*.tmp"]
            "#,
        )
        .unwrap();
        assert_eq!(config.refresh.queue_capacity, 4);
        assert_eq!(config.refresh.ignored_names, vec!["target", "*.tmp"]);
        assert_eq!(config.refresh.archive_cache_capacity, 32);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = DriftConfig::load_from_str("[refresh]\nqueue_size = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
    }

    #[test]
    fn invalid_ignore_pattern_is_reported() {
        let err = DriftConfig::load_from_str("[refresh]\nignored_names = [\"a[\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern(_)), "{err:?}");
    }

    #[test]
    fn level_synonyms_are_normalized() {
        assert_eq!(LoggingConfig::normalize_level_directives(" WARNING "), "warn");
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
        assert_eq!(
            LoggingConfig::normalize_level_directives("drift.vfs=trace"),
            "drift.vfs=trace"
        );
    }

    #[test]
    fn discovers_workspace_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".drift")).unwrap();
        std::fs::write(
            dir.path().join(".drift/config.toml"),
            "[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();

        if std::env::var_os(DRIFT_CONFIG_ENV_VAR).is_some() {
            return;
        }
        let (config, path) = load_for_workspace(dir.path()).unwrap();
        assert_eq!(path, Some(dir.path().join(".drift/config.toml")));
        assert_eq!(config.logging.level, "debug");
    }
}
