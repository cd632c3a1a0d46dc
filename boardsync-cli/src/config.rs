//! `~/.boardsync/config.yaml` loading.
//!
//! ```yaml
//! board_id: "1234567890"
//! groups: [topics, backlog]
//! tasks_file: tasks/tasks.json
//! columns:
//!   local_id: text_local
//!   status: status
//!   dependencies: text_deps
//! batch_size: 10
//! retry: { attempts: 3, initial_delay_ms: 1000 }
//! ```
//!
//! Relative paths resolve against the directory holding the config file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use boardsync_core::LockOptions;
use boardsync_sync::batcher::DEFAULT_MAX_BATCH;
use boardsync_sync::RetryPolicy;

pub const DEFAULT_API_URL: &str = "https://api.monday.com/v2";
pub const DEFAULT_TOKEN_ENV: &str = "BOARDSYNC_API_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    HomeNotFound,

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config {path} is missing required key `{key}`")]
    Missing { path: PathBuf, key: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

/// Raw file contents. Required keys are optional here so a missing one can
/// be reported by name.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    board_id: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    api_url: Option<String>,
    api_token_env: Option<String>,
    tasks_file: Option<PathBuf>,
    /// Tag inside a tagged task file envelope.
    tag: Option<String>,
    mapping_file: Option<PathBuf>,
    #[serde(default)]
    columns: BTreeMap<String, String>,
    batch_size: Option<usize>,
    #[serde(default)]
    retry: RetryConfig,
    lock_timeout_ms: Option<u64>,
    cache_ttl_ms: Option<u64>,
}

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub board_id: String,
    pub groups: Vec<String>,
    pub api_url: String,
    pub api_token_env: String,
    pub tasks_file: PathBuf,
    pub tag: Option<String>,
    pub mapping_file: PathBuf,
    pub columns: BTreeMap<String, String>,
    pub batch_size: usize,
    pub retry: RetryConfig,
    pub lock_timeout_ms: u64,
    pub cache_ttl_ms: u64,
}

impl Config {
    /// `~/.boardsync/config.yaml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".boardsync").join("config.yaml"))
    }

    /// Load `path`, or the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&contents, &path)
    }

    /// Parse YAML read from `path`.
    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let missing = |key| ConfigError::Missing {
            path: path.to_path_buf(),
            key,
        };
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let board_id = raw.board_id.ok_or_else(|| missing("board_id"))?;
        let tasks_file = base.join(raw.tasks_file.ok_or_else(|| missing("tasks_file"))?);
        if raw.columns.is_empty() {
            return Err(missing("columns"));
        }
        let mapping_file = match raw.mapping_file {
            Some(file) => base.join(file),
            None => tasks_file
                .parent()
                .unwrap_or(base)
                .join(".boardsync")
                .join("mappings.json"),
        };

        Ok(Self {
            board_id,
            groups: raw.groups,
            api_url: raw.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_owned()),
            api_token_env: raw
                .api_token_env
                .unwrap_or_else(|| DEFAULT_TOKEN_ENV.to_owned()),
            tasks_file,
            tag: raw.tag,
            mapping_file,
            columns: raw.columns,
            batch_size: raw.batch_size.unwrap_or(DEFAULT_MAX_BATCH),
            retry: raw.retry,
            lock_timeout_ms: raw.lock_timeout_ms.unwrap_or(10_000),
            cache_ttl_ms: raw.cache_ttl_ms.unwrap_or(5_000),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.attempts.max(1),
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        let timeout = Duration::from_millis(self.lock_timeout_ms);
        LockOptions {
            timeout,
            stale_after: timeout,
            ..LockOptions::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
board_id: '42'
tasks_file: tasks/tasks.json
columns:
  local_id: text_local
";

    #[test]
    fn defaults_fill_optional_keys() {
        let config = Config::parse(MINIMAL, Path::new("/work/.boardsync.yaml")).unwrap();
        assert_eq!(config.board_id, "42");
        assert_eq!(config.tasks_file, PathBuf::from("/work/tasks/tasks.json"));
        assert_eq!(
            config.mapping_file,
            PathBuf::from("/work/tasks/.boardsync/mappings.json")
        );
        assert_eq!(config.api_token_env, DEFAULT_TOKEN_ENV);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.lock_options().timeout, Duration::from_secs(10));
        assert_eq!(config.cache_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn explicit_values_win() {
        let yaml = format!(
            "{MINIMAL}mapping_file: /var/map.json\nretry:\n  attempts: 5\n  initial_delay_ms: 10\ngroups: [a, b]\n"
        );
        let config = Config::parse(&yaml, Path::new("/work/c.yaml")).unwrap();
        assert_eq!(config.mapping_file, PathBuf::from("/var/map.json"));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.retry_policy().initial_delay, Duration::from_millis(10));
        assert_eq!(config.groups, vec!["a", "b"]);
    }

    #[test]
    fn missing_key_is_named() {
        let err = Config::parse("tasks_file: t.json\n", Path::new("c.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "board_id", .. }));
        assert!(err.to_string().contains("board_id"));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = Config::parse("board_id: [unclosed", Path::new("c.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
