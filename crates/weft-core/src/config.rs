use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Broadcast channel capacity for workflow events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Project folder used when a run does not name one.
    #[serde(default = "default_project_folder")]
    pub project_folder: String,
    /// Seconds to wait for an approval before rejecting it. Unset waits forever.
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
    /// Hard ceiling applied on top of every loop's own `maxIterations`.
    #[serde(default = "default_loop_ceiling")]
    pub max_loop_iterations: u64,
    /// Finished runs whose status stays queryable; older ones are dropped.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            project_folder: default_project_folder(),
            approval_timeout_secs: None,
            max_loop_iterations: default_loop_ceiling(),
            retained_runs: default_retained_runs(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }
fn default_project_folder() -> String { ".".to_string() }
fn default_loop_ceiling() -> u64 { 10_000 }
fn default_retained_runs() -> usize { 64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Response bodies above this size are truncated.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_http_timeout() -> u64 { 30 }
fn default_user_agent() -> String { format!("weft/{}", env!("CARGO_PKG_VERSION")) }
fn default_max_body_bytes() -> usize { 1_048_576 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Language → interpreter command line.
    #[serde(default = "default_interpreters")]
    pub interpreters: HashMap<String, Vec<String>>,
    /// Working directory for child processes. Default: the project folder.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Captured stdout above this size is truncated.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreters: default_interpreters(),
            work_dir: None,
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_interpreters() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert("python".to_string(), vec!["python3".to_string(), "-c".to_string()]);
    map.insert("javascript".to_string(), vec!["node".to_string(), "-e".to_string()]);
    map.insert("bash".to_string(), vec!["bash".to_string(), "-c".to_string()]);
    map
}

fn default_max_output_bytes() -> usize { 65_536 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `~/` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.weft/weft.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "weft=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the SQLite store path (expand ~).
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store.as_ref().map(|s| expand_home(&s.path))
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.engine.max_loop_iterations, 10_000);
        assert_eq!(config.engine.retained_runs, 64);
        assert!(config.engine.approval_timeout_secs.is_none());
        assert_eq!(config.http.timeout_secs, 30);
        assert!(config.sandbox.interpreters.contains_key("python"));
        assert!(config.store.is_none());
        assert_eq!(config.log.filter, "weft=info,warn");
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[engine]
approval_timeout_secs = 300

[sandbox.interpreters]
python = ["python3.12", "-c"]

[store]
path = "/var/lib/weft/runs.db"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.approval_timeout_secs, Some(300));
        assert_eq!(config.engine.project_folder, ".");
        assert_eq!(config.sandbox.interpreters["python"][0], "python3.12");
        assert!(!config.sandbox.interpreters.contains_key("bash"));
        assert_eq!(
            config.store_path(),
            Some(PathBuf::from("/var/lib/weft/runs.db"))
        );
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = AppConfig::load_or_default(Path::new("/nonexistent/weft.toml")).unwrap();
        assert_eq!(config.http.max_body_bytes, 1_048_576);
        assert!(matches!(
            AppConfig::load(Path::new("/nonexistent/weft.toml")),
            Err(WeftError::ConfigNotFound(_))
        ));
    }
}
