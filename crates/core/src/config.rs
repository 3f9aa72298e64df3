//! Engine configuration loaded from a TOML file.
//!
//! Keys mirror the daemon's historical layout: `server.rules` and
//! `server.templates` point at the rule and template directories,
//! `server.timeout_ms` is the evaluator tick period, `log.config` is an
//! optional tracing filter directive. Loading never exits the process; the
//! binary decides what a fatal configuration error means.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default evaluator tick period in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// ── Top-level config ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding persisted `*.rule` documents.
    #[serde(default = "default_rules_dir")]
    pub rules: PathBuf,
    /// Directory holding rule templates with `__name__` placeholders.
    #[serde(default = "default_templates_dir")]
    pub templates: PathBuf,
    /// Evaluator tick period in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    /// Tracing filter directive (e.g. "info,vigil_engine=debug").
    /// Empty means: fall back to the RUST_LOG environment variable.
    #[serde(default)]
    pub config: String,
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("var/rules")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("var/templates")
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rules: default_rules_dir(),
            templates: default_templates_dir(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error instead of exiting; a missing optional section falls
    /// back to its defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| EngineError::Persistence(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| EngineError::Json(format!("{}: {}", path.display(), e)))
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  rules:     {}", self.server.rules.display());
        tracing::info!("  templates: {}", self.server.templates.display());
        tracing::info!("  timeout:   {}ms", self.server.timeout_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_full_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            r#"
[server]
rules = "/var/lib/vigil/rules"
templates = "/usr/share/vigil/templates"
timeout_ms = 5000

[log]
config = "debug"
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server.rules, PathBuf::from("/var/lib/vigil/rules"));
        assert_eq!(cfg.server.timeout_ms, 5000);
        assert_eq!(cfg.log.config, "debug");
    }

    #[test]
    fn missing_sections_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(cfg.server.rules, PathBuf::from("var/rules"));
        assert!(cfg.log.config.is_empty());
    }

    #[test]
    fn missing_file_is_an_error_not_an_exit() {
        let err = Config::load(Path::new("/nonexistent/engine.toml")).unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
    }

    #[test]
    fn malformed_toml_is_a_json_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "[server\nrules = ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, EngineError::Json(_)));
    }
}
