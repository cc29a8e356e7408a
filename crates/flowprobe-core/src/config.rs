//! YAML configuration loading (§2a, §6).
//!
//! Grounded in the teacher's layered config (a YAML defaults file, overridden by explicit CLI
//! flags at the call site) — this module only parses the file into typed defaults; binaries are
//! responsible for applying their own CLI/env overrides on top of what [`Config::load`] returns.

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub db_path: String,
    pub log_level: String,
    pub request_timeout_secs: u64,
    pub rotation_period_secs: u64,
    pub max_mem_pct: f64,
    pub resolve_timeout_secs: u64,
    pub rate_limit_per_min: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:8145".to_string(),
            db_path: "/var/lib/flowprobe".to_string(),
            log_level: "info".to_string(),
            request_timeout_secs: 30,
            rotation_period_secs: 300,
            max_mem_pct: 60.0,
            resolve_timeout_secs: 2,
            rate_limit_per_min: 0,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> FlowResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| FlowError::invalid_argument(format!("bad config file '{}': {e}", path.display())))
    }

    /// Loads `path` if given, else returns the built-in defaults (§6: config file is optional).
    pub fn load_or_default(path: Option<&Path>) -> FlowResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_sane() {
        let cfg = Config::default();
        assert!(cfg.max_mem_pct > 0.0 && cfg.max_mem_pct <= 100.0);
        assert!(!cfg.db_path.is_empty());
    }

    #[test]
    fn loads_partial_yaml_and_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "log_level: debug\nmax_mem_pct: 80.0\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.max_mem_pct, 80.0);
        assert_eq!(cfg.db_path, Config::default().db_path);
    }

    #[test]
    fn missing_file_errors() {
        let err = Config::load(Path::new("/nonexistent/flowprobe.yaml")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn no_path_yields_defaults() {
        assert_eq!(Config::load_or_default(None).unwrap(), Config::default());
    }
}
