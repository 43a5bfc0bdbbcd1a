//! Configuration
//!
//! A small JSON config file controls the pieces a user may want to swap:
//! which shell the bottom pane runs, the `TERM` value exported to both
//! children, and the status-bar label. Every field has a default, so no
//! config file is required; CLI flags override file values.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shell executed in the bottom pane.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// `TERM` value exported to both children.
    #[serde(default = "default_term")]
    pub term: String,

    /// Label shown in the status bar.
    #[serde(default = "default_status_label")]
    pub status_label: String,
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

fn default_term() -> String {
    "ishell-m".to_string()
}

fn default_status_label() -> String {
    "ishell".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shell: default_shell(),
            term: default_term(),
            status_label: default_status_label(),
        }
    }
}

impl Config {
    /// Load from `path` if given, otherwise the defaults. A malformed or
    /// unreadable file is an error; absent fields fall back to their
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            None => Ok(Config::default()),
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("read config {}", p.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parse config {}", p.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.shell.is_empty());
        assert_eq!(config.term, "ishell-m");
        assert_eq!(config.status_label, "ishell");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"shell\": \"/bin/zsh\"}}").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.shell, "/bin/zsh");
        assert_eq!(config.term, "ishell-m");
    }

    #[test]
    fn test_load_rejects_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/ishell.json"))).is_err());
    }
}
