//! Configuration loading and validation.
//!
//! Settings live in `~/.taskloop/config.yaml`. A missing file is created
//! with defaults on first load; a partial file merges with defaults field by
//! field. Validation collects every violation before reporting.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid YAML in config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_max_iterations() -> u32 {
    50
}

fn default_session_dir() -> PathBuf {
    config_dir().join("sessions")
}

/// Settings directory, `~/.taskloop`.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map_or_else(|| PathBuf::from("."), |home| home.join(".taskloop"))
}

/// Settings file, `~/.taskloop/config.yaml`.
pub fn config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The Ollama model to use for generation.
    pub model: String,
    /// Base URL for the Ollama API.
    pub ollama_url: String,
    /// Maximum loop iterations before stopping.
    pub max_iterations: u32,
    /// Directory to store session data.
    pub session_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            ollama_url: default_ollama_url(),
            max_iterations: default_max_iterations(),
            session_dir: default_session_dir(),
        }
    }
}

impl Config {
    /// Validate the configuration, collecting all violations.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.model.is_empty() {
            errors.push("model: cannot be empty".to_string());
        }

        if self.ollama_url.is_empty() {
            errors.push("ollama_url: cannot be empty".to_string());
        } else if !self.ollama_url.starts_with("http://")
            && !self.ollama_url.starts_with("https://")
        {
            errors.push("ollama_url: must start with http:// or https://".to_string());
        }

        if self.max_iterations == 0 {
            errors.push("max_iterations: must be positive, got 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Load configuration from the default path, creating the default file on
/// first use.
pub fn load() -> Result<Config> {
    load_from(&config_path())
}

/// Load configuration from an explicit path.
///
/// A missing file is written with defaults; fields absent from the file take
/// their default values.
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let config = Config::default();
        save_to(&config, path)?;
        return Ok(config);
    }

    let body = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&body)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to the default path.
pub fn save(config: &Config) -> Result<()> {
    save_to(config, &config_path())
}

fn save_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_yaml::to_string(config)?;
    fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.max_iterations, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_creates_default_file_when_missing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        let config = load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.model, "llama3.2");
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(&path, "model: codellama\nmax_iterations: 10\n").unwrap();

        let config = load_from(&path).unwrap();
        assert_eq!(config.model, "codellama");
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.ollama_url, "http://localhost:11434");
    }

    #[test]
    fn round_trips_through_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        let config = Config {
            model: "mistral".to_string(),
            ollama_url: "http://ollama.local:11434".to_string(),
            max_iterations: 25,
            session_dir: PathBuf::from("/tmp/sessions"),
        };
        save_to(&config, &path).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.model, "mistral");
        assert_eq!(loaded.ollama_url, "http://ollama.local:11434");
        assert_eq!(loaded.max_iterations, 25);
        assert_eq!(loaded.session_dir, PathBuf::from("/tmp/sessions"));
    }

    #[test]
    fn invalid_yaml_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(&path, "model: [unclosed").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn validation_collects_all_violations() {
        let config = Config {
            model: String::new(),
            ollama_url: "ftp://wrong".to_string(),
            max_iterations: 0,
            session_dir: PathBuf::from("/tmp"),
        };
        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].contains("model"));
                assert!(errors[1].contains("ollama_url"));
                assert!(errors[2].contains("max_iterations"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn bad_url_scheme_fails_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(&path, "ollama_url: localhost:11434\n").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Validation(_))));
    }
}
