//! Loads the `Config` snapshot from disk.
//!
//! This is a reference implementation of the out-of-scope configuration
//! collaborator: the engine depends only on the `Config` struct shape, not
//! on this loader, but a runnable binary needs some concrete way to
//! produce one.

use crate::config::model::Config;
use crate::error::ConfigError;
use std::env;
use std::path::Path;

/// Refuse to read config files larger than this; a legitimate
/// configuration is a handful of KB, and an unbounded read is an easy way
/// to wedge the process on a misdirected path.
const MAX_CONFIG_SIZE: u64 = 10 * 1024 * 1024;

/// Load and validate the configuration snapshot named by
/// `CCRELAY_CONFIG_PATH` (default `./config.json`).
pub fn load() -> Result<Config, ConfigError> {
    let path = env::var("CCRELAY_CONFIG_PATH").unwrap_or_else(|_| "./config.json".to_string());
    load_from(&path)
}

/// Load and validate the configuration snapshot at an explicit path.
/// Rejects paths that canonicalize outside the current working directory
/// and files over `MAX_CONFIG_SIZE`.
pub fn load_from(path: &str) -> Result<Config, ConfigError> {
    let p = Path::new(path);
    if !p.exists() {
        return Err(ConfigError::NotFound(path.to_string()));
    }

    let current_dir = env::current_dir().map_err(ConfigError::Io)?;
    let canonical_path = p.canonicalize().map_err(ConfigError::Io)?;
    let canonical_current = current_dir.canonicalize().map_err(ConfigError::Io)?;
    if !canonical_path.starts_with(&canonical_current) {
        log::warn!(
            "config path {:?} resolves outside the working directory {:?}",
            canonical_path,
            canonical_current
        );
        return Err(ConfigError::PathTraversal(path.to_string()));
    }

    let metadata = std::fs::metadata(&canonical_path).map_err(ConfigError::Io)?;
    if metadata.len() > MAX_CONFIG_SIZE {
        return Err(ConfigError::TooLarge(metadata.len(), MAX_CONFIG_SIZE));
    }

    let raw = std::fs::read_to_string(&canonical_path).map_err(ConfigError::Io)?;
    let config: Config = serde_json::from_str(&raw)?;
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_json() -> &'static str {
        r#"{
            "defaultProvider": "anthropic",
            "providers": {
                "anthropic": {
                    "id": "anthropic",
                    "name": "Anthropic",
                    "baseUrl": "https://api.anthropic.com",
                    "mode": "passthrough",
                    "providerType": "anthropic"
                }
            }
        }"#
    }

    #[test]
    fn loads_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(sample_json().as_bytes()).unwrap();

        let config = load_from(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.providers.len(), 1);
    }

    #[test]
    fn rejects_missing_file() {
        let err = load_from("/nonexistent/path/config.json");
        assert!(matches!(err, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn rejects_unknown_default_provider() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.json");
        std::fs::write(
            &file_path,
            r#"{"defaultProvider": "missing", "providers": {}}"#,
        )
        .unwrap();

        let err = load_from(file_path.to_str().unwrap());
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }
}
