//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Join tuning knobs.
///
/// Everything here has a sensible default; a join constructed through
/// [`crate::HashJoin::new`] never needs a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JoinConfig {
    /// Estimated average record length in bytes, used to size the initial
    /// bucket table.
    pub avg_record_len: usize,
    /// Directory spill files are created under when the join builds its own
    /// file-backed I/O manager ([`crate::HashJoin::with_config`]). Defaults
    /// to a crate-named directory below the system temp directory.
    pub spill_dir: Option<PathBuf>,
    /// Override for the number of write-behind buffers (capped at 6).
    pub write_behind: Option<usize>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            avg_record_len: crate::table::DEFAULT_RECORD_LEN,
            spill_dir: None,
            write_behind: None,
        }
    }
}

impl JoinConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIJOIN_CONFIG` env var (if set), then
    /// apply `OXIJOIN__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("OXIJOIN_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIJOIN__") {
                continue;
            }
            let field = key["OXIJOIN__".len()..].to_ascii_lowercase();
            let value = value.trim().to_string();

            match field.as_str() {
                "avg_record_len" => self.avg_record_len = parse_value(&key, &value)?,
                "spill_dir" => self.spill_dir = Some(PathBuf::from(value)),
                "write_behind" => self.write_behind = Some(parse_value(&key, &value)?),
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JoinConfig::default();
        assert_eq!(config.avg_record_len, 100);
        assert!(config.spill_dir.is_none());
        assert!(config.write_behind.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oxijoin.toml");
        fs::write(
            &path,
            "avg_record_len = 64\nspill_dir = \"/tmp/spill\"\nwrite_behind = 4\n",
        )
        .unwrap();

        let config = JoinConfig::load_from_path(&path).unwrap();
        assert_eq!(config.avg_record_len, 64);
        assert_eq!(config.spill_dir, Some(PathBuf::from("/tmp/spill")));
        assert_eq!(config.write_behind, Some(4));
    }

    #[test]
    fn test_unknown_toml_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oxijoin.toml");
        fs::write(&path, "not_a_knob = 1\n").unwrap();

        assert!(matches!(
            JoinConfig::load_from_path(&path),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_invalid_value_error_carries_key() {
        let err = parse_value::<usize>("OXIJOIN__AVG_RECORD_LEN", "many").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, "OXIJOIN__AVG_RECORD_LEN");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
