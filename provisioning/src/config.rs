use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::runtime::ExecutionConfig;

const MAX_OPERATION_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Where run reports, outputs and the simulated cloud are kept.
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            dir: PathBuf::from(".provisioning"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub caller_arn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub settle_polls: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig { settle_polls: 2 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub execution: ExecutionConfig,
    pub state: StateConfig,
    pub identity: IdentityConfig,
    pub simulation: SimulationConfig,
}

impl Config {
    /// Load from `path` with `PROVISIONING_*` environment overrides. A missing
    /// file falls back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides come from `lookup` so tests do not have to touch the
    /// process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("PROVISIONING_CONCURRENCY") {
            self.execution.concurrency = parsed("PROVISIONING_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("PROVISIONING_POLL_INTERVAL_MS") {
            self.execution.poll_interval =
                Duration::from_millis(parsed("PROVISIONING_POLL_INTERVAL_MS", v)?);
        }
        if let Some(v) = lookup("PROVISIONING_OPERATION_TIMEOUT_SECS") {
            self.execution.operation_timeout =
                Duration::from_secs(parsed("PROVISIONING_OPERATION_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = lookup("PROVISIONING_RETRY_MAX_ATTEMPTS") {
            self.execution.retry.max_attempts = parsed("PROVISIONING_RETRY_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("PROVISIONING_STATE_DIR") {
            self.state.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PROVISIONING_CALLER_ARN") {
            self.identity.caller_arn = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.concurrency == 0 {
            return Err(ConfigError::Invalid("execution.concurrency must be at least 1".into()));
        }
        let execution = &self.execution;
        if execution.operation_timeout.is_zero() || execution.operation_timeout > MAX_OPERATION_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "execution.operation_timeout must be between 1ms and {}s",
                MAX_OPERATION_TIMEOUT.as_secs()
            )));
        }
        if execution.poll_interval.is_zero() || execution.poll_interval > execution.operation_timeout {
            return Err(ConfigError::Invalid(
                "execution.poll_interval must be positive and no longer than operation_timeout".into(),
            ));
        }
        let retry = &execution.retry;
        if !(retry.backoff_multiplier >= 1.0 && retry.backoff_multiplier.is_finite()) {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be a finite value of at least 1.0".into(),
            ));
        }
        if retry.max_delay > MAX_RETRY_DELAY || retry.initial_delay > retry.max_delay {
            return Err(ConfigError::Invalid(format!(
                "retry delays must satisfy initial_delay <= max_delay <= {}s",
                MAX_RETRY_DELAY.as_secs()
            )));
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provisioning.toml");
        fs::write(
            &path,
            "[execution]\nconcurrency = 8\npoll_interval = 250\n\n[execution.retry]\nmax_attempts = 2\n",
        )
        .unwrap();
        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.execution.concurrency, 8);
        assert_eq!(config.execution.poll_interval, Duration::from_millis(250));
        assert_eq!(config.execution.retry.max_attempts, 2);
        assert_eq!(config.execution.retry.backoff_multiplier, 2.0);
        assert_eq!(config.state.dir, PathBuf::from(".provisioning"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PROVISIONING_CONCURRENCY", "2"),
            ("PROVISIONING_STATE_DIR", "/tmp/stack"),
            ("PROVISIONING_CALLER_ARN", "arn:aws:iam::123456789012:user/ops"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.execution.concurrency, 2);
        assert_eq!(config.state.dir, PathBuf::from("/tmp/stack"));
        assert!(config.identity.caller_arn.is_some());

        let err = Config::default()
            .apply_overrides(|k| (k == "PROVISIONING_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provisioning.toml");
        fs::write(&path, "[execution\n").unwrap();
        assert!(matches!(Config::load_from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = Config::default();
        config
            .apply_overrides(|k| {
                (k == "PROVISIONING_OPERATION_TIMEOUT_SECS").then(|| u64::MAX.to_string())
            })
            .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.execution.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.execution.retry.max_delay = Duration::from_secs(u64::MAX);
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.execution.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
