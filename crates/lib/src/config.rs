//! Reconciler configuration.
//!
//! ```toml
//! default_namespace = "default"
//! request_timeout = "30s"
//!
//! [establish]
//! interval = "5s"
//! timeout = "10m"
//! attempts = 3
//! ```
//!
//! Every key is optional. Durations use `humantime` syntax.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::establish::EstablishPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid config: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("invalid config: {key} {reason}")]
  OutOfRange { key: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
  /// Namespace for namespaced manifests that do not name one.
  pub default_namespace: String,
  /// Upper bound on reading a single API response.
  #[serde(with = "duration")]
  pub request_timeout: Duration,
  pub establish: EstablishPolicy,
}

impl Default for ReconcileConfig {
  fn default() -> Self {
    Self {
      default_namespace: "default".to_string(),
      request_timeout: Duration::from_secs(30),
      establish: EstablishPolicy::default(),
    }
  }
}

impl ReconcileConfig {
  pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
    let config: Self = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&input)
  }

  /// Reject values the establish loop cannot run with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let establish = &self.establish;
    if establish.interval.is_zero() {
      return Err(ConfigError::OutOfRange {
        key: "establish.interval",
        reason: "must be greater than zero",
      });
    }
    if establish.timeout.is_zero() {
      return Err(ConfigError::OutOfRange {
        key: "establish.timeout",
        reason: "must be greater than zero",
      });
    }
    if establish.attempts == 0 {
      return Err(ConfigError::OutOfRange {
        key: "establish.attempts",
        reason: "must be at least 1",
      });
    }
    Ok(())
  }
}

/// `humantime` (de)serialization for [`Duration`] fields.
pub(crate) mod duration {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer, de};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(de::Error::custom)
  }
}
