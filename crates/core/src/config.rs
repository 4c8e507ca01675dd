//! Configuration management for fieldlink.
//!
//! Configuration is read from TOML. Every section is optional and falls back
//! to its `Default` impl, so a minimal file only names what it overrides:
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/fieldlink"
//!
//! [upload]
//! interval_secs = 30
//! destination = "in.example.net"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SECS_PER_HOUR: u64 = 3600;

/// Longest hour-based window accepted; keeps millisecond arithmetic in `i64`
const MAX_WINDOW_HOURS: u64 = 24 * 365 * 100;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Database locations
    pub storage: StorageConfig,
    /// Channel arbitration
    pub arbiter: ArbiterConfig,
    /// Datum upload and retention
    pub upload: UploadConfig,
    /// Instruction handling
    pub reactor: ReactorConfig,
    /// Outbound message queue
    pub messages: MessageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub datum_db: String,
    pub message_db: String,
    pub instruction_db: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("var"),
            datum_db: "datum.db".to_string(),
            message_db: "message.db".to_string(),
            instruction_db: "instruction.db".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn datum_path(&self) -> PathBuf {
        self.data_dir.join(&self.datum_db)
    }

    pub fn message_path(&self) -> PathBuf {
        self.data_dir.join(&self.message_db)
    }

    pub fn instruction_path(&self) -> PathBuf {
        self.data_dir.join(&self.instruction_db)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Maximum wait for a channel lease
    pub default_timeout_secs: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 10,
        }
    }
}

impl ArbiterConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    pub interval_secs: u64,
    /// Records per upload call; 1 uploads one record at a time
    pub batch_size: usize,
    /// Uploaded records older than this are purged
    pub retention_hours: u64,
    /// Name recorded in each upload mark
    pub destination: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 50,
            retention_hours: 168,
            destination: "remote".to_string(),
        }
    }
}

impl UploadConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(SECS_PER_HOUR))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReactorConfig {
    /// Received/Executing instructions older than this are expired
    pub maximum_incomplete_hours: u64,
    /// Upper bound on a single handler invocation; unbounded when unset
    pub handler_timeout_secs: Option<u64>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            maximum_incomplete_hours: 24,
            handler_timeout_secs: None,
        }
    }
}

impl ReactorConfig {
    pub fn maximum_incomplete_age(&self) -> Duration {
        Duration::from_secs(self.maximum_incomplete_hours.saturating_mul(SECS_PER_HOUR))
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessageConfig {
    pub destination: String,
    pub batch_size: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            destination: "broker".to_string(),
            batch_size: 100,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges; [`Config::from_toml_str`] calls this
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "upload.interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.upload.retention_hours > MAX_WINDOW_HOURS {
            return Err(ConfigError::Invalid {
                field: "upload.retention_hours",
                reason: format!("must be at most {MAX_WINDOW_HOURS}"),
            });
        }
        if self.reactor.maximum_incomplete_hours > MAX_WINDOW_HOURS {
            return Err(ConfigError::Invalid {
                field: "reactor.maximum_incomplete_hours",
                reason: format!("must be at most {MAX_WINDOW_HOURS}"),
            });
        }
        if self.upload.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "upload.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.messages.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "messages.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.upload.destination.is_empty() {
            return Err(ConfigError::Invalid {
                field: "upload.destination",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
