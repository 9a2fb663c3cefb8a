//! Broker connection parameters per channel.
//!
//! ```json
//! {
//!     "Default": {"host": "localhost", "port": 6379, "db": 0},
//!     "Log": {"host": "localhost", "port": 6379, "db": 1, "length": 1000},
//!     "dispatch": {"host": "10.0.0.2", "port": 6380, "db": 0}
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_ENTRY: &str = "Default";
const LOG_ENTRY: &str = "Log";

/// Connection parameters for one broker instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
        }
    }
}

impl ConnectionParams {
    /// Redis connection URL for these parameters.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Connection and retention settings for the broker log sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogParams {
    #[serde(flatten)]
    pub connection: ConnectionParams,
    /// Maximum number of lines kept per log list.
    pub length: usize,
}

#[derive(Deserialize)]
struct RawRuntimeConfig {
    #[serde(rename = "Default")]
    default: Option<ConnectionParams>,
    #[serde(rename = "Log")]
    log: Option<LogParams>,
    #[serde(flatten)]
    channels: HashMap<String, ConnectionParams>,
}

/// Per-channel broker connection parameters with a `Default` fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    default: ConnectionParams,
    log: Option<LogParams>,
    channels: HashMap<String, ConnectionParams>,
}

impl RuntimeConfig {
    /// Loads the runtime configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw: RawRuntimeConfig = super::read_json(path.as_ref())?;
        Self::from_raw(raw)
    }

    /// Parses the runtime configuration from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawRuntimeConfig =
            serde_json::from_str(text).map_err(|source| ConfigError::Json {
                path: "<inline>".into(),
                source,
            })?;
        Self::from_raw(raw)
    }

    /// Creates a configuration where every channel uses `default`.
    pub fn with_default(default: ConnectionParams) -> Self {
        Self {
            default,
            log: None,
            channels: HashMap::new(),
        }
    }

    fn from_raw(mut raw: RawRuntimeConfig) -> Result<Self, ConfigError> {
        // flatten also collects the reserved entries when their typed parse fails
        raw.channels.remove(DEFAULT_ENTRY);
        raw.channels.remove(LOG_ENTRY);

        let default = raw.default.ok_or(ConfigError::MissingDefault)?;
        if let Some(log) = &raw.log {
            if log.length == 0 {
                return Err(ConfigError::ValidationFailed(
                    "Log.length must be greater than 0".to_string(),
                ));
            }
        }

        Ok(Self {
            default,
            log: raw.log,
            channels: raw.channels,
        })
    }

    /// The fallback connection, also used for ready/delayed sets and state.
    pub fn default_params(&self) -> &ConnectionParams {
        &self.default
    }

    /// Connection parameters for a channel, falling back to `Default`.
    pub fn for_channel(&self, channel: &str) -> &ConnectionParams {
        self.channels.get(channel).unwrap_or(&self.default)
    }

    /// Log sink settings, if configured.
    pub fn log(&self) -> Option<&LogParams> {
        self.log.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNTIME: &str = r#"{
        "Default": {"host": "127.0.0.1", "port": 6379, "db": 0},
        "Log": {"host": "127.0.0.1", "port": 6379, "db": 2, "length": 500},
        "dispatch": {"host": "10.0.0.2", "port": 6380, "db": 3}
    }"#;

    #[test]
    fn test_channel_lookup_with_fallback() {
        let config = RuntimeConfig::from_json(RUNTIME).expect("valid runtime");

        assert_eq!(config.for_channel("dispatch").host, "10.0.0.2");
        assert_eq!(config.for_channel("dispatch").db, 3);
        assert_eq!(config.for_channel("unknown"), config.default_params());
    }

    #[test]
    fn test_log_entry() {
        let config = RuntimeConfig::from_json(RUNTIME).expect("valid runtime");
        let log = config.log().expect("log configured");

        assert_eq!(log.length, 500);
        assert_eq!(log.connection.db, 2);
        // reserved entries are not channels
        assert_eq!(config.for_channel("Log"), config.default_params());
    }

    #[test]
    fn test_missing_default() {
        let err = RuntimeConfig::from_json(r#"{"dispatch": {"port": 6380}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDefault));
    }

    #[test]
    fn test_zero_log_length_rejected() {
        let err = RuntimeConfig::from_json(
            r#"{"Default": {}, "Log": {"length": 0}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_connection_url() {
        let params = ConnectionParams {
            host: "redis.local".to_string(),
            port: 6380,
            db: 4,
        };
        assert_eq!(params.url(), "redis://redis.local:6380/4");
        assert_eq!(ConnectionParams::default().url(), "redis://localhost:6379/0");
    }
}
