//! Timing and batching knobs shared by relays, supervisor and aggregator.

use std::time::Duration;

use crate::error::ConfigError;

/// Runtime tuning for pipequeue processes.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Sleep after an empty pop in the outbound relay.
    pub outbound_backoff: Duration,
    /// Upper bound on one blocking receive in the inbound relay. The delayed
    /// scheduler runs at least this often.
    pub receive_timeout: Duration,
    /// Maximum messages drained from a subscription without yielding.
    pub drain_batch: usize,
    /// Interval between supervisor liveness polls.
    pub supervisor_poll: Duration,
    /// Interval between status snapshots.
    pub status_interval: Duration,
    /// Expiry of the status snapshot key.
    pub status_ttl: Duration,
    /// Time allowed for a killed child to be reaped.
    pub kill_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outbound_backoff: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(1),
            drain_batch: 1000,
            supervisor_poll: Duration::from_secs(1),
            status_interval: Duration::from_secs(5),
            status_ttl: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPEQUEUE_OUTBOUND_BACKOFF_MS` (default: 1000)
    /// - `PIPEQUEUE_RECEIVE_TIMEOUT_MS` (default: 1000)
    /// - `PIPEQUEUE_DRAIN_BATCH` (default: 1000)
    /// - `PIPEQUEUE_SUPERVISOR_POLL_MS` (default: 1000)
    /// - `PIPEQUEUE_STATUS_INTERVAL_MS` (default: 5000)
    /// - `PIPEQUEUE_STATUS_TTL_SECS` (default: 30)
    /// - `PIPEQUEUE_KILL_TIMEOUT_MS` (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(val) = lookup("PIPEQUEUE_OUTBOUND_BACKOFF_MS") {
            settings.outbound_backoff = parse_millis(&val, "PIPEQUEUE_OUTBOUND_BACKOFF_MS")?;
        }
        if let Some(val) = lookup("PIPEQUEUE_RECEIVE_TIMEOUT_MS") {
            settings.receive_timeout = parse_millis(&val, "PIPEQUEUE_RECEIVE_TIMEOUT_MS")?;
        }
        if let Some(val) = lookup("PIPEQUEUE_DRAIN_BATCH") {
            settings.drain_batch = parse_env_value(&val, "PIPEQUEUE_DRAIN_BATCH")?;
        }
        if let Some(val) = lookup("PIPEQUEUE_SUPERVISOR_POLL_MS") {
            settings.supervisor_poll = parse_millis(&val, "PIPEQUEUE_SUPERVISOR_POLL_MS")?;
        }
        if let Some(val) = lookup("PIPEQUEUE_STATUS_INTERVAL_MS") {
            settings.status_interval = parse_millis(&val, "PIPEQUEUE_STATUS_INTERVAL_MS")?;
        }
        if let Some(val) = lookup("PIPEQUEUE_STATUS_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPEQUEUE_STATUS_TTL_SECS")?;
            settings.status_ttl = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("PIPEQUEUE_KILL_TIMEOUT_MS") {
            settings.kill_timeout = parse_millis(&val, "PIPEQUEUE_KILL_TIMEOUT_MS")?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the knobs used by relays, workers and the supervisor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_backoff.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "outbound_backoff must be greater than 0".to_string(),
            ));
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "receive_timeout must be greater than 0".to_string(),
            ));
        }
        if self.drain_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "drain_batch must be greater than 0".to_string(),
            ));
        }
        if self.supervisor_poll.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "supervisor_poll must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates the status snapshot knobs.
    ///
    /// Only processes that run the status aggregator need these, so they are
    /// checked separately from [`Settings::validate`].
    pub fn validate_status(&self) -> Result<(), ConfigError> {
        if self.status_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "status_interval must be greater than 0".to_string(),
            ));
        }
        if self.status_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "status_ttl must be at least one second".to_string(),
            ));
        }
        if self.status_ttl <= self.status_interval {
            return Err(ConfigError::ValidationFailed(
                "status_ttl must exceed status_interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the outbound backoff.
    pub fn with_outbound_backoff(mut self, backoff: Duration) -> Self {
        self.outbound_backoff = backoff;
        self
    }

    /// Sets the inbound receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the supervisor poll interval.
    pub fn with_supervisor_poll(mut self, interval: Duration) -> Self {
        self.supervisor_poll = interval;
        self
    }

    /// Sets the status snapshot interval and expiry.
    pub fn with_status(mut self, interval: Duration, ttl: Duration) -> Self {
        self.status_interval = interval;
        self.status_ttl = ttl;
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.outbound_backoff, Duration::from_secs(1));
        assert_eq!(settings.receive_timeout, Duration::from_secs(1));
        assert_eq!(settings.drain_batch, 1000);
        assert_eq!(settings.status_ttl, Duration::from_secs(30));
        assert!(settings.validate().is_ok());
        assert!(settings.validate_status().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("PIPEQUEUE_OUTBOUND_BACKOFF_MS", "250"),
            ("PIPEQUEUE_DRAIN_BATCH", "10"),
            ("PIPEQUEUE_STATUS_TTL_SECS", "60"),
        ]))
        .expect("valid settings");

        assert_eq!(settings.outbound_backoff, Duration::from_millis(250));
        assert_eq!(settings.drain_batch, 10);
        assert_eq!(settings.status_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_env_invalid_value() {
        let err = Settings::from_lookup(lookup(&[("PIPEQUEUE_SUPERVISOR_POLL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "PIPEQUEUE_SUPERVISOR_POLL_MS"));
    }

    #[test]
    fn test_ttl_must_exceed_interval() {
        let settings = Settings::new().with_status(Duration::from_secs(10), Duration::from_secs(5));
        assert!(settings.validate_status().is_err());
    }

    #[test]
    fn test_status_knobs_do_not_block_relays() {
        // a long interval with the default ttl only matters to the aggregator
        let settings = Settings::from_lookup(lookup(&[("PIPEQUEUE_STATUS_INTERVAL_MS", "60000")]))
            .expect("relay settings valid");

        assert_eq!(settings.status_interval, Duration::from_secs(60));
        assert!(settings.validate().is_ok());
        assert!(settings.validate_status().is_err());
    }
}
