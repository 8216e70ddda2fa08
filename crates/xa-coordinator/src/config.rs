//! Coordinator configuration.
//!
//! Plain struct with defaults, a fast profile for tests, and an environment
//! loader.
//!
//! | Variable | Default | Field |
//! |----------|---------|-------|
//! | `XA_SERVER_ID` | `xa-server` | `server_id` |
//! | `XA_QUEUE_SIZE` | `1000` | `queue_size` |
//! | `XA_TRANSACTION_TIMEOUT_MS` | `60000` | `transaction_timeout` |
//! | `XA_RECOVERY_TIMEOUT_MS` | `30000` | `recovery_timeout` |
//! | `XA_RECOVERY_PERIOD_MS` | `0` (disabled) | `recovery_period` |
//! | `XA_TIMER_INTERVAL_MS` | `1000` | `timer_interval` |
//! | `XA_RECOVER_ON_START` | `true` | `recover_on_start` |

use std::env;
use std::time::Duration;

use shared_types::{validate_server_id, IdError};
use thiserror::Error;

/// Configuration rejected by [`CoordinatorConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Server id does not fit the identifier encoding
    #[error("Invalid server id: {0}")]
    ServerId(#[from] IdError),

    /// A size or duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identifies this node in the XA+ tree
    pub server_id: String,
    /// Inbox capacity of every service
    pub queue_size: usize,
    /// Lifetime of a transaction from begin to terminal outcome
    pub transaction_timeout: Duration,
    /// Longest a recovery round may run before it is failed
    pub recovery_timeout: Duration,
    /// Period of automatic recovery rounds; zero disables them
    pub recovery_period: Duration,
    /// Period of the timer sweep
    pub timer_interval: Duration,
    /// Run one recovery round right after startup
    pub recover_on_start: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_id: "xa-server".to_string(),
            queue_size: shared_bus::DEFAULT_CHANNEL_CAPACITY,
            transaction_timeout: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            recovery_period: Duration::ZERO,
            timer_interval: Duration::from_secs(1),
            recover_on_start: true,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults with a different server id.
    pub fn with_server_id(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ..Self::default()
        }
    }

    /// Short timeouts and no automatic recovery.
    pub fn for_testing(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            queue_size: 256,
            transaction_timeout: Duration::from_secs(5),
            recovery_timeout: Duration::from_secs(2),
            recovery_period: Duration::ZERO,
            timer_interval: Duration::from_millis(20),
            recover_on_start: false,
        }
    }

    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_id: env::var("XA_SERVER_ID").unwrap_or(defaults.server_id),
            queue_size: env::var("XA_QUEUE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_size),
            transaction_timeout: millis_var("XA_TRANSACTION_TIMEOUT_MS")
                .unwrap_or(defaults.transaction_timeout),
            recovery_timeout: millis_var("XA_RECOVERY_TIMEOUT_MS")
                .unwrap_or(defaults.recovery_timeout),
            recovery_period: millis_var("XA_RECOVERY_PERIOD_MS")
                .unwrap_or(defaults.recovery_period),
            timer_interval: millis_var("XA_TIMER_INTERVAL_MS").unwrap_or(defaults.timer_interval),
            recover_on_start: env::var("XA_RECOVER_ON_START")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.recover_on_start),
        }
    }

    /// Check every field against its constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server_id(&self.server_id)?;
        if self.queue_size == 0 {
            return Err(ConfigError::Zero("queue_size"));
        }
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::Zero("transaction_timeout"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::Zero("recovery_timeout"));
        }
        if self.timer_interval.is_zero() {
            return Err(ConfigError::Zero("timer_interval"));
        }
        Ok(())
    }

    /// True if periodic recovery is enabled.
    pub fn periodic_recovery(&self) -> bool {
        !self.recovery_period.is_zero()
    }
}

fn millis_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
