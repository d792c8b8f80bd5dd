//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! reporting_component = "weblogic-operator"
//! reporting_instance = "operator-7d9f"
//! call_timeout = "10s"
//! event_window = "1h"
//!
//! [retry]
//! max_retries = 5
//!
//! [retry.backoff]
//! type = "exponential"
//! initial_delay = "200ms"
//! max_delay = "30s"
//! multiplier = 2.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::{Backoff, RetryPolicy};

/// Component name stamped on every event record.
pub const DEFAULT_REPORTING_COMPONENT: &str = "weblogic-operator";

/// Environment variable naming the pod the engine runs in.
pub const POD_NAME_ENV: &str = "POD_NAME";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `reportingComponent` of emitted events.
    pub reporting_component: String,

    /// `reportingInstance` of emitted events; identifies the owning process.
    pub reporting_instance: String,

    /// Upper bound on a single external call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// A stored event last written longer ago than this is not bumped; the
    /// next occurrence starts a new record.
    #[serde(with = "humantime_serde")]
    pub event_window: Duration,

    pub retry: RetryPolicy,
}

fn default_reporting_instance() -> String {
    std::env::var(POD_NAME_ENV)
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "keelson-0".to_string())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reporting_component: DEFAULT_REPORTING_COMPONENT.to_string(),
            reporting_instance: default_reporting_instance(),
            call_timeout: Duration::from_secs(10),
            event_window: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reporting_component.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "reporting_component",
                reason: "must not be empty".into(),
            });
        }
        if self.reporting_instance.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "reporting_instance",
                reason: "must not be empty".into(),
            });
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "call_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.event_window.is_zero() {
            return Err(ConfigError::Invalid {
                field: "event_window",
                reason: "must be greater than zero".into(),
            });
        }
        if let Backoff::Exponential {
            initial_delay,
            max_delay,
            multiplier,
        } = &self.retry.backoff
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(ConfigError::Invalid {
                    field: "retry.backoff.multiplier",
                    reason: format!("{multiplier} is below 1.0"),
                });
            }
            if max_delay < initial_delay {
                return Err(ConfigError::Invalid {
                    field: "retry.backoff.max_delay",
                    reason: format!(
                        "{max_delay:?} is shorter than initial_delay {initial_delay:?}"
                    ),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_reporting_component(mut self, component: impl Into<String>) -> Self {
        self.reporting_component = component.into();
        self
    }

    #[must_use]
    pub fn with_reporting_instance(mut self, instance: impl Into<String>) -> Self {
        self.reporting_instance = instance.into();
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_event_window(mut self, window: Duration) -> Self {
        self.event_window = window;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
