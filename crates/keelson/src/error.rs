//! Error taxonomy for API calls, fibers, the presence cache and configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::presence::ResourceKey;

/// How a failed external call is treated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Retry-eligible: timeouts, server errors, conflicts, throttling.
    Transient,
    /// The target object does not exist.
    NotFound,
    /// Bad request, auth failure or any refusal a retry will not change.
    Rejected,
}

/// Error returned by the external API client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The API answered with a non-success status.
    #[error("api returned {status} {reason}: {message}")]
    Status {
        /// Machine-readable status code.
        status: u16,
        /// Short reason, e.g. `NotFound` or `Conflict`.
        reason: String,
        /// Human-readable detail.
        message: String,
    },

    /// No answer arrived within the configured call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The request never reached the API.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn status(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status(404, "NotFound", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::status(409, "Conflict", message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::status(409, "AlreadyExists", message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::status(500, "InternalError", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::status(400, "BadRequest", message)
    }

    /// The status code, when the API answered at all.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Timeout(_) | Self::Transport(_) => None,
        }
    }

    /// Classifies the failure for the retry machinery.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout(_) | Self::Transport(_) => FailureClass::Transient,
            Self::Status { status, .. } => match *status {
                404 => FailureClass::NotFound,
                408 | 409 | 429 => FailureClass::Transient,
                s if s >= 500 => FailureClass::Transient,
                _ => FailureClass::Rejected,
            },
        }
    }
}

/// Broad error taxonomy reported with a failed fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    NotFoundOnWrite,
    PermanentlyRejected,
    Logic,
}

/// Terminal error of a fiber, surfaced to whoever started it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiberError {
    /// The API refused a call and retrying would not help.
    #[error("{call} rejected: {source}")]
    Rejected {
        /// Description of the call.
        call: String,
        /// The refusal.
        #[source]
        source: ApiError,
    },

    /// A transient failure outlived the retry budget.
    #[error("{call} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Description of the call.
        call: String,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The last failure observed.
        last: ApiError,
    },

    /// An engine invariant was violated.
    #[error("logic error: {0}")]
    Logic(String),
}

impl FiberError {
    pub fn logic(message: impl Into<String>) -> Self {
        Self::Logic(message.into())
    }

    /// Exhausted retries count as permanently rejected.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected { .. } | Self::RetriesExhausted { .. } => {
                ErrorClass::PermanentlyRejected
            }
            Self::Logic(_) => ErrorClass::Logic,
        }
    }
}

/// Errors from compare-and-set updates of the presence cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("no presence entry for {0}")]
    Missing(ResourceKey),

    #[error("presence entry {key} moved on (expected version {expected}, found {found})")]
    Stale {
        key: ResourceKey,
        expected: u64,
        found: u64,
    },
}

/// Errors raised while loading engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
