use std::path::PathBuf;

use thiserror::Error;

use crate::types::DispatchMode;

/// Body text returned with every 401.
pub const AUTH_ERROR_MESSAGE: &str = "The token was missing or invalid.";

/// Bearer token missing or wrong. Handled at the boundary; never reaches the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", AUTH_ERROR_MESSAGE)]
pub struct AuthError;

/// Inbound event rejected before any decision logic runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("unknown dispatch mode '{0}'")]
    UnknownDispatchMode(String),

    /// Body declared a mode other than the one the route was registered with.
    #[error("event declares {declared} but route is registered as {expected}")]
    ModeMismatch {
        expected: DispatchMode,
        declared: DispatchMode,
    },

    /// Deferred-capable event arrived without `callbackURL` or `secret`.
    #[error("{mode} event is missing callbackURL or secret")]
    MissingCallback { mode: DispatchMode },

    #[error("invalid callback URL '{url}': {message}")]
    InvalidCallbackUrl { url: String, message: String },
}

/// Decision provider could not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("decision provider failed: {0}")]
    Provider(String),

    /// Provider did not finish inside the synchronous response budget.
    #[error("decision not ready within {budget_ms}ms")]
    BudgetExceeded { budget_ms: u64 },
}

impl DecisionError {
    pub fn provider(message: impl Into<String>) -> Self {
        DecisionError::Provider(message.into())
    }
}

/// Reasons why a single callback attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error")]
    Network,

    /// 5xx or 429 from the dispatcher.
    #[error("remote endpoint returned {0}")]
    RemoteError(u16),

    /// Any other 4xx. Never retried.
    #[error("client error {0} (non-retryable)")]
    ClientError(u16),
}

impl FailureReason {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureReason::ClientError(_))
    }
}

/// Terminal outcome of a callback delivery that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The dispatcher refused the callback outright.
    #[error("callback rejected after {attempts} attempt(s): {reason}")]
    Rejected { attempts: u32, reason: FailureReason },

    #[error("callback failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: FailureReason },

    /// The response deadline passed; the dispatcher has moved on.
    #[error("response deadline passed after {attempts} attempt(s)")]
    DeadlineExceeded {
        attempts: u32,
        last: Option<FailureReason>,
    },
}

impl DeliveryError {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Rejected { attempts, .. }
            | DeliveryError::Exhausted { attempts, .. }
            | DeliveryError::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable '{var}' not set")]
    MissingEnvVar { var: String },

    #[error("environment variable '{var}' has invalid value '{value}'")]
    InvalidEnvVar { var: String, value: String },

    #[error("bearer token must not be empty")]
    EmptyToken,

    #[error("route path '{path}' must start with '/'")]
    InvalidPath { path: String },

    #[error("duplicate route path '{path}'")]
    DuplicatePath { path: String },

    #[error("sync budget must be greater than zero")]
    ZeroSyncBudget,

    #[error("sync margin ({margin_ms}ms) must be smaller than the sync budget ({budget_ms}ms)")]
    MarginExceedsBudget { margin_ms: u64, budget_ms: u64 },

    #[error("callback max_attempts must be at least 1")]
    ZeroAttempts,
}

/// Errors that stop the receiver process from serving.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
