use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::callback::RetryPolicy;
use crate::error::ConfigError;
use crate::handler::HandlerConfig;
use crate::types::Subscription;

/// Receiver configuration.
///
/// Loaded once at process start and shared read-only afterwards.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub port: u16,

    /// Shared bearer token the dispatcher presents on every request.
    pub token: String,

    /// One entry per trigger subscription.
    pub routes: Vec<Subscription>,

    pub sync_budget_ms: u64,
    pub sync_margin_ms: u64,
    pub default_response_deadline_secs: u64,

    pub callback: RetryPolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            token: String::new(),
            routes: Subscription::defaults(),
            sync_budget_ms: 10_000,
            sync_margin_ms: 500,
            default_response_deadline_secs: 60 * 60,
            callback: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for ReceiverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverConfig")
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .field("routes", &self.routes)
            .field("sync_budget_ms", &self.sync_budget_ms)
            .field("sync_margin_ms", &self.sync_margin_ms)
            .field("default_response_deadline_secs", &self.default_response_deadline_secs)
            .field("callback", &self.callback)
            .finish()
    }
}

impl ReceiverConfig {
    /// Default routes with the given token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ReceiverConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Default routes, `TOKEN` (required) and `PORT` (optional) from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("TOKEN").map_err(|_| ConfigError::MissingEnvVar {
            var: "TOKEN".to_string(),
        })?;

        let port = match std::env::var("PORT") {
            Ok(val) => val.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var: "PORT".to_string(),
                value: val,
            })?,
            Err(_) => 8081,
        };

        let config = Self {
            port,
            ..Self::with_token(token)
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::EmptyToken);
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    path: route.path.clone(),
                });
            }
            if !seen.insert(route.path.as_str()) {
                return Err(ConfigError::DuplicatePath {
                    path: route.path.clone(),
                });
            }
        }

        if self.sync_budget_ms == 0 {
            return Err(ConfigError::ZeroSyncBudget);
        }
        if self.sync_margin_ms >= self.sync_budget_ms {
            return Err(ConfigError::MarginExceedsBudget {
                margin_ms: self.sync_margin_ms,
                budget_ms: self.sync_budget_ms,
            });
        }
        if self.callback.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            sync_budget: Duration::from_millis(self.sync_budget_ms),
            sync_margin: Duration::from_millis(self.sync_margin_ms),
            default_response_deadline: Duration::from_secs(self.default_response_deadline_secs),
        }
    }
}
