//! Runtime configuration
//!
//! Configuration can be set programmatically, parsed from TOML, or loaded
//! from environment variables. The active configuration is process-wide;
//! install one with [`configure`].
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `EFFECTSCOPE_MAX_DISPATCH_DEPTH` | Nested perform limit per thread (0 = unlimited) | 1024 |
//! | `EFFECTSCOPE_TRACE_DISPATCH` | Log every perform at debug level | false |
//! | `EFFECTSCOPE_LOG` | `tracing_subscriber` filter directive | info |

use std::path::Path;
use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use effectscope_error::{ConfigError, ConfigResult};

/// Environment variable for [`RuntimeConfig::max_dispatch_depth`]
pub const ENV_MAX_DISPATCH_DEPTH: &str = "EFFECTSCOPE_MAX_DISPATCH_DEPTH";
/// Environment variable for [`RuntimeConfig::trace_dispatch`]
pub const ENV_TRACE_DISPATCH: &str = "EFFECTSCOPE_TRACE_DISPATCH";
/// Environment variable for [`RuntimeConfig::log_filter`]
pub const ENV_LOG: &str = "EFFECTSCOPE_LOG";

/// Configuration for the effect runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of handlers running at once on one thread.
    /// A perform beyond this fails with `DepthExceeded`; 0 disables the check.
    pub max_dispatch_depth: usize,

    /// Emit a debug event for every perform instead of a trace event
    pub trace_dispatch: bool,

    /// Filter directive handed to `tracing_subscriber::EnvFilter`
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_dispatch_depth: 1024,
            trace_dispatch: false,
            log_filter: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the nested perform limit
    pub fn with_max_dispatch_depth(mut self, depth: usize) -> Self {
        self.max_dispatch_depth = depth;
        self
    }

    /// Enable or disable per-perform debug events
    pub fn with_trace_dispatch(mut self, enabled: bool) -> Self {
        self.trace_dispatch = enabled;
        self
    }

    /// Set the log filter directive
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by any `EFFECTSCOPE_*` variables that are set
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    /// Override fields from a variable lookup
    pub fn merge_env<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_DISPATCH_DEPTH) {
            self.max_dispatch_depth = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_MAX_DISPATCH_DEPTH.to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_TRACE_DISPATCH) {
            self.trace_dispatch = parse_flag(&value).ok_or_else(|| ConfigError::InvalidEnv {
                key: ENV_TRACE_DISPATCH.to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.log_filter = value;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check that every field holds a usable value
    pub fn validate(&self) -> ConfigResult<()> {
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::Invalid("log_filter must not be empty".to_string()));
        }
        EnvFilter::try_new(&self.log_filter)
            .map_err(|e| ConfigError::Invalid(format!("log_filter {:?}: {}", self.log_filter, e)))?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

static RUNTIME_CONFIG: Lazy<RwLock<RuntimeConfig>> = Lazy::new(|| RwLock::new(RuntimeConfig::default()));

/// Install `config` as the process-wide configuration
pub fn configure(config: RuntimeConfig) -> ConfigResult<()> {
    config.validate()?;
    tracing::info!(
        max_dispatch_depth = config.max_dispatch_depth,
        trace_dispatch = config.trace_dispatch,
        "effect runtime configured"
    );
    *RUNTIME_CONFIG.write().unwrap_or_else(PoisonError::into_inner) = config;
    Ok(())
}

/// The active process-wide configuration
pub fn config() -> RuntimeConfig {
    RUNTIME_CONFIG
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Settings read on every perform
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatchSettings {
    pub max_dispatch_depth: usize,
    pub trace_dispatch: bool,
}

pub(crate) fn dispatch_settings() -> DispatchSettings {
    let config = RUNTIME_CONFIG.read().unwrap_or_else(PoisonError::into_inner);
    DispatchSettings {
        max_dispatch_depth: config.max_dispatch_depth,
        trace_dispatch: config.trace_dispatch,
    }
}
