// Configuration error types

use std::any::Any;

use thiserror::Error;

use crate::{BoxError, EffectScopeError, ErrorCode, ErrorDomain};

/// Configuration loading and validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Reading a configuration file failed
    #[error("Failed to read configuration: {0}")]
    Io(String),

    /// The configuration text could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// An environment variable held an unusable value
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    /// A field failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Installing the tracing subscriber failed
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

impl EffectScopeError for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "CONFIG_IO",
            ConfigError::Parse(_) => "CONFIG_PARSE",
            ConfigError::InvalidEnv { .. } => "CONFIG_INVALID_ENV",
            ConfigError::Invalid(_) => "CONFIG_INVALID",
            ConfigError::Logging(_) => "CONFIG_LOGGING",
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            ConfigError::Io(_) => ErrorCode(5001),
            ConfigError::Parse(_) => ErrorCode(5002),
            ConfigError::InvalidEnv { .. } => ErrorCode(5003),
            ConfigError::Invalid(_) => ErrorCode(5004),
            ConfigError::Logging(_) => ErrorCode(5005),
        }
    }

    fn domain(&self) -> ErrorDomain {
        ErrorDomain::Config
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Convenient Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for BoxError {
    fn from(err: ConfigError) -> Self {
        Box::new(err)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}
