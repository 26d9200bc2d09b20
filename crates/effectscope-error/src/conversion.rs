// Error conversion utilities
// Turns foreign errors into BoxError so handlers can report them

use std::any::Any;

use thiserror::Error;

use crate::{BoxError, EffectScopeError, ErrorCode, ErrorDomain};

/// Trait for converting any error type to a BoxError
pub trait IntoBoxError {
    /// Convert the error into a BoxError
    fn into_box_error(self) -> BoxError;
}

impl<E: EffectScopeError> IntoBoxError for E {
    fn into_box_error(self) -> BoxError {
        Box::new(self)
    }
}

impl IntoBoxError for BoxError {
    fn into_box_error(self) -> BoxError {
        self
    }
}

impl IntoBoxError for std::io::Error {
    fn into_box_error(self) -> BoxError {
        Box::new(ExternalError::Io(self.to_string()))
    }
}

impl IntoBoxError for String {
    fn into_box_error(self) -> BoxError {
        Box::new(ExternalError::Other(self))
    }
}

impl IntoBoxError for &str {
    fn into_box_error(self) -> BoxError {
        Box::new(ExternalError::Other(self.to_string()))
    }
}

impl IntoBoxError for anyhow::Error {
    fn into_box_error(self) -> BoxError {
        Box::new(ExternalError::Other(format!("{:#}", self)))
    }
}

impl IntoBoxError for serde_json::Error {
    fn into_box_error(self) -> BoxError {
        Box::new(ExternalError::Serde(self.to_string()))
    }
}

/// Errors that come from outside the runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serde(String),

    /// Other external error
    #[error("{0}")]
    Other(String),
}

impl EffectScopeError for ExternalError {
    fn error_code(&self) -> &'static str {
        match self {
            ExternalError::Io(_) => "EXTERNAL_IO",
            ExternalError::Serde(_) => "EXTERNAL_SERDE",
            ExternalError::Other(_) => "EXTERNAL_OTHER",
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            ExternalError::Io(_) => ErrorCode(9001),
            ExternalError::Serde(_) => ErrorCode(9002),
            ExternalError::Other(_) => ErrorCode(9003),
        }
    }

    fn domain(&self) -> ErrorDomain {
        ErrorDomain::External
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Helper function to convert any error to a BoxError
pub fn to_box_error<E: IntoBoxError>(err: E) -> BoxError {
    err.into_box_error()
}

/// Helper function to convert a Result with any error type to a Result with BoxError
pub fn map_error<T, E: IntoBoxError>(result: Result<T, E>) -> Result<T, BoxError> {
    result.map_err(|e| e.into_box_error())
}
