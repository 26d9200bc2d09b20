// effectscope error handling framework
// Central location for error types, traits, and conversion utilities

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

// Re-export common error handling tools for convenience
pub use anyhow;
pub use thiserror;

mod config;
mod conversion;
mod dispatch;

pub use config::{ConfigError, ConfigResult};
pub use conversion::{map_error, to_box_error, ExternalError, IntoBoxError};
pub use dispatch::{codes, DispatchError, DispatchResult};

/// Error domains representing the different layers of the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    Identity,
    Registry,
    Scope,
    Dispatch,
    Config,
    External,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Identity => write!(f, "identity"),
            ErrorDomain::Registry => write!(f, "registry"),
            ErrorDomain::Scope => write!(f, "scope"),
            ErrorDomain::Dispatch => write!(f, "dispatch"),
            ErrorDomain::Config => write!(f, "config"),
            ErrorDomain::External => write!(f, "external"),
        }
    }
}

/// Numeric error code, unique across domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub u32);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Base trait for all errors produced by the effect runtime.
///
/// Handlers that fail report their failure as a [`BoxError`], so any type
/// implementing this trait can travel through `perform` unchanged and be
/// recovered with [`EffectScopeError::as_any`] on the other side.
pub trait EffectScopeError: StdError + fmt::Debug + fmt::Display + Send + Sync + Any + 'static {
    /// Returns a unique static string code for this error.
    fn error_code(&self) -> &'static str;

    /// Numeric code of this error.
    fn code(&self) -> ErrorCode;

    /// Layer the error originated from.
    fn domain(&self) -> ErrorDomain;

    /// Converts the error into a boxed trait object.
    fn into_boxed(self) -> BoxError
    where
        Self: Sized,
    {
        Box::new(self)
    }

    /// Returns this error as a `&dyn Any` to allow downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Shorthand for a boxed effect runtime error
pub type BoxError = Box<dyn EffectScopeError>;

/// Standard Result type using BoxError
pub type Result<T> = std::result::Result<T, BoxError>;

/// Downcast a boxed error back to its concrete type.
pub fn downcast_ref<E: EffectScopeError>(err: &BoxError) -> Option<&E> {
    err.as_any().downcast_ref::<E>()
}
