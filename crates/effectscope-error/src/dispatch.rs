// Dispatch-specific error types
// Raised by the lookup chain, handle scopes and perform

use std::any::Any;

use thiserror::Error;

use crate::{BoxError, EffectScopeError, ErrorCode, ErrorDomain, IntoBoxError};

/// Error codes for identity, registry, scope and dispatch failures
pub mod codes {
    use crate::ErrorCode;

    // Identity error codes start with 1000
    pub const RESULT_TYPE_MISMATCH: ErrorCode = ErrorCode(1001);
    pub const NO_STATIC_IDENTITY: ErrorCode = ErrorCode(1002);

    // Registry error codes start with 2000
    pub const DUPLICATE_HANDLER: ErrorCode = ErrorCode(2001);
    pub const STACK_DISCIPLINE: ErrorCode = ErrorCode(2002);

    // Scope error codes start with 3000
    pub const INACTIVE_HANDLE: ErrorCode = ErrorCode(3001);
    pub const HANDLE_ALREADY_ACTIVE: ErrorCode = ErrorCode(3002);

    // Dispatch error codes start with 4000
    pub const EFFECT_ESCAPED: ErrorCode = ErrorCode(4001);
    pub const HANDLER_FAILED: ErrorCode = ErrorCode(4002);
    pub const DEPTH_EXCEEDED: ErrorCode = ErrorCode(4003);
}

/// Failures of the effect dispatch machinery.
///
/// Effect names are carried as display strings so this crate stays free of
/// the identity types defined by the runtime.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No frame on the lookup chain binds the performed effect type
    #[error("Effect escaped: no handler bound for {0}")]
    EffectEscaped(String),

    /// A handler was bound or removed through a handle that is not active
    #[error("Inactive handle: cannot modify bindings for {0} outside the handle's scope")]
    InactiveHandle(String),

    /// The effect type is already bound in the same frame
    #[error("Duplicate handler: {0} is already bound in this frame")]
    DuplicateHandler(String),

    /// A handle was entered while it was already active
    #[error("Handle already active: {0}")]
    HandleAlreadyActive(String),

    /// Unbalanced push/pop on the lookup chain
    #[error("Stack discipline violation: {0}")]
    StackDiscipline(String),

    /// A fallible handler reported a failure; the inner error is untouched
    #[error("Handler failed: {0}")]
    Handler(BoxError),

    /// Nested performs went deeper than the configured limit
    #[error("Dispatch depth limit of {0} exceeded")]
    DepthExceeded(usize),

    /// The handler's result type does not match the effect identity
    #[error("Result type mismatch for {effect}: expected {expected}, found {found}")]
    ResultTypeMismatch {
        effect: String,
        expected: String,
        found: String,
    },

    /// A dynamically named effect was bound without its name
    #[error("Effect {0} has no static identity; bind it by name")]
    NoStaticIdentity(String),
}

impl EffectScopeError for DispatchError {
    fn error_code(&self) -> &'static str {
        match self {
            DispatchError::EffectEscaped(_) => "DISPATCH_EFFECT_ESCAPED",
            DispatchError::InactiveHandle(_) => "SCOPE_INACTIVE_HANDLE",
            DispatchError::DuplicateHandler(_) => "REGISTRY_DUPLICATE_HANDLER",
            DispatchError::HandleAlreadyActive(_) => "SCOPE_HANDLE_ALREADY_ACTIVE",
            DispatchError::StackDiscipline(_) => "REGISTRY_STACK_DISCIPLINE",
            DispatchError::Handler(_) => "DISPATCH_HANDLER_FAILED",
            DispatchError::DepthExceeded(_) => "DISPATCH_DEPTH_EXCEEDED",
            DispatchError::ResultTypeMismatch { .. } => "IDENTITY_RESULT_TYPE_MISMATCH",
            DispatchError::NoStaticIdentity(_) => "IDENTITY_NO_STATIC_IDENTITY",
        }
    }

    fn code(&self) -> ErrorCode {
        use codes::*;
        match self {
            DispatchError::EffectEscaped(_) => EFFECT_ESCAPED,
            DispatchError::InactiveHandle(_) => INACTIVE_HANDLE,
            DispatchError::DuplicateHandler(_) => DUPLICATE_HANDLER,
            DispatchError::HandleAlreadyActive(_) => HANDLE_ALREADY_ACTIVE,
            DispatchError::StackDiscipline(_) => STACK_DISCIPLINE,
            DispatchError::Handler(_) => HANDLER_FAILED,
            DispatchError::DepthExceeded(_) => DEPTH_EXCEEDED,
            DispatchError::ResultTypeMismatch { .. } => RESULT_TYPE_MISMATCH,
            DispatchError::NoStaticIdentity(_) => NO_STATIC_IDENTITY,
        }
    }

    fn domain(&self) -> ErrorDomain {
        match self {
            DispatchError::ResultTypeMismatch { .. } | DispatchError::NoStaticIdentity(_) => {
                ErrorDomain::Identity
            }
            DispatchError::DuplicateHandler(_) | DispatchError::StackDiscipline(_) => {
                ErrorDomain::Registry
            }
            DispatchError::InactiveHandle(_) | DispatchError::HandleAlreadyActive(_) => {
                ErrorDomain::Scope
            }
            DispatchError::EffectEscaped(_)
            | DispatchError::Handler(_)
            | DispatchError::DepthExceeded(_) => ErrorDomain::Dispatch,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Convenient Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

impl From<DispatchError> for BoxError {
    fn from(err: DispatchError) -> Self {
        Box::new(err)
    }
}

impl DispatchError {
    /// Create a new effect escaped error
    pub fn escaped(effect: impl Into<String>) -> Self {
        DispatchError::EffectEscaped(effect.into())
    }

    /// Create a new stack discipline error
    pub fn stack_discipline(message: impl Into<String>) -> Self {
        DispatchError::StackDiscipline(message.into())
    }

    /// Wrap the failure reported by a handler
    pub fn handler(err: impl IntoBoxError) -> Self {
        DispatchError::Handler(err.into_box_error())
    }

    /// The error a fallible handler returned, if this is a handler failure
    pub fn handler_error(&self) -> Option<&BoxError> {
        match self {
            DispatchError::Handler(err) => Some(err),
            _ => None,
        }
    }

    /// True when no handler was found for the performed effect
    pub fn is_escaped(&self) -> bool {
        matches!(self, DispatchError::EffectEscaped(_))
    }
}
