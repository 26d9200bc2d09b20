// effectscope runtime
//
// Code performs typed operations without knowing who satisfies them;
// enclosing handle scopes supply the handlers, and the handler's value is
// returned directly to the performing call site.

// =================================================================
// Core modules
// =================================================================

// Effect Identity
// Interned effect type tokens for declared and dynamically named effects
pub mod identity;

// Handler Registry / Lookup Chain
// Thread-local stack of handler frames and the innermost-wins lookup
pub mod chain;

// Handle Scopes
// RAII frame ownership and handler binding
pub mod handle;

// Perform / Dispatch
pub mod dispatch;

// Task Scopes
// Per-future lookup chains for futures that share a thread
pub mod task;

// =================================================================
// Ambient modules
// =================================================================

// Runtime configuration (TOML, environment, builder)
pub mod config;

// Tracing subscriber setup
pub mod telemetry;

// Re-export the error crate
pub use effectscope_error as error;

// Re-export important types for easier access
pub use chain::{Binding, FrameId, LookupChain};
pub use config::{config, configure, RuntimeConfig};
pub use dispatch::perform;
pub use effectscope_error::{BoxError, ConfigError, DispatchError, DispatchResult, EffectScopeError};
pub use handle::{Handle, HandleGuard, HandleState};
pub use task::{ScopedFutureExt, TaskScope};
pub use identity::{
    declare_effect_type, effect, named_effect, registered_effect_types, Effect, EffectKind, EffectTypeId,
    EffectTypeInfo, NamedEffect,
};

/// Result type for effects answered asynchronously.
///
/// The handler runs synchronously and hands back a future; the performing
/// code awaits it on its own thread.
pub type Deferred<T> = futures::future::LocalBoxFuture<'static, T>;
