//! Perform / dispatch
//!
//! [`perform`] resolves an effect instance against the calling thread's
//! lookup chain and calls the innermost bound handler with it. The
//! handler's value comes back as an ordinary return; nothing is unwound.

use std::any::type_name;

use effectscope_error::{DispatchError, DispatchResult};

use crate::chain::{self, FrameId};
use crate::config;
use crate::identity::{Effect, EffectTypeId};

/// Marks a handler as running for as long as it lives
struct DispatchGuard {
    frame: FrameId,
    effect_type: EffectTypeId,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        chain::try_with_current(|chain| chain.exit_dispatch(self.frame, self.effect_type));
    }
}

/// Perform `effect` and return the value produced by the innermost handler
/// bound for its effect type.
///
/// While that handler runs, performs of the same effect type skip the
/// handler's own frame: they see handles the handler opens itself first and
/// then the bindings further out. Performs of other effect types resolve
/// from the top of the chain as usual.
///
/// # Errors
///
/// - `EffectEscaped` when no open frame binds the effect type
/// - `DepthExceeded` when too many handlers are already running on this
///   thread
/// - `Handler` when a fallible handler reported a failure
pub fn perform<E: Effect>(effect: E) -> DispatchResult<E::Output> {
    let effect_type = effect.effect_type();
    let settings = config::dispatch_settings();

    let (frame, binding) = chain::with_current(|chain| -> DispatchResult<_> {
        let limit = chain
            .max_depth_override()
            .unwrap_or(settings.max_dispatch_depth);
        if limit != 0 && chain.dispatch_depth() >= limit {
            return Err(DispatchError::DepthExceeded(limit));
        }
        let (frame, binding) = chain.resolve(effect_type)?;
        chain.enter_dispatch(frame, effect_type);
        Ok((frame, binding))
    })
    .map_err(|err| {
        if err.is_escaped() {
            tracing::warn!(effect = %effect_type, "effect escaped every handler scope");
        }
        err
    })?;
    let _running = DispatchGuard { frame, effect_type };

    if settings.trace_dispatch {
        tracing::debug!(effect = %effect_type, %frame, "dispatching effect");
    } else {
        tracing::trace!(effect = %effect_type, %frame, "dispatching effect");
    }

    let output = binding.invoke(Box::new(effect))?;
    output
        .downcast::<E::Output>()
        .map(|value| *value)
        .map_err(|_| DispatchError::ResultTypeMismatch {
            effect: effect_type.to_string(),
            expected: type_name::<E::Output>().to_string(),
            found: binding.instance_type_name().to_string(),
        })
}
