//! Handle scopes
//!
//! A [`Handle`] owns one registry frame on the calling thread's lookup
//! chain for as long as it is active. Entering pushes a fresh, empty frame;
//! the returned [`HandleGuard`] pops it again when dropped, whether the
//! scope ended normally, through `?`, or by unwinding.
//!
//! ```rust,ignore
//! let handle = Handle::new();
//! handle.scope(|h| {
//!     h.on(|log: Log| println!("{}", log.0))?;
//!     perform(Log("hi".into()))
//! })??;
//! ```

use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;

use effectscope_error::{DispatchError, DispatchResult, IntoBoxError};

use crate::chain::{self, Binding, FrameId};
use crate::identity::{named_effect, Effect, EffectTypeId, NamedEffect};

/// Lifecycle state of a [`Handle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created but never entered
    Unentered,
    /// Entered; owns the given frame
    Active(FrameId),
    /// Exited; may be entered again as a fresh scope
    Inactive,
}

/// A scoped registry of handler bindings
pub struct Handle {
    label: Option<String>,
    state: Cell<HandleState>,
    // Frames live in thread-local storage; a handle must stay on its thread
    _not_send: PhantomData<Rc<()>>,
}

impl Handle {
    /// Create an unentered handle
    pub fn new() -> Self {
        Self {
            label: None,
            state: Cell::new(HandleState::Unentered),
            _not_send: PhantomData,
        }
    }

    /// Create an unentered handle with a label used in logs and errors
    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            state: Cell::new(HandleState::Unentered),
            _not_send: PhantomData,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandleState {
        self.state.get()
    }

    /// Whether the handle currently owns a frame
    pub fn is_active(&self) -> bool {
        matches!(self.state.get(), HandleState::Active(_))
    }

    /// Push a fresh frame and make this handle active.
    ///
    /// Fails with `HandleAlreadyActive` if the handle is already active.
    pub fn enter(&self) -> DispatchResult<HandleGuard<'_>> {
        if let HandleState::Active(frame) = self.state.get() {
            return Err(DispatchError::HandleAlreadyActive(format!("{} already owns {}", self, frame)));
        }
        let frame = chain::with_current(|chain| chain.push_frame());
        self.state.set(HandleState::Active(frame));
        tracing::debug!(handle = %self, %frame, "entered handle");
        Ok(HandleGuard { handle: self, frame })
    }

    /// Enter the handle, run `body`, and exit on every path out of `body`
    pub fn scope<R, F>(&self, body: F) -> DispatchResult<R>
    where
        F: FnOnce(&Handle) -> R,
    {
        let _guard = self.enter()?;
        Ok(body(self))
    }

    /// Bind a handler for the statically declared effect `E`
    pub fn on<E, F>(&self, handler: F) -> DispatchResult<()>
    where
        E: Effect,
        F: Fn(E) -> E::Output + 'static,
    {
        self.bind_handler::<E, F>(static_type::<E>()?, handler)
    }

    /// Bind a handler for the static effect `E` that may fail.
    ///
    /// The handler's error is boxed and reaches the performing code inside
    /// `DispatchError::Handler`, still downcastable to its own type.
    pub fn try_on<E, F, Fail>(&self, handler: F) -> DispatchResult<()>
    where
        E: Effect,
        F: Fn(E) -> Result<E::Output, Fail> + 'static,
        Fail: IntoBoxError,
    {
        self.install(static_type::<E>()?, Binding::fallible::<E, F, Fail>(handler), false)
            .map(|_| ())
    }

    /// Bind a handler for the dynamic effect `(name, T)`
    pub fn on_named<T, F>(&self, name: &str, handler: F) -> DispatchResult<()>
    where
        T: 'static,
        F: Fn(NamedEffect<T>) -> T + 'static,
    {
        self.bind_handler::<NamedEffect<T>, F>(named_effect::<T>(name), handler)
    }

    /// Bind a handler for an explicit effect identity.
    ///
    /// `E` must be the instance type the identity dispatches, otherwise the
    /// binding is rejected with `ResultTypeMismatch`.
    pub fn bind_handler<E, F>(&self, effect_type: EffectTypeId, handler: F) -> DispatchResult<()>
    where
        E: Effect,
        F: Fn(E) -> E::Output + 'static,
    {
        self.install(effect_type, Binding::new::<E, F>(handler), false)
            .map(|_| ())
    }

    /// Bind or overwrite the handler for the static effect `E`.
    /// Returns whether a binding in this handle's frame was replaced.
    pub fn replace_handler<E, F>(&self, handler: F) -> DispatchResult<bool>
    where
        E: Effect,
        F: Fn(E) -> E::Output + 'static,
    {
        self.install(static_type::<E>()?, Binding::new::<E, F>(handler), true)
    }

    /// Bind or overwrite the handler for the dynamic effect `(name, T)`
    pub fn replace_named<T, F>(&self, name: &str, handler: F) -> DispatchResult<bool>
    where
        T: 'static,
        F: Fn(NamedEffect<T>) -> T + 'static,
    {
        self.install(named_effect::<T>(name), Binding::new::<NamedEffect<T>, F>(handler), true)
    }

    /// Remove one binding, or all of them when `effect_type` is `None`.
    /// Removing something that is not bound is not an error.
    pub fn unbind(&self, effect_type: Option<EffectTypeId>) -> DispatchResult<usize> {
        let target = effect_type.map(|t| t.to_string()).unwrap_or_else(|| "all effects".to_string());
        let frame = self.active_frame(&target)?;
        chain::with_current(|chain| chain.unbind(frame, effect_type))
    }

    /// Remove the binding for the identity of `effect`
    pub fn unbind_effect<E: Effect>(&self, effect: &E) -> DispatchResult<usize> {
        self.unbind(Some(effect.effect_type()))
    }

    /// Remove every binding in this handle's frame
    pub fn clear(&self) -> DispatchResult<usize> {
        self.unbind(None)
    }

    /// Whether this handle's frame binds `effect_type`
    pub fn is_bound(&self, effect_type: EffectTypeId) -> bool {
        self.bound_effects().contains(&effect_type)
    }

    /// Effect types bound in this handle's frame; empty when inactive
    pub fn bound_effects(&self) -> Vec<EffectTypeId> {
        match self.state.get() {
            HandleState::Active(frame) => {
                chain::try_with_current(|chain| chain.frame_bindings(frame)).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    fn install(&self, effect_type: EffectTypeId, binding: Binding, replace: bool) -> DispatchResult<bool> {
        let frame = self.active_frame(&effect_type.to_string())?;
        chain::with_current(|chain| {
            if replace {
                chain.replace(frame, effect_type, binding)
            } else {
                chain.bind(frame, effect_type, binding).map(|_| false)
            }
        })
    }

    fn active_frame(&self, target: &str) -> DispatchResult<FrameId> {
        match self.state.get() {
            HandleState::Active(frame) => Ok(frame),
            _ => Err(DispatchError::InactiveHandle(target.to_string())),
        }
    }

    fn exit(&self, frame: FrameId) {
        self.state.set(HandleState::Inactive);
        let popped = chain::try_with_current(|chain| match chain.pop_frame(frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                chain.remove_frame(frame);
                Err(err)
            }
        });
        match popped {
            Some(Ok(())) | None => tracing::debug!(handle = %self, %frame, "exited handle"),
            Some(Err(err)) => {
                tracing::error!(handle = %self, %frame, error = %err, "handle exited out of order");
                if !std::thread::panicking() {
                    panic!("{}", err);
                }
            }
        }
    }
}

fn static_type<E: Effect>() -> DispatchResult<EffectTypeId> {
    E::static_effect_type().ok_or_else(|| DispatchError::NoStaticIdentity(type_name::<E>().to_string()))
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // Only reachable when a guard was leaked with mem::forget
        if let HandleState::Active(frame) = self.state.get() {
            tracing::warn!(handle = %self, %frame, "handle dropped while active");
            chain::try_with_current(|chain| chain.remove_frame(frame));
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "handle '{}'", label),
            None => write!(f, "handle"),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound: Vec<String> = self.bound_effects().iter().map(|t| t.to_string()).collect();
        f.debug_struct("Handle")
            .field("label", &self.label)
            .field("state", &self.state.get())
            .field("bound", &bound)
            .finish()
    }
}

/// Proof that a [`Handle`] is active; exits the handle when dropped
#[must_use = "the handle exits as soon as the guard is dropped"]
pub struct HandleGuard<'h> {
    handle: &'h Handle,
    frame: FrameId,
}

impl HandleGuard<'_> {
    /// Frame owned by the guarded handle
    pub fn frame(&self) -> FrameId {
        self.frame
    }
}

impl Deref for HandleGuard<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        self.handle
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.handle.exit(self.frame);
    }
}

impl fmt::Debug for HandleGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleGuard")
            .field("handle", &self.handle)
            .field("frame", &self.frame)
            .finish()
    }
}
