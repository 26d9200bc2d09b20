//! Handler registry and lookup chain
//!
//! A [`LookupChain`] is an ordered stack of registry frames, innermost last,
//! sitting on an implicit empty bottom frame. Resolution walks the frames
//! from the top down and returns the first binding for the requested effect
//! type, so handlers installed by more deeply nested scopes shadow outer
//! ones.
//!
//! Each OS thread owns a current chain. [`Handle`](crate::Handle) and
//! [`perform`](crate::perform) operate on it; the free functions in this
//! module expose read-only views of it. A [`TaskScope`](crate::TaskScope)
//! replaces the current chain with its own while its future is polled.

use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use effectscope_error::{DispatchError, DispatchResult, IntoBoxError};

use crate::identity::{Effect, EffectTypeId};

type ErasedHandler = dyn Fn(Box<dyn Any>) -> DispatchResult<Box<dyn Any>>;

// Shared by every chain: frame ids are unique process-wide
static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

/// Identifier of a registry frame on a lookup chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    /// The implicit bottom frame every chain starts with
    pub const ROOT: FrameId = FrameId(0);
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// A type-erased handler ready to be stored in a frame
#[derive(Clone)]
pub struct Binding {
    handler: Rc<ErasedHandler>,
    instance_type: TypeId,
    instance_type_name: &'static str,
}

impl Binding {
    /// Wrap an infallible handler for effect `E`
    pub fn new<E, F>(handler: F) -> Self
    where
        E: Effect,
        F: Fn(E) -> E::Output + 'static,
    {
        Self::erase::<E, _>(move |effect| Ok(handler(effect)))
    }

    /// Wrap a handler that may fail; its error surfaces from `perform` as
    /// [`DispatchError::Handler`]
    pub fn fallible<E, F, Fail>(handler: F) -> Self
    where
        E: Effect,
        F: Fn(E) -> Result<E::Output, Fail> + 'static,
        Fail: IntoBoxError,
    {
        Self::erase::<E, _>(move |effect| handler(effect).map_err(|err| DispatchError::handler(err)))
    }

    fn erase<E, F>(handler: F) -> Self
    where
        E: Effect,
        F: Fn(E) -> DispatchResult<E::Output> + 'static,
    {
        let erased = move |payload: Box<dyn Any>| -> DispatchResult<Box<dyn Any>> {
            let effect = payload.downcast::<E>().map_err(|_| {
                DispatchError::stack_discipline(format!(
                    "handler for {} was invoked with an instance of another effect type",
                    type_name::<E>()
                ))
            })?;
            let output = handler(*effect)?;
            Ok(Box::new(output) as Box<dyn Any>)
        };
        Self {
            handler: Rc::new(erased),
            instance_type: TypeId::of::<E>(),
            instance_type_name: type_name::<E>(),
        }
    }

    /// Run the handler on a boxed effect instance
    pub(crate) fn invoke(&self, effect: Box<dyn Any>) -> DispatchResult<Box<dyn Any>> {
        (self.handler)(effect)
    }

    /// Name of the effect instance type this handler accepts
    pub fn instance_type_name(&self) -> &'static str {
        self.instance_type_name
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("instance_type", &self.instance_type_name)
            .finish()
    }
}

#[derive(Debug)]
struct Frame {
    id: FrameId,
    bindings: HashMap<EffectTypeId, Binding>,
}

impl Frame {
    fn new(id: FrameId) -> Self {
        Self {
            id,
            bindings: HashMap::new(),
        }
    }
}

/// Ordered stack of handler registry frames
#[derive(Debug)]
pub struct LookupChain {
    frames: Vec<Frame>,
    /// Handlers currently running, as (frame, effect type) pairs, innermost last
    executing: Vec<(FrameId, EffectTypeId)>,
    max_depth_override: Option<usize>,
}

impl LookupChain {
    /// Create a chain holding only the implicit bottom frame
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::new(FrameId::ROOT)],
            executing: Vec::new(),
            max_depth_override: None,
        }
    }

    /// Append an empty frame and return its identifier
    pub fn push_frame(&mut self) -> FrameId {
        let id = FrameId(NEXT_FRAME.fetch_add(1, Ordering::Relaxed));
        self.frames.push(Frame::new(id));
        tracing::debug!(frame = %id, depth = self.depth(), "pushed handler frame");
        id
    }

    /// Remove the top frame, which must be `expected`
    pub fn pop_frame(&mut self, expected: FrameId) -> DispatchResult<()> {
        let top = match self.frames.last() {
            Some(frame) if frame.id != FrameId::ROOT => frame.id,
            _ => {
                return Err(DispatchError::stack_discipline(format!(
                    "cannot pop {}: no scoped frame is open",
                    expected
                )))
            }
        };
        if top != expected {
            return Err(DispatchError::stack_discipline(format!(
                "cannot pop {}: {} is on top of the chain",
                expected, top
            )));
        }
        self.frames.pop();
        tracing::debug!(frame = %expected, depth = self.depth(), "popped handler frame");
        Ok(())
    }

    /// Remove `frame` wherever it sits; returns whether it was found.
    ///
    /// Used to keep the chain consistent after a scope was exited out of
    /// order.
    pub(crate) fn remove_frame(&mut self, frame: FrameId) -> bool {
        if frame == FrameId::ROOT {
            return false;
        }
        let before = self.frames.len();
        self.frames.retain(|f| f.id != frame);
        before != self.frames.len()
    }

    /// Insert a binding into `frame`; fails if the effect type is already
    /// bound there
    pub fn bind(&mut self, frame: FrameId, effect_type: EffectTypeId, binding: Binding) -> DispatchResult<()> {
        check_instance_type(effect_type, &binding)?;
        let target = self.frame_mut(frame)?;
        if target.bindings.contains_key(&effect_type) {
            return Err(DispatchError::DuplicateHandler(effect_type.to_string()));
        }
        target.bindings.insert(effect_type, binding);
        tracing::debug!(%frame, effect = %effect_type, "bound handler");
        Ok(())
    }

    /// Insert or overwrite a binding in `frame`; returns whether an existing
    /// binding was replaced
    pub fn replace(&mut self, frame: FrameId, effect_type: EffectTypeId, binding: Binding) -> DispatchResult<bool> {
        check_instance_type(effect_type, &binding)?;
        let target = self.frame_mut(frame)?;
        let replaced = target.bindings.insert(effect_type, binding).is_some();
        tracing::debug!(%frame, effect = %effect_type, replaced, "replaced handler");
        Ok(replaced)
    }

    /// Remove one binding from `frame`, or every binding when `effect_type`
    /// is `None`. Returns how many bindings were removed.
    pub fn unbind(&mut self, frame: FrameId, effect_type: Option<EffectTypeId>) -> DispatchResult<usize> {
        let target = self.frame_mut(frame)?;
        let removed = match effect_type {
            Some(effect_type) => usize::from(target.bindings.remove(&effect_type).is_some()),
            None => {
                let count = target.bindings.len();
                target.bindings.clear();
                count
            }
        };
        tracing::debug!(%frame, removed, "unbound handlers");
        Ok(removed)
    }

    /// Find the innermost binding for `effect_type`.
    ///
    /// A frame whose handler for `effect_type` is currently running is
    /// skipped, so a handler performing its own effect reaches the next
    /// binding out instead of itself.
    pub fn resolve(&self, effect_type: EffectTypeId) -> DispatchResult<(FrameId, Binding)> {
        self.frames
            .iter()
            .rev()
            .filter(|frame| !self.is_executing(frame.id, effect_type))
            .find_map(|frame| {
                frame
                    .bindings
                    .get(&effect_type)
                    .map(|binding| (frame.id, binding.clone()))
            })
            .ok_or_else(|| DispatchError::escaped(effect_type.to_string()))
    }

    /// Number of scoped frames, not counting the bottom frame
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    /// Identifier of the top frame
    pub fn top(&self) -> FrameId {
        self.frames.last().map(|f| f.id).unwrap_or(FrameId::ROOT)
    }

    /// Whether `frame` is on the chain
    pub fn contains(&self, frame: FrameId) -> bool {
        self.frames.iter().any(|f| f.id == frame)
    }

    /// Whether any frame binds `effect_type`
    pub fn is_bound(&self, effect_type: EffectTypeId) -> bool {
        self.frames.iter().any(|f| f.bindings.contains_key(&effect_type))
    }

    /// Effect types bound in `frame`
    pub fn frame_bindings(&self, frame: FrameId) -> Vec<EffectTypeId> {
        let mut bound: Vec<_> = self
            .frames
            .iter()
            .find(|f| f.id == frame)
            .map(|f| f.bindings.keys().copied().collect())
            .unwrap_or_default();
        bound.sort();
        bound
    }

    /// A new chain whose bottom frame holds every binding visible from the
    /// top of this one. Inner bindings win over outer ones, as they would in
    /// [`resolve`](Self::resolve); running-handler marks are not copied.
    pub fn fork(&self) -> LookupChain {
        let mut forked = LookupChain::new();
        forked.max_depth_override = self.max_depth_override;
        let root = &mut forked.frames[0].bindings;
        for frame in &self.frames {
            for (effect_type, binding) in &frame.bindings {
                root.insert(*effect_type, binding.clone());
            }
        }
        forked
    }

    /// Number of handlers currently executing on this chain
    pub fn dispatch_depth(&self) -> usize {
        self.executing.len()
    }

    pub(crate) fn enter_dispatch(&mut self, frame: FrameId, effect_type: EffectTypeId) {
        self.executing.push((frame, effect_type));
    }

    pub(crate) fn exit_dispatch(&mut self, frame: FrameId, effect_type: EffectTypeId) {
        if let Some(pos) = self
            .executing
            .iter()
            .rposition(|entry| *entry == (frame, effect_type))
        {
            self.executing.remove(pos);
        }
    }

    pub(crate) fn max_depth_override(&self) -> Option<usize> {
        self.max_depth_override
    }

    fn is_executing(&self, frame: FrameId, effect_type: EffectTypeId) -> bool {
        self.executing.contains(&(frame, effect_type))
    }

    fn frame_mut(&mut self, frame: FrameId) -> DispatchResult<&mut Frame> {
        self.frames
            .iter_mut()
            .find(|f| f.id == frame)
            .ok_or_else(|| DispatchError::stack_discipline(format!("{} is not on the lookup chain", frame)))
    }
}

impl Default for LookupChain {
    fn default() -> Self {
        Self::new()
    }
}

fn check_instance_type(effect_type: EffectTypeId, binding: &Binding) -> DispatchResult<()> {
    let info = effect_type.info();
    if info.instance_type != binding.instance_type {
        return Err(DispatchError::ResultTypeMismatch {
            effect: effect_type.to_string(),
            expected: info.instance_type_name.to_string(),
            found: binding.instance_type_name.to_string(),
        });
    }
    Ok(())
}

thread_local! {
    static CURRENT: RefCell<LookupChain> = RefCell::new(LookupChain::new());
}

/// Run `f` against the calling thread's chain.
///
/// Never call a handler from inside `f`: handlers may perform effects,
/// which borrow the chain again.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut LookupChain) -> R) -> R {
    CURRENT.with(|chain| f(&mut chain.borrow_mut()))
}

/// Like [`with_current`], but returns `None` once the thread's storage has
/// been torn down
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut LookupChain) -> R) -> Option<R> {
    CURRENT.try_with(|chain| f(&mut chain.borrow_mut())).ok()
}

/// Exchange the calling thread's current chain with `other`
pub(crate) fn swap_current(other: &mut LookupChain) {
    let _ = CURRENT.try_with(|chain| std::mem::swap(&mut *chain.borrow_mut(), other));
}

/// Snapshot of the bindings visible on the current chain
pub(crate) fn fork_current() -> LookupChain {
    with_current(|chain| chain.fork())
}

/// Number of open handle frames on this thread
pub fn depth() -> usize {
    with_current(|chain| chain.depth())
}

/// Whether any open frame on this thread binds `effect_type`
pub fn is_bound(effect_type: EffectTypeId) -> bool {
    with_current(|chain| chain.is_bound(effect_type))
}

/// Number of handlers currently running on this thread
pub fn dispatch_depth() -> usize {
    with_current(|chain| chain.dispatch_depth())
}

/// Override the configured nesting limit for performs on this thread.
///
/// `None` restores the process-wide value from
/// [`RuntimeConfig`](crate::RuntimeConfig); `Some(0)` disables the limit.
pub fn set_max_dispatch_depth(limit: Option<usize>) {
    with_current(|chain| chain.max_depth_override = limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use effectscope_error::{BoxError, EffectScopeError};
    use crate::identity::{declare_effect_type, named_effect, NamedEffect};

    struct Greet(&'static str);

    impl Effect for Greet {
        type Output = String;
    }

    struct Count;

    impl Effect for Count {
        type Output = usize;
    }

    fn greeter(prefix: &'static str) -> Binding {
        Binding::new(move |g: Greet| format!("{} {}", prefix, g.0))
    }

    fn call(chain: &LookupChain, name: &'static str) -> DispatchResult<String> {
        let (_, binding) = chain.resolve(declare_effect_type::<Greet>())?;
        let out = binding.invoke(Box::new(Greet(name)))?;
        Ok(*out.downcast::<String>().unwrap())
    }

    #[test]
    fn test_new_chain_has_only_bottom_frame() {
        let chain = LookupChain::new();
        assert_eq!(chain.depth(), 0);
        assert_eq!(chain.top(), FrameId::ROOT);
        assert!(chain.resolve(declare_effect_type::<Greet>()).unwrap_err().is_escaped());
    }

    #[test]
    fn test_inner_frame_shadows_outer() {
        let mut chain = LookupChain::new();
        let ty = declare_effect_type::<Greet>();
        let outer = chain.push_frame();
        chain.bind(outer, ty, greeter("hello")).unwrap();
        let inner = chain.push_frame();
        chain.bind(inner, ty, greeter("hi")).unwrap();

        assert_eq!(call(&chain, "ann").unwrap(), "hi ann");
        chain.pop_frame(inner).unwrap();
        assert_eq!(call(&chain, "ann").unwrap(), "hello ann");
    }

    #[test]
    fn test_duplicate_in_same_frame_is_rejected() {
        let mut chain = LookupChain::new();
        let ty = declare_effect_type::<Greet>();
        let frame = chain.push_frame();
        chain.bind(frame, ty, greeter("a")).unwrap();
        let err = chain.bind(frame, ty, greeter("b")).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateHandler(_)));

        assert!(chain.replace(frame, ty, greeter("c")).unwrap());
        assert_eq!(call(&chain, "x").unwrap(), "c x");
    }

    #[test]
    fn test_pop_underflow_and_out_of_order() {
        let mut chain = LookupChain::new();
        let err = chain.pop_frame(FrameId(7)).unwrap_err();
        assert!(matches!(err, DispatchError::StackDiscipline(_)));

        let a = chain.push_frame();
        let b = chain.push_frame();
        assert!(matches!(chain.pop_frame(a), Err(DispatchError::StackDiscipline(_))));
        assert_eq!(chain.depth(), 2);
        chain.pop_frame(b).unwrap();
        chain.pop_frame(a).unwrap();
        assert_eq!(chain.depth(), 0);
    }

    #[test]
    fn test_unbind_one_all_and_missing() {
        let mut chain = LookupChain::new();
        let greet = declare_effect_type::<Greet>();
        let count = declare_effect_type::<Count>();
        let outer = chain.push_frame();
        chain.bind(outer, greet, greeter("outer")).unwrap();
        let inner = chain.push_frame();
        chain.bind(inner, greet, greeter("inner")).unwrap();
        chain.bind(inner, count, Binding::new(|_: Count| 3usize)).unwrap();

        assert_eq!(chain.unbind(inner, Some(greet)).unwrap(), 1);
        assert_eq!(chain.unbind(inner, Some(greet)).unwrap(), 0);
        assert_eq!(call(&chain, "y").unwrap(), "outer y");

        assert_eq!(chain.frame_bindings(inner), vec![count]);
        assert_eq!(chain.unbind(inner, None).unwrap(), 1);
        assert!(chain.frame_bindings(inner).is_empty());
    }

    #[test]
    fn test_binding_checks_instance_type() {
        let mut chain = LookupChain::new();
        let frame = chain.push_frame();
        let asked = named_effect::<String>("chain.ask");

        let err = chain.bind(frame, asked, greeter("no")).unwrap_err();
        assert!(matches!(err, DispatchError::ResultTypeMismatch { .. }));

        let wrong_result = Binding::new(|_: NamedEffect<u8>| 1u8);
        assert!(chain.bind(frame, asked, wrong_result).is_err());

        let right = Binding::new(|_: NamedEffect<String>| "ok".to_string());
        chain.bind(frame, asked, right).unwrap();
        assert!(chain.is_bound(asked));
    }

    #[test]
    fn test_executing_frame_is_skipped() {
        let mut chain = LookupChain::new();
        let ty = declare_effect_type::<Greet>();
        let outer = chain.push_frame();
        chain.bind(outer, ty, greeter("outer")).unwrap();
        let inner = chain.push_frame();
        chain.bind(inner, ty, greeter("inner")).unwrap();

        chain.enter_dispatch(inner, ty);
        assert_eq!(chain.resolve(ty).unwrap().0, outer);
        chain.enter_dispatch(outer, ty);
        assert!(chain.resolve(ty).unwrap_err().is_escaped());
        assert_eq!(chain.dispatch_depth(), 2);

        chain.exit_dispatch(outer, ty);
        chain.exit_dispatch(inner, ty);
        assert_eq!(chain.resolve(ty).unwrap().0, inner);
    }

    #[test]
    fn test_bind_into_unknown_frame_fails() {
        let mut chain = LookupChain::new();
        let frame = chain.push_frame();
        chain.pop_frame(frame).unwrap();
        let err = chain
            .bind(frame, declare_effect_type::<Greet>(), greeter("x"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::StackDiscipline(_)));
    }

    #[test]
    fn test_fallible_binding_wraps_error() {
        let binding = Binding::fallible(|_: Count| -> Result<usize, BoxError> {
            Err(effectscope_error::to_box_error("counter offline"))
        });
        let err = binding.invoke(Box::new(Count)).unwrap_err();
        assert_eq!(err.handler_error().unwrap().to_string(), "counter offline");

        let plain = Binding::fallible(|_: Count| -> Result<usize, String> { Err("no counter".to_string()) });
        let err = plain.invoke(Box::new(Count)).unwrap_err();
        assert_eq!(err.handler_error().unwrap().error_code(), "EXTERNAL_OTHER");
    }

    #[test]
    fn test_wrong_instance_names_the_handled_effect() {
        let binding = Binding::new(|_: Count| 3usize);
        let err = binding.invoke(Box::new(Greet("stray"))).unwrap_err();
        match err {
            DispatchError::StackDiscipline(message) => {
                assert!(message.contains("Count"));
                assert!(message.contains("another effect type"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_frame_ids_are_unique_across_chains() {
        let mut first = LookupChain::new();
        let mut second = LookupChain::new();
        let a = first.push_frame();
        let b = second.push_frame();
        assert_ne!(a, b);
        assert!(matches!(second.pop_frame(a), Err(DispatchError::StackDiscipline(_))));
        second.pop_frame(b).unwrap();
    }

    #[test]
    fn test_fork_flattens_visible_bindings() {
        let mut chain = LookupChain::new();
        let greet = declare_effect_type::<Greet>();
        let count = declare_effect_type::<Count>();
        let outer = chain.push_frame();
        chain.bind(outer, greet, greeter("outer")).unwrap();
        chain.bind(outer, count, Binding::new(|_: Count| 1usize)).unwrap();
        let inner = chain.push_frame();
        chain.bind(inner, greet, greeter("inner")).unwrap();
        chain.enter_dispatch(inner, greet);

        let forked = chain.fork();
        assert_eq!(forked.depth(), 0);
        assert_eq!(forked.dispatch_depth(), 0);
        assert_eq!(call(&forked, "z").unwrap(), "inner z");
        assert_eq!(forked.frame_bindings(FrameId::ROOT), {
            let mut both = vec![greet, count];
            both.sort();
            both
        });
    }
}
