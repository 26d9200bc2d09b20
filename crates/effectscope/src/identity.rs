//! Effect identity
//!
//! Every performable operation is keyed by an [`EffectTypeId`], a small
//! interned token. Statically declared effects are Rust types implementing
//! [`Effect`]; their identity is the Rust type itself. Dynamic effects are
//! created from a `(name, result type)` pair through [`named_effect`] and
//! share an identity with every other effect built from an equal pair.
//!
//! The interning table is process-wide and never evicts entries, so a token
//! handed out once stays valid (and keeps the same meaning) for the rest of
//! the process.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use effectscope_error::{map_error, BoxError};

/// Identifier for an effect type
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectTypeId(u32);

/// How an effect identity came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    /// A Rust type implementing [`Effect`]
    Declared,
    /// A `(name, result type)` pair interned by [`named_effect`]
    Named,
}

/// Metadata recorded for every interned effect identity
#[derive(Debug, Clone)]
pub struct EffectTypeInfo {
    /// The identity this entry describes
    pub id: EffectTypeId,
    /// Display name: the Rust type name or the dynamic name
    pub name: Arc<str>,
    /// Declared or named
    pub kind: EffectKind,
    /// Type of the value a handler must return
    pub result_type: TypeId,
    /// Readable name of the result type
    pub result_type_name: &'static str,
    /// Type of the effect instance handed to handlers
    pub instance_type: TypeId,
    /// Readable name of the instance type
    pub instance_type_name: &'static str,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum InternKey {
    Declared(TypeId),
    Named(Arc<str>, TypeId),
}

#[derive(Default)]
struct Interner {
    ids: HashMap<InternKey, EffectTypeId>,
    entries: Vec<EffectTypeInfo>,
}

static INTERNER: Lazy<RwLock<Interner>> = Lazy::new(|| RwLock::new(Interner::default()));

fn intern<F>(key: InternKey, describe: F) -> EffectTypeId
where
    F: FnOnce(EffectTypeId) -> EffectTypeInfo,
{
    {
        let interner = INTERNER.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = interner.ids.get(&key) {
            return *id;
        }
    }

    let mut interner = INTERNER.write().unwrap_or_else(PoisonError::into_inner);
    // Another thread may have interned the key between the two locks
    if let Some(id) = interner.ids.get(&key) {
        return *id;
    }
    let id = next_id(interner.entries.len());
    let info = describe(id);
    tracing::trace!(effect = %info.name, kind = ?info.kind, "interned effect type");
    interner.entries.push(info);
    interner.ids.insert(key, id);
    id
}

// Entries are never evicted, so running out of tokens is unrecoverable
fn next_id(interned: usize) -> EffectTypeId {
    match u32::try_from(interned) {
        Ok(raw) => EffectTypeId(raw),
        Err(_) => panic!("effect type table is full: {} identities already interned", interned),
    }
}

/// A performable operation whose handlers return `Self::Output`.
///
/// Implement this on a plain struct to declare a static effect; the struct's
/// fields are the payload handed to whichever handler is in scope.
///
/// ```rust,ignore
/// struct Log(String);
///
/// impl Effect for Log {
///     type Output = ();
/// }
/// ```
pub trait Effect: Sized + 'static {
    /// The value a handler returns to the performing call site
    type Output: 'static;

    /// Identity shared by every instance of this type, if there is one.
    ///
    /// Dynamic effects return `None`; their identity lives on the instance.
    fn static_effect_type() -> Option<EffectTypeId> {
        Some(declare_effect_type::<Self>())
    }

    /// Identity used to dispatch this instance
    fn effect_type(&self) -> EffectTypeId {
        declare_effect_type::<Self>()
    }
}

/// Identity of the statically declared effect `E`.
pub fn declare_effect_type<E: Effect>() -> EffectTypeId {
    intern(InternKey::Declared(TypeId::of::<E>()), |id| EffectTypeInfo {
        id,
        name: Arc::from(type_name::<E>()),
        kind: EffectKind::Declared,
        result_type: TypeId::of::<E::Output>(),
        result_type_name: type_name::<E::Output>(),
        instance_type: TypeId::of::<E>(),
        instance_type_name: type_name::<E>(),
    })
}

/// Identity of the dynamic effect `name` whose handlers return `T`.
///
/// Calls with an equal `(name, T)` pair return the same token. The same
/// name with a different result type is a different effect.
pub fn named_effect<T: 'static>(name: &str) -> EffectTypeId {
    let name: Arc<str> = Arc::from(name);
    intern(InternKey::Named(name.clone(), TypeId::of::<T>()), |id| EffectTypeInfo {
        id,
        name,
        kind: EffectKind::Named,
        result_type: TypeId::of::<T>(),
        result_type_name: type_name::<T>(),
        instance_type: TypeId::of::<NamedEffect<T>>(),
        instance_type_name: type_name::<NamedEffect<T>>(),
    })
}

/// Snapshot of every effect identity interned so far
pub fn registered_effect_types() -> Vec<EffectTypeInfo> {
    INTERNER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .entries
        .clone()
}

impl EffectTypeId {
    /// Metadata recorded when this identity was interned
    pub fn info(&self) -> EffectTypeInfo {
        let interner = INTERNER.read().unwrap_or_else(PoisonError::into_inner);
        // Tokens are only minted by `intern`, so the index is always present
        interner.entries[self.0 as usize].clone()
    }

    /// Display name of the effect
    pub fn name(&self) -> Arc<str> {
        self.info().name
    }

    /// Declared or named
    pub fn kind(&self) -> EffectKind {
        self.info().kind
    }

    /// Readable name of the declared result type
    pub fn result_type_name(&self) -> &'static str {
        self.info().result_type_name
    }

    /// Raw token value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for EffectTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        match info.kind {
            EffectKind::Declared => write!(f, "{}", info.name),
            EffectKind::Named => write!(f, "{}: {}", info.name, info.result_type_name),
        }
    }
}

impl fmt::Debug for EffectTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EffectTypeId({}, {})", self.0, self)
    }
}

/// An instance of a dynamically named effect.
///
/// The payload is an arbitrary JSON value; the handler bound for the
/// `(name, T)` identity decides how to read it.
pub struct NamedEffect<T> {
    effect_type: EffectTypeId,
    payload: Value,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> NamedEffect<T> {
    /// Create an instance of the named effect with an empty payload
    pub fn new(name: &str) -> Self {
        Self {
            effect_type: named_effect::<T>(name),
            payload: Value::Null,
            _result: PhantomData,
        }
    }

    /// Create an instance carrying an already built JSON payload
    pub fn from_value(name: &str, payload: Value) -> Self {
        Self {
            payload,
            ..Self::new(name)
        }
    }

    /// Attach a serializable payload
    pub fn with_payload<P: Serialize + ?Sized>(mut self, payload: &P) -> Result<Self, BoxError> {
        self.payload = map_error(serde_json::to_value(payload))?;
        Ok(self)
    }

    /// Name this effect was created with
    pub fn name(&self) -> Arc<str> {
        self.effect_type.name()
    }

    /// Raw payload
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserialize the payload into `D`
    pub fn payload_as<D: DeserializeOwned>(&self) -> Result<D, BoxError> {
        map_error(serde_json::from_value(self.payload.clone()))
    }

    /// Take ownership of the payload
    pub fn into_payload(self) -> Value {
        self.payload
    }
}

impl<T: 'static> Effect for NamedEffect<T> {
    type Output = T;

    fn static_effect_type() -> Option<EffectTypeId> {
        None
    }

    fn effect_type(&self) -> EffectTypeId {
        self.effect_type
    }
}

impl<T> Clone for NamedEffect<T> {
    fn clone(&self) -> Self {
        Self {
            effect_type: self.effect_type,
            payload: self.payload.clone(),
            _result: PhantomData,
        }
    }
}

impl<T> fmt::Debug for NamedEffect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedEffect")
            .field("effect_type", &self.effect_type)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Shorthand for [`NamedEffect::new`]
pub fn effect<T: 'static>(name: &str) -> NamedEffect<T> {
    NamedEffect::new(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;

    impl Effect for Ping {
        type Output = u64;
    }

    struct Pong;

    impl Effect for Pong {
        type Output = u64;
    }

    #[test]
    fn test_declared_identity_is_per_type() {
        let ping = declare_effect_type::<Ping>();
        assert_eq!(ping, declare_effect_type::<Ping>());
        assert_eq!(ping, Ping.effect_type());
        assert_eq!(Some(ping), Ping::static_effect_type());
        assert_ne!(ping, declare_effect_type::<Pong>());

        let info = ping.info();
        assert_eq!(info.kind, EffectKind::Declared);
        assert_eq!(info.result_type, TypeId::of::<u64>());
        assert!(info.name.ends_with("Ping"));
    }

    #[test]
    fn test_named_identity_is_memoized_on_name_and_result_type() {
        let a = named_effect::<String>("identity.ask_name");
        let b = named_effect::<String>("identity.ask_name");
        let c = named_effect::<u32>("identity.ask_name");
        let d = named_effect::<String>("identity.ask_age");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.kind(), EffectKind::Named);
        assert_eq!(&*a.name(), "identity.ask_name");
        assert_eq!(a.to_string(), "identity.ask_name: alloc::string::String");
    }

    #[test]
    fn test_named_effect_instances_share_identity() {
        let first = effect::<String>("identity.shared");
        let second = NamedEffect::<String>::new("identity.shared");
        assert_eq!(first.effect_type(), second.effect_type());
        assert_eq!(NamedEffect::<String>::static_effect_type(), None);
    }

    #[test]
    fn test_named_effect_payload() {
        let request = effect::<bool>("identity.payload")
            .with_payload(&vec![1u8, 2, 3])
            .unwrap();
        assert_eq!(request.payload(), &serde_json::json!([1, 2, 3]));
        assert_eq!(request.payload_as::<Vec<u8>>().unwrap(), vec![1, 2, 3]);
        assert!(request.payload_as::<String>().is_err());

        let raw = NamedEffect::<bool>::from_value("identity.payload", serde_json::json!("x"));
        assert_eq!(raw.effect_type(), request.effect_type());
        assert_eq!(raw.into_payload(), serde_json::json!("x"));
    }

    #[test]
    fn test_registered_effect_types_lists_interned_entries() {
        let id = named_effect::<i8>("identity.listed");
        let listed = registered_effect_types();
        assert!(listed.iter().any(|info| info.id == id && &*info.name == "identity.listed"));
    }

    #[test]
    fn test_next_id_tracks_table_length() {
        assert_eq!(next_id(0).as_u32(), 0);
        assert_eq!(next_id(u32::MAX as usize).as_u32(), u32::MAX);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[should_panic(expected = "effect type table is full")]
    fn test_next_id_refuses_to_wrap() {
        next_id(u32::MAX as usize + 1);
    }

    #[test]
    fn test_interning_from_many_threads_agrees() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| named_effect::<()>("identity.threads")))
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
