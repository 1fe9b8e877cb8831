//! Shared execution context and run parameters.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Read-only parameters passed alongside the context to every step.
pub type Params = serde_json::Map<String, Value>;

string_name! {
    /// Key of a [`Context`] entry.
    ContextKey
}

/// Producer-output channel installed on a [`Context`] while a run is streamed.
#[derive(Clone)]
pub struct Emitter(Arc<dyn Fn(Value) + Send + Sync>);

impl Emitter {
    /// Creates an emitter forwarding every value to `sink`.
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Self(Arc::new(sink))
    }

    /// Forwards a value.
    pub fn emit(&self, value: Value) {
        (self.0)(value)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Emitter(..)")
    }
}

/// Mutable state shared by every step of a run.
///
/// Values are stored as [`serde_json::Value`], which keeps the context
/// cloneable for isolated fan-out drafts and serializable for interrupt
/// snapshots.
///
/// # Examples
///
/// ```
/// use hataori_core::Context;
///
/// let mut ctx = Context::new();
///
/// ctx.insert("user_id", 123);
/// ctx.insert("name", "Alice");
/// ctx.insert("active", true);
///
/// assert_eq!(ctx.get_as::<u64>("user_id"), Some(123));
/// assert_eq!(ctx.get_as::<String>("name"), Some("Alice".to_string()));
/// assert_eq!(ctx.get("active"), Some(&serde_json::Value::Bool(true)));
///
/// // Wrong type returns None
/// assert_eq!(ctx.get_as::<String>("user_id"), None);
/// ```
#[derive(Clone, Default)]
pub struct Context {
    data: HashMap<ContextKey, Value>,
    emitter: Option<Emitter>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("data", &self.data)
            .field("streaming", &self.emitter.is_some())
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Context {
    /// Creates a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a context from a [`snapshot`](Self::snapshot).
    ///
    /// Non-object snapshots yield an empty context.
    pub fn from_snapshot(snapshot: Value) -> Self {
        let data = match snapshot {
            Value::Object(entries) => entries
                .into_iter()
                .map(|(key, value)| (ContextKey::from(key), value))
                .collect(),
            _ => HashMap::new(),
        };
        Self {
            data,
            emitter: None,
        }
    }

    /// Inserts a value, returning the previous one for that key.
    pub fn insert(&mut self, key: impl Into<ContextKey>, value: impl Into<Value>) -> Option<Value> {
        self.data.insert(key.into(), value.into())
    }

    /// Returns a reference to the raw value for the given key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Deserializes the value for the given key.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|value| T::deserialize(value).ok())
    }

    /// Returns a mutable reference to the raw value for the given key.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.data.get_mut(key)
    }

    /// Removes a value by key and returns it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Returns `true` if the context contains a value for the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Returns an iterator over all keys in the context.
    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.data.keys()
    }

    /// Returns the number of entries in the context.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the context contains no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serializes every entry into a JSON object.
    pub fn snapshot(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        )
    }

    /// Pushes a value to the active stream consumer.
    ///
    /// Returns `false` when the run is not being streamed, in which case the
    /// value is dropped.
    pub fn emit(&self, value: impl Into<Value>) -> bool {
        match &self.emitter {
            Some(emitter) => {
                emitter.emit(value.into());
                true
            }
            None => false,
        }
    }

    /// Replaces the producer-output channel, returning the previous one.
    pub fn set_emitter(&mut self, emitter: Option<Emitter>) -> Option<Emitter> {
        std::mem::replace(&mut self.emitter, emitter)
    }
}
