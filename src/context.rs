//! Provide a [`Context`] for the request lifecycle.
//!
//! Requests carry a context as they are batched and executed. The context is
//! shared between the constituent request and the combined upstream call made
//! on its behalf, so entries written by the caller are visible to the
//! transport executor.

use std::sync::Arc;

use dashmap::DashMap;

use crate::json_ext::Value;

/// Holds [`Context`] entries, shared across clones of the same context.
pub(crate) type Entries = Arc<DashMap<String, Value>>;

/// Context for a request, shared by reference between the caller and the
/// executor. Cloning the context does not duplicate its entries.
#[derive(Clone, Debug, Default)]
pub struct Context {
    entries: Entries,
}

impl Context {
    /// Create a new context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the context, returning the previous value for the
    /// key if there was one.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Get a clone of the value for a key, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Whether the context holds an entry for the key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_shared_between_clones() {
        let context = Context::new();
        let clone = context.clone();
        context.insert("batch", 1);
        assert_eq!(clone.get("batch"), Some(Value::from(1)));
        assert!(clone.contains_key("batch"));
        assert!(!clone.contains_key("other"));
    }
}
