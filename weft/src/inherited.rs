// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task-inherited data: a typed key-value map carried with each task.
//!
//! A child task captures its parent's map (by shared pointer) at spawn time.
//! Writes are copy-on-write, so mutations on either side never leak into the
//! other. Typical payloads are tracing correlation ids and request metadata.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

type Value = Arc<dyn Any + Send + Sync>;

/// An immutable, cheaply clonable snapshot of per-task data.
#[derive(Clone, Default)]
pub struct AmbientData {
    map: Arc<HashMap<String, Value>>,
}

impl AmbientData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `name`, downcasting to `T`. Returns `None` when the key is
    /// missing or holds a different type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let value = self.map.get(name)?;
        Arc::clone(value).downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert `value` under `name`, cloning the map. Other holders of the
    /// previous snapshot are unaffected.
    pub fn set<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: T) {
        let mut map = HashMap::clone(&self.map);
        map.insert(name.into(), Arc::new(value));
        self.map = Arc::new(map);
    }

    /// Remove `name`, cloning the map. Returns whether the key was present.
    pub fn erase(&mut self, name: &str) -> bool {
        if !self.map.contains_key(name) {
            return false;
        }
        let mut map = HashMap::clone(&self.map);
        map.remove(name);
        self.map = Arc::new(map);
        true
    }
}

impl core::fmt::Debug for AmbientData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmbientData")
            .field("keys", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut data = AmbientData::new();
        data.set("request-id", 42_u64);
        assert_eq!(data.get::<u64>("request-id").as_deref(), Some(&42));
        // wrong type yields nothing
        assert_eq!(data.get::<String>("request-id"), None);
    }

    #[test]
    fn writes_are_copy_on_write() {
        let mut parent = AmbientData::new();
        parent.set("trace", "a".to_owned());

        let mut child = parent.clone();
        child.set("trace", "b".to_owned());
        parent.set("extra", 1_u32);

        assert_eq!(parent.get::<String>("trace").as_deref().map(String::as_str), Some("a"));
        assert_eq!(child.get::<String>("trace").as_deref().map(String::as_str), Some("b"));
        assert!(!child.contains("extra"));
    }

    #[test]
    fn erase_removes_only_locally() {
        let mut parent = AmbientData::new();
        parent.set("k", 1_u8);
        let mut child = parent.clone();

        assert!(child.erase("k"));
        assert!(!child.erase("k"));
        assert!(parent.contains("k"));
    }
}
