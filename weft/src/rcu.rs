// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Read-copy-update shared state.
//!
//! Readers take an immutable snapshot in O(1), wait-free, and may hold it
//! for as long as they like; the snapshot never mutates under them. Writers
//! clone the current snapshot, mutate the clone, and publish it atomically.
//! Writers are serialized by a task mutex, so acquiring the write side under
//! contention is a suspension point; publications are totally ordered.

use crate::error::AcquireError;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::time::Deadline;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A shared variable with RCU semantics.
pub struct RcuVariable<V> {
    current: ArcSwap<V>,
    writer: Mutex<()>,
}

impl<V> RcuVariable<V> {
    pub fn new(value: V) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
            writer: Mutex::new(()),
        }
    }

    /// Take a snapshot of the current value. Wait-free.
    pub fn read(&self) -> Arc<V> {
        self.current.load_full()
    }
}

impl<V: Clone> RcuVariable<V> {
    /// Open a write transaction over a clone of the current snapshot.
    ///
    /// Blocks (as a task) while another writer is active. Dropping the
    /// transaction without [`commit`](WriteTxn::commit) discards the
    /// changes.
    pub async fn start_write(&self, deadline: Deadline) -> Result<WriteTxn<'_, V>, AcquireError> {
        let guard = self.writer.lock(deadline).await?;
        let value = V::clone(&self.read());
        Ok(WriteTxn {
            var: self,
            value: Some(value),
            _guard: guard,
        })
    }

    /// Replace the value wholesale. Equivalent to an empty-read write
    /// transaction; serialized with other writers and not interruptible by
    /// cancellation.
    pub async fn assign(&self, value: V) {
        let blocker = crate::task::current_task::block_cancellation();
        let guard = match self.writer.lock(Deadline::NEVER).await {
            Ok(guard) => guard,
            Err(err) => unreachable!("uncancellable lock without deadline failed: {err}"),
        };
        self.current.store(Arc::new(value));
        drop(guard);
        drop(blocker);
    }
}

impl<V: core::fmt::Debug> core::fmt::Debug for RcuVariable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RcuVariable")
            .field("current", &self.read())
            .finish_non_exhaustive()
    }
}

/// An open write transaction on an [`RcuVariable`].
///
/// Derefs to the writable clone; `commit` publishes it.
pub struct WriteTxn<'a, V> {
    var: &'a RcuVariable<V>,
    value: Option<V>,
    _guard: MutexGuard<'a, ()>,
}

impl<V> WriteTxn<'_, V> {
    /// Publish the mutated snapshot. Readers that already hold the previous
    /// snapshot keep it until they drop it.
    pub fn commit(mut self) {
        let value = self.value.take().expect("write transaction already committed");
        self.var.current.store(Arc::new(value));
    }
}

impl<V> core::ops::Deref for WriteTxn<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value.as_ref().expect("write transaction already committed")
    }
}

impl<V> core::ops::DerefMut for WriteTxn<'_, V> {
    fn deref_mut(&mut self) -> &mut V {
        self.value.as_mut().expect("write transaction already committed")
    }
}

/// A map with RCU-protected keyset and shared-ownership values.
///
/// Only keyset changes are synchronized here: values are `Arc`s that can be
/// held past any snapshot's lifetime, and interior mutation of a value is
/// the caller's responsibility. Iteration goes over a frozen snapshot.
pub struct RcuMap<K, V> {
    inner: RcuVariable<HashMap<K, Arc<V>>>,
}

impl<K, V> RcuMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RcuVariable::new(HashMap::new()),
        }
    }

    /// Look up a value in the current snapshot.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.read().get(key).cloned()
    }

    /// Approximate size of the map at some point in time.
    pub fn len_approx(&self) -> usize {
        self.inner.read().len()
    }

    /// A frozen snapshot of the whole map.
    pub fn snapshot(&self) -> Arc<HashMap<K, Arc<V>>> {
        self.inner.read()
    }

    /// Iterate over a frozen snapshot taken now. Concurrent keyset changes
    /// do not affect the iteration.
    pub fn iter(&self) -> impl Iterator<Item = (K, Arc<V>)> {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Insert a value, returning the previous one if the key existed.
    pub async fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        let mut txn = self.write().await;
        let prev = txn.insert(key, Arc::new(value));
        txn.commit();
        prev
    }

    /// Fetch the value for `key`, default-inserting it if absent.
    pub async fn get_or_insert_default(&self, key: K) -> Arc<V>
    where
        V: Default,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let mut txn = self.write().await;
        if let Some(value) = txn.get(&key) {
            // another writer inserted it before we took the write lock
            let value = Arc::clone(value);
            return value;
        }
        let value = Arc::new(V::default());
        txn.insert(key, Arc::clone(&value));
        txn.commit();
        value
    }

    /// Remove a key. Returns whether it was present.
    pub async fn erase(&self, key: &K) -> bool {
        self.pop(key).await.is_some()
    }

    /// Remove a key, returning its value.
    pub async fn pop(&self, key: &K) -> Option<Arc<V>> {
        if !self.inner.read().contains_key(key) {
            return None;
        }
        let mut txn = self.write().await;
        let prev = txn.remove(key);
        if prev.is_some() {
            txn.commit();
        }
        prev
    }

    /// Reset the map to an empty state.
    pub async fn clear(&self) {
        self.inner.assign(HashMap::new()).await;
    }

    async fn write(&self) -> WriteTxn<'_, HashMap<K, Arc<V>>> {
        let blocker = crate::task::current_task::block_cancellation();
        let txn = match self.inner.start_write(Deadline::NEVER).await {
            Ok(txn) => txn,
            Err(err) => unreachable!("uncancellable lock without deadline failed: {err}"),
        };
        drop(blocker);
        txn
    }
}

impl<K: Eq + Hash + Clone, V> Default for RcuMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> core::fmt::Debug for RcuMap<K, V>
where
    K: Eq + Hash + Clone + core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RcuMap")
            .field("len", &self.len_approx())
            .finish_non_exhaustive()
    }
}
