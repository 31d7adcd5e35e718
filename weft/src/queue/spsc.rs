// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded single-producer, single-consumer queue.

use super::inner::Core;
pub use super::inner::{PopError, PushError};
use crate::time::Deadline;
use std::sync::Arc;

/// Create a bounded SPSC queue with the given soft capacity limit.
///
/// Both role handles are move-only; duplicating a role is prevented by
/// construction.
pub fn channel<T: Send>(max_len: usize) -> (Producer<T>, Consumer<T>) {
    let core = Arc::new(Core::new(max_len, 1));
    (
        Producer {
            core: Arc::clone(&core),
        },
        Consumer { core },
    )
}

/// The producing side. Exactly one exists per queue.
#[derive(Debug)]
pub struct Producer<T: Send> {
    core: Arc<Core<T>>,
}

impl<T: Send> Producer<T> {
    /// Push an element, parking while the queue is full and the consumer is
    /// alive.
    pub async fn push(&self, value: T, deadline: Deadline) -> Result<(), PushError<T>> {
        self.core.push(value, deadline).await
    }

    /// Push without parking; gives the element back when the queue is full
    /// or the consumer is gone. Does not observe cancellation.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.core.try_push(value)
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the consumer still exists.
    pub fn is_open(&self) -> bool {
        self.core.is_consumer_alive()
    }
}

impl<T: Send> Drop for Producer<T> {
    fn drop(&mut self) {
        self.core.drop_producer();
    }
}

/// The consuming side. Exactly one exists per queue.
#[derive(Debug)]
pub struct Consumer<T: Send> {
    core: Arc<Core<T>>,
}

impl<T: Send> Consumer<T> {
    /// Pop an element, parking while the queue is empty and the producer is
    /// alive. [`PopError::Closed`] is EOF.
    pub async fn pop(&self, deadline: Deadline) -> Result<T, PopError> {
        self.core.pop(deadline).await
    }

    /// Pop without parking. Does not observe cancellation.
    pub fn try_pop(&self) -> Option<T> {
        self.core.try_pop()
    }

    /// Adjust the soft capacity limit.
    pub fn set_max_len(&self, max_len: usize) {
        self.core.set_max_len(max_len);
    }

    pub fn max_len(&self) -> usize {
        self.core.max_len()
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.core.drop_consumer();
    }
}
