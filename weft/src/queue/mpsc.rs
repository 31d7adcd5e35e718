// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded multi-producer, single-consumer queue.
//!
//! Identical contract to [`spsc`](super::spsc), except the producer handle
//! is clonable: the queue counts live producers and the consumer sees EOF
//! only after the last one is gone. Elements pushed by one producer are
//! popped in that producer's push order; pushes of different producers
//! interleave.

use super::inner::Core;
pub use super::inner::{PopError, PushError};
use crate::time::Deadline;
use std::sync::Arc;

/// Create a bounded MPSC queue with the given soft capacity limit.
pub fn channel<T: Send>(max_len: usize) -> (Producer<T>, Consumer<T>) {
    let core = Arc::new(Core::new(max_len, 1));
    (
        Producer {
            core: Arc::clone(&core),
        },
        Consumer { core },
    )
}

/// A producing handle; clone it to add producers.
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

impl<T: Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        self.core.add_producer();
        Self {
            core: Arc::clone(&self.core),
        }
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
    /// Pop an element, parking while the queue is empty and any producer is
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_after_last_producer() {
        let (tx, rx) = channel::<u8>(8);
        let tx2 = tx.clone();

        tx.try_push(1).unwrap();
        tx2.try_push(2).unwrap();
        drop(tx);

        // one producer still alive: not EOF
        assert_eq!(rx.try_pop(), Some(1));
        drop(tx2);

        // drain the tail, then EOF
        assert_eq!(rx.try_pop(), Some(2));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let (tx_a, rx) = channel::<(u8, u32)>(64);
        let tx_b = tx_a.clone();

        for i in 0..10 {
            tx_a.try_push((0, i)).unwrap();
            tx_b.try_push((1, i)).unwrap();
        }

        let mut last = [None::<u32>; 2];
        while let Some((producer, i)) = rx.try_pop() {
            let slot = &mut last[producer as usize];
            assert!(slot.map_or(true, |prev| prev < i));
            *slot = Some(i);
        }
        assert_eq!(last, [Some(9), Some(9)]);
    }
}
