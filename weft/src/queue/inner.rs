// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared body of the bounded SP/MP-SC queues.
//!
//! The element store is a node-based lock-free queue; the capacity bound is
//! enforced with a separate size counter (a soft limit), a single-consumer
//! [`Event`] on the "nonempty" side, and a wait list on the "nonfull" side
//! so that many producers can park.

use crate::sync::event::Event;
use crate::sync::wait::{park, WakeSource};
use crate::sync::wait_queue::WaitQueue;
use crate::time::Deadline;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

/// Why a blocking push gave the element back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError<T> {
    /// The consumer is gone; nothing will ever drain the queue.
    #[error("queue consumer is gone")]
    Closed(T),

    /// The deadline was reached while the queue stayed full.
    #[error("push deadline reached")]
    Timeout(T),

    /// The pushing task was cancelled.
    #[error("pushing task cancelled")]
    Cancelled(T),
}

impl<T> PushError<T> {
    /// Recover the element that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Closed(value)
            | PushError::Timeout(value)
            | PushError::Cancelled(value) => value,
        }
    }
}

/// Why a blocking pop returned nothing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// All producers are gone and the queue is drained.
    #[error("queue producers are gone and the queue is empty")]
    Closed,

    /// The deadline was reached while the queue stayed empty.
    #[error("pop deadline reached")]
    Timeout,

    /// The popping task was cancelled.
    #[error("popping task cancelled")]
    Cancelled,
}

pub(super) struct Core<T> {
    queue: SegQueue<T>,
    size: AtomicUsize,
    max_len: AtomicUsize,
    consumer_alive: AtomicBool,
    producer_alive: AtomicBool,
    /// Live producer handles (1 for SPSC, refcounted for MPSC).
    producers: AtomicUsize,
    nonempty: Event,
    nonfull: WaitQueue,
}

impl<T: Send> Core<T> {
    pub(super) fn new(max_len: usize, producers: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            size: AtomicUsize::new(0),
            max_len: AtomicUsize::new(max_len),
            consumer_alive: AtomicBool::new(true),
            producer_alive: AtomicBool::new(true),
            producers: AtomicUsize::new(producers),
            nonempty: Event::new(),
            nonfull: WaitQueue::new(),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub(super) fn max_len(&self) -> usize {
        self.max_len.load(Ordering::SeqCst)
    }

    /// Raise or lower the soft limit. May spuriously wake parked producers;
    /// that is race-free, they re-check.
    pub(super) fn set_max_len(&self, max_len: usize) {
        self.max_len.store(max_len, Ordering::SeqCst);
        self.nonfull.wake_all();
    }

    pub(super) fn is_consumer_alive(&self) -> bool {
        self.consumer_alive.load(Ordering::SeqCst)
    }

    pub(super) fn is_producer_alive(&self) -> bool {
        self.producer_alive.load(Ordering::SeqCst)
    }

    /// Push, parking while the queue is full and the consumer lives.
    pub(super) async fn push(&self, value: T, deadline: Deadline) -> Result<(), PushError<T>> {
        loop {
            if !self.is_consumer_alive() {
                return Err(PushError::Closed(value));
            }
            if self.size.load(Ordering::SeqCst) < self.max_len() {
                return self.do_push(value);
            }

            // join the nonfull wait list before re-checking, so a pop that
            // frees a slot in between cannot be missed
            let mut wait = core::pin::pin!(self.nonfull.wait());
            if wait.as_mut().subscribe().is_ready() {
                continue;
            }
            if !self.is_consumer_alive() || self.size.load(Ordering::SeqCst) < self.max_len() {
                continue;
            }

            match park(deadline, wait).await {
                WakeSource::Ready => continue,
                WakeSource::Timeout => return Err(PushError::Timeout(value)),
                WakeSource::Cancelled => return Err(PushError::Cancelled(value)),
            }
        }
    }

    /// Push without parking. Fails on a full queue or dead consumer.
    pub(super) fn try_push(&self, value: T) -> Result<(), T> {
        if self.size.load(Ordering::SeqCst) >= self.max_len() {
            return Err(value);
        }
        self.do_push(value).map_err(PushError::into_inner)
    }

    fn do_push(&self, value: T) -> Result<(), PushError<T>> {
        if !self.is_consumer_alive() {
            return Err(PushError::Closed(value));
        }
        self.size.fetch_add(1, Ordering::SeqCst);
        self.queue.push(value);
        self.nonempty.send();
        Ok(())
    }

    /// Pop, parking while the queue is empty and a producer lives.
    ///
    /// When the wait ends for another reason (EOF, deadline, cancellation),
    /// one final pop is attempted: a producer may have pushed between our
    /// last check and its death.
    pub(super) async fn pop(&self, deadline: Deadline) -> Result<T, PopError> {
        loop {
            if let Some(value) = self.do_pop() {
                return Ok(value);
            }
            if !self.is_producer_alive() {
                return self.do_pop().ok_or(PopError::Closed);
            }

            match self.nonempty.wait(deadline).await {
                WakeSource::Ready => continue,
                WakeSource::Timeout => return self.do_pop().ok_or(PopError::Timeout),
                WakeSource::Cancelled => return self.do_pop().ok_or(PopError::Cancelled),
            }
        }
    }

    /// Pop without parking.
    pub(super) fn try_pop(&self) -> Option<T> {
        self.do_pop()
    }

    fn do_pop(&self) -> Option<T> {
        let value = self.queue.pop()?;
        self.size.fetch_sub(1, Ordering::SeqCst);
        self.nonfull.wake();
        Some(value)
    }

    pub(super) fn add_producer(&self) {
        self.producers.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn drop_producer(&self) {
        if self.producers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.producer_alive.store(false, Ordering::SeqCst);
            // EOF: wake the consumer so it observes the dead producer
            self.nonempty.send();
        }
    }

    pub(super) fn drop_consumer(&self) {
        self.consumer_alive.store(false, Ordering::SeqCst);
        // unblock all parked producers (and any future nonfull waits); the
        // push loop re-checks liveness and fails
        self.nonfull.close();
    }
}

impl<T: Send> core::fmt::Debug for Core<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("max_len", &self.max_len())
            .field("consumer_alive", &self.is_consumer_alive())
            .field("producer_alive", &self.is_producer_alive())
            .finish_non_exhaustive()
    }
}

// Leftover elements are dropped by the `SegQueue` when the last role handle
// releases the core; no manual drain is needed.
