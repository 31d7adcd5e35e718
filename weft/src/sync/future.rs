// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-value channel: a [`Promise`] publishes exactly one value (or
//! error) to its [`Future`].
//!
//! Dropping a promise without setting a value breaks it: the future observes
//! [`FutureError::BrokenPromise`]. The future may be retrieved from the
//! promise once, and its value consumed once; everything else fails
//! deterministically rather than racing.

use crate::sync::wait::{park, WakeSource};
use crate::sync::wait_cell::{PollWaitError, WaitCell};
use crate::time::Deadline;
use core::future::Future as StdFuture;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Errors of the promise (producer) side.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PromiseError {
    /// A value or error has already been set.
    #[error("promise already satisfied")]
    AlreadySet,

    /// [`Promise::future`] was already called.
    #[error("future already retrieved")]
    FutureAlreadyRetrieved,
}

/// Errors observed by the future (consumer) side.
#[derive(Debug, Error, Clone)]
pub enum FutureError {
    /// The promise was dropped without setting a value.
    #[error("broken promise")]
    BrokenPromise,

    /// The promise published an error payload.
    #[error("promise failed: {0}")]
    Failed(#[source] Arc<dyn core::error::Error + Send + Sync>),

    /// The deadline passed before a value arrived.
    #[error("wait deadline reached")]
    Timeout,

    /// The waiting task was cancelled.
    #[error("task cancelled while waiting")]
    Cancelled,
}

struct Shared<T> {
    ready: AtomicBool,
    slot: Mutex<Option<Result<T, FutureError>>>,
    waiter: WaitCell,
    retrieved: AtomicBool,
}

impl<T> Shared<T> {
    fn set(&self, value: Result<T, FutureError>) -> Result<(), PromiseError> {
        {
            let mut slot = self.slot.lock();
            if self.ready.load(Ordering::Acquire) {
                return Err(PromiseError::AlreadySet);
            }
            *slot = Some(value);
            self.ready.store(true, Ordering::Release);
        }
        self.waiter.wake();
        Ok(())
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if self.ready.load(Ordering::Acquire) {
                return Poll::Ready(());
            }
            match self.waiter.poll_wait(cx) {
                Poll::Ready(Ok(())) => continue,
                Poll::Ready(Err(PollWaitError::Closed)) => continue,
                Poll::Ready(Err(PollWaitError::Busy)) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn take(&self) -> Result<T, FutureError> {
        self.slot
            .lock()
            .take()
            .expect("future value already consumed")
    }
}

/// Producer side of the single-value channel.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                ready: AtomicBool::new(false),
                slot: Mutex::new(None),
                waiter: WaitCell::new(),
                retrieved: AtomicBool::new(false),
            }),
        }
    }

    /// Retrieve the [`Future`] paired with this promise. May be called once.
    pub fn future(&self) -> Result<Future<T>, PromiseError> {
        if self.shared.retrieved.swap(true, Ordering::AcqRel) {
            return Err(PromiseError::FutureAlreadyRetrieved);
        }
        Ok(Future {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Publish a value. Succeeds exactly once per promise.
    pub fn set_value(&self, value: T) -> Result<(), PromiseError> {
        self.shared.set(Ok(value))
    }

    /// Publish an error payload instead of a value.
    pub fn set_error(
        &self,
        error: impl Into<Box<dyn core::error::Error + Send + Sync>>,
    ) -> Result<(), PromiseError> {
        self.shared
            .set(Err(FutureError::Failed(Arc::from(error.into()))))
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // unset promise: whoever waits on the future learns it is broken
        let _ = self.shared.set(Err(FutureError::BrokenPromise));
    }
}

impl<T> core::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.shared.ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Consumer side of the single-value channel.
///
/// `get` consumes the value; it can be observed exactly once.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Future<T> {
    /// Whether a value (or error) has been published.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Park until the value is available, the deadline passes, or the task
    /// is cancelled. Does not consume the value.
    pub async fn wait(&self, deadline: Deadline) -> WakeSource {
        let shared = &self.shared;
        park(deadline, core::future::poll_fn(|cx| shared.poll_ready(cx))).await
    }

    /// Wait for and consume the value.
    pub async fn get(self) -> Result<T, FutureError> {
        self.get_until(Deadline::NEVER).await
    }

    /// Deadline-bound [`get`](Self::get).
    pub async fn get_until(self, deadline: Deadline) -> Result<T, FutureError> {
        match self.wait(deadline).await {
            WakeSource::Ready => self.shared.take(),
            WakeSource::Timeout => Err(FutureError::Timeout),
            WakeSource::Cancelled => Err(FutureError::Cancelled),
        }
    }
}

impl<T> StdFuture for Future<T> {
    type Output = Result<T, FutureError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        core::task::ready!(self.shared.poll_ready(cx));
        Poll::Ready(self.shared.take())
    }
}

impl<T> Unpin for Future<T> {}

impl<T> core::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_value_roundtrip() {
        let promise = Promise::new();
        let future = promise.future().unwrap();
        promise.set_value(42).unwrap();
        assert!(future.is_ready());
        assert_eq!(futures::executor::block_on(future.get()).unwrap(), 42);
    }

    #[test]
    fn second_set_fails() {
        let promise = Promise::new();
        promise.set_value(1).unwrap();
        assert_eq!(promise.set_value(2), Err(PromiseError::AlreadySet));
        assert_eq!(
            promise.set_error(std::io::Error::other("nope")),
            Err(PromiseError::AlreadySet)
        );
    }

    #[test]
    fn future_retrieved_once() {
        let promise = Promise::<u32>::new();
        let _future = promise.future().unwrap();
        assert_eq!(
            promise.future().unwrap_err(),
            PromiseError::FutureAlreadyRetrieved
        );
    }

    #[test]
    fn dropping_unset_promise_breaks_it() {
        let promise = Promise::<u32>::new();
        let future = promise.future().unwrap();
        drop(promise);
        assert!(matches!(
            futures::executor::block_on(future.get()),
            Err(FutureError::BrokenPromise)
        ));
    }

    #[test]
    fn set_error_surfaces_payload() {
        let promise = Promise::<u32>::new();
        let future = promise.future().unwrap();
        promise.set_error(std::io::Error::other("backend down")).unwrap();
        match futures::executor::block_on(future.get()) {
            Err(FutureError::Failed(err)) => {
                assert!(err.to_string().contains("backend down"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
