// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::wait::{self, WakeSource};
use crate::sync::wait_cell::{PollWaitError, WaitCell};
use crate::task::{CancelReason, Id, TaskRef};
use crate::time::Deadline;
use core::fmt;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Error produced when a joined task did not return a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The task was cancelled before it could produce a value.
    #[error("task was cancelled ({0})")]
    Cancelled(CancelReason),

    /// The task body panicked. The payload's message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl JoinError {
    /// The cancellation reason, if this error is a cancellation.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            JoinError::Cancelled(reason) => Some(*reason),
            JoinError::Panicked(_) => None,
        }
    }
}

/// Single-shot slot the task publishes its result into, shared between the
/// task core and its [`JoinHandle`].
pub(crate) struct OutputSlot<T> {
    ready: AtomicBool,
    slot: Mutex<Option<Result<T, JoinError>>>,
    waiter: WaitCell,
}

impl<T> OutputSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            slot: Mutex::new(None),
            waiter: WaitCell::new(),
        }
    }

    /// Publish the task's result and wake the joiner. Called exactly once,
    /// by the completing worker.
    pub(crate) fn set(&self, output: Result<T, JoinError>) {
        *self.slot.lock() = Some(output);
        self.ready.store(true, Ordering::Release);
        self.waiter.wake();
    }

    fn poll_complete(&self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if self.ready.load(Ordering::Acquire) {
                return Poll::Ready(());
            }
            match self.waiter.poll_wait(cx) {
                Poll::Ready(Ok(())) => continue,
                // the cell only closes when the slot is dropped, which
                // cannot happen while we hold it
                Poll::Ready(Err(PollWaitError::Closed)) => continue,
                Poll::Ready(Err(PollWaitError::Busy)) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError>> {
        core::task::ready!(self.poll_complete(cx));
        Poll::Ready(
            self.slot
                .lock()
                .take()
                .expect("JoinHandle polled after the output was consumed"),
        )
    }
}

/// Owner side of a spawned task.
///
/// Awaiting the handle joins the task: it yields the task's output or a
/// [`JoinError`]. Dropping the handle detaches the task; it keeps running,
/// and if it then fails, the error is logged through the abandoned-error
/// path. The output can be consumed exactly once.
pub struct JoinHandle<T> {
    task: TaskRef,
    output: Arc<OutputSlot<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef, output: Arc<OutputSlot<T>>) -> Self {
        Self { task, output }
    }

    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Request cancellation of the task. The task observes it at its next
    /// suspension point. Returns whether this was the first cancellation
    /// request.
    pub fn cancel(&self) -> bool {
        self.task.cancel(CancelReason::User)
    }

    /// Detach the task: it keeps running without a joiner.
    pub fn detach(self) {}

    /// Whether the task has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.task.header().state.is_complete()
    }

    /// Wait for the task to finish, without consuming the output.
    ///
    /// Returns [`WakeSource::Ready`] once the task completed, or
    /// `Timeout` / `Cancelled` per the usual wait contract.
    pub async fn wait(&self, deadline: Deadline) -> WakeSource {
        let output = &self.output;
        wait::park(
            deadline,
            core::future::poll_fn(|cx| output.poll_complete(cx)),
        )
        .await
    }
}

impl<T> core::future::Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.output.poll_join(cx)
    }
}

impl<T> Unpin for JoinHandle<T> {}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task)
            .field("finished", &self.is_finished())
            .finish()
    }
}
