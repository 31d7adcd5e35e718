// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task contexts: the scheduling record for one logical asynchronous
//! computation.
//!
//! A spawned future is wrapped in a [`Core`], a reference-counted allocation
//! holding the future itself, a [`Header`] with the scheduling state, and a
//! shared output slot read by the [`JoinHandle`]. The ready queues hold
//! type-erased [`TaskRef`]s; the concrete future type is only known to the
//! `Core`, which is also the task's [`Waker`].

pub mod current_task;
mod id;
mod join;
mod state;

pub use id::Id;
pub use join::{JoinError, JoinHandle};

pub(crate) use join::OutputSlot;
pub(crate) use state::{PollResult, State, WakeAction};

use crate::inherited::AmbientData;
use crate::pool::ContextSlot;
use crate::proc;
use crate::time::Deadline;
use core::fmt;
use core::future::Future;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Why a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelReason {
    /// Explicit request through a handle or the parent scope.
    User = 1,
    /// The task's deadline was reached.
    Deadline = 2,
    /// The task processor shed it under overload.
    Overload = 3,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelReason::User => "user",
            CancelReason::Deadline => "deadline",
            CancelReason::Overload => "overload",
        })
    }
}

/// Error returned by [`current_task::cancellation_point`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled ({reason})")]
pub struct Cancelled {
    pub reason: CancelReason,
}

/// Sticky cancellation state. Once requested, never cleared.
pub(crate) struct CancelCell(AtomicU8);

impl CancelCell {
    const NOT_REQUESTED: u8 = 0;

    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(Self::NOT_REQUESTED))
    }

    /// Request cancellation. Only the first request wins; returns whether
    /// this call was it.
    pub(crate) fn request(&self, reason: CancelReason) -> bool {
        self.0
            .compare_exchange(
                Self::NOT_REQUESTED,
                reason as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn get(&self) -> Option<CancelReason> {
        match self.0.load(Ordering::SeqCst) {
            Self::NOT_REQUESTED => None,
            1 => Some(CancelReason::User),
            2 => Some(CancelReason::Deadline),
            3 => Some(CancelReason::Overload),
            bits => unreachable!("invalid cancellation state: {bits}"),
        }
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) != Self::NOT_REQUESTED
    }
}

impl fmt::Debug for CancelCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelCell").field(&self.get()).finish()
    }
}

/// The type-erased part of a task context.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) id: Id,
    pub(crate) state: State,
    pub(crate) cancel: CancelCell,
    /// Depth of active cancellation blockers; while non-zero, suspension
    /// points do not observe the cancellation flag.
    pub(crate) cancel_mask: AtomicUsize,
    deadline: Mutex<Deadline>,
    inherited: Mutex<AmbientData>,
    pub(crate) proc: Arc<proc::Shared>,
    pub(crate) span: tracing::Span,
}

impl Header {
    pub(crate) fn deadline(&self) -> Deadline {
        *self.deadline.lock()
    }

    pub(crate) fn set_deadline(&self, deadline: Deadline) {
        *self.deadline.lock() = deadline;
    }

    pub(crate) fn inherited(&self) -> AmbientData {
        self.inherited.lock().clone()
    }

    pub(crate) fn set_inherited(&self, data: AmbientData) {
        *self.inherited.lock() = data;
    }

    pub(crate) fn cancel_masked(&self) -> bool {
        self.cancel_mask.load(Ordering::Acquire) > 0
    }
}

/// Object-safe view of a [`Core`].
pub(crate) trait Erased: Send + Sync + 'static {
    fn header(&self) -> &Header;
    fn run(self: Arc<Self>);
}

/// A type-erased, reference-counted handle to a spawned task.
#[derive(Clone)]
pub(crate) struct TaskRef(Arc<dyn Erased>);

impl TaskRef {
    pub(crate) fn id(&self) -> Id {
        self.header().id
    }

    pub(crate) fn header(&self) -> &Header {
        self.0.header()
    }

    /// Poll the task once on the calling worker thread.
    pub(crate) fn run(self) {
        self.0.run();
    }

    /// Make the task ready, enqueueing it if it is not already queued,
    /// running, or complete.
    pub(crate) fn wake_by_ref(&self) {
        if self.header().state.transition_to_woken() == WakeAction::Enqueue {
            self.header().proc.enqueue(self.clone());
        }
    }

    /// Request cancellation. Sticky; wakes the task so the cancellation is
    /// observed at its next suspension point. Returns whether this call was
    /// the first to request it.
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        let newly = self.header().cancel.request(reason);
        if newly && !self.header().state.is_complete() {
            tracing::trace!(task.id = %self.id(), %reason, "cancelling task");
            self.wake_by_ref();
        }
        newly
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef").field("id", &self.id()).finish()
    }
}

/// The lifecycle stage of the wrapped future.
enum Stage<F: core::future::Future> {
    /// Still pending. The context slot returns to the pool when the stage
    /// leaves this state.
    Pending(F, ContextSlot),
    /// The future has completed (or was dropped by cancellation-before-start
    /// or a panic) and its output moved to the output slot.
    Consumed,
}

impl<F: core::future::Future> Stage<F> {
    /// Poll the future, catching panics. On completion the future is dropped
    /// in place and its output (or the panic) is returned.
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<F::Output, JoinError>> {
        let Stage::Pending(future, _) = &mut *self else {
            unreachable!("task polled after completion");
        };

        // Safety: the future lives inside the `Arc<Core>` allocation and is
        // never moved out of the `Stage`; dropping it in place on completion
        // is allowed for pinned values.
        let future = unsafe { Pin::new_unchecked(future) };
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| future.poll(cx)));

        match result {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => {
                *self = Stage::Consumed;
                Poll::Ready(Ok(output))
            }
            Err(payload) => {
                *self = Stage::Consumed;
                Poll::Ready(Err(JoinError::Panicked(panic_message(payload.as_ref()))))
            }
        }
    }

    /// Drop the future without polling it (cancellation before start).
    fn discard(&mut self) {
        *self = Stage::Consumed;
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// The typed task allocation: header + future + output slot.
pub(crate) struct Core<F: core::future::Future> {
    header: Header,
    /// The future (or nothing, once completed). The scheduling state word
    /// guarantees at most one worker polls at a time; the mutex makes that
    /// guarantee local and keeps `Core: Sync` without unsafe cells.
    stage: Mutex<Stage<F>>,
    output: Arc<OutputSlot<F::Output>>,
}

impl<F> Core<F>
where
    F: core::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn finish(&self, output: Result<F::Output, JoinError>) {
        // A join handle holds the second reference to the output slot; if it
        // is gone, this failure would vanish silently, so log it instead.
        if Arc::strong_count(&self.output) == 1 {
            if let Err(err) = &output {
                tracing::error!(task.id = %self.header.id, %err, "abandoned task failed");
            }
        }
        self.output.set(output);
        self.header.proc.on_task_complete();
    }
}

impl<F> Erased for Core<F>
where
    F: core::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn header(&self) -> &Header {
        &self.header
    }

    fn run(self: Arc<Self>) {
        let header = &self.header;
        let _entered = header.span.clone().entered();

        // A task cancelled before its first poll completes immediately; the
        // future is dropped without running.
        if !header.state.has_started() {
            if let Some(reason) = header.cancel.get() {
                tracing::trace!(task.id = %header.id, %reason, "cancelled before first poll");
                self.stage.lock().discard();
                header.state.complete();
                self.finish(Err(JoinError::Cancelled(reason)));
                return;
            }
        }

        if !header.state.start_poll() {
            return;
        }

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let _current = current_task::enter(TaskRef(Arc::clone(&self) as Arc<dyn Erased>));
            self.stage.lock().poll(&mut cx)
        };

        match poll {
            Poll::Ready(output) => {
                header.state.complete();
                self.finish(output);
            }
            Poll::Pending => {
                if header.state.end_poll() == PollResult::PendingSchedule {
                    header
                        .proc
                        .enqueue(TaskRef(Arc::clone(&self) as Arc<dyn Erased>));
                }
            }
        }
    }
}

impl<F> std::task::Wake for Core<F>
where
    F: core::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        TaskRef(self as Arc<dyn Erased>).wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        TaskRef(Arc::clone(self) as Arc<dyn Erased>).wake_by_ref();
    }
}

/// Construct a task context bound to `proc`.
///
/// The task is *not* enqueued; the caller transitions it to queued (after
/// applying overload policy) and pushes it.
#[track_caller]
pub(crate) fn new_task<F>(
    proc: Arc<proc::Shared>,
    future: F,
    slot: ContextSlot,
    deadline: Deadline,
    inherited: AmbientData,
) -> (TaskRef, JoinHandle<F::Output>)
where
    F: core::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    let id = Id::next();
    let location = core::panic::Location::caller();
    let span = tracing::trace_span!(
        "task",
        task.tid = id.as_u64(),
        task.processor = %proc.name,
        loc.file = location.file(),
        loc.line = location.line(),
    );

    let output = Arc::new(OutputSlot::new());
    let core = Arc::new(Core {
        header: Header {
            id,
            state: State::new(),
            cancel: CancelCell::new(),
            cancel_mask: AtomicUsize::new(0),
            deadline: Mutex::new(deadline),
            inherited: Mutex::new(inherited),
            proc,
            span,
        },
        stage: Mutex::new(Stage::Pending(future, slot)),
        output: Arc::clone(&output),
    });

    let task = TaskRef(core as Arc<dyn Erased>);
    let join = JoinHandle::new(task.clone(), output);
    (task, join)
}
