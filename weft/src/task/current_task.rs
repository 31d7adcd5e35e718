// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Operations on the task that is currently being polled.
//!
//! These free functions read a poll-scoped thread-local that workers set
//! around every poll. Outside a task they degrade gracefully: cancellation
//! checks report "not cancelled", the deadline is `NEVER`, and the inherited
//! data map is empty.

use crate::inherited::AmbientData;
use crate::task::{CancelReason, Cancelled, Id, TaskRef};
use crate::time::Deadline;
use core::cell::RefCell;
use core::pin::Pin;
use core::sync::atomic::Ordering;
use core::task::{Context, Poll};
use std::sync::Arc;

std::thread_local! {
    static CURRENT: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

/// Install `task` as the current task for the duration of the returned
/// guard (i.e. one poll).
pub(crate) fn enter(task: TaskRef) -> CurrentGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(task));
    CurrentGuard { prev }
}

pub(crate) struct CurrentGuard {
    prev: Option<TaskRef>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = self.prev.take();
        });
    }
}

pub(crate) fn with_current<R>(f: impl FnOnce(Option<&TaskRef>) -> R) -> R {
    CURRENT.with(|current| f(current.borrow().as_ref()))
}

pub(crate) fn current() -> Option<TaskRef> {
    with_current(|task| task.cloned())
}

/// The id of the current task, if called from one.
pub fn id() -> Option<Id> {
    with_current(|task| task.map(TaskRef::id))
}

/// Whether cancellation has been requested for the current task (and is not
/// masked by a [`CancellationBlocker`]).
///
/// Non-blocking code must poll this (or [`cancellation_point`]) explicitly;
/// cancellation is otherwise only observed at suspension points.
pub fn should_cancel() -> bool {
    with_current(|task| match task {
        Some(task) => {
            let header = task.header();
            !header.cancel_masked() && header.cancel.is_requested()
        }
        None => false,
    })
}

/// Explicit cancellation poll: returns `Err` iff the current task has an
/// unmasked pending cancellation.
pub fn cancellation_point() -> Result<(), Cancelled> {
    with_current(|task| match task {
        Some(task) => {
            let header = task.header();
            match header.cancel.get() {
                Some(reason) if !header.cancel_masked() => Err(Cancelled { reason }),
                _ => Ok(()),
            }
        }
        None => Ok(()),
    })
}

/// The cancellation reason of the current task, masked or not.
pub fn cancellation_reason() -> Option<CancelReason> {
    with_current(|task| task.and_then(|task| task.header().cancel.get()))
}

/// Set the current task's deadline. Any blocking call after the deadline is
/// reached reports `Cancelled` (reason `deadline`).
///
/// Takes effect at the next suspension point; a wait that is already parked
/// re-reads the deadline when it is next polled.
pub fn set_deadline(deadline: Deadline) {
    with_current(|task| {
        if let Some(task) = task {
            task.header().set_deadline(deadline);
        }
    });
}

/// The current task's deadline (`NEVER` outside a task).
pub fn deadline() -> Deadline {
    with_current(|task| task.map_or(Deadline::NEVER, |task| task.header().deadline()))
}

/// Request cancellation of the current task (reason `user`).
pub fn cancel() -> bool {
    with_current(|task| task.map_or(false, |task| task.cancel(CancelReason::User)))
}

/// Mask cancellation for bounded critical cleanup.
///
/// While the returned guard lives, suspension points of the current task do
/// not observe the cancellation flag (and the task deadline does not fire as
/// cancellation). The flag itself stays set and re-triggers at the next
/// unmasked suspension point.
#[must_use = "cancellation is only blocked while the guard is held"]
pub fn block_cancellation() -> CancellationBlocker {
    let task = current();
    if let Some(task) = &task {
        task.header().cancel_mask.fetch_add(1, Ordering::AcqRel);
    }
    CancellationBlocker { task }
}

pub struct CancellationBlocker {
    task: Option<TaskRef>,
}

impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let prev = task.header().cancel_mask.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "unbalanced cancellation blocker");
        }
    }
}

/// Yield the worker to other ready tasks of the same processor.
///
/// The task goes to the back of the ready queue.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    yielded: bool,
}

impl core::future::Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

// sleeping is deadline machinery; it lives in `time` and is re-exported here
// because it operates on the current task
pub use crate::time::{sleep_for, sleep_until};

/// Snapshot of the current task's inherited data (empty outside a task).
pub fn inherited() -> AmbientData {
    with_current(|task| task.map(|task| task.header().inherited()).unwrap_or_default())
}

/// Look up an inherited value by name.
pub fn get_inherited<T: Send + Sync + 'static>(name: &str) -> Option<Arc<T>> {
    with_current(|task| task.and_then(|task| task.header().inherited().get::<T>(name)))
}

/// Set an inherited value on the current task (copy-on-write; already
/// spawned children are unaffected). No-op outside a task.
pub fn set_inherited<T: Send + Sync + 'static>(name: impl Into<String>, value: T) {
    with_current(|task| {
        if let Some(task) = task {
            let mut data = task.header().inherited();
            data.set(name, value);
            task.header().set_inherited(data);
        }
    });
}

/// Erase an inherited value from the current task. Returns whether the key
/// was present.
pub fn erase_inherited(name: &str) -> bool {
    with_current(|task| match task {
        Some(task) => {
            let mut data = task.header().inherited();
            let removed = data.erase(name);
            if removed {
                task.header().set_inherited(data);
            }
            removed
        }
        None => false,
    })
}
