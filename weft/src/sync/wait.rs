// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The park combinator: every deadline-bound wait in the crate goes through
//! [`park`].
//!
//! `park` wraps a readiness future (a wait-queue node, a wait-cell
//! subscription, a timer, an fd readiness poll) and layers the runtime-wide
//! wait contract on top:
//!
//! - the current task's cancellation flag is checked on every poll, *before*
//!   anything else, so a wake tie always resolves to `Cancelled`;
//! - a per-wait deadline timer is armed at the earlier of the operation
//!   deadline and the task deadline, and disarmed when the park ends;
//! - a fired *task* deadline marks the task cancelled (reason `deadline`)
//!   and reports `Cancelled`; a fired operation deadline reports `Timeout`.
//!
//! Dropping the park future (which drops the inner readiness future) is what
//! restores the primitive's state: wait-queue nodes unlink themselves and
//! pass unconsumed grants on.

use crate::reactor::{PoolHandle, Timer};
use crate::task::{current_task, CancelReason};
use crate::time::Deadline;
use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Why a parked task became runnable.
///
/// Ties are broken deterministically: `Cancelled` beats `Timeout` beats
/// `Ready`, so cancellation is never hidden by a racing signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    /// The awaited condition held: a signal arrived, readiness fired, the
    /// sleep elapsed.
    Ready,
    /// The operation deadline was reached. The task itself is *not*
    /// cancelled.
    Timeout,
    /// The task's cancellation flag is set (user, deadline or overload).
    Cancelled,
}

impl WakeSource {
    pub fn is_ready(self) -> bool {
        matches!(self, WakeSource::Ready)
    }

    pub fn is_timeout(self) -> bool {
        matches!(self, WakeSource::Timeout)
    }

    pub fn is_cancelled(self) -> bool {
        matches!(self, WakeSource::Cancelled)
    }
}

std::thread_local! {
    static THREAD_REACTORS: RefCell<Option<PoolHandle>> = const { RefCell::new(None) };
}

/// Install the reactor pool handle for this thread (workers at startup,
/// `block_on` for its duration).
pub(crate) fn set_thread_reactors(handle: PoolHandle) -> ThreadReactorsGuard {
    let prev = THREAD_REACTORS.with(|cell| cell.borrow_mut().replace(handle));
    ThreadReactorsGuard { prev }
}

pub(crate) struct ThreadReactorsGuard {
    prev: Option<PoolHandle>,
}

impl Drop for ThreadReactorsGuard {
    fn drop(&mut self) {
        THREAD_REACTORS.with(|cell| {
            *cell.borrow_mut() = self.prev.take();
        });
    }
}

/// The reactor pool reachable from this call site: the current task's
/// processor's pool, or the thread-installed one.
pub(crate) fn current_reactors() -> Option<PoolHandle> {
    if let Some(handle) =
        current_task::with_current(|task| task.map(|task| task.header().proc.reactors()))
    {
        return Some(handle);
    }
    THREAD_REACTORS.with(|cell| cell.borrow().clone())
}

/// Park on `wait` until it completes, the deadline is reached, or the
/// current task is cancelled. See the module docs for the full contract.
pub(crate) fn park<F: core::future::Future>(deadline: Deadline, wait: F) -> Park<F> {
    Park {
        deadline,
        timer: None,
        wait,
    }
}

#[pin_project::pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Park<F> {
    /// Operation deadline; the task deadline is read fresh on every poll.
    deadline: Deadline,
    timer: Option<Timer>,
    #[pin]
    wait: F,
}

impl<F: core::future::Future> core::future::Future for Park<F> {
    type Output = WakeSource;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let task = current_task::with_current(|task| {
            task.map(|task| {
                let header = task.header();
                (
                    task.clone(),
                    header.deadline(),
                    header.cancel_masked(),
                    header.cancel.is_requested(),
                )
            })
        });

        // 1. cancellation wins every tie
        let task_deadline = match &task {
            Some((task, task_deadline, masked, cancelled)) if !masked => {
                if *cancelled {
                    return Poll::Ready(WakeSource::Cancelled);
                }
                if task_deadline.is_reached() {
                    task.cancel(CancelReason::Deadline);
                    return Poll::Ready(WakeSource::Cancelled);
                }
                *task_deadline
            }
            // while masked, the task deadline neither fires nor arms a timer
            _ => Deadline::NEVER,
        };

        // 2. timeout beats a racing signal
        if this.deadline.is_reached() {
            return Poll::Ready(WakeSource::Timeout);
        }

        let effective = this.deadline.min(task_deadline);
        if let Some(at) = effective.instant() {
            let rearm = match this.timer.as_ref() {
                Some(timer) => timer.deadline() != at,
                None => true,
            };
            if rearm {
                *this.timer = current_reactors().map(|reactors| reactors.arm_timer(at));
            }
            if let Some(timer) = this.timer.as_mut() {
                if Pin::new(timer).poll(cx).is_ready() {
                    // decide which deadline fired
                    if task_deadline.is_reached() {
                        if let Some((task, ..)) = &task {
                            task.cancel(CancelReason::Deadline);
                        }
                        return Poll::Ready(WakeSource::Cancelled);
                    }
                    return Poll::Ready(WakeSource::Timeout);
                }
            }
        }

        // 3. the actual signal
        match this.wait.poll(cx) {
            Poll::Ready(_) => Poll::Ready(WakeSource::Ready),
            Poll::Pending => Poll::Pending,
        }
    }
}
