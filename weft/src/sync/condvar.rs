// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Condition variable for [`Mutex`]-guarded state.
//!
//! `wait` enqueues the waiter *before* unlocking the mutex, so a
//! notification sent between the unlock and the park is never lost. The
//! mutex is reacquired before `wait` returns on **every** wake source,
//! including cancellation, so user code always observes the outcome while
//! holding the lock. Spurious wakeups are permitted; the predicate form is
//! the contract-bearing API.

use crate::sync::mutex::{Mutex, MutexGuard};
use crate::sync::wait::{park, WakeSource};
use crate::sync::wait_queue::WaitQueue;
use crate::task::current_task;
use crate::time::Deadline;
use core::task::Poll;

#[derive(Debug, Default)]
pub struct Condvar {
    queue: WaitQueue,
}

impl Condvar {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    /// Atomically release `guard`, park until notified, and reacquire the
    /// mutex.
    ///
    /// Returns the reacquired guard and the wake source. A `Cancelled`
    /// source means the task's cancellation flag is set; the mutex is held
    /// regardless.
    pub async fn wait<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, T>, WakeSource) {
        let mutex: &'a Mutex<T> = guard.mutex();

        let mut wait = core::pin::pin!(self.queue.wait());
        // join the queue while still holding the mutex
        let presubscribe = wait.as_mut().subscribe();
        drop(guard);

        let source = match presubscribe {
            // a stored notification was consumed (or the queue closed);
            // treat it as an immediate, possibly spurious, wakeup
            Poll::Ready(_) => WakeSource::Ready,
            Poll::Pending => park(deadline, wait).await,
        };

        // Reacquire unconditionally. Cancellation is masked so the lock
        // call cannot itself report `Cancelled`.
        let blocker = current_task::block_cancellation();
        let guard = match mutex.lock(Deadline::NEVER).await {
            Ok(guard) => guard,
            Err(err) => unreachable!("uncancellable lock without deadline failed: {err}"),
        };
        drop(blocker);

        (guard, source)
    }

    /// Predicate form: parks while `predicate` returns `true`.
    ///
    /// Returns with [`WakeSource::Ready`] once the predicate is `false`;
    /// `Timeout` / `Cancelled` end the wait early with the predicate
    /// possibly still `true` (re-check under the returned guard).
    pub async fn wait_while<'a, T: ?Sized, P>(
        &self,
        mut guard: MutexGuard<'a, T>,
        deadline: Deadline,
        mut predicate: P,
    ) -> (MutexGuard<'a, T>, WakeSource)
    where
        P: FnMut(&mut T) -> bool,
    {
        loop {
            if !predicate(&mut *guard) {
                return (guard, WakeSource::Ready);
            }
            let (reacquired, source) = self.wait(guard, deadline).await;
            guard = reacquired;
            if !source.is_ready() {
                return (guard, source);
            }
        }
    }

    /// Wake one waiter, in FIFO order.
    ///
    /// If no task is waiting, the notification is stored and consumed by the
    /// next `wait` as a permitted spurious wakeup.
    pub fn notify_one(&self) {
        self.queue.wake();
    }

    /// Wake all current waiters.
    pub fn notify_all(&self) {
        self.queue.wake_all();
    }
}
