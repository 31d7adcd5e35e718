// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Closed;
use crate::util::CachePadded;
use bitflags::bitflags;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use static_assertions::const_assert_eq;

/// An atomically registered [`Waker`] for a single waiting task.
///
/// This is the single-waiter building block underneath events, timers, the
/// promise/future shared state and join handles. It follows tokio's
/// `AtomicWaker` synchronization strategy with an additional close bit.
pub(crate) struct WaitCell {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        const WAITING = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING = 0b0010;
        const WOKEN = 0b0100;
        const CLOSED = 0b1000;
    }
}
// WAITING must be zero: it is the `fetch_and` reset target.
const_assert_eq!(State::WAITING.bits(), 0);

/// Future returned from [`WaitCell::wait()`]. Fused: completes at most once.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Wait<'a> {
    cell: &'a WaitCell,
    presubscribe: Poll<Result<(), Closed>>,
}

/// Future returned from [`WaitCell::subscribe()`]; resolves to a [`Wait`]
/// that is already registered for wakeups.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Subscribe<'a> {
    cell: &'a WaitCell,
}

/// Why a [`Waker`] could not be registered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PollWaitError {
    Closed,
    /// Another task is concurrently registering its own waker. At most one
    /// task may wait on a cell at a time.
    Busy,
}

// === impl WaitCell ===

impl WaitCell {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(State::WAITING.bits())),
            waker: UnsafeCell::new(None),
        }
    }

    // loom's atomics and cells have non-const constructors
    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(State::WAITING.bits())),
            waker: UnsafeCell::new(None),
        }
    }

    /// Register the waker from `cx`, or complete immediately if a wakeup
    /// already arrived.
    pub(crate) fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), PollWaitError>> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(Err(PollWaitError::Closed));
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // consume the stored wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(Ok(()));
            }
            // someone is mid-wake; don't go to sleep
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(Ok(()));
            }
            Err(_) => return Poll::Ready(Err(PollWaitError::Busy)),
            Ok(_) => {}
        }

        let waker = cx.waker();
        tracing::trace!(?waker, "WaitCell::poll_wait: registering waker");

        if let Some(prev_waker) = self.replace_waker(waker.clone()) {
            prev_waker.wake();
        }

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // We were woken or closed while writing the waker. Back out of
            // the registration and report which it was.
            tracing::trace!(state = ?actual, "WaitCell::poll_wait: notified during registration");

            // Safety: the REGISTERING bit is still set, so no other thread
            // touches the waker slot concurrently.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // Reset to WAITING, preserving only the CLOSED bit.
            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);
            debug_assert!(
                state == actual || state == actual | State::CLOSED,
                "state changed unexpectedly while parking!"
            );

            if let Some(waker) = waker {
                waker.wake();
            }

            if state.contains(State::CLOSED) {
                return Poll::Ready(Err(PollWaitError::Closed));
            }
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    }

    /// Eagerly register for the next wakeup, *then* hand back a [`Wait`]
    /// future. A wake that lands between subscribing and awaiting the
    /// returned future is not lost.
    pub(crate) fn subscribe(&self) -> Subscribe<'_> {
        Subscribe { cell: self }
    }

    /// Wake the stored waker, if any. Returns whether a task was woken.
    pub(crate) fn wake(&self) -> bool {
        if let Some(waker) = self.take_waker(false) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Close the cell, waking the stored waker with an error. Subsequent
    /// waits fail with [`Closed`].
    pub(crate) fn close(&self) -> bool {
        if let Some(waker) = self.take_waker(true) {
            waker.wake();
            true
        } else {
            false
        }
    }

    fn take_waker(&self, close: bool) -> Option<Waker> {
        // Set WAKING (we are touching the waker) and WOKEN (a wakeup is being
        // delivered), plus CLOSED if requested.
        let state = {
            let mut bits = State::WAKING | State::WOKEN;
            if close {
                bits |= State::CLOSED;
            }
            self.fetch_or(bits, Ordering::AcqRel)
        };

        // Only take the waker if no one else is already touching it.
        if !state.intersects(State::WAKING | State::REGISTERING | State::CLOSED) {
            // Safety: we won the WAKING bit, so we have exclusive access to
            // the waker slot.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // release the WAKING "lock"
            self.fetch_and(!State::WAKING, Ordering::Release);

            if let Some(waker) = waker {
                tracing::trace!(?close, ?waker, "WaitCell::take_waker");
                return Some(waker);
            }
        }

        None
    }

    fn replace_waker(&self, waker: Waker) -> Option<Waker> {
        let state = self.fetch_or(State::WAKING, Ordering::AcqRel);

        if !state.intersects(State::WAKING | State::CLOSED) {
            // Safety: we won the WAKING bit (and hold REGISTERING), so we
            // have exclusive access to the waker slot.
            let prev_waker = self.waker.with_mut(|old_waker| unsafe {
                match &mut *old_waker {
                    Some(old_waker) if waker.will_wake(old_waker) => None,
                    old => old.replace(waker),
                }
            });

            self.fetch_and(!State::WAKING, Ordering::Release);
            return prev_waker;
        }

        None
    }

    #[inline(always)]
    fn compare_exchange(
        &self,
        curr: State,
        new: State,
        success: Ordering,
    ) -> Result<State, State> {
        self.state
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.load(Ordering::Acquire))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell::new()
    }
}

// Safety: `WaitCell` synchronizes all waker-slot accesses through the state
// word's WAKING/REGISTERING bits.
unsafe impl Send for WaitCell {}
// Safety: see the `Send` impl above.
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Drop for WaitCell {
    fn drop(&mut self) {
        self.close();
    }
}

// === impl Wait ===

impl core::future::Future for Wait<'_> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Did a wakeup arrive while we were pre-subscribing?
        if self.presubscribe.is_ready() {
            return self.presubscribe;
        }

        match core::task::ready!(self.cell.poll_wait(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(PollWaitError::Closed) => Poll::Ready(Err(Closed(()))),
            Err(PollWaitError::Busy) => {
                // Another task holds the registration; yield and retry once
                // it is done.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

// === impl Subscribe ===

impl<'cell> core::future::Future for Subscribe<'cell> {
    type Output = Wait<'cell>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let presubscribe = match self.cell.poll_wait(cx) {
            Poll::Ready(Err(PollWaitError::Busy)) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Poll::Ready(Err(PollWaitError::Closed)) => Poll::Ready(Err(Closed(()))),
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        };

        Poll::Ready(Wait {
            cell: self.cell,
            presubscribe,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;
    use std::task::{Context, Poll, Wake, Waker};

    struct CountingWaker(std::sync::atomic::AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn wake_before_wait_completes_immediately() {
        loom::model(|| {
            let cell = WaitCell::new();
            // no waiter yet: the wakeup is stored
            assert!(!cell.wake());

            let counter = Arc::new(CountingWaker(std::sync::atomic::AtomicUsize::new(0)));
            let waker = Waker::from(counter.clone());
            let mut cx = Context::from_waker(&waker);
            assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Ok(())));
        });
    }

    #[test]
    fn wake_after_registration() {
        loom::model(|| {
            let cell = WaitCell::new();
            let counter = Arc::new(CountingWaker(std::sync::atomic::AtomicUsize::new(0)));
            let waker = Waker::from(counter.clone());
            let mut cx = Context::from_waker(&waker);

            assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
            assert!(cell.wake());
            assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
            // the wake was delivered, the next poll completes
            assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(Ok(())));
        });
    }

    #[test]
    fn close_wakes_with_error() {
        loom::model(|| {
            let cell = WaitCell::new();
            let counter = Arc::new(CountingWaker(std::sync::atomic::AtomicUsize::new(0)));
            let waker = Waker::from(counter.clone());
            let mut cx = Context::from_waker(&waker);

            assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
            assert!(cell.close());
            assert_eq!(
                cell.poll_wait(&mut cx),
                Poll::Ready(Err(PollWaitError::Closed))
            );
        });
    }
}
