// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task scheduling state word.
//!
//! The protocol keeps two invariants:
//!
//! 1. a task is referenced by at most one ready-queue entry at a time (the
//!    `QUEUED` bit gates every enqueue), and
//! 2. a wake that lands while the task is being polled re-enqueues it exactly
//!    once, after the poll finishes.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use bitflags::bitflags;
use core::fmt;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Flags: usize {
        /// An entry for this task sits in (or is being pushed onto) its
        /// processor's ready queue.
        const QUEUED = 1 << 0;
        /// A worker is currently polling the task.
        const RUNNING = 1 << 1;
        /// Terminal. The output slot has been (or is being) published.
        const COMPLETE = 1 << 2;
        /// The task has been polled at least once (or completed without
        /// ever being polled).
        const STARTED = 1 << 3;
    }
}

/// What the waker that just fired should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeAction {
    /// The caller must push the task onto its ready queue.
    Enqueue,
    /// Nothing to do: the task is already queued, currently running (the
    /// worker will re-enqueue it), or complete.
    None,
}

/// Outcome of finishing a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task completed.
    Ready,
    /// The task is parked; whoever holds its waker will wake it.
    Pending,
    /// The task was woken during the poll; the worker must re-enqueue it.
    PendingSchedule,
}

pub(crate) struct State(AtomicUsize);

impl State {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(Flags::empty().bits()))
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self(AtomicUsize::new(Flags::empty().bits()))
    }

    /// Transition on wake (or first spawn). Returns whether the caller must
    /// enqueue the task.
    pub(crate) fn transition_to_woken(&self) -> WakeAction {
        let mut curr = self.load();
        loop {
            if curr.intersects(Flags::COMPLETE | Flags::QUEUED) {
                return WakeAction::None;
            }
            let next = curr | Flags::QUEUED;
            match self.compare_exchange(curr, next) {
                Ok(_) => {
                    return if curr.contains(Flags::RUNNING) {
                        // the running worker observes QUEUED in `end_poll`
                        // and re-enqueues
                        WakeAction::None
                    } else {
                        WakeAction::Enqueue
                    };
                }
                Err(actual) => curr = actual,
            }
        }
    }

    /// Transition from queued to running. Returns `false` if the task must
    /// not be polled (already complete).
    pub(crate) fn start_poll(&self) -> bool {
        let mut curr = self.load();
        loop {
            if curr.contains(Flags::COMPLETE) {
                return false;
            }
            debug_assert!(
                curr.contains(Flags::QUEUED) && !curr.contains(Flags::RUNNING),
                "polled a task that was not queued: {curr:?}"
            );
            let next = (curr - Flags::QUEUED) | Flags::RUNNING | Flags::STARTED;
            match self.compare_exchange(curr, next) {
                Ok(_) => return true,
                Err(actual) => curr = actual,
            }
        }
    }

    /// Finish a poll that returned `Pending`. If a wake arrived while the
    /// task was running, the worker must re-enqueue it.
    pub(crate) fn end_poll(&self) -> PollResult {
        let prev = Flags::from_bits_retain(
            self.0.fetch_and(!Flags::RUNNING.bits(), Ordering::AcqRel),
        );
        debug_assert!(prev.contains(Flags::RUNNING));
        if prev.contains(Flags::QUEUED) {
            PollResult::PendingSchedule
        } else {
            PollResult::Pending
        }
    }

    /// Finish a poll that completed the task.
    pub(crate) fn complete(&self) {
        let mut curr = self.load();
        loop {
            debug_assert!(!curr.contains(Flags::COMPLETE));
            let next = ((curr - Flags::RUNNING) - Flags::QUEUED) | Flags::COMPLETE | Flags::STARTED;
            match self.compare_exchange(curr, next) {
                Ok(_) => return,
                Err(actual) => curr = actual,
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.load().contains(Flags::COMPLETE)
    }

    pub(crate) fn has_started(&self) -> bool {
        self.load().contains(Flags::STARTED)
    }

    fn load(&self) -> Flags {
        Flags::from_bits_retain(self.0.load(Ordering::SeqCst))
    }

    fn compare_exchange(&self, curr: Flags, new: Flags) -> Result<Flags, Flags> {
        self.0
            .compare_exchange(curr.bits(), new.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .map(Flags::from_bits_retain)
            .map_err(Flags::from_bits_retain)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_then_run_then_complete() {
        let state = State::new();
        assert_eq!(state.transition_to_woken(), WakeAction::Enqueue);
        // a second wake while queued is a no-op
        assert_eq!(state.transition_to_woken(), WakeAction::None);

        assert!(state.start_poll());
        state.complete();
        assert!(state.is_complete());
        assert!(state.has_started());

        // wakes after completion do nothing
        assert_eq!(state.transition_to_woken(), WakeAction::None);
    }

    #[test]
    fn wake_during_poll_reschedules_once() {
        let state = State::new();
        assert_eq!(state.transition_to_woken(), WakeAction::Enqueue);
        assert!(state.start_poll());

        // woken while running: the waker does not enqueue
        assert_eq!(state.transition_to_woken(), WakeAction::None);
        // a second wake is also a no-op (QUEUED already set)
        assert_eq!(state.transition_to_woken(), WakeAction::None);

        // the worker re-enqueues exactly once
        assert_eq!(state.end_poll(), PollResult::PendingSchedule);
        assert!(state.start_poll());
        assert_eq!(state.end_poll(), PollResult::Pending);
    }
}
