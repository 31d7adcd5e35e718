// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-consumer event: a one-shot-ish readiness flag with at most one
//! waiting task.
//!
//! `send` is idempotent: repeated sends while the event is signaled are
//! no-ops, and the event stays signaled until a `wait` consumes it. A signal
//! that arrives before the wait completes the next wait immediately. This is
//! the backbone of the bounded queues' "nonempty" side.

use crate::sync::wait::{park, WakeSource};
use crate::sync::wait_cell::WaitCell;
use crate::time::Deadline;
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct Event {
    signaled: AtomicBool,
    cell: WaitCell,
}

impl Event {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            cell: WaitCell::new(),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            cell: WaitCell::new(),
        }
    }

    /// Signal the event. Idempotent; wakes the waiter if one is parked.
    pub fn send(&self) {
        self.signaled.store(true, Ordering::Release);
        self.cell.wake();
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Consume a pending signal without parking.
    pub fn try_consume(&self) -> bool {
        self.signaled.swap(false, Ordering::AcqRel)
    }

    /// Park until the event is signaled, consuming the signal.
    ///
    /// At most one task may wait at a time; a second concurrent waiter is a
    /// contract violation.
    pub async fn wait(&self, deadline: Deadline) -> WakeSource {
        park(deadline, self.wait_signal()).await
    }

    async fn wait_signal(&self) {
        loop {
            // register interest first so a send racing with the check is
            // not lost
            let wait = self.cell.subscribe().await;
            if self.try_consume() {
                return;
            }
            // the cell is only closed on drop, which cannot race a wait
            let _ = wait.await;
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_is_idempotent() {
        let event = Event::new();
        event.send();
        event.send();
        assert!(event.try_consume());
        // a consumed signal does not linger
        assert!(!event.try_consume());
    }

    #[test]
    fn signal_persists_until_consumed() {
        let event = Event::new();
        event.send();
        assert!(event.is_signaled());
        assert!(event.is_signaled());
        assert!(event.try_consume());
        assert!(!event.is_signaled());
    }
}
