// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for cooperative tasks.
//!
//! Everything that blocks here blocks *the task*, not the worker thread: a
//! parked task hands its worker back to the processor's ready queue.
//! Deadline-bound operations report a three-valued [`WakeSource`] with the
//! tie priority `cancelled > timeout > ready`.

pub mod condvar;
pub mod event;
pub mod future;
pub mod mutex;
pub mod semaphore;
pub mod shared_mutex;
pub(crate) mod wait;
pub(crate) mod wait_cell;
pub(crate) mod wait_queue;
mod wake_batch;

pub use condvar::Condvar;
pub use event::Event;
pub use future::{Future, FutureError, Promise, PromiseError};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
pub use shared_mutex::{SharedMutex, SharedMutexReadGuard, SharedMutexWriteGuard};
pub use wait::WakeSource;

pub(crate) use wake_batch::WakeBatch;

use core::fmt;

/// Error returned when waiting on a primitive that has been closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}
