// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fair FIFO mutex for cooperative tasks.
//!
//! The lock state *is* the wait queue's stored wakeup: holding the stored
//! wakeup means the mutex is free, and `unlock` either stores it back (no
//! waiters) or hands it directly to the head waiter, so ownership transfers
//! without a race window where a newcomer could barge in. A waiter that
//! times out or is cancelled after receiving the grant passes it to the next
//! eligible waiter when its wait future is dropped; cancelled waiters are
//! skipped, never given the lock.

use crate::error::AcquireError;
use crate::sync::wait::{park, WakeSource};
use crate::sync::wait_queue::WaitQueue;
use crate::time::Deadline;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

pub struct Mutex<T: ?Sized> {
    queue: WaitQueue,
    data: UnsafeCell<T>,
}

// Safety: the queue's grant protocol guarantees at most one live guard, so
// the mutex hands out exclusive access like `std::sync::Mutex`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// Safety: see the `Send` impl above.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Self {
        let queue = WaitQueue::new();
        // the stored wakeup represents the unlocked state
        queue.wake();
        Self {
            queue,
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Lock the mutex, parking until it is acquired, the deadline is
    /// reached, or the calling task is cancelled.
    ///
    /// Waiters acquire in strict FIFO order.
    pub async fn lock(&self, deadline: Deadline) -> Result<MutexGuard<'_, T>, AcquireError> {
        match park(deadline, self.queue.wait()).await {
            WakeSource::Ready => Ok(MutexGuard { mutex: self }),
            WakeSource::Timeout => Err(AcquireError::Timeout),
            WakeSource::Cancelled => Err(AcquireError::Cancelled),
        }
    }

    /// Non-blocking lock attempt.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.queue.try_wait() {
            core::task::Poll::Ready(Ok(())) => Some(MutexGuard { mutex: self }),
            _ => None,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        self.queue.wake();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => s.field("data", &&*guard),
            None => s.field("data", &"<locked>"),
        }
        .finish()
    }
}

/// RAII guard; unlocking hands the mutex to the next waiter.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard witnesses exclusive ownership of the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see `deref`.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// Safety: the guard only gives access to `T` from the holding task; `T:
// Send` suffices for moving the guard across workers between polls.
unsafe impl<T: ?Sized + Send> Send for MutexGuard<'_, T> {}
// Safety: shared access through the guard requires `T: Sync`.
unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_excludes() {
        let mutex = Mutex::new(7);
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 7);
    }

    #[test]
    fn unlock_restores_stored_grant() {
        let mutex = Mutex::new(());
        drop(mutex.try_lock().unwrap());
        drop(mutex.try_lock().unwrap());
    }
}
