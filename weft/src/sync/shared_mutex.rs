// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Many-readers/one-writer lock with writer preference.
//!
//! A pending writer blocks *new* readers, so writers cannot starve behind a
//! steady stream of readers. A task holding the shared lock must not attempt
//! to upgrade: acquiring the exclusive lock from a reader deadlocks by
//! contract.

use crate::error::AcquireError;
use crate::sync::wait::{park, WakeSource};
use crate::sync::wait_queue::WaitQueue;
use crate::time::Deadline;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::task::Poll;

pub struct SharedMutex<T: ?Sized> {
    state: parking_lot::Mutex<RwState>,
    readers_queue: WaitQueue,
    writers_queue: WaitQueue,
    data: UnsafeCell<T>,
}

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

// Safety: access to `data` is mediated by the reader/writer accounting in
// `state`, which grants either many shared or one exclusive borrow.
unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
// Safety: shared access from multiple tasks requires `T: Send + Sync`.
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: parking_lot::Mutex::new(RwState::default()),
            readers_queue: WaitQueue::new(),
            writers_queue: WaitQueue::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    /// Acquire the shared (read) lock.
    pub async fn read(
        &self,
        deadline: Deadline,
    ) -> Result<SharedMutexReadGuard<'_, T>, AcquireError> {
        loop {
            if self.try_read_inner() {
                return Ok(SharedMutexReadGuard { lock: self });
            }

            let mut wait = core::pin::pin!(self.readers_queue.wait());
            if wait.as_mut().subscribe().is_ready() {
                // consumed a stored notification; re-check the state
                continue;
            }
            if self.try_read_inner() {
                return Ok(SharedMutexReadGuard { lock: self });
            }

            match park(deadline, wait).await {
                WakeSource::Ready => continue,
                WakeSource::Timeout => return Err(AcquireError::Timeout),
                WakeSource::Cancelled => return Err(AcquireError::Cancelled),
            }
        }
    }

    /// Acquire the exclusive (write) lock.
    pub async fn write(
        &self,
        deadline: Deadline,
    ) -> Result<SharedMutexWriteGuard<'_, T>, AcquireError> {
        self.state.lock().writers_waiting += 1;

        let result = loop {
            if self.try_write_inner() {
                break Ok(());
            }

            let mut wait = core::pin::pin!(self.writers_queue.wait());
            if wait.as_mut().subscribe().is_ready() {
                continue;
            }
            if self.try_write_inner() {
                break Ok(());
            }

            match park(deadline, wait).await {
                WakeSource::Ready => continue,
                WakeSource::Timeout => break Err(AcquireError::Timeout),
                WakeSource::Cancelled => break Err(AcquireError::Cancelled),
            }
        };

        let unblock_readers = {
            let mut state = self.state.lock();
            state.writers_waiting -= 1;
            result.is_err() && state.writers_waiting == 0 && !state.writer
        };
        if unblock_readers {
            // the blockade this writer imposed on new readers is lifted
            self.readers_queue.wake_all();
        }

        result.map(|()| SharedMutexWriteGuard { lock: self })
    }

    /// Non-blocking shared lock attempt.
    pub fn try_read(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        self.try_read_inner()
            .then_some(SharedMutexReadGuard { lock: self })
    }

    /// Non-blocking exclusive lock attempt. Does not assert writer
    /// preference: an available lock is taken even past waiting readers.
    pub fn try_write(&self) -> Option<SharedMutexWriteGuard<'_, T>> {
        let mut state = self.state.lock();
        if !state.writer && state.readers == 0 {
            state.writer = true;
            drop(state);
            Some(SharedMutexWriteGuard { lock: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn try_read_inner(&self) -> bool {
        let mut state = self.state.lock();
        if !state.writer && state.writers_waiting == 0 {
            state.readers += 1;
            true
        } else {
            false
        }
    }

    fn try_write_inner(&self) -> bool {
        let mut state = self.state.lock();
        if !state.writer && state.readers == 0 {
            state.writer = true;
            true
        } else {
            false
        }
    }

    fn unlock_shared(&self) {
        let wake_writer = {
            let mut state = self.state.lock();
            state.readers -= 1;
            state.readers == 0 && state.writers_waiting > 0
        };
        if wake_writer {
            self.writers_queue.wake();
        }
    }

    fn unlock_exclusive(&self) {
        let wake_writer = {
            let mut state = self.state.lock();
            state.writer = false;
            state.writers_waiting > 0
        };
        if wake_writer {
            self.writers_queue.wake();
        } else {
            self.readers_queue.wake_all();
        }
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SharedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedMutex")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("writers_waiting", &state.writers_waiting)
            .finish_non_exhaustive()
    }
}

#[must_use = "if unused the lock will immediately release"]
pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: reader accounting excludes writers while this guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

// Safety: the read guard hands out `&T` across tasks, requiring `T: Sync`.
unsafe impl<T: ?Sized + Sync> Send for SharedMutexReadGuard<'_, T> {}
// Safety: see the `Send` impl above.
unsafe impl<T: ?Sized + Sync> Sync for SharedMutexReadGuard<'_, T> {}

#[must_use = "if unused the lock will immediately release"]
pub struct SharedMutexWriteGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the writer bit excludes all other access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see `deref`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}

// Safety: exclusive access moves with the guard; `T: Send` suffices.
unsafe impl<T: ?Sized + Send> Send for SharedMutexWriteGuard<'_, T> {}
// Safety: shared access through the guard requires `T: Sync`.
unsafe impl<T: ?Sized + Sync> Sync for SharedMutexWriteGuard<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn many_readers_exclude_writer() {
        let lock = SharedMutex::new(1);
        let a = lock.try_read().unwrap();
        let b = lock.try_read().unwrap();
        assert!(lock.try_write().is_none());
        drop(a);
        assert!(lock.try_write().is_none());
        drop(b);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = SharedMutex::new(());
        let guard = lock.try_write().unwrap();
        assert!(lock.try_read().is_none());
        drop(guard);
        assert!(lock.try_read().is_some());
    }
}
