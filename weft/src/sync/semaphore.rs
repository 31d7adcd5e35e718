// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Counting semaphore.

use crate::error::AcquireError;
use crate::sync::wait::{park, WakeSource};
use crate::sync::wait_queue::WaitQueue;
use crate::time::Deadline;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A counting semaphore for limiting concurrent access to a resource.
///
/// Waiters queue FIFO and re-check permit availability when woken by a
/// release.
#[derive(Debug)]
pub struct Semaphore {
    permits: AtomicUsize,
    queue: WaitQueue,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
            queue: WaitQueue::new(),
        }
    }

    /// Currently available permits.
    pub fn available(&self) -> usize {
        self.permits.load(Ordering::SeqCst)
    }

    /// Acquire `count` permits, parking until they are available.
    pub async fn acquire(
        &self,
        count: usize,
        deadline: Deadline,
    ) -> Result<SemaphorePermit<'_>, AcquireError> {
        loop {
            if self.try_take(count) {
                return Ok(SemaphorePermit {
                    semaphore: self,
                    count,
                });
            }

            let mut wait = core::pin::pin!(self.queue.wait());
            if wait.as_mut().subscribe().is_ready() {
                continue;
            }
            if self.try_take(count) {
                return Ok(SemaphorePermit {
                    semaphore: self,
                    count,
                });
            }

            match park(deadline, wait).await {
                WakeSource::Ready => continue,
                WakeSource::Timeout => return Err(AcquireError::Timeout),
                WakeSource::Cancelled => return Err(AcquireError::Cancelled),
            }
        }
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self, count: usize) -> Option<SemaphorePermit<'_>> {
        self.try_take(count).then(|| SemaphorePermit {
            semaphore: self,
            count,
        })
    }

    fn try_take(&self, count: usize) -> bool {
        let mut current = self.permits.load(Ordering::SeqCst);
        loop {
            if current < count {
                return false;
            }
            match self.permits.compare_exchange(
                current,
                current - count,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, count: usize) {
        self.permits.fetch_add(count, Ordering::SeqCst);
        // Wake everyone: the released permits may satisfy a waiter further
        // back in the queue even when the head's request is still too big.
        // Waiters re-check and re-park, so the spurious wakeups are benign.
        self.queue.wake_all();
    }
}

/// Permits held on a [`Semaphore`]; released on drop.
#[derive(Debug)]
#[must_use = "permits are released when the permit is dropped"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
    count: usize,
}

impl SemaphorePermit<'_> {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_respects_count() {
        let semaphore = Semaphore::new(3);
        let a = semaphore.try_acquire(2).unwrap();
        assert!(semaphore.try_acquire(2).is_none());
        let b = semaphore.try_acquire(1).unwrap();
        assert_eq!(semaphore.available(), 0);
        drop(a);
        drop(b);
        assert_eq!(semaphore.available(), 3);
    }
}
