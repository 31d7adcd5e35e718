// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use arrayvec::ArrayVec;
use core::task::Waker;

const NUM_WAKERS: usize = 32;

/// A bounded batch of [`Waker`]s.
///
/// `wake_all` paths drain waiters into a batch under the list lock and invoke
/// the wakers only after the lock is released, so that woken tasks which
/// immediately re-park never contend with the drain.
pub(crate) struct WakeBatch {
    inner: ArrayVec<Waker, NUM_WAKERS>,
}

impl WakeBatch {
    pub(crate) const fn new() -> Self {
        Self {
            inner: ArrayVec::new_const(),
        }
    }

    /// Adds a [`Waker`] to the batch, returning `true` if the batch is full
    /// and must be flushed before more wakers can be added.
    pub(crate) fn add_waker(&mut self, waker: Waker) -> bool {
        self.inner.push(waker);
        self.inner.is_full()
    }

    pub(crate) fn wake_all(&mut self) {
        for waker in self.inner.drain(..) {
            waker.wake();
        }
    }
}

impl Default for WakeBatch {
    fn default() -> Self {
        Self::new()
    }
}
