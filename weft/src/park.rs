// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Parking for worker threads.
//!
//! Workers that run out of ready tasks park themselves here and are unparked
//! by whoever enqueues the next task. User tasks never park on this module;
//! they suspend through [`crate::sync`] primitives instead.

use std::sync::Arc;
use std::task::{Wake, Waker};

pub(crate) trait Park: Send + Sync + 'static {
    fn park(&self);
    fn unpark(&self);
}

/// [`Park`] implementation backed by `std::thread` parking.
#[derive(Debug)]
pub(crate) struct StdPark {
    thread: std::thread::Thread,
}

impl StdPark {
    pub(crate) fn for_current() -> Self {
        Self {
            thread: std::thread::current(),
        }
    }
}

impl Park for StdPark {
    fn park(&self) {
        debug_assert_eq!(self.thread.id(), std::thread::current().id());
        std::thread::park();
    }

    fn unpark(&self) {
        self.thread.unpark();
    }
}

#[derive(Debug)]
pub(crate) struct Parker<P>(Arc<P>);

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park> Parker<P> {
    pub(crate) fn new(park_impl: P) -> Self {
        Self(Arc::new(park_impl))
    }

    #[inline]
    pub(crate) fn park(&self) {
        self.0.park();
    }

    /// Convert this `Parker` into an [`UnparkToken`] which can be used to
    /// wake up the owning thread.
    #[inline]
    pub(crate) fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self.0)
    }

    /// Convert self into a `Waker` that unparks the owning thread. This is
    /// what drives `block_on` on non-worker threads.
    #[inline]
    pub(crate) fn into_waker(self) -> Waker {
        Waker::from(Arc::new(ParkWaker(self.0)))
    }
}

#[derive(Debug)]
pub(crate) struct UnparkToken<P>(Arc<P>);

impl<P> Clone for UnparkToken<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park> UnparkToken<P> {
    #[inline]
    pub(crate) fn unpark(&self) {
        self.0.unpark();
    }
}

struct ParkWaker<P>(Arc<P>);

impl<P: Park> Wake for ParkWaker<P> {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Set of parked workers belonging to one processor.
///
/// The order in which workers are unparked is not defined.
#[derive(Debug)]
pub(crate) struct ParkingLot<P> {
    tokens: parking_lot::Mutex<Vec<UnparkToken<P>>>,
}

impl<P: Park> ParkingLot<P> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: parking_lot::Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Park the calling worker until unparked.
    ///
    /// The unpark token is published *before* `has_work` runs, and `StdPark`
    /// unparks are sticky, so a task enqueued concurrently with this call
    /// cannot be missed: either `has_work` observes it, or the enqueuer's
    /// `unpark_one` finds our token.
    pub(crate) fn park(&self, parker: &Parker<P>, has_work: impl FnOnce() -> bool) {
        self.tokens.lock().push(parker.clone().into_unpark());
        if has_work() {
            parker.0.unpark();
        }
        parker.park();
    }

    /// Unpark a single parked worker, if any. Returns whether a token was
    /// consumed.
    pub(crate) fn unpark_one(&self) -> bool {
        if let Some(token) = self.tokens.lock().pop() {
            token.unpark();
            true
        } else {
            false
        }
    }

    /// Unpark all currently parked workers, returning how many tokens were
    /// consumed.
    pub(crate) fn unpark_all(&self) -> usize {
        let mut tokens = self.tokens.lock();
        let mut unparked = 0;
        while let Some(token) = tokens.pop() {
            token.unpark();
            unparked += 1;
        }
        unparked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn park_unpark_roundtrip() {
        static UNPARKED: AtomicUsize = AtomicUsize::new(0);

        let lot: Arc<ParkingLot<StdPark>> = Arc::new(ParkingLot::with_capacity(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lot = lot.clone();
                std::thread::spawn(move || {
                    let parker = Parker::new(StdPark::for_current());
                    lot.park(&parker, || false);
                    UNPARKED.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        let mut remaining = 2;
        while remaining > 0 {
            if lot.unpark_one() {
                remaining -= 1;
            } else {
                std::thread::yield_now();
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(UNPARKED.load(Ordering::Acquire), 2);
    }

    #[test]
    fn has_work_prevents_lost_wakeup() {
        let lot: ParkingLot<StdPark> = ParkingLot::with_capacity(1);
        let parker = Parker::new(StdPark::for_current());
        // Work is already available: park must return immediately instead of
        // blocking forever.
        lot.park(&parker, || true);
    }

    #[test]
    fn waker_unparks() {
        let parker = Parker::new(StdPark::for_current());
        let waker = parker.clone().into_waker();
        waker.wake_by_ref();
        // The sticky unpark token makes this return immediately.
        parker.park();
    }
}
