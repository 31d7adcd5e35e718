// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The wait list: an intrusive FIFO queue of parked tasks.
//!
//! Every blocking primitive in this crate parks its waiters here (or on the
//! single-waiter [`WaitCell`](super::wait_cell::WaitCell)). Waiter nodes live
//! inside the futures of the waiting tasks, so parking allocates nothing; the
//! nodes are linked into a doubly-linked list so that a cancelled waiter can
//! unlink itself from the middle. The list is guarded by a mutex that is only
//! held across O(1) operations.
//!
//! A `WaitQueue` holds at most one *stored wakeup*: waking an empty queue
//! completes the next `wait().await` immediately. A waiter that received a
//! `wake()` grant but is dropped before consuming it (timeout, cancellation)
//! passes the grant to the next queued waiter, so a grant is never lost and
//! never delivered to a dead waiter.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Closed, WakeBatch};
use crate::util::CachePadded;
use cordyceps::{list, Linked, List};
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, Waker};
use parking_lot::{Mutex, MutexGuard};

pub(crate) struct WaitQueue {
    state: CachePadded<AtomicUsize>,
    /// The linked list of waiters.
    ///
    /// Waiter nodes may only be manipulated (linked, unlinked, waker
    /// replaced) while this mutex is held.
    queue: Mutex<List<Waiter>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(usize)]
enum State {
    /// No waiters and no pending wakeup.
    Empty = 0b00,
    /// One or more waiters are queued.
    Waiting = 0b01,
    /// A wakeup is stored; the next `wait` completes immediately.
    Woken = 0b10,
    /// The queue is closed. Must be all bits set: it is written with a
    /// `fetch_or`.
    Closed = 0b11,
}

/// Future returned by [`WaitQueue::wait()`].
#[pin_project::pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Wait<'a> {
    queue: &'a WaitQueue,
    #[pin]
    waiter: Waiter,
}

/// A waiter node, linkable into a wait queue.
#[repr(C)]
#[pin_project::pin_project]
struct Waiter {
    /// This must be the first field so that the `Linked` impl can project to
    /// the links through the struct's base address.
    #[pin]
    node: UnsafeCell<Node>,
    state: WaitState,
}

struct Node {
    links: list::Links<Waiter>,
    wakeup: Wakeup,
    /// Whether this node is currently linked into the list. Tracked under
    /// the list lock so that a node popped by a waker and a concurrently
    /// dropped future never double-unlink.
    linked: bool,
    _pin: PhantomPinned,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum WaitState {
    /// Not yet enqueued; safe to drop without touching the list.
    Start,
    /// Enqueued (or woken while enqueued and not yet re-polled).
    Waiting,
    /// Completed; the node is no longer linked.
    Woken,
}

#[derive(Clone, Debug)]
enum Wakeup {
    Empty,
    Waiting(Waker),
    One,
    All,
    Closed,
}

// === impl WaitQueue ===

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(State::Empty as usize)),
            queue: Mutex::new(List::new()),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(State::Empty as usize)),
            queue: Mutex::new(List::new()),
        }
    }

    /// Wake the next task in the queue.
    ///
    /// If the queue is empty, the wakeup is stored and consumed by the next
    /// call to `wait`. At most one wakeup is stored at a time.
    pub(crate) fn wake(&self) {
        let mut state = self.load();
        loop {
            match state {
                State::Closed => return,
                State::Waiting => break,
                State::Empty | State::Woken => {
                    match self.compare_exchange(state, State::Woken) {
                        Ok(_) => return,
                        Err(actual) => state = actual,
                    }
                }
            }
        }

        // there are waiters; dequeue the head under the lock
        let mut queue = self.queue.lock();
        // the state may have changed while we were taking the lock
        let state = self.load();
        let waker = self.wake_locked(&mut queue, state);
        drop(queue);

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake all tasks currently in the queue.
    ///
    /// Unlike [`wake()`](Self::wake), nothing is stored for future waiters:
    /// only currently registered waiters are woken.
    pub(crate) fn wake_all(&self) {
        let mut batch = WakeBatch::new();
        let mut queue = self.queue.lock();

        match self.load() {
            State::Empty | State::Woken | State::Closed => return,
            State::Waiting => self.store(State::Empty),
        }

        let mut waiters_remaining = true;
        while waiters_remaining {
            waiters_remaining = Self::drain_to_wake_batch(&mut batch, &mut queue, Wakeup::All);
            MutexGuard::unlocked(&mut queue, || batch.wake_all());
        }
    }

    /// Close the queue. Current and future waiters see [`Closed`].
    pub(crate) fn close(&self) {
        let prev = State::from_bits(
            self.state
                .fetch_or(State::Closed as usize, Ordering::SeqCst),
        );
        if prev != State::Waiting {
            return;
        }

        let mut batch = WakeBatch::new();
        let mut queue = self.queue.lock();
        let mut waiters_remaining = true;
        while waiters_remaining {
            waiters_remaining = Self::drain_to_wake_batch(&mut batch, &mut queue, Wakeup::Closed);
            MutexGuard::unlocked(&mut queue, || batch.wake_all());
        }
    }

    /// Wait to be woken by this queue.
    pub(crate) fn wait(&self) -> Wait<'_> {
        Wait {
            queue: self,
            waiter: Waiter {
                state: WaitState::Start,
                node: UnsafeCell::new(Node {
                    links: list::Links::new(),
                    wakeup: Wakeup::Empty,
                    linked: false,
                    _pin: PhantomPinned,
                }),
            },
        }
    }

    /// Non-blocking attempt to consume a stored wakeup.
    ///
    /// Returns `Ready(Ok(()))` if a stored wakeup was consumed,
    /// `Ready(Err(Closed))` if the queue is closed, and `Pending` otherwise.
    pub(crate) fn try_wait(&self) -> Poll<Result<(), Closed>> {
        let mut state = self.load();
        while state == State::Woken {
            match self.compare_exchange(State::Woken, State::Empty) {
                Ok(_) => return Poll::Ready(Ok(())),
                Err(actual) => state = actual,
            }
        }
        match state {
            State::Closed => Poll::Ready(Err(Closed(()))),
            _ => Poll::Pending,
        }
    }

    #[cold]
    #[inline(never)]
    fn wake_locked(&self, queue: &mut List<Waiter>, curr: State) -> Option<Waker> {
        // it is possible we transitioned to a different state while locking
        // the queue; if there are no longer waiters, store the wakeup
        if curr != State::Waiting {
            if curr != State::Closed {
                self.store(State::Woken);
            }
            return None;
        }

        let node = queue
            .pop_back()
            .expect("if the queue is Waiting, there must be waiters");
        let waker = Waiter::wake(node, queue, Wakeup::One);

        if queue.is_empty() {
            self.store(State::Empty);
        }

        waker
    }

    /// Drain waiters into `batch`. Returns `true` while waiters remain (the
    /// batch filled up before the queue was empty).
    fn drain_to_wake_batch(
        batch: &mut WakeBatch,
        queue: &mut List<Waiter>,
        wakeup: Wakeup,
    ) -> bool {
        while let Some(node) = queue.pop_back() {
            let Some(waker) = Waiter::wake(node, queue, wakeup.clone()) else {
                // enqueued by `subscribe` without a waker; nothing to invoke
                continue;
            };

            if batch.add_waker(waker) {
                break;
            }
        }

        !queue.is_empty()
    }

    fn load(&self) -> State {
        State::from_bits(self.state.load(Ordering::SeqCst))
    }

    fn store(&self, state: State) {
        self.state.store(state as usize, Ordering::SeqCst);
    }

    fn compare_exchange(&self, current: State, new: State) -> Result<State, State> {
        self.state
            .compare_exchange(
                current as usize,
                new as usize,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(State::from_bits)
            .map_err(State::from_bits)
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("state", &self.load())
            .finish_non_exhaustive()
    }
}

// === impl State ===

impl State {
    fn from_bits(bits: usize) -> Self {
        match bits {
            bits if bits == Self::Empty as usize => Self::Empty,
            bits if bits == Self::Waiting as usize => Self::Waiting,
            bits if bits == Self::Woken as usize => Self::Woken,
            bits if bits == Self::Closed as usize => Self::Closed,
            _ => unreachable!("invalid wait queue state: {bits:#b}"),
        }
    }
}

// === impl Waiter ===

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Waiter {
    /// Deliver `wakeup` to the waiter behind `this`, returning its registered
    /// waker if it has one.
    ///
    /// Must only be called on nodes just unlinked from `list`, while the list
    /// lock is held (witnessed by the `list` borrow).
    #[inline(always)]
    fn wake(this: NonNull<Self>, list: &mut List<Self>, wakeup: Wakeup) -> Option<Waker> {
        Waiter::with_node(this, list, |node| {
            node.linked = false;
            let waker = core::mem::replace(&mut node.wakeup, wakeup);
            match waker {
                Wakeup::Waiting(waker) => Some(waker),
                // registered via `subscribe` without polling; the future is
                // woken when it is actually polled
                Wakeup::Empty => None,
                _ => unreachable!("tried to wake a waiter in the {waker:?} state"),
            }
        })
    }

    /// Access the inner node. The `_list` borrow proves the list lock is
    /// held, which is what makes the access sound.
    #[inline(always)]
    fn with_node<T>(
        mut this: NonNull<Self>,
        _list: &mut List<Self>,
        f: impl FnOnce(&mut Node) -> T,
    ) -> T {
        // Safety: the list lock is held (witnessed by `_list`), so no other
        // thread is accessing the node.
        unsafe { f(&mut *this.as_mut().node.get()) }
    }

    fn poll_wait(
        mut self: Pin<&mut Self>,
        queue: &WaitQueue,
        waker: Option<&Waker>,
    ) -> Poll<Result<(), Closed>> {
        // Safety: we never move out of `ptr`, only mutate fields in place.
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(self.as_mut())) };
        let this = self.as_mut().project();

        match *this.state {
            WaitState::Start => {
                // fast path: consume a stored wakeup
                if queue
                    .compare_exchange(State::Woken, State::Empty)
                    .is_ok()
                {
                    *this.state = WaitState::Woken;
                    return Poll::Ready(Ok(()));
                }

                let mut waiters = queue.queue.lock();
                let mut queue_state = queue.load();

                // transition the queue to Waiting (or bail out)
                loop {
                    match queue_state {
                        State::Empty => {
                            match queue.compare_exchange(queue_state, State::Waiting) {
                                Ok(_) => break,
                                Err(actual) => queue_state = actual,
                            }
                        }
                        State::Waiting => break,
                        State::Woken => {
                            match queue.compare_exchange(queue_state, State::Empty) {
                                Ok(_) => {
                                    *this.state = WaitState::Woken;
                                    return Poll::Ready(Ok(()));
                                }
                                Err(actual) => queue_state = actual,
                            }
                        }
                        State::Closed => return Poll::Ready(Err(Closed(()))),
                    }
                }

                // enqueue the node
                *this.state = WaitState::Waiting;
                Waiter::with_node(ptr, &mut waiters, |node| {
                    debug_assert!(matches!(node.wakeup, Wakeup::Empty));
                    if let Some(waker) = waker {
                        node.wakeup = Wakeup::Waiting(waker.clone());
                    }
                    node.linked = true;
                });
                waiters.push_front(ptr);

                Poll::Pending
            }
            WaitState::Waiting => {
                let mut waiters = queue.queue.lock();
                Waiter::with_node(ptr, &mut waiters, |node| match node.wakeup {
                    Wakeup::Waiting(ref mut curr_waker) => {
                        if let Some(waker) = waker {
                            if !curr_waker.will_wake(waker) {
                                *curr_waker = waker.clone();
                            }
                        }
                        Poll::Pending
                    }
                    Wakeup::One | Wakeup::All => {
                        *this.state = WaitState::Woken;
                        Poll::Ready(Ok(()))
                    }
                    Wakeup::Closed => {
                        *this.state = WaitState::Woken;
                        Poll::Ready(Err(Closed(())))
                    }
                    Wakeup::Empty => {
                        if let Some(waker) = waker {
                            node.wakeup = Wakeup::Waiting(waker.clone());
                        }
                        Poll::Pending
                    }
                })
            }
            WaitState::Woken => Poll::Ready(Ok(())),
        }
    }

    /// Unlink this waiter from the queue. Called when a [`Wait`] future is
    /// dropped.
    ///
    /// If the waiter held an unconsumed [`Wakeup::One`] grant, the grant is
    /// handed to the next waiter (or stored), so that a cancelled or
    /// timed-out waiter never swallows a wakeup.
    fn release(mut self: Pin<&mut Self>, queue: &WaitQueue) {
        let state = *self.as_mut().project().state;
        // Safety: we never move out of `ptr`, only mutate fields in place.
        let ptr = NonNull::from(unsafe { Pin::into_inner_unchecked(self) });

        if state != WaitState::Waiting {
            return;
        }

        let mut waiters = queue.queue.lock();

        let was_linked = Waiter::with_node(ptr, &mut waiters, |node| {
            let linked = node.linked;
            node.linked = false;
            linked
        });
        if was_linked {
            // Safety: `linked` is only true while the node is an element of
            // this queue's list, and we hold the list lock.
            let _ = unsafe { waiters.remove(ptr) };
            if waiters.is_empty() && queue.load() == State::Waiting {
                queue.store(State::Empty);
            }
        }

        // pass on an unconsumed wakeup
        let has_grant =
            Waiter::with_node(ptr, &mut waiters, |node| matches!(node.wakeup, Wakeup::One));
        let next_waiter = if has_grant {
            let state = queue.load();
            queue.wake_locked(&mut waiters, state)
        } else {
            None
        };

        drop(waiters);

        if let Some(next) = next_waiter {
            next.wake();
        }
    }
}

// Safety: `Waiter`s are only ever linked while pinned inside a `Wait` future,
// which unlinks itself before its memory is reused (see `PinnedDrop`); node
// access is serialized by the queue's list lock.
unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Waiter>> {
        // Safety: `node` is the first field of `Waiter` (repr(C)), and
        // `addr_of` avoids materializing intermediate references.
        unsafe {
            let node = &*ptr::addr_of!((*target.as_ptr()).node);
            let links = ptr::addr_of_mut!((*node.get()).links);
            NonNull::new_unchecked(links)
        }
    }
}

// Safety: waiter nodes are only touched under the queue's list lock.
unsafe impl Send for Waiter {}
// Safety: see the `Send` impl above.
unsafe impl Sync for Waiter {}

// === impl Wait ===

impl Wait<'_> {
    /// Eagerly enqueue this waiter without registering a waker.
    ///
    /// Use this to join the queue *before* re-checking the guarded condition,
    /// closing the check-then-park race: a wakeup sent after `subscribe`
    /// returns is guaranteed to reach this waiter.
    pub(crate) fn subscribe(self: Pin<&mut Self>) -> Poll<Result<(), Closed>> {
        let this = self.project();
        this.waiter.poll_wait(this.queue, None)
    }
}

impl fmt::Debug for Wait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("waiter", &self.waiter)
            .finish_non_exhaustive()
    }
}

impl core::future::Future for Wait<'_> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.waiter.poll_wait(this.queue, Some(cx.waker()))
    }
}

#[pin_project::pinned_drop]
impl PinnedDrop for Wait<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.waiter.release(this.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use core::future::Future as _;
    use std::sync::Arc;
    use std::task::{Context, Wake, Waker};

    struct CountingWaker(std::sync::atomic::AtomicUsize);

    impl CountingWaker {
        fn new() -> Arc<Self> {
            Arc::new(Self(std::sync::atomic::AtomicUsize::new(0)))
        }
        fn count(&self) -> usize {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn stored_wakeup_completes_next_wait() {
        loom::model(|| {
            let queue = WaitQueue::new();
            queue.wake();

            let counter = CountingWaker::new();
            let waker = Waker::from(counter.clone());
            let mut cx = Context::from_waker(&waker);

            let mut wait = Box::pin(queue.wait());
            assert!(wait.as_mut().poll(&mut cx).is_ready());
        });
    }

    #[test]
    fn at_most_one_stored_wakeup() {
        loom::model(|| {
            let queue = WaitQueue::new();
            queue.wake();
            queue.wake();

            let counter = CountingWaker::new();
            let waker = Waker::from(counter.clone());
            let mut cx = Context::from_waker(&waker);

            let mut first = Box::pin(queue.wait());
            assert!(first.as_mut().poll(&mut cx).is_ready());

            let mut second = Box::pin(queue.wait());
            assert!(second.as_mut().poll(&mut cx).is_pending());
        });
    }

    #[test]
    fn fifo_wake_order() {
        loom::model(|| {
            let queue = WaitQueue::new();

            let first_counter = CountingWaker::new();
            let first_waker = Waker::from(first_counter.clone());
            let second_counter = CountingWaker::new();
            let second_waker = Waker::from(second_counter.clone());

            let mut first = Box::pin(queue.wait());
            let mut second = Box::pin(queue.wait());
            assert!(first
                .as_mut()
                .poll(&mut Context::from_waker(&first_waker))
                .is_pending());
            assert!(second
                .as_mut()
                .poll(&mut Context::from_waker(&second_waker))
                .is_pending());

            queue.wake();
            assert_eq!(first_counter.count(), 1);
            assert_eq!(second_counter.count(), 0);
            assert!(first
                .as_mut()
                .poll(&mut Context::from_waker(&first_waker))
                .is_ready());

            queue.wake();
            assert_eq!(second_counter.count(), 1);
        });
    }

    #[test]
    fn dropped_waiter_passes_grant_on() {
        loom::model(|| {
            let queue = WaitQueue::new();

            let first_counter = CountingWaker::new();
            let first_waker = Waker::from(first_counter.clone());
            let second_counter = CountingWaker::new();
            let second_waker = Waker::from(second_counter.clone());

            let mut first = Box::pin(queue.wait());
            let mut second = Box::pin(queue.wait());
            assert!(first
                .as_mut()
                .poll(&mut Context::from_waker(&first_waker))
                .is_pending());
            assert!(second
                .as_mut()
                .poll(&mut Context::from_waker(&second_waker))
                .is_pending());

            // the head waiter receives the grant, then gives up without
            // consuming it
            queue.wake();
            assert_eq!(first_counter.count(), 1);
            drop(first);

            // the grant must have moved to the second waiter
            assert_eq!(second_counter.count(), 1);
            assert!(second
                .as_mut()
                .poll(&mut Context::from_waker(&second_waker))
                .is_ready());
        });
    }

    #[test]
    fn last_dropped_waiter_stores_grant() {
        loom::model(|| {
            let queue = WaitQueue::new();
            let counter = CountingWaker::new();
            let waker = Waker::from(counter.clone());

            let mut wait = Box::pin(queue.wait());
            assert!(wait
                .as_mut()
                .poll(&mut Context::from_waker(&waker))
                .is_pending());

            queue.wake();
            drop(wait);

            // no other waiter existed; the grant becomes a stored wakeup
            assert!(queue.try_wait().is_ready());
        });
    }

    #[test]
    fn wake_all_wakes_everyone_and_stores_nothing() {
        loom::model(|| {
            let queue = WaitQueue::new();

            let counters: Vec<_> = (0..3).map(|_| CountingWaker::new()).collect();
            let wakers: Vec<_> = counters.iter().map(|c| Waker::from(c.clone())).collect();
            let mut waits: Vec<_> = (0..3).map(|_| Box::pin(queue.wait())).collect();

            for (wait, waker) in waits.iter_mut().zip(&wakers) {
                assert!(wait
                    .as_mut()
                    .poll(&mut Context::from_waker(waker))
                    .is_pending());
            }

            queue.wake_all();
            for counter in &counters {
                assert_eq!(counter.count(), 1);
            }
            for (wait, waker) in waits.iter_mut().zip(&wakers) {
                assert!(wait.as_mut().poll(&mut Context::from_waker(waker)).is_ready());
            }

            // wake_all does not store a wakeup for future waiters
            assert!(queue.try_wait().is_pending());
        });
    }

    #[test]
    fn close_errors_waiters() {
        loom::model(|| {
            let queue = WaitQueue::new();
            let counter = CountingWaker::new();
            let waker = Waker::from(counter.clone());
            let mut cx = Context::from_waker(&waker);

            let mut wait = Box::pin(queue.wait());
            assert!(wait.as_mut().poll(&mut cx).is_pending());

            queue.close();
            assert_eq!(wait.as_mut().poll(&mut cx), Poll::Ready(Err(Closed(()))));

            let mut late = Box::pin(queue.wait());
            assert_eq!(late.as_mut().poll(&mut cx), Poll::Ready(Err(Closed(()))));
        });
    }
}
