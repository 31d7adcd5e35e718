// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The event-loop layer: a small fixed pool of reactor threads.
//!
//! Each reactor thread runs an independent single-threaded loop around
//! [`polling::Poller`] (epoll/kqueue/event ports), converting fd readiness
//! and timer expiry into task wakeups. No user task is ever polled on a
//! reactor thread: firing a [`Waker`] re-enqueues the task on its own
//! processor.
//!
//! Timers are an ordered map per reactor; the poll timeout is the distance to
//! the earliest timer. Fd sources are slab-allocated and handed out
//! round-robin across the pool.

use parking_lot::Mutex;
use polling::{Event, Poller};
use slab::Slab;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

const READ: usize = 0;
const WRITE: usize = 1;

/// Which readiness direction an I/O wait is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Read => READ,
            Direction::Write => WRITE,
        }
    }
}

/// One reactor thread's shared state.
pub(crate) struct Shared {
    poller: Poller,
    /// Registered fd sources, indexed by their poller key.
    sources: Mutex<Slab<Arc<Source>>>,
    /// Armed timers, ordered by deadline. The `u64` disambiguates timers
    /// that fire at the same instant.
    timers: Mutex<BTreeMap<(Instant, u64), Waker>>,
    next_timer_id: AtomicU64,
    stop: AtomicBool,
}

/// Cheaply clonable handle to the whole reactor pool.
#[derive(Debug)]
pub(crate) struct PoolInner {
    reactors: Vec<Arc<Shared>>,
    next: AtomicUsize,
}

pub(crate) type PoolHandle = Arc<PoolInner>;

/// The reactor pool: owns the reactor threads. Dropping it stops them.
pub(crate) struct ReactorPool {
    inner: PoolHandle,
    threads: Vec<std::thread::JoinHandle<()>>,
}

// === impl ReactorPool ===

impl ReactorPool {
    pub(crate) fn start(num_threads: usize) -> io::Result<Self> {
        let reactors = (0..num_threads)
            .map(|_| {
                Ok(Arc::new(Shared {
                    poller: Poller::new()?,
                    sources: Mutex::new(Slab::new()),
                    timers: Mutex::new(BTreeMap::new()),
                    next_timer_id: AtomicU64::new(0),
                    stop: AtomicBool::new(false),
                }))
            })
            .collect::<io::Result<Vec<_>>>()?;

        let threads = reactors
            .iter()
            .enumerate()
            .map(|(i, shared)| {
                let shared = Arc::clone(shared);
                std::thread::Builder::new()
                    .name(format!("weft-reactor-{i}"))
                    .spawn(move || run(&shared))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                reactors,
                next: AtomicUsize::new(0),
            }),
            threads,
        })
    }

    pub(crate) fn handle(&self) -> PoolHandle {
        Arc::clone(&self.inner)
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        for shared in &self.inner.reactors {
            shared.stop.store(true, Ordering::Release);
            let _ = shared.poller.notify();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

// === impl PoolInner ===

impl PoolInner {
    fn next_reactor(&self) -> &Arc<Shared> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        &self.reactors[i]
    }

    /// Arm a timer on one of the reactors. The returned [`Timer`] future
    /// completes when `at` is reached and disarms itself when dropped.
    pub(crate) fn arm_timer(&self, at: Instant) -> Timer {
        let shared = Arc::clone(self.next_reactor());
        let id = shared.next_timer_id.fetch_add(1, Ordering::Relaxed);
        Timer {
            shared,
            when: at,
            id,
            registered: false,
        }
    }

    /// Register an fd with one of the reactors. The fd must already be in
    /// nonblocking mode.
    pub(crate) fn register(&self, raw: RawFd) -> io::Result<Arc<Source>> {
        Shared::register(self.next_reactor(), raw)
    }
}

// === impl Shared ===

impl Shared {
    fn register(shared: &Arc<Self>, raw: RawFd) -> io::Result<Arc<Source>> {
        let mut sources = shared.sources.lock();
        let entry = sources.vacant_entry();
        let key = entry.key();
        shared.poller.add(raw, Event::none(key))?;

        let source = Arc::new(Source {
            raw,
            key,
            reactor: Arc::downgrade(shared),
            state: Mutex::new([DirState::default(), DirState::default()]),
        });
        entry.insert(Arc::clone(&source));
        Ok(source)
    }
}

/// One reactor thread's loop: fire due timers, sleep in the poller until the
/// next timer or fd event, deliver readiness, repeat.
fn run(shared: &Arc<Shared>) {
    let _span = tracing::debug_span!("reactor", thread = ?std::thread::current().name()).entered();
    let mut events: Vec<Event> = Vec::new();
    let mut wakers: Vec<Waker> = Vec::new();

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        // fire due timers and compute the poll timeout
        let timeout = {
            let mut timers = shared.timers.lock();
            let now = Instant::now();

            let pending = timers.split_off(&(now + Duration::from_nanos(1), 0));
            let due = core::mem::replace(&mut *timers, pending);
            for (_, waker) in due {
                wakers.push(waker);
            }

            timers
                .keys()
                .next()
                .map(|(when, _)| when.saturating_duration_since(now))
        };

        if !wakers.is_empty() {
            tracing::trace!(expired = wakers.len(), "firing timers");
        }
        for waker in wakers.drain(..) {
            waker.wake();
        }

        events.clear();
        match shared.poller.wait(&mut events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::error!(?err, "reactor poll failed");
                break;
            }
        }

        for ev in events.drain(..) {
            let source = shared.sources.lock().get(ev.key).map(Arc::clone);
            let Some(source) = source else {
                // deregistered while the event was in flight
                continue;
            };

            let mut state = source.state.lock();
            if ev.readable {
                state[READ].ready = true;
                if let Some(waker) = state[READ].waker.take() {
                    wakers.push(waker);
                }
            }
            if ev.writable {
                state[WRITE].ready = true;
                if let Some(waker) = state[WRITE].waker.take() {
                    wakers.push(waker);
                }
            }
            // the poller is oneshot: re-arm whatever interest remains
            let interest = Event {
                key: source.key,
                readable: state[READ].waker.is_some(),
                writable: state[WRITE].waker.is_some(),
            };
            if interest.readable || interest.writable {
                if let Err(err) = shared.poller.modify(source.raw, interest) {
                    tracing::error!(?err, fd = source.raw, "failed to re-arm fd interest");
                }
            }
            drop(state);
        }

        for waker in wakers.drain(..) {
            waker.wake();
        }
    }
}

// === impl Source ===

/// A registered fd. One waiter per direction, like the single-consumer
/// event: at most one task may wait for readability and one for writability
/// at a time.
pub(crate) struct Source {
    raw: RawFd,
    key: usize,
    reactor: Weak<Shared>,
    state: Mutex<[DirState; 2]>,
}

#[derive(Default)]
struct DirState {
    ready: bool,
    waker: Option<Waker>,
}

impl Source {
    pub(crate) fn raw(&self) -> RawFd {
        self.raw
    }

    /// Poll for readiness in `dir`, consuming a pending readiness flag or
    /// registering the waker and arming fd interest.
    pub(crate) fn poll_ready(&self, dir: Direction, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(reactor) = self.reactor.upgrade() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "reactor has shut down",
            )));
        };

        let mut state = self.state.lock();
        let slot = &mut state[dir.index()];
        if slot.ready {
            slot.ready = false;
            return Poll::Ready(Ok(()));
        }

        debug_assert!(
            slot.waker
                .as_ref()
                .map_or(true, |w| w.will_wake(cx.waker())),
            "at most one task may wait per fd direction"
        );
        slot.waker = Some(cx.waker().clone());

        let interest = Event {
            key: self.key,
            readable: state[READ].waker.is_some(),
            writable: state[WRITE].waker.is_some(),
        };
        if let Err(err) = reactor.poller.modify(self.raw, interest) {
            state[dir.index()].waker = None;
            return Poll::Ready(Err(err));
        }

        Poll::Pending
    }

    /// Forget a previously registered direction waker (wait future dropped
    /// before readiness arrived).
    pub(crate) fn clear_waiter(&self, dir: Direction) {
        let mut state = self.state.lock();
        state[dir.index()].waker = None;
    }

    fn deregister(&self) {
        if let Some(reactor) = self.reactor.upgrade() {
            let _ = reactor.poller.delete(self.raw);
            reactor.sources.lock().try_remove(self.key);
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        // `sources` holds an Arc per registration, so `Drop` only runs once
        // the owning `Async` removed itself; deleting here covers the case
        // where the slab entry was already gone.
        if let Some(reactor) = self.reactor.upgrade() {
            let _ = reactor.poller.delete(self.raw);
        }
    }
}

/// Removes the registration of `source` from its reactor. Called by the
/// owning I/O wrapper on drop.
pub(crate) fn deregister(source: &Arc<Source>) {
    source.deregister();
}

// === impl Timer ===

/// Future that completes when its deadline is reached.
///
/// Dropping the timer before expiry disarms it.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timer {
    shared: Arc<Shared>,
    when: Instant,
    id: u64,
    registered: bool,
}

impl core::fmt::Debug for Shared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl Timer {
    /// The instant this timer fires at.
    pub fn deadline(&self) -> Instant {
        self.when
    }

    /// Disarm the timer without waiting for it.
    pub fn cancel(mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        if self.registered {
            self.shared.timers.lock().remove(&(self.when, self.id));
            self.registered = false;
        }
    }
}

impl core::future::Future for Timer {
    type Output = ();

    fn poll(mut self: core::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.when {
            self.disarm();
            return Poll::Ready(());
        }

        let key = (self.when, self.id);
        let mut timers = self.shared.timers.lock();
        timers.insert(key, cx.waker().clone());
        let is_earliest = timers.keys().next() == Some(&key);
        drop(timers);

        if !self.registered {
            self.registered = true;
            // wake the reactor so it recomputes its poll timeout
            if is_earliest {
                let _ = self.shared.poller.notify();
            }
        }

        Poll::Pending
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future as _;
    use std::pin::pin;
    use std::task::Wake;

    struct ThreadWaker(std::thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.unpark();
        }
    }

    fn block_on<F: core::future::Future>(future: F) -> F::Output {
        let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => std::thread::park(),
            }
        }
    }

    #[test]
    fn timer_fires() {
        let pool = ReactorPool::start(1).unwrap();
        let handle = pool.handle();

        let begin = Instant::now();
        block_on(handle.arm_timer(begin + Duration::from_millis(50)));
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn elapsed_timer_completes_immediately() {
        let pool = ReactorPool::start(1).unwrap();
        let handle = pool.handle();

        // a deadline in the past completes on the first poll, without ever
        // touching the timer map
        block_on(handle.arm_timer(Instant::now() - Duration::from_millis(5)));
    }

    #[test]
    fn dropped_timer_is_disarmed() {
        let pool = ReactorPool::start(1).unwrap();
        let handle = pool.handle();

        let timer = handle.arm_timer(Instant::now() + Duration::from_secs(3600));
        timer.cancel();

        // and the pool still shuts down promptly
        drop(pool);
    }

    #[test]
    fn timers_fire_in_order() {
        let pool = ReactorPool::start(1).unwrap();
        let handle = pool.handle();

        let begin = Instant::now();
        let far = handle.arm_timer(begin + Duration::from_millis(80));
        let near = handle.arm_timer(begin + Duration::from_millis(20));

        block_on(near);
        let near_elapsed = begin.elapsed();
        block_on(far);
        let far_elapsed = begin.elapsed();

        assert!(near_elapsed >= Duration::from_millis(20));
        assert!(far_elapsed >= Duration::from_millis(80));
        assert!(near_elapsed < far_elapsed);
    }
}
