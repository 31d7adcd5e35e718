// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadlines, sleeps and timeouts.

use crate::sync::wait::{self, WakeSource};
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::{Duration, Instant};

/// An absolute point on the monotonic clock, or "never".
///
/// Deadlines compose by [`min`](Self::min); `NEVER` is greater than every
/// finite deadline.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const NEVER: Deadline = Deadline(None);

    /// Deadline at the given instant.
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    /// Deadline that is already reached.
    pub fn passed() -> Self {
        Self(Some(Instant::now()))
    }

    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Whether the deadline has been reached. `NEVER` is never reached.
    pub fn is_reached(&self) -> bool {
        match self.0 {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) => Deadline(Some(a)),
            (None, b) => Deadline(b),
        }
    }

    /// Time left until the deadline; `None` for `NEVER`, zero if reached.
    pub fn time_left(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(at) => f.debug_tuple("Deadline").field(&at).finish(),
            None => f.write_str("Deadline(NEVER)"),
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Self::at(at)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::after(duration)
    }
}

/// Suspend the current task for `duration`.
///
/// Completes with [`WakeSource::Ready`] when the time elapsed, or
/// [`WakeSource::Cancelled`] if the task was cancelled first.
pub async fn sleep_for(duration: Duration) -> WakeSource {
    sleep_until(Deadline::after(duration)).await
}

/// Suspend the current task until `deadline`.
///
/// A `NEVER` deadline parks until cancellation. Requires a runtime context
/// (a task or a `block_on` thread) for finite deadlines.
pub async fn sleep_until(deadline: Deadline) -> WakeSource {
    match deadline.instant() {
        // the inner future never completes; only cancellation ends the park
        None => wait::park(Deadline::NEVER, core::future::pending::<()>()).await,
        Some(at) => {
            if deadline.is_reached() {
                return WakeSource::Ready;
            }
            let Some(reactors) = wait::current_reactors() else {
                panic!("sleep requires a weft runtime context");
            };
            let timer = reactors.arm_timer(at);
            wait::park(Deadline::NEVER, timer).await
        }
    }
}

/// Require `future` to complete before `deadline`.
///
/// Cancellation is not handled here: the inner future's own suspension
/// points observe it.
pub fn timeout<F>(deadline: Deadline, future: F) -> Timeout<F::IntoFuture>
where
    F: core::future::IntoFuture,
{
    Timeout {
        deadline,
        timer: None,
        future: future.into_future(),
    }
}

/// Future returned by [`timeout`].
#[pin_project::pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    deadline: Deadline,
    timer: Option<crate::reactor::Timer>,
    #[pin]
    future: F,
}

/// The deadline of a [`timeout`] elapsed before the inner future completed.
#[derive(Debug, PartialEq, Eq)]
pub struct Elapsed(pub(crate) ());

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("deadline elapsed")
    }
}

impl core::error::Error for Elapsed {}

impl<F: core::future::Future> core::future::Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(v) = this.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }

        if this.deadline.is_reached() {
            return Poll::Ready(Err(Elapsed(())));
        }

        if let Some(at) = this.deadline.instant() {
            if this.timer.is_none() {
                *this.timer = wait::current_reactors().map(|reactors| reactors.arm_timer(at));
            }
            if let Some(timer) = this.timer.as_mut() {
                if Pin::new(timer).poll(cx).is_ready() {
                    return Poll::Ready(Err(Elapsed(())));
                }
            }
        }

        Poll::Pending
    }
}
