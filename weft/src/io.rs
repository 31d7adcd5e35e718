// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reactor-backed fd wrappers.
//!
//! [`Async`] adopts a file descriptor (forcing it into nonblocking mode),
//! registers it with one of the reactors, and offers deadline-bound
//! readiness waits plus `WouldBlock` retry loops for the actual syscalls.
//! This is the handoff point for I/O-performing subsystems built on top of
//! the core.

use crate::reactor::{self, Direction, Source};
use crate::runtime::Runtime;
use crate::sync::wait::{park, WakeSource};
use crate::time::Deadline;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// An fd registered with the reactor pool.
pub struct Async<T: AsRawFd> {
    source: Arc<Source>,
    inner: T,
}

impl<T: AsRawFd> Async<T> {
    /// Adopt `inner`, silently forcing its fd into nonblocking mode and
    /// registering it with one of the runtime's reactors.
    pub fn new(runtime: &Runtime, inner: T) -> io::Result<Self> {
        let raw = inner.as_raw_fd();
        set_nonblocking(raw)?;
        let source = runtime.reactor_handle().register(raw)?;
        Ok(Self { source, inner })
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.source.raw()
    }

    /// Park until the fd is readable, the deadline passes, or the task is
    /// cancelled.
    pub async fn wait_readable(&self, deadline: Deadline) -> WakeSource {
        self.wait(Direction::Read, deadline).await
    }

    /// Park until the fd is writable, the deadline passes, or the task is
    /// cancelled.
    pub async fn wait_writable(&self, deadline: Deadline) -> WakeSource {
        self.wait(Direction::Write, deadline).await
    }

    async fn wait(&self, dir: Direction, deadline: Deadline) -> WakeSource {
        let source = &self.source;
        let result = park(
            deadline,
            core::future::poll_fn(|cx| source.poll_ready(dir, cx)),
        )
        .await;
        if !result.is_ready() {
            // interest may still be armed; the next event must not wake a
            // waiter that no longer exists
            source.clear_waiter(dir);
        }
        result
    }

    /// Run `op` until it stops returning `WouldBlock`, waiting for
    /// readability in between.
    ///
    /// A reached deadline surfaces as [`io::ErrorKind::TimedOut`], a
    /// cancelled task as [`io::ErrorKind::Interrupted`].
    pub async fn read_with<R>(
        &self,
        op: impl FnMut(&T) -> io::Result<R>,
        deadline: Deadline,
    ) -> io::Result<R> {
        self.io_loop(Direction::Read, op, deadline).await
    }

    /// Write-side counterpart of [`read_with`](Self::read_with).
    pub async fn write_with<R>(
        &self,
        op: impl FnMut(&T) -> io::Result<R>,
        deadline: Deadline,
    ) -> io::Result<R> {
        self.io_loop(Direction::Write, op, deadline).await
    }

    async fn io_loop<R>(
        &self,
        dir: Direction,
        mut op: impl FnMut(&T) -> io::Result<R>,
        deadline: Deadline,
    ) -> io::Result<R> {
        loop {
            match op(&self.inner) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }

            match self.wait(dir, deadline).await {
                WakeSource::Ready => {}
                WakeSource::Timeout => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "io deadline reached"))
                }
                WakeSource::Cancelled => {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "task cancelled during io",
                    ))
                }
            }
        }
    }
}

impl<T: AsRawFd> Drop for Async<T> {
    fn drop(&mut self) {
        reactor::deregister(&self.source);
    }
}

impl<T: AsRawFd + core::fmt::Debug> core::fmt::Debug for Async<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Async")
            .field("fd", &self.source.raw())
            .field("inner", &self.inner)
            .finish()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: fcntl on a caller-owned fd with valid arguments; no memory is
    // passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        // Safety: see above.
        let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
