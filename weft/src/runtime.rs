// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime assembly: context pool + task processors + reactor pool.

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, SpawnError};
use crate::park::{Parker, StdPark};
use crate::pool::{ContextPool, PoolStats};
use crate::proc::Processor;
use crate::reactor::{ReactorPool, Timer};
use crate::sync::wait;
use crate::task::{self, current_task, CancelReason, JoinHandle};
use crate::time::Deadline;
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// A running weft runtime. Cheap to clone; clones share the same processors
/// and reactors.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

struct RuntimeShared {
    pool: Arc<ContextPool>,
    procs: Vec<Processor>,
    by_name: HashMap<String, usize>,
    default_index: usize,
    reactors: ReactorPool,
    stopped: AtomicBool,
}

impl Runtime {
    /// Build and start a runtime from `config`.
    ///
    /// Worker and reactor threads are spawned here; the runtime is ready to
    /// accept tasks when this returns.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let reactors = ReactorPool::start(config.event_loops.threads)
            .map_err(|err| ConfigError::Io(err.to_string()))?;
        let pool = ContextPool::new(&config.coroutine_pool);

        let procs = config
            .task_processors
            .iter()
            .map(|proc_config| {
                Processor::start(
                    proc_config,
                    reactors.handle(),
                    config.coroutine_pool.stack_bytes,
                )
            })
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|err| ConfigError::Io(err.to_string()))?;

        let by_name: HashMap<String, usize> = procs
            .iter()
            .enumerate()
            .map(|(i, proc)| (proc.name().to_owned(), i))
            .collect();
        let default_index = by_name[&config.default_task_processor];

        tracing::debug!(
            processors = procs.len(),
            reactors = config.event_loops.threads,
            "runtime started"
        );

        Ok(Self {
            shared: Arc::new(RuntimeShared {
                pool,
                procs,
                by_name,
                default_index,
                reactors,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Build a runtime with default configuration.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(RuntimeConfig::default())
    }

    pub fn processor(&self, name: &str) -> Option<&Processor> {
        self.shared
            .by_name
            .get(name)
            .map(|&i| &self.shared.procs[i])
    }

    pub fn default_processor(&self) -> &Processor {
        &self.shared.procs[self.shared.default_index]
    }

    pub fn processors(&self) -> impl Iterator<Item = &Processor> {
        self.shared.procs.iter()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Spawn `future` on the default processor.
    ///
    /// The new task captures the calling task's inherited data and deadline
    /// (if called from a task).
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.do_spawn(self.default_processor(), None, future)
    }

    /// Spawn `future` on the named processor.
    #[track_caller]
    pub fn spawn_on<F>(&self, processor: &str, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let proc = self
            .processor(processor)
            .ok_or_else(|| SpawnError::UnknownProcessor(processor.to_owned()))?;
        self.do_spawn(proc, None, future)
    }

    /// Spawn with an explicit deadline, overriding the inherited one.
    #[track_caller]
    pub fn spawn_with_deadline<F>(
        &self,
        deadline: Deadline,
        future: F,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.do_spawn(self.default_processor(), Some(deadline), future)
    }

    /// Spawn on the named processor with an explicit deadline.
    #[track_caller]
    pub fn spawn_on_with_deadline<F>(
        &self,
        processor: &str,
        deadline: Deadline,
        future: F,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let proc = self
            .processor(processor)
            .ok_or_else(|| SpawnError::UnknownProcessor(processor.to_owned()))?;
        self.do_spawn(proc, Some(deadline), future)
    }

    #[track_caller]
    fn do_spawn<F>(
        &self,
        proc: &Processor,
        deadline: Option<Deadline>,
        future: F,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = &proc.shared;
        if !shared.is_accepting() {
            return Err(SpawnError::Stopped);
        }

        let slot = ContextPool::acquire(&self.shared.pool)?;

        // children inherit the parent's ambient data and (unless overridden)
        // its deadline
        let inherited = current_task::inherited();
        let deadline = deadline.unwrap_or_else(current_task::deadline);

        let (task, join) = task::new_task(Arc::clone(shared), future, slot, deadline, inherited);
        shared.on_task_spawned();

        if shared.sheds_new_tasks() {
            // accepted, but pre-cancelled: the worker completes it with a
            // cancellation error instead of polling it
            task.header().cancel.request(CancelReason::Overload);
            shared.note_overload_cancel();
            tracing::debug!(task.id = %task.id(), processor = %shared.name, "overload: shedding new task");
        }

        match task.header().state.transition_to_woken() {
            task::WakeAction::Enqueue => shared.enqueue(task),
            task::WakeAction::None => unreachable!("freshly built task must be enqueueable"),
        }

        Ok(join)
    }

    /// Drive `future` to completion on the calling thread.
    ///
    /// Intended for non-worker threads (main, tests). The calling thread
    /// parks between polls; runtime timers and I/O work normally.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _reactors = wait::set_thread_reactors(self.shared.reactors.handle());
        let parker = Parker::new(StdPark::for_current());
        let waker = parker.clone().into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut future = pin!(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(value) => return value,
                Poll::Pending => parker.park(),
            }
        }
    }

    /// Arm a timer on the reactor pool. Returns `None` for a `NEVER`
    /// deadline.
    pub fn arm_timer(&self, deadline: Deadline) -> Option<Timer> {
        deadline
            .instant()
            .map(|at| self.shared.reactors.handle().arm_timer(at))
    }

    pub(crate) fn reactor_handle(&self) -> crate::reactor::PoolHandle {
        self.shared.reactors.handle()
    }

    /// Stop all processors.
    ///
    /// With `graceful`, waits for in-flight tasks to drain first. Reactor
    /// threads stop when the last runtime handle is dropped. Must not be
    /// called from inside one of this runtime's tasks.
    pub fn shutdown(&self, graceful: bool) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for proc in &self.shared.procs {
            proc.stop(graceful);
        }
        tracing::debug!("runtime stopped");
    }
}

impl Drop for RuntimeShared {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            for proc in &self.procs {
                proc.stop(false);
            }
        }
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("processors", &self.shared.procs.len())
            .finish_non_exhaustive()
    }
}
