// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task processors: named pools of worker OS threads draining a shared FIFO
//! ready queue.
//!
//! Every live task is bound to exactly one processor for its whole lifetime;
//! workers never pick up tasks of another processor, and there is no work
//! stealing across pools. Tasks that become ready at the same instant are
//! drained in FIFO order, with no priorities.

use crate::config::{OverloadAction, ProcessorConfig};
use crate::park::{Parker, ParkingLot, StdPark};
use crate::reactor::PoolHandle;
use crate::sync::wait;
use crate::task::TaskRef;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters exposed through [`Processor::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorStats {
    pub spawned: u64,
    pub completed: u64,
    pub cancelled_on_overload: u64,
    pub queue_len: usize,
    pub live_tasks: usize,
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    cancelled_on_overload: AtomicU64,
}

/// State shared between a processor's workers, its handle, and the headers
/// of its tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) name: String,
    queue: SegQueue<TaskRef>,
    queue_len: AtomicUsize,
    soft_limit: usize,
    overload: OverloadAction,
    /// Tasks spawned and not yet completed (queued, running, or parked).
    live: AtomicUsize,
    accepting: AtomicBool,
    stop: AtomicBool,
    lot: ParkingLot<StdPark>,
    reactors: PoolHandle,
    counters: Counters,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl Shared {
    pub(crate) fn reactors(&self) -> PoolHandle {
        Arc::clone(&self.reactors)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Whether the ready queue is past the configured soft limit and the
    /// overload action is to shed new tasks.
    pub(crate) fn sheds_new_tasks(&self) -> bool {
        self.overload == OverloadAction::CancelNewTasks
            && self.queue_len.load(Ordering::Relaxed) > self.soft_limit
    }

    /// Push a ready task and wake a parked worker.
    pub(crate) fn enqueue(&self, task: TaskRef) {
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        self.queue.push(task);
        self.lot.unpark_one();
    }

    pub(crate) fn on_task_spawned(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_overload_cancel(&self) {
        self.counters
            .cancelled_on_overload
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_task_complete(&self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            // hold the lock so a concurrent graceful stop cannot miss the
            // notification between its check and its wait
            let _guard = self.idle_lock.lock();
            self.idle_cv.notify_all();
        }
    }
}

/// A named worker pool. Created by the runtime from a [`ProcessorConfig`].
#[derive(Debug)]
pub struct Processor {
    pub(crate) shared: Arc<Shared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Processor {
    pub(crate) fn start(
        config: &ProcessorConfig,
        reactors: PoolHandle,
        stack_bytes: usize,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            queue: SegQueue::new(),
            queue_len: AtomicUsize::new(0),
            soft_limit: config.queue_soft_limit,
            overload: config.overload_action,
            live: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            lot: ParkingLot::with_capacity(config.worker_threads),
            reactors,
            counters: Counters::default(),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        });

        let workers = (0..config.worker_threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let mut builder = std::thread::Builder::new()
                    .name(format!("{}-worker-{index}", config.name));
                if stack_bytes > 0 {
                    builder = builder.stack_size(stack_bytes);
                }
                builder.spawn(move || worker_main(&shared, index))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn stats(&self) -> ProcessorStats {
        let shared = &self.shared;
        ProcessorStats {
            spawned: shared.counters.spawned.load(Ordering::Relaxed),
            completed: shared.counters.completed.load(Ordering::Relaxed),
            cancelled_on_overload: shared
                .counters
                .cancelled_on_overload
                .load(Ordering::Relaxed),
            queue_len: shared.queue_len.load(Ordering::Relaxed),
            live_tasks: shared.live.load(Ordering::SeqCst),
        }
    }

    /// Stop the processor.
    ///
    /// Intake closes immediately. With `graceful`, waits until the live-task
    /// count drains to zero before stopping the workers; tasks already
    /// accepted keep running and observe their cancellation flags at their
    /// own suspension points. Workers drain the remaining ready queue before
    /// exiting either way.
    ///
    /// Must not be called from one of this processor's own tasks.
    pub(crate) fn stop(&self, graceful: bool) {
        self.shared.accepting.store(false, Ordering::Release);

        if graceful {
            let mut guard = self.shared.idle_lock.lock();
            while self.shared.live.load(Ordering::SeqCst) > 0 {
                self.shared.idle_cv.wait(&mut guard);
            }
        }

        self.shared.stop.store(true, Ordering::Release);
        self.shared.lot.unpark_all();

        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_main(shared: &Arc<Shared>, index: usize) {
    let _reactors = wait::set_thread_reactors(shared.reactors());
    let _span =
        tracing::debug_span!("worker", processor = %shared.name, worker = index).entered();
    let parker = Parker::new(StdPark::for_current());

    loop {
        if let Some(task) = shared.queue.pop() {
            shared.queue_len.fetch_sub(1, Ordering::SeqCst);
            tracing::trace!(task.id = %task.id(), "running task");
            task.run();
            continue;
        }

        if shared.stop.load(Ordering::Acquire) {
            tracing::debug!(worker = index, "stop signal received, shutting down");
            break;
        }

        shared.lot.park(&parker, || {
            !shared.queue.is_empty() || shared.stop.load(Ordering::Acquire)
        });
    }
}
