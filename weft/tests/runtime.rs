// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spawn paths, processors, pools and the task lifecycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::sync::Event;
use weft::{
    current_task, CancelReason, Deadline, JoinError, OverloadAction, ProcessorConfig, Runtime,
    RuntimeConfig, SpawnError, WakeSource,
};

fn runtime_with(config: RuntimeConfig) -> Runtime {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
    Runtime::new(config).unwrap()
}

fn runtime() -> Runtime {
    runtime_with(RuntimeConfig::default())
}

#[test]
fn spawn_join_roundtrip() {
    let rt = runtime();
    let handle = rt.spawn(async { 2 + 2 }).unwrap();
    assert_eq!(rt.block_on(handle).unwrap(), 4);
    rt.shutdown(true);
}

#[test]
fn tasks_run_on_their_processor() {
    let mut config = RuntimeConfig::default();
    config.task_processors.push(ProcessorConfig {
        name: "aux".to_owned(),
        worker_threads: 1,
        ..ProcessorConfig::default()
    });
    let rt = runtime_with(config);

    let handle = rt
        .spawn_on("aux", async {
            std::thread::current().name().map(str::to_owned)
        })
        .unwrap();
    let name = rt.block_on(handle).unwrap().unwrap();
    assert!(name.starts_with("aux-worker-"), "ran on {name}");

    assert!(matches!(
        rt.spawn_on("nope", async {}),
        Err(SpawnError::UnknownProcessor(_))
    ));
    rt.shutdown(true);
}

#[test]
fn panics_are_captured() {
    let rt = runtime();
    let handle = rt.spawn(async { panic!("boom") }).unwrap();
    match rt.block_on(handle) {
        Err(JoinError::Panicked(message)) => assert_eq!(message, "boom"),
        other => panic!("unexpected join result: {other:?}"),
    }
    rt.shutdown(true);
}

#[test]
fn cancel_before_first_poll() {
    // a single busy worker guarantees the victim is still queued when we
    // cancel it
    let mut config = RuntimeConfig::default();
    config.task_processors[0].worker_threads = 1;
    let rt = runtime_with(config);

    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let blocker = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        rt.spawn(async move {
            started.store(true, Ordering::Release);
            while !release.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        })
        .unwrap()
    };
    while !started.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    let polled = Arc::new(AtomicBool::new(false));
    let victim = {
        let polled = Arc::clone(&polled);
        rt.spawn(async move {
            polled.store(true, Ordering::Release);
        })
        .unwrap()
    };
    assert!(victim.cancel());
    release.store(true, Ordering::Release);

    match rt.block_on(victim) {
        Err(JoinError::Cancelled(CancelReason::User)) => {}
        other => panic!("unexpected join result: {other:?}"),
    }
    assert!(!polled.load(Ordering::Acquire), "victim body must not run");
    rt.block_on(blocker).unwrap();
    rt.shutdown(true);
}

#[test]
fn pool_exhaustion_fails_spawn() {
    let mut config = RuntimeConfig::default();
    config.coroutine_pool.max_size = 1;
    let rt = runtime_with(config);

    let gate = Arc::new(Event::new());
    let holder = {
        let gate = Arc::clone(&gate);
        rt.spawn(async move {
            gate.wait(Deadline::NEVER).await;
        })
        .unwrap()
    };

    assert_eq!(rt.spawn(async {}).unwrap_err(), SpawnError::PoolExhausted);

    gate.send();
    rt.block_on(holder).unwrap();
    // the context slot is back
    rt.block_on(rt.spawn(async {}).unwrap()).unwrap();
    rt.shutdown(true);
}

#[test]
fn zero_capacity_pool_rejects_spawn() {
    let mut config = RuntimeConfig::default();
    config.coroutine_pool.max_size = 0;
    let rt = runtime_with(config);
    assert_eq!(rt.spawn(async {}).unwrap_err(), SpawnError::PoolExhausted);
    rt.shutdown(true);
}

#[test]
fn overload_sheds_new_tasks() {
    let mut config = RuntimeConfig::default();
    config.task_processors[0] = ProcessorConfig {
        name: "main".to_owned(),
        worker_threads: 1,
        queue_soft_limit: 0,
        overload_action: OverloadAction::CancelNewTasks,
    };
    let rt = runtime_with(config);

    // occupy the only worker without suspending
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let blocker = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        rt.spawn(async move {
            started.store(true, Ordering::Release);
            while !release.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        })
        .unwrap()
    };
    while !started.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    // fills the queue to length 1
    let queued = rt.spawn(async { 1 }).unwrap();
    // queue length now exceeds the soft limit: this one is shed
    let shed = rt.spawn(async { 2 }).unwrap();

    release.store(true, Ordering::Release);
    rt.block_on(blocker).unwrap();
    assert_eq!(rt.block_on(queued).unwrap(), 1);
    match rt.block_on(shed) {
        Err(JoinError::Cancelled(CancelReason::Overload)) => {}
        other => panic!("unexpected join result: {other:?}"),
    }

    assert_eq!(rt.default_processor().stats().cancelled_on_overload, 1);
    rt.shutdown(true);
}

#[test]
fn spawn_after_shutdown_fails() {
    let rt = runtime();
    rt.shutdown(true);
    assert_eq!(rt.spawn(async {}).unwrap_err(), SpawnError::Stopped);
}

#[test]
fn graceful_shutdown_waits_for_tasks() {
    let rt = runtime();
    let done = Arc::new(AtomicBool::new(false));
    {
        let done = Arc::clone(&done);
        rt.spawn(async move {
            weft::sleep_for(Duration::from_millis(50)).await;
            done.store(true, Ordering::Release);
        })
        .unwrap()
        .detach();
    }
    rt.shutdown(true);
    assert!(done.load(Ordering::Acquire));
}

#[test]
fn inherited_data_flows_to_children() {
    let rt = runtime();
    let rt2 = rt.clone();

    let handle = rt
        .spawn(async move {
            current_task::set_inherited("request-id", 17u64);

            let child = rt2
                .spawn(async {
                    // captured at spawn time
                    let seen = current_task::get_inherited::<u64>("request-id").map(|v| *v);
                    // the child's own writes stay local
                    current_task::set_inherited("request-id", 99u64);
                    seen
                })
                .unwrap();

            let seen_by_child = child.await.unwrap();
            let still_mine = current_task::get_inherited::<u64>("request-id").map(|v| *v);
            (seen_by_child, still_mine)
        })
        .unwrap();

    let (seen_by_child, still_mine) = rt.block_on(handle).unwrap();
    assert_eq!(seen_by_child, Some(17));
    assert_eq!(still_mine, Some(17));
    rt.shutdown(true);
}

#[test]
fn yield_now_interleaves_tasks() {
    let mut config = RuntimeConfig::default();
    config.task_processors[0].worker_threads = 1;
    let rt = runtime_with(config);

    let progress = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let progress = Arc::clone(&progress);
            rt.spawn(async move {
                let mut interleaved = false;
                let mut last = progress.load(Ordering::SeqCst);
                for _ in 0..100 {
                    progress.fetch_add(1, Ordering::SeqCst);
                    current_task::yield_now().await;
                    let now = progress.load(Ordering::SeqCst);
                    // someone else ran between our steps
                    if now > last + 1 {
                        interleaved = true;
                    }
                    last = now;
                }
                interleaved
            })
            .unwrap()
        })
        .collect();

    let interleavings: Vec<bool> = handles
        .into_iter()
        .map(|handle| rt.block_on(handle).unwrap())
        .collect();
    assert!(interleavings.iter().any(|&i| i), "tasks never interleaved");
    rt.shutdown(true);
}

#[test]
fn explicit_cancellation_point() {
    let rt = runtime();
    let handle = rt
        .spawn(async {
            assert!(current_task::cancellation_point().is_ok());
            current_task::cancel();
            assert!(current_task::should_cancel());
            current_task::cancellation_point().unwrap_err().reason
        })
        .unwrap();
    assert_eq!(rt.block_on(handle).unwrap(), CancelReason::User);
    rt.shutdown(true);
}

#[test]
fn set_deadline_cancels_later_waits() {
    let rt = runtime();
    let handle = rt
        .spawn(async {
            current_task::set_deadline(Deadline::after(Duration::from_millis(30)));
            // any further blocking call past the deadline reports Cancelled
            let source = weft::sleep_for(Duration::from_secs(10)).await;
            (source, current_task::cancellation_reason())
        })
        .unwrap();

    let (source, reason) = rt.block_on(handle).unwrap();
    assert_eq!(source, WakeSource::Cancelled);
    assert_eq!(reason, Some(CancelReason::Deadline));
    rt.shutdown(true);
}
