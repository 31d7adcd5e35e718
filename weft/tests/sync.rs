// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadline, cancellation and wake-source behavior of the synchronization
//! primitives.

use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::queue::{mpsc, spsc, PopError, PushError};
use weft::sync::{Condvar, Event, Mutex, Promise, Semaphore, SharedMutex};
use weft::{current_task, AcquireError, Deadline, Runtime, RuntimeConfig, WakeSource};

fn runtime() -> Runtime {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();

    let mut config = RuntimeConfig::default();
    config.task_processors[0].worker_threads = 2;
    Runtime::new(config).unwrap()
}

#[test]
fn reached_deadline_times_out_immediately() {
    let rt = runtime();
    rt.block_on(async {
        let event = Event::new();
        // deadline equal to "now"
        assert_eq!(event.wait(Deadline::passed()).await, WakeSource::Timeout);
        // deadline in the past
        let past = Deadline::at(Instant::now() - Duration::from_secs(1));
        assert_eq!(event.wait(past).await, WakeSource::Timeout);
        // a pending signal still beats nothing: it stays for the next wait
        event.send();
        assert_eq!(event.wait(Deadline::NEVER).await, WakeSource::Ready);
    });
    rt.shutdown(true);
}

#[test]
fn event_signal_before_wait() {
    let rt = runtime();
    rt.block_on(async {
        let event = Event::new();
        event.send();
        assert_eq!(event.wait(Deadline::NEVER).await, WakeSource::Ready);
        // consumed: the next wait parks until the deadline
        assert_eq!(
            event.wait(Deadline::after(Duration::from_millis(20))).await,
            WakeSource::Timeout
        );
    });
    rt.shutdown(true);
}

#[test]
fn event_wakes_parked_waiter() {
    let rt = runtime();
    let event = Arc::new(Event::new());

    let waiter = {
        let event = Arc::clone(&event);
        rt.spawn(async move { event.wait(Deadline::NEVER).await })
            .unwrap()
    };

    std::thread::sleep(Duration::from_millis(20));
    event.send();
    assert_eq!(rt.block_on(waiter).unwrap(), WakeSource::Ready);
    rt.shutdown(true);
}

#[test]
fn mutex_lock_times_out_under_contention() {
    let rt = runtime();
    let mutex = Arc::new(Mutex::new(()));

    rt.block_on(async {
        let guard = mutex.lock(Deadline::NEVER).await.unwrap();
        let contender = mutex.lock(Deadline::after(Duration::from_millis(30)));
        assert_eq!(contender.await.unwrap_err(), AcquireError::Timeout);
        drop(guard);
        // and the lock is still usable afterwards
        drop(mutex.lock(Deadline::NEVER).await.unwrap());
    });
    rt.shutdown(true);
}

#[test]
fn cancelled_task_cannot_lock() {
    let rt = runtime();
    let handle = rt
        .spawn(async {
            current_task::cancel();
            let mutex = Mutex::new(());
            // even an uncontended lock reports cancellation first
            mutex.lock(Deadline::NEVER).await.map(drop).unwrap_err()
        })
        .unwrap();
    assert_eq!(rt.block_on(handle).unwrap(), AcquireError::Cancelled);
    rt.shutdown(true);
}

#[test]
fn mutex_handoff_skips_cancelled_waiter() {
    let rt = runtime();
    let mutex = Arc::new(Mutex::new(0u32));

    let guard = rt.block_on(mutex.lock(Deadline::NEVER)).unwrap();

    // a waiter that will give up before acquiring
    let quitter = {
        let mutex = Arc::clone(&mutex);
        rt.spawn(async move {
            mutex
                .lock(Deadline::after(Duration::from_millis(30)))
                .await
                .map(drop)
                .unwrap_err()
        })
        .unwrap()
    };
    std::thread::sleep(Duration::from_millis(5));
    // a second waiter that stays
    let stayer = {
        let mutex = Arc::clone(&mutex);
        rt.spawn(async move {
            let mut guard = mutex.lock(Deadline::NEVER).await.unwrap();
            *guard += 1;
        })
        .unwrap()
    };

    // let the quitter time out at the head of the queue, then unlock: the
    // grant must skip it and reach the stayer
    assert_eq!(rt.block_on(quitter).unwrap(), AcquireError::Timeout);
    drop(guard);
    rt.block_on(stayer).unwrap();
    assert_eq!(*rt.block_on(mutex.lock(Deadline::NEVER)).unwrap(), 1);
    rt.shutdown(true);
}

#[test]
fn condvar_notify_one_wakes_a_waiter() {
    let rt = runtime();
    let state = Arc::new((Mutex::new(false), Condvar::new()));

    let waiter = {
        let state = Arc::clone(&state);
        rt.spawn(async move {
            let (mutex, condvar) = &*state;
            let guard = mutex.lock(Deadline::NEVER).await.unwrap();
            let (guard, source) = condvar
                .wait_while(guard, Deadline::NEVER, |ready| !*ready)
                .await;
            drop(guard);
            source
        })
        .unwrap()
    };

    std::thread::sleep(Duration::from_millis(30));
    {
        let (mutex, condvar) = &*state;
        let mut guard = rt.block_on(mutex.lock(Deadline::NEVER)).unwrap();
        *guard = true;
        drop(guard);
        condvar.notify_one();
    }

    assert_eq!(rt.block_on(waiter).unwrap(), WakeSource::Ready);
    rt.shutdown(true);
}

#[test]
fn condvar_notify_all_wakes_every_waiter() {
    let rt = runtime();
    let state = Arc::new((Mutex::new(false), Condvar::new()));

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let state = Arc::clone(&state);
        waiters.push(
            rt.spawn(async move {
                let (mutex, condvar) = &*state;
                let guard = mutex.lock(Deadline::NEVER).await.unwrap();
                let (guard, source) = condvar
                    .wait_while(guard, Deadline::NEVER, |ready| !*ready)
                    .await;
                drop(guard);
                source
            })
            .unwrap(),
        );
    }

    std::thread::sleep(Duration::from_millis(30));
    {
        let (mutex, condvar) = &*state;
        let mut guard = rt.block_on(mutex.lock(Deadline::NEVER)).unwrap();
        *guard = true;
        drop(guard);
        condvar.notify_all();
    }

    for waiter in waiters {
        assert_eq!(rt.block_on(waiter).unwrap(), WakeSource::Ready);
    }
    rt.shutdown(true);
}

#[test]
fn shared_mutex_writer_preference() {
    let rt = runtime();
    let lock = Arc::new(SharedMutex::new(0u32));

    rt.block_on(async {
        let read = lock.read(Deadline::NEVER).await.unwrap();

        // writer parks behind the reader
        let writer = {
            let lock = Arc::clone(&lock);
            async move {
                let mut guard = lock.write(Deadline::NEVER).await.unwrap();
                *guard += 1;
            }
        };
        let writer = futures::future::maybe_done(writer);
        let mut writer = Box::pin(writer);
        assert!(futures::poll!(writer.as_mut()).is_pending());

        // with a writer waiting, new readers are refused entry
        assert!(
            lock.read(Deadline::after(Duration::from_millis(20)))
                .await
                .is_err(),
            "writer preference must block new readers"
        );

        drop(read);
        writer.as_mut().await;
        assert_eq!(*lock.read(Deadline::NEVER).await.unwrap(), 1);
    });
    rt.shutdown(true);
}

#[test]
fn semaphore_limits_and_releases() {
    let rt = runtime();
    let semaphore = Arc::new(Semaphore::new(2));

    rt.block_on(async {
        let a = semaphore.acquire(1, Deadline::NEVER).await.unwrap();
        let b = semaphore.acquire(1, Deadline::NEVER).await.unwrap();
        assert_eq!(
            semaphore
                .acquire(1, Deadline::after(Duration::from_millis(20)))
                .await
                .unwrap_err(),
            AcquireError::Timeout
        );
        drop(a);
        let c = semaphore.acquire(1, Deadline::NEVER).await.unwrap();
        drop(b);
        drop(c);
        // batch acquire sees all permits again
        semaphore.acquire(2, Deadline::NEVER).await.unwrap();
    });
    rt.shutdown(true);
}

#[test]
fn future_wait_reports_timeout_without_cancelling() {
    let rt = runtime();
    rt.block_on(async {
        let promise = Promise::<u32>::new();
        let future = promise.future().unwrap();
        assert_eq!(
            future.wait(Deadline::after(Duration::from_millis(20))).await,
            WakeSource::Timeout
        );
        // the state is intact; a late value still arrives
        promise.set_value(5).unwrap();
        assert_eq!(future.get().await.unwrap(), 5);
    });
    rt.shutdown(true);
}

#[test]
fn cancelling_task_blocked_on_future_wait() {
    let rt = runtime();
    let promise = Promise::<u32>::new();
    let future = promise.future().unwrap();

    let waiter = rt
        .spawn(async move { future.wait(Deadline::NEVER).await })
        .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    waiter.cancel();
    assert_eq!(rt.block_on(waiter).unwrap(), WakeSource::Cancelled);
    rt.shutdown(true);
}

#[test]
fn queue_push_blocks_until_pop() {
    let rt = runtime();
    let (tx, rx) = spsc::channel::<u32>(1);

    tx.try_push(1).unwrap();

    let pusher = rt
        .spawn(async move {
            // full: parks until the consumer makes room
            tx.push(2, Deadline::NEVER).await.unwrap();
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(rx.try_pop(), Some(1));
    rt.block_on(pusher).unwrap();
    assert_eq!(rx.try_pop(), Some(2));
    rt.shutdown(true);
}

#[test]
fn zero_length_queue_blocks_every_push() {
    let rt = runtime();
    let (tx, rx) = mpsc::channel::<u32>(0);

    rt.block_on(async {
        assert_eq!(tx.try_push(1), Err(1));
        match tx.push(1, Deadline::after(Duration::from_millis(20))).await {
            Err(PushError::Timeout(1)) => {}
            other => panic!("unexpected push result: {other:?}"),
        }
    });
    drop(rx);
    rt.shutdown(true);
}

#[test]
fn queue_pop_times_out_and_sees_eof() {
    let rt = runtime();
    let (tx, rx) = spsc::channel::<u32>(4);

    rt.block_on(async {
        assert_eq!(
            rx.pop(Deadline::after(Duration::from_millis(20))).await,
            Err(PopError::Timeout)
        );
        tx.try_push(7).unwrap();
        drop(tx);
        // a value pushed before producer death is still delivered
        assert_eq!(rx.pop(Deadline::NEVER).await, Ok(7));
        assert_eq!(rx.pop(Deadline::NEVER).await, Err(PopError::Closed));
    });
    rt.shutdown(true);
}

#[test]
fn cancelled_task_fails_queue_ops() {
    let rt = runtime();
    let (tx, rx) = mpsc::channel::<u32>(0);

    let handle = rt
        .spawn(async move {
            current_task::cancel();
            let push = tx.push(1, Deadline::NEVER).await;
            let pop = rx.pop(Deadline::NEVER).await;
            (push, pop)
        })
        .unwrap();

    let (push, pop) = rt.block_on(handle).unwrap();
    assert!(matches!(push, Err(PushError::Cancelled(1))));
    assert_eq!(pop, Err(PopError::Cancelled));
    rt.shutdown(true);
}

#[test]
fn sleep_and_timeout() {
    let rt = runtime();
    rt.block_on(async {
        let begin = Instant::now();
        assert_eq!(
            weft::sleep_for(Duration::from_millis(50)).await,
            WakeSource::Ready
        );
        assert!(begin.elapsed() >= Duration::from_millis(50));

        // a future that finishes in time
        let ok = weft::timeout(Deadline::after(Duration::from_secs(5)), async { 1 }).await;
        assert_eq!(ok.unwrap(), 1);

        // one that does not
        let err = weft::timeout(
            Deadline::after(Duration::from_millis(30)),
            core::future::pending::<()>(),
        )
        .await;
        assert!(err.is_err());
    });
    rt.shutdown(true);
}
