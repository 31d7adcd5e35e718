// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The context pool: a hard bound on live task contexts.
//!
//! Every spawn acquires a slot; the slot returns to the pool when the task's
//! future is dropped (completion or cancellation-before-start). A pool with
//! `max_size = 0` rejects every spawn.

use crate::config::ContextPoolConfig;
use crate::error::SpawnError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct ContextPool {
    max_size: usize,
    initial_size: usize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub peak: usize,
    pub initial_size: usize,
    pub max_size: usize,
}

impl ContextPool {
    pub(crate) fn new(config: &ContextPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            max_size: config.max_size,
            initial_size: config.initial_size,
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub(crate) fn acquire(pool: &Arc<Self>) -> Result<ContextSlot, SpawnError> {
        let mut live = pool.live.load(Ordering::SeqCst);
        loop {
            if live >= pool.max_size {
                return Err(SpawnError::PoolExhausted);
            }
            match pool
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => live = actual,
            }
        }

        pool.peak.fetch_max(live + 1, Ordering::Relaxed);
        Ok(ContextSlot {
            pool: Arc::clone(pool),
        })
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.live.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::Relaxed),
            initial_size: self.initial_size,
            max_size: self.max_size,
        }
    }
}

/// Permit for one live task context; releases itself on drop.
#[derive(Debug)]
pub(crate) struct ContextSlot {
    pool: Arc<ContextPool>,
}

impl Drop for ContextSlot {
    fn drop(&mut self) {
        let prev = self.pool.live.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "context pool accounting underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_size: usize) -> Arc<ContextPool> {
        ContextPool::new(&ContextPoolConfig {
            initial_size: 0,
            max_size,
            stack_bytes: 0,
        })
    }

    #[test]
    fn exhaustion_and_release() {
        let pool = pool(2);
        let a = ContextPool::acquire(&pool).unwrap();
        let _b = ContextPool::acquire(&pool).unwrap();
        assert_eq!(
            ContextPool::acquire(&pool).unwrap_err(),
            SpawnError::PoolExhausted
        );

        drop(a);
        let _c = ContextPool::acquire(&pool).unwrap();
        assert_eq!(pool.stats().live, 2);
        assert_eq!(pool.stats().peak, 2);
    }

    #[test]
    fn zero_capacity_pool_rejects_all() {
        let pool = pool(0);
        assert_eq!(
            ContextPool::acquire(&pool).unwrap_err(),
            SpawnError::PoolExhausted
        );
    }
}
