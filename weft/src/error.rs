// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// Error returned when a task could not be spawned.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SpawnError {
    /// The context pool reached its `max_size`; the caller decides whether to
    /// retry, shed load, or propagate.
    #[error("context pool exhausted")]
    PoolExhausted,

    /// The target processor has stopped accepting new tasks.
    #[error("task processor is no longer accepting tasks")]
    Stopped,

    /// No processor with the requested name exists in this runtime.
    #[error("unknown task processor `{0}`")]
    UnknownProcessor(String),
}

/// Error returned by deadline-bound acquire operations (mutex locks, shared
/// locks, semaphore acquires).
///
/// `Timeout` is distinct from `Cancelled`: a timed-out task is not itself
/// cancelled and may keep running.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum AcquireError {
    /// The operation deadline was reached before the resource was acquired.
    #[error("wait deadline reached")]
    Timeout,

    /// The waiting task was cancelled.
    #[error("task cancelled while waiting")]
    Cancelled,
}

/// Error produced while validating a [`RuntimeConfig`](crate::RuntimeConfig).
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("no task processors configured")]
    NoProcessors,

    #[error("duplicate task processor name `{0}`")]
    DuplicateProcessor(String),

    #[error("default task processor `{0}` is not configured")]
    UnknownDefaultProcessor(String),

    #[error("task processor `{0}` has zero worker threads")]
    NoWorkers(String),

    #[error("event loop pool has zero threads")]
    NoReactors,

    #[error("failed to start runtime: {0}")]
    Io(String),
}
