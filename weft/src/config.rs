// Copyright 2025 the weft authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration.
//!
//! All knobs carry serde-friendly defaults, so a runtime can be built from an
//! empty config, from literal structs, or deserialized from whatever config
//! format the embedding application uses.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub coroutine_pool: ContextPoolConfig,
    pub task_processors: Vec<ProcessorConfig>,
    pub event_loops: ReactorConfig,
    /// Name used by spawn calls that don't nominate a processor.
    pub default_task_processor: String,
}

/// Bounds on live task contexts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextPoolConfig {
    /// Contexts accounted for up front; reported in stats.
    pub initial_size: usize,
    /// Hard ceiling on live contexts; spawns past it fail with
    /// [`SpawnError::PoolExhausted`](crate::SpawnError::PoolExhausted).
    pub max_size: usize,
    /// Stack size for worker threads. Tasks borrow their worker's stack
    /// while polled, so this is where per-context stack size lands.
    pub stack_bytes: usize,
}

/// One named worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub name: String,
    pub worker_threads: usize,
    /// Ready-queue length past which the overload action applies.
    pub queue_soft_limit: usize,
    pub overload_action: OverloadAction,
}

/// What a processor does with new tasks while its ready queue is over the
/// soft limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadAction {
    /// Accept the task normally.
    #[default]
    Ignore,
    /// Accept the task but mark it cancelled (reason `Overload`) before its
    /// first poll; it completes immediately with a cancellation error.
    CancelNewTasks,
}

/// Reactor (event loop) pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            coroutine_pool: ContextPoolConfig::default(),
            task_processors: vec![ProcessorConfig::default()],
            event_loops: ReactorConfig::default(),
            default_task_processor: "main".to_owned(),
        }
    }
}

impl Default for ContextPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 1000,
            max_size: 10_000,
            stack_bytes: 256 * 1024,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "main".to_owned(),
            worker_threads: num_cpus::get(),
            queue_soft_limit: 10_000,
            overload_action: OverloadAction::Ignore,
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { threads: 2 }
    }
}

impl RuntimeConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.task_processors.is_empty() {
            return Err(ConfigError::NoProcessors);
        }
        if self.event_loops.threads == 0 {
            return Err(ConfigError::NoReactors);
        }

        let mut names = HashSet::new();
        for proc in &self.task_processors {
            if !names.insert(proc.name.as_str()) {
                return Err(ConfigError::DuplicateProcessor(proc.name.clone()));
            }
            if proc.worker_threads == 0 {
                return Err(ConfigError::NoWorkers(proc.name.clone()));
            }
        }

        if !names.contains(self.default_task_processor.as_str()) {
            return Err(ConfigError::UnknownDefaultProcessor(
                self.default_task_processor.clone(),
            ));
        }

        Ok(())
    }
}
