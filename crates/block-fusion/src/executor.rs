//! Running independent block tasks.
//!
//! An [`Executor`] receives every task of a stage at once, runs them in no
//! particular order and reports per-task failures after retrying. Stages
//! are barriers: `execute` returns only when every task has finished.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{FusionError, Result};

/// What a successful task did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The block was written.
    Written,
    /// Nothing contributes to the block; no write was made.
    Skipped,
}

/// A task that failed on its last attempt.
#[derive(Debug)]
pub struct TaskFailure {
    /// Position of the task in the submitted list.
    pub index: usize,
    pub attempts: u32,
    pub error: FusionError,
}

/// Result of one stage.
#[derive(Debug)]
pub struct ExecutionReport {
    pub stage: String,
    pub tasks: usize,
    pub written: usize,
    pub skipped: usize,
    pub failures: Vec<TaskFailure>,
    pub elapsed: Duration,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn a report with failures into the first task's error.
    pub fn into_result(mut self) -> Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        for failure in &self.failures {
            error!(
                stage = %self.stage,
                task = failure.index,
                attempts = failure.attempts,
                error = %failure.error,
                "Task failed"
            );
        }
        Err(self.failures.swap_remove(0).error)
    }
}

/// Runs the tasks of one stage.
pub trait Executor: Send + Sync {
    fn execute<T, F>(&self, stage: &str, tasks: &[T], task: F) -> ExecutionReport
    where
        T: Sync,
        F: Fn(&T) -> Result<TaskOutcome> + Sync;
}

/// Executes tasks on a local rayon thread pool.
pub struct LocalExecutor {
    pool: rayon::ThreadPool,
    max_attempts: u32,
}

impl LocalExecutor {
    /// Create an executor with `threads` workers (all CPUs when `None`).
    pub fn new(threads: Option<usize>, max_attempts: u32) -> Result<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("fusion-{}", i));
        if let Some(threads) = threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| FusionError::configuration(format!("cannot start worker pool: {}", e)))?;

        Ok(Self {
            pool,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        Self::new(config.threads, config.max_attempts)
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run_with_retry<T, F>(&self, stage: &str, index: usize, task: &T, run: &F) -> (u32, Result<TaskOutcome>)
    where
        F: Fn(&T) -> Result<TaskOutcome>,
    {
        let mut attempt = 1;
        loop {
            match run(task) {
                Ok(outcome) => return (attempt, Ok(outcome)),
                Err(e) if attempt < self.max_attempts => {
                    warn!(stage = stage, task = index, attempt = attempt, error = %e, "Retrying task");
                    attempt += 1;
                }
                Err(e) => return (attempt, Err(e)),
            }
        }
    }
}

impl Executor for LocalExecutor {
    fn execute<T, F>(&self, stage: &str, tasks: &[T], task: F) -> ExecutionReport
    where
        T: Sync,
        F: Fn(&T) -> Result<TaskOutcome> + Sync,
    {
        let start = Instant::now();
        info!(stage = stage, tasks = tasks.len(), threads = self.num_threads(), "Starting stage");

        let results: Vec<(usize, u32, Result<TaskOutcome>)> = self.pool.install(|| {
            tasks
                .par_iter()
                .enumerate()
                .map(|(index, t)| {
                    let (attempts, result) = self.run_with_retry(stage, index, t, &task);
                    (index, attempts, result)
                })
                .collect()
        });

        let mut report = ExecutionReport {
            stage: stage.to_string(),
            tasks: tasks.len(),
            written: 0,
            skipped: 0,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        };
        for (index, attempts, result) in results {
            match result {
                Ok(TaskOutcome::Written) => report.written += 1,
                Ok(TaskOutcome::Skipped) => report.skipped += 1,
                Err(error) => report.failures.push(TaskFailure {
                    index,
                    attempts,
                    error,
                }),
            }
        }
        report.elapsed = start.elapsed();

        info!(
            stage = stage,
            written = report.written,
            skipped = report.skipped,
            failed = report.failures.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Finished stage"
        );
        report
    }
}
