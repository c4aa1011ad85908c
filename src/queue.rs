// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

pub mod local;

use std::path::PathBuf;

use crate::Error;

/// Identifier assigned to a task by the queue master.
pub type TaskId = u64;

/// A file staged to or from a worker alongside a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFile {
    /// Path on the submitting host.
    pub local: PathBuf,

    /// Name on the worker, typically the basename of `local`.
    pub remote: String,

    /// Stage a whole directory tree rather than a single file.
    pub directory: bool,

    /// Allow the worker to cache the file between tasks.
    pub cache: bool,
}

/// A unit of execution handed to the queue master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    /// The full command line to execute.
    pub command: String,

    /// Files the worker needs before running.
    pub inputs: Vec<TaskFile>,

    /// Files the worker returns when finished.
    pub outputs: Vec<TaskFile>,
}

/// The observed result of a finished task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedTask {
    pub id: TaskId,

    /// The task's exit status.
    pub return_status: i32,

    /// Submission time in microseconds since the epoch.
    pub submitted: u64,

    /// Completion time in microseconds since the epoch.
    pub finished: u64,

    /// Captured combined output, clipped to [`crate::OUTPUT_LIMIT`].
    pub output: String,

    /// The command line the task executed.
    pub command: String,
}

/// Counters describing the queue's current load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub cancelled: u64,
}

/// A `TaskQueue` distributes tasks to workers and reports their results.
pub trait TaskQueue {
    /** Prepare the queue master for task submission.

    # Errors
    Returns `Err(yerba::Error::QueueUnavailable)` when the master cannot
    start, for example when the configured port is already bound or the
    transaction log cannot be opened. The daemon treats this as fatal.
    */
    fn initialize(&mut self) -> Result<(), Error>;

    /** Submit a task for execution.

    # Arguments
    * `task`: The task to execute.
    * `priority`: Higher priority tasks run first when workers are scarce.

    # Returns
    `Ok(task_id)` identifying the outstanding task.

    # Errors
    Returns `Err(yerba::Error)` when the submission fails.
    */
    fn submit(&mut self, task: Task, priority: i64) -> Result<TaskId, Error>;

    /// Poll for one finished task without blocking.
    ///
    /// Returns `None` when no task has finished since the last call. The
    /// caller drains the queue by calling `wait` until it returns `None`.
    ///
    fn wait(&mut self) -> Option<CompletedTask>;

    /// Cancel an outstanding task by id.
    ///
    /// Returns `true` when the task was pending or running and has been
    /// removed.
    ///
    fn cancel(&mut self, task: TaskId) -> bool;

    /// Get the queue's current load counters.
    fn stats(&self) -> QueueStats;

    /// Stop the master and release every outstanding task.
    fn shutdown(&mut self);
}
