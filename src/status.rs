// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use std::fmt;

/// Aggregate status of a workflow.
///
/// The integer codes are stable: they are persisted in the workflow store and
/// must not be renumbered.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    NotFound,
    Initialized,
    Scheduled,
    Running,
    Completed,
    Cancelled,
    Stopped,
    Failed,
    Error,
}

impl Status {
    /// Get the stored integer code for this status.
    pub fn code(self) -> i64 {
        match self {
            Status::NotFound => -1,
            Status::Initialized => 0,
            Status::Scheduled => 1,
            Status::Running => 2,
            Status::Completed => 3,
            Status::Cancelled => 4,
            Status::Stopped => 5,
            Status::Failed => 6,
            Status::Error => 7,
        }
    }

    /// Build a status from a stored integer code.
    ///
    /// Unknown codes map to `Status::Error`.
    ///
    pub fn from_code(code: i64) -> Status {
        match code {
            -1 => Status::NotFound,
            0 => Status::Initialized,
            1 => Status::Scheduled,
            2 => Status::Running,
            3 => Status::Completed,
            4 => Status::Cancelled,
            5 => Status::Stopped,
            6 => Status::Failed,
            _ => Status::Error,
        }
    }

    /// Get the name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Status::NotFound => "NotFound",
            Status::Initialized => "Initialized",
            Status::Scheduled => "Scheduled",
            Status::Running => "Running",
            Status::Completed => "Completed",
            Status::Cancelled => "Cancelled",
            Status::Stopped => "Stopped",
            Status::Failed => "Failed",
            Status::Error => "Error",
        }
    }

    /// Describe a workflow with this status for the operator log.
    pub fn message(self, workflow: i64) -> String {
        match self {
            Status::NotFound => format!("The workflow {workflow} was not found."),
            Status::Initialized => format!("The workflow {workflow} has been initialized."),
            Status::Scheduled => format!("The workflow {workflow} has been scheduled."),
            Status::Running => format!("The workflow {workflow} is running."),
            Status::Completed => format!("The workflow {workflow} was completed."),
            Status::Cancelled => format!("The workflow {workflow} has been cancelled."),
            Status::Stopped => format!("The workflow {workflow} has been stopped."),
            Status::Failed => format!("The workflow {workflow} failed."),
            Status::Error => format!("The workflow {workflow} has errors."),
        }
    }

    /// Check whether a workflow with this status can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Cancelled | Status::Stopped | Status::Failed
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a single job within a workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Waiting,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Stopped,
    Skipped,
}

impl JobState {
    /// Get the name used in job state vectors.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Stopped => "stopped",
            JobState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
