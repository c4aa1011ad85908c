// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, info, trace};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::job::{Job, TaskInfo};
use crate::status::{JobState, Status};
use crate::{Error, WorkflowId};

/// The client-submitted workflow specification.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WorkflowSpec {
    /// Display name, not necessarily unique.
    #[serde(default = "default_name")]
    pub name: String,

    /// Higher priority workflows are scheduled first.
    #[serde(default)]
    pub priority: i64,

    /// Optional path for the operator-facing job log.
    #[serde(default, alias = "logpath")]
    pub logfile: Option<PathBuf>,

    /// Resubmit an existing workflow by id.
    #[serde(default)]
    pub id: Option<WorkflowId>,

    /// Raw job objects, validated by [`WorkflowSpec::build_jobs`].
    #[serde(default)]
    pub jobs: Vec<Value>,
}

fn default_name() -> String {
    "unnamed".to_string()
}

impl WorkflowSpec {
    /// Parse a specification from the request payload.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the payload is not a workflow object.
    ///
    pub fn parse(data: &Value) -> Result<Self, Error> {
        let spec = serde_json::from_value(data.clone())?;
        Ok(spec)
    }

    /// Get the canonical JSON of the submitted jobs array.
    ///
    /// The blob is stored with the workflow and keys duplicate detection:
    /// two submissions with identical jobs arrays share one workflow row.
    ///
    pub fn jobs_blob(&self) -> String {
        Value::from(self.jobs.clone()).to_string()
    }

    /// Validate every job object and construct the job list.
    ///
    /// # Errors
    /// * `Error::EmptyWorkflow` when there are no jobs.
    /// * `Error::InvalidWorkflow` carrying `(index, reason)` for every job
    ///   that failed validation. No partial job list is produced.
    ///
    pub fn build_jobs(&self) -> Result<Vec<Job>, Error> {
        if self.jobs.is_empty() {
            return Err(Error::EmptyWorkflow);
        }

        let mut jobs = Vec::with_capacity(self.jobs.len());
        let mut errors = Vec::new();

        for (index, object) in self.jobs.iter().enumerate() {
            match Job::from_value(object) {
                Ok(job) => jobs.push(job),
                Err(reason) => errors.push((index, reason)),
            }
        }

        if errors.is_empty() {
            Ok(jobs)
        } else {
            Err(Error::InvalidWorkflow { errors })
        }
    }
}

/// A set of jobs submitted and tracked as a unit.
///
/// Jobs are partitioned into three disjoint index sets: `available` (not yet
/// dispatched), `running` (dispatched, unresolved), and `completed`
/// (terminal). The union of the partitions is always the full job list.
///
#[derive(Debug)]
pub struct Workflow {
    id: WorkflowId,
    name: String,
    log: Option<PathBuf>,
    priority: i64,
    jobs: Vec<Job>,

    available: Vec<usize>,
    running: BTreeSet<usize>,
    completed: BTreeSet<usize>,
    status: Status,
}

impl Workflow {
    /// Construct a workflow over a validated job list.
    pub fn new(
        id: WorkflowId,
        name: &str,
        log: Option<PathBuf>,
        priority: i64,
        jobs: Vec<Job>,
    ) -> Self {
        let available = (0..jobs.len()).collect();

        info!("WORKFLOW {id} ('{name}') has been generated.");

        Self {
            id,
            name: name.to_string(),
            log,
            priority,
            jobs,
            available,
            running: BTreeSet::new(),
            completed: BTreeSet::new(),
            status: Status::Initialized,
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn log(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Count the jobs in each partition: (available, running, completed).
    pub fn progress(&self) -> (usize, usize, usize) {
        (
            self.available.len(),
            self.running.len(),
            self.completed.len(),
        )
    }

    /// Select the jobs that are now dispatchable and mark them running.
    ///
    /// Jobs whose outputs are already present are skipped without running.
    /// When nothing was selected, nothing is running, and undispatched work
    /// remains, the workflow has stalled: the remaining jobs are failed.
    ///
    pub fn next(&mut self) -> Vec<Job> {
        if self.frozen() {
            trace!("WORKFLOW {}: frozen, nothing to schedule.", self.id);
            return Vec::new();
        }

        let id = self.id;
        let mut selected = Vec::new();
        let mut remaining = Vec::new();

        for index in std::mem::take(&mut self.available) {
            let job = &mut self.jobs[index];

            if job.completed(None) {
                debug!(
                    "WORKFLOW {id}: skipping '{}', the analysis was previously generated.",
                    job.command_line()
                );
                job.set_state(JobState::Skipped);
                self.completed.insert(index);
            } else if job.ready()
                && matches!(job.state(), JobState::Waiting | JobState::Scheduled)
            {
                job.set_state(JobState::Running);
                self.running.insert(index);
                selected.push(job.clone());
            } else {
                remaining.push(index);
            }
        }

        self.available = remaining;

        if !selected.is_empty() || !self.running.is_empty() {
            self.status = Status::Running;
        } else if self.available.is_empty() {
            self.status = Status::Completed;
        } else {
            self.fail_remaining();
            self.status = Status::Failed;
        }

        selected
    }

    /// Ingest the result of a finished task for the matching running job.
    ///
    /// A failing job with attempts remaining is returned to `available` for
    /// the next scheduling pass; otherwise the job is failed and so is the
    /// workflow. Results for jobs no longer tracked are ignored.
    ///
    pub fn update_status(&mut self, fingerprint: &str, info: TaskInfo) -> Status {
        let found = self
            .running
            .iter()
            .copied()
            .find(|&index| self.jobs[index].fingerprint() == fingerprint);

        let Some(index) = found else {
            debug!(
                "WORKFLOW {}: ignoring a task result for an untracked job.",
                self.id
            );
            return self.status;
        };

        self.running.remove(&index);

        let id = self.id;
        let returned = info.returned;
        let job = &mut self.jobs[index];
        job.record_info(info);

        let accepted = job.options.accepted_return_codes.contains(&returned);
        if !accepted || !job.completed(Some(returned)) {
            if job.may_retry() {
                job.retry();
                job.set_state(JobState::Scheduled);
                info!(
                    "WORKFLOW {id}: job '{}' returned {returned}, retrying (attempt {}).",
                    job.command_line(),
                    job.attempts()
                );
                self.available.push(index);
                self.status = Status::Running;
                return self.status;
            }

            job.push_error(format!("The job exited with status {returned}."));
            job.set_state(JobState::Failed);
            self.completed.insert(index);
            self.status = Status::Failed;
            return self.status;
        }

        job.set_state(JobState::Completed);
        self.completed.insert(index);

        if self.available.is_empty() && self.running.is_empty() {
            self.status = Status::Completed;
        } else if !self.running.is_empty() || self.has_ready_job() {
            self.status = Status::Running;
        } else {
            self.fail_remaining();
            self.status = Status::Failed;
        }

        self.status
    }

    /// Cancel every job that has not resolved and freeze the workflow.
    pub fn cancel(&mut self) {
        self.freeze(JobState::Cancelled, Status::Cancelled);
    }

    /// Stop every job that has not resolved and freeze the workflow.
    pub fn stop(&mut self) {
        self.freeze(JobState::Stopped, Status::Stopped);
    }

    /// Snapshot each job's status, description, errors, and task info.
    pub fn state(&self) -> Vec<Value> {
        self.jobs.iter().map(Job::state_value).collect()
    }

    fn frozen(&self) -> bool {
        matches!(self.status, Status::Cancelled | Status::Stopped)
    }

    fn has_ready_job(&self) -> bool {
        self.available
            .iter()
            .any(|&index| self.jobs[index].ready())
    }

    /// Fail every undispatched job with a "not run" record.
    fn fail_remaining(&mut self) {
        let id = self.id;

        for index in std::mem::take(&mut self.available) {
            let job = &mut self.jobs[index];
            info!(
                "WORKFLOW {id}: job '{}' was not run.",
                job.command_line()
            );
            job.push_error("The job was not run.".to_string());
            job.set_state(JobState::Failed);
            self.completed.insert(index);
        }
    }

    fn freeze(&mut self, state: JobState, status: Status) {
        for index in std::mem::take(&mut self.available) {
            self.jobs[index].set_state(state);
            self.completed.insert(index);
        }

        let running: Vec<usize> = self.running.iter().copied().collect();
        for index in running {
            self.jobs[index].set_state(state);
            self.completed.insert(index);
        }
        self.running.clear();

        self.status = status;
        info!("WORKFLOW {}: {}", self.id, status.message(self.id));
    }
}
