// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;

use crate::event::{Event, Notifier};
use crate::job::TaskInfo;
use crate::joblog::JobLogWriter;
use crate::status::Status;
use crate::store::{WorkflowStore, WorkflowSummary};
use crate::workflow::{Workflow, WorkflowSpec};
use crate::{Error, WorkflowId};

/// Owner of every live workflow, mediating the store and the scheduler.
///
/// The manager validates submissions, keeps the id → workflow map for the
/// daemon's lifetime, persists lifecycle transitions, and emits scheduling
/// events consumed by the work queue service.
///
pub struct WorkflowManager {
    store: WorkflowStore,
    notifier: Notifier,
    workflows: HashMap<WorkflowId, Workflow>,
    joblog: JobLogWriter,
}

impl WorkflowManager {
    pub fn new(store: WorkflowStore, notifier: Notifier) -> Self {
        Self {
            store,
            notifier,
            workflows: HashMap::new(),
            joblog: JobLogWriter::new(),
        }
    }

    /// Validate and accept a workflow submission.
    ///
    /// An id in the specification resubmits that workflow; otherwise the
    /// jobs blob deduplicates against previous submissions. Submitting a
    /// workflow that is already running is idempotent.
    ///
    /// # Errors
    /// * `Error::EmptyWorkflow` / `Error::InvalidWorkflow` when validation
    ///   fails; no store row is created.
    /// * `Error::Store` when the submission cannot be recorded.
    ///
    pub fn submit(&mut self, data: &Value) -> Result<(WorkflowId, Status), Error> {
        let spec = WorkflowSpec::parse(data)?;

        // Validate before touching the store.
        let jobs = spec.build_jobs()?;
        let blob = spec.jobs_blob();

        let existing = match spec.id {
            Some(id) => self.store.get_workflow(id)?,
            None => self.store.find_workflow(&blob)?,
        };

        let id = match existing {
            Some(row)
                if row.status == Status::Running && self.workflows.contains_key(&row.id) =>
            {
                info!("WORKFLOW {}: already running, submission attached.", row.id);
                return Ok((row.id, Status::Running));
            }
            Some(row) => {
                self.store.update_workflow(
                    row.id,
                    &spec.name,
                    spec.logfile.as_deref(),
                    &blob,
                    spec.priority,
                )?;
                self.store
                    .update_status(row.id, Status::Initialized, false)?;
                row.id
            }
            None => self.store.add_workflow(
                &spec.name,
                spec.logfile.as_deref(),
                &blob,
                spec.priority,
                Status::Initialized,
            )?,
        };

        let workflow = Workflow::new(id, &spec.name, spec.logfile.clone(), spec.priority, jobs);
        self.workflows.insert(id, workflow);

        self.schedule(id);

        let status = match self.store.get_status(id) {
            Ok(status) => status,
            Err(error) => {
                warn!("Unable to read the status of workflow {id}: {error}");
                self.workflows[&id].status()
            }
        };

        Ok((id, status))
    }

    /// Mark the workflow scheduled and dispatch its ready jobs.
    pub fn schedule(&mut self, id: WorkflowId) {
        let Some(workflow) = self.workflows.get_mut(&id) else {
            debug!("Unable to schedule unknown workflow {id}.");
            return;
        };

        persist(&self.store, id, Status::Scheduled, false);

        let priority = workflow.priority();
        let jobs = workflow.next();
        debug!("WORKFLOW {id}: {} jobs ready for submission.", jobs.len());

        self.notifier.notify(Event::ScheduleTask {
            workflow: id,
            priority,
            jobs,
        });

        // Scheduling alone may finish the workflow, e.g. when every output
        // already exists.
        let status = workflow.status();
        if status.is_terminal() {
            persist(&self.store, id, status, true);
            self.joblog.write(&*workflow);
        }
    }

    /// Deliver a finished task's result to its workflow.
    ///
    /// On a non-terminal outcome the next batch of ready jobs is dispatched.
    /// Results for workflows that are no longer live are ignored.
    ///
    pub fn update(&mut self, id: WorkflowId, fingerprint: &str, info: TaskInfo) {
        let Some(workflow) = self.workflows.get_mut(&id) else {
            debug!("Ignoring a task result for unknown workflow {id}.");
            return;
        };

        let status = workflow.update_status(fingerprint, info);
        persist(&self.store, id, status, status.is_terminal());

        if status == Status::Running {
            let priority = workflow.priority();
            let jobs = workflow.next();
            self.notifier.notify(Event::ScheduleTask {
                workflow: id,
                priority,
                jobs,
            });

            let after = workflow.status();
            if after != status {
                persist(&self.store, id, after, after.is_terminal());
            }
            if after.is_terminal() {
                self.joblog.write(&*workflow);
            }
        } else if status.is_terminal() {
            self.joblog.write(&*workflow);
        }
    }

    /// Cancel a workflow and release its queued tasks.
    ///
    /// Cancelling an unknown id reports `NotFound`; cancelling a workflow
    /// that is not live reports its persisted status unchanged.
    ///
    pub fn cancel(&mut self, id: WorkflowId) -> Status {
        if let Some(workflow) = self.workflows.get_mut(&id) {
            workflow.cancel();
            persist(&self.store, id, Status::Cancelled, true);
            self.notifier.notify(Event::CancelTask { workflow: id });
            self.joblog.write(&*workflow);
            return Status::Cancelled;
        }

        match self.store.get_status(id) {
            Ok(status) => status,
            Err(error) => {
                warn!("Unable to read the status of workflow {id}: {error}");
                Status::NotFound
            }
        }
    }

    /// Get a workflow's persisted status and live job state vector.
    pub fn status(&self, id: WorkflowId) -> (Status, Vec<Value>) {
        let status = match self.store.get_status(id) {
            Ok(status) => status,
            Err(error) => {
                warn!("Unable to read the status of workflow {id}: {error}");
                Status::NotFound
            }
        };

        let jobs = self
            .workflows
            .get(&id)
            .map(Workflow::state)
            .unwrap_or_default();

        (status, jobs)
    }

    /// Fetch summary rows for the given workflows, or for all of them.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the store query fails.
    ///
    pub fn workflows(&self, ids: Option<&[WorkflowId]>) -> Result<Vec<WorkflowSummary>, Error> {
        self.store.fetch(ids)
    }

    /// Rehydrate a stored workflow and schedule it again.
    ///
    /// # Errors
    /// * `Error::WorkflowNotFound` when no row exists for the id.
    /// * Validation or store errors from rebuilding the job list.
    ///
    pub fn restart(&mut self, id: WorkflowId) -> Result<Status, Error> {
        let row = self
            .store
            .get_workflow(id)?
            .ok_or(Error::WorkflowNotFound(id))?;

        let spec = WorkflowSpec {
            name: row.name.clone(),
            priority: row.priority,
            logfile: row.log.clone(),
            id: Some(id),
            jobs: serde_json::from_str(&row.jobs)?,
        };
        let jobs = spec.build_jobs()?;

        info!("WORKFLOW {id}: restarting from the store.");

        let workflow = Workflow::new(id, &spec.name, spec.logfile.clone(), spec.priority, jobs);
        self.workflows.insert(id, workflow);
        self.store.update_status(id, Status::Initialized, false)?;

        self.schedule(id);

        Ok(self.workflows[&id].status())
    }

    /// Stop every workflow the store still believes is running.
    ///
    /// Runs at startup, so rows from a crashed daemon do not claim to be
    /// running, and again at shutdown.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the store update fails.
    ///
    pub fn cleanup(&mut self) -> Result<usize, Error> {
        self.store.stop_workflows()
    }

    /// Iterate over the live workflows.
    pub fn live(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.values()
    }
}

/// Persist a status change, warning instead of failing on store errors.
///
/// The in-memory workflow remains authoritative until the next successful
/// write.
///
fn persist(store: &WorkflowStore, id: WorkflowId, status: Status, completed: bool) {
    if let Err(error) = store.update_status(id, status, completed) {
        warn!("Unable to persist status {status} for workflow {id}: {error}");
    }
}
