// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, info, trace, warn};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::event::{Event, Notifier};
use crate::job::{Job, TaskInfo};
use crate::queue::{CompletedTask, QueueStats, Task, TaskFile, TaskId, TaskQueue};
use crate::service::Service;
use crate::{Error, WorkflowId, OUTPUT_LIMIT};

struct TaskEntry {
    /// Workflows waiting on this task's completion.
    workflows: BTreeSet<WorkflowId>,
    job: Job,
}

/// Translates workflow jobs into distributed tasks and back.
///
/// The service keeps one outstanding task per job fingerprint. When two
/// workflows schedule an equal job, the second attaches to the first's task
/// instead of submitting a duplicate, and both receive the completion.
///
pub struct WorkQueueService {
    queue: Box<dyn TaskQueue>,
    notifier: Notifier,

    tasks: HashMap<TaskId, TaskEntry>,
    fingerprints: HashMap<String, TaskId>,
}

impl WorkQueueService {
    pub fn new(queue: Box<dyn TaskQueue>, notifier: Notifier) -> Self {
        Self {
            queue,
            notifier,
            tasks: HashMap::new(),
            fingerprints: HashMap::new(),
        }
    }

    /// Submit each ready job as a task, coalescing equal jobs.
    pub fn schedule(&mut self, workflow: WorkflowId, priority: i64, jobs: &[Job]) {
        for job in jobs {
            if !job.ready() {
                trace!(
                    "WORKFLOW {workflow}: job '{}' is not ready, skipping submission.",
                    job.command_line()
                );
                continue;
            }

            let fingerprint = job.fingerprint();

            if let Some(&task_id) = self.fingerprints.get(&fingerprint) {
                if let Some(entry) = self.tasks.get_mut(&task_id) {
                    entry.workflows.insert(workflow);
                    debug!("WORKFLOW {workflow}: attached to existing task {task_id}.");
                    continue;
                }
            }

            let task = build_task(job);
            match self.queue.submit(task, priority) {
                Ok(task_id) => {
                    info!(
                        "WORKFLOW {workflow}: scheduled '{}' as task {task_id}.",
                        job.command_line()
                    );
                    self.fingerprints.insert(fingerprint, task_id);
                    self.tasks.insert(
                        task_id,
                        TaskEntry {
                            workflows: BTreeSet::from([workflow]),
                            job: job.clone(),
                        },
                    );
                }
                Err(error) => {
                    // Report the submission failure as a failed task so the
                    // workflow can retry or fail on its own terms.
                    warn!(
                        "WORKFLOW {workflow}: unable to submit '{}': {error}",
                        job.command_line()
                    );
                    self.notifier.notify(Event::TaskDone {
                        workflow,
                        fingerprint,
                        info: TaskInfo {
                            started: 0,
                            ended: 0,
                            elapsed: 0.0,
                            taskid: 0,
                            returned: -1,
                            cmd: job.command_line(),
                            output: error.to_string(),
                        },
                    });
                }
            }
        }
    }

    /// Release the workflow's interest in its outstanding tasks.
    ///
    /// Tasks still needed by another workflow keep running; the rest are
    /// cancelled in the queue.
    ///
    pub fn cancel(&mut self, workflow: WorkflowId) {
        let mut released = Vec::new();

        for (task_id, entry) in &mut self.tasks {
            if entry.workflows.remove(&workflow) && entry.workflows.is_empty() {
                released.push(*task_id);
            }
        }

        for task_id in released {
            if let Some(entry) = self.tasks.remove(&task_id) {
                self.fingerprints.remove(&entry.job.fingerprint());
            }
            if self.queue.cancel(task_id) {
                info!("Cancelled task {task_id} for workflow {workflow}.");
            }
        }
    }

    /// Get the queue's load counters.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Count the tasks currently tracked.
    pub fn tracked(&self) -> usize {
        self.tasks.len()
    }

    /// Drain finished tasks and notify every subscribed workflow.
    fn drain(&mut self) {
        while let Some(completed) = self.queue.wait() {
            let Some(entry) = self.tasks.remove(&completed.id) else {
                trace!("Ignoring a result for untracked task {}.", completed.id);
                continue;
            };

            let fingerprint = entry.job.fingerprint();
            self.fingerprints.remove(&fingerprint);

            debug!(
                "Task {} returned status {}.",
                completed.id, completed.return_status
            );

            let info = task_info(&completed);
            for workflow in entry.workflows {
                self.notifier.notify(Event::TaskDone {
                    workflow,
                    fingerprint: fingerprint.clone(),
                    info: info.clone(),
                });
            }
        }
    }
}

impl Service for WorkQueueService {
    fn name(&self) -> &'static str {
        "workqueue"
    }

    fn group(&self) -> &'static str {
        "scheduler"
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.queue.initialize()
    }

    fn update(&mut self) {
        self.drain();
    }

    fn stop(&mut self) {
        self.queue.shutdown();
    }
}

impl Service for Rc<RefCell<WorkQueueService>> {
    fn name(&self) -> &'static str {
        "workqueue"
    }

    fn group(&self) -> &'static str {
        "scheduler"
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.borrow_mut().initialize()
    }

    fn update(&mut self) {
        self.borrow_mut().update();
    }

    fn stop(&mut self) {
        self.borrow_mut().stop();
    }
}

/// Build the queue task for a job.
///
/// Inputs and outputs are staged under their basenames on the worker.
/// Outputs are never cached: each run must return fresh results.
///
fn build_task(job: &Job) -> Task {
    let stage = |file: &crate::job::JobFile, cache: bool| TaskFile {
        local: file.path.clone(),
        remote: file
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.path.display().to_string()),
        directory: file.directory,
        cache,
    };

    Task {
        command: job.command_line(),
        inputs: job.inputs.iter().map(|file| stage(file, true)).collect(),
        outputs: job.outputs.iter().map(|file| stage(file, false)).collect(),
    }
}

/// Convert a completed task into the info record attached to jobs.
fn task_info(task: &CompletedTask) -> TaskInfo {
    let mut output = task.output.clone();
    if output.len() > OUTPUT_LIMIT {
        let mut end = OUTPUT_LIMIT;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
    }

    TaskInfo {
        started: (task.submitted / 1_000_000) as i64,
        ended: (task.finished / 1_000_000) as i64,
        elapsed: task.finished.saturating_sub(task.submitted) as f64 / 1e6,
        taskid: task.id,
        returned: task.return_status,
        cmd: task.command.clone(),
        output,
    }
}
