// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::TcpListener;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::WorkQueueConfig;
use crate::queue::{CompletedTask, QueueStats, Task, TaskId, TaskQueue};
use crate::{Error, OUTPUT_LIMIT};

/// Tasks executed concurrently by the local master.
const EXECUTION_SLOTS: usize = 4;

struct PendingTask {
    id: TaskId,
    task: Task,
    priority: i64,
}

struct RunningTask {
    child: Child,
    command: String,
    submitted: u64,
    output_path: PathBuf,
}

/// A queue master that runs its workers in local subprocesses.
///
/// `LocalQueue` implements the same submit/wait/cancel surface a remote
/// work queue master exposes, executing each task's command under
/// `/bin/sh` on the daemon host. Input and output staging is a no-op:
/// local tasks share the filesystem with the daemon.
///
pub struct LocalQueue {
    config: WorkQueueConfig,
    log_path: PathBuf,

    next_id: TaskId,
    pending: Vec<PendingTask>,
    running: HashMap<TaskId, RunningTask>,
    finished: Vec<CompletedTask>,

    transaction_log: Option<File>,
    listener: Option<TcpListener>,

    submitted: u64,
    completed: u64,
    cancelled: u64,
}

impl LocalQueue {
    /// Construct a local queue master.
    ///
    /// `log_path` is the resolved location of the queue's transaction log.
    ///
    pub fn new(config: WorkQueueConfig, log_path: PathBuf) -> Self {
        Self {
            config,
            log_path,
            next_id: 1,
            pending: Vec::new(),
            running: HashMap::new(),
            finished: Vec::new(),
            transaction_log: None,
            listener: None,
            submitted: 0,
            completed: 0,
            cancelled: 0,
        }
    }

    /// Start as many pending tasks as the execution slots allow.
    fn dispatch(&mut self) {
        while self.running.len() < EXECUTION_SLOTS && !self.pending.is_empty() {
            let best = self
                .pending
                .iter()
                .enumerate()
                .max_by_key(|(index, pending)| (pending.priority, std::cmp::Reverse(*index)))
                .map(|(index, _)| index);

            let Some(index) = best else {
                break;
            };
            let pending = self.pending.remove(index);

            if let Err(error) = self.spawn(&pending) {
                error!("Task {} failed to start: {error}", pending.id);
                self.finished.push(CompletedTask {
                    id: pending.id,
                    return_status: 127,
                    submitted: epoch_micros(),
                    finished: epoch_micros(),
                    output: error.to_string(),
                    command: pending.task.command,
                });
            }
        }
    }

    fn spawn(&mut self, pending: &PendingTask) -> Result<(), Error> {
        let output_path = env::temp_dir().join(format!(
            "yerba-task-{}-{}.out",
            std::process::id(),
            pending.id
        ));

        let output = File::create(&output_path)
            .map_err(|e| Error::FileWrite(output_path.clone(), e))?;
        let errors = output
            .try_clone()
            .map_err(|e| Error::FileWrite(output_path.clone(), e))?;

        if self.config.debug {
            debug!("Task {}: /bin/sh -c '{}'", pending.id, pending.task.command);
        }

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&pending.task.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(errors))
            .spawn()
            .map_err(|e| Error::SpawnProcess(pending.task.command.clone(), e))?;

        trace!("Task {} started as pid {}.", pending.id, child.id());

        self.running.insert(
            pending.id,
            RunningTask {
                child,
                command: pending.task.command.clone(),
                submitted: epoch_micros(),
                output_path,
            },
        );

        Ok(())
    }

    /// Reap one finished child, if any.
    fn reap(&mut self) -> Option<CompletedTask> {
        let mut finished_id = None;
        let mut return_status = 0;

        for (id, running) in &mut self.running {
            match running.child.try_wait() {
                Ok(Some(status)) => {
                    return_status = status
                        .code()
                        .unwrap_or_else(|| status.signal().map_or(-1, |signal| 128 + signal));
                    finished_id = Some(*id);
                    break;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("Unable to poll task {id}: {error}");
                }
            }
        }

        let id = finished_id?;
        let running = self.running.remove(&id)?;

        let output = read_output(&running.output_path);
        let _ = fs::remove_file(&running.output_path);

        let completed = CompletedTask {
            id,
            return_status,
            submitted: running.submitted,
            finished: epoch_micros(),
            output,
            command: running.command,
        };

        self.completed += 1;
        self.log_transaction(&completed);

        Some(completed)
    }

    /// Append one record to the queue's transaction log.
    fn log_transaction(&mut self, task: &CompletedTask) {
        let Some(file) = self.transaction_log.as_mut() else {
            return;
        };

        let result = writeln!(
            file,
            "Job: {}\nSubmitted at: {}\nCompleted at: {}\nAssigned to task: {}\nReturn status: {}\n{}\n",
            task.command, task.submitted, task.finished, task.id, task.return_status, task.output
        );

        if let Err(error) = result {
            warn!(
                "Unable to write '{}': {error}",
                self.log_path.display()
            );
        }
    }
}

impl TaskQueue for LocalQueue {
    fn initialize(&mut self) -> Result<(), Error> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| Error::QueueUnavailable(error.to_string()))?;
        }

        let transaction_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|error| {
                Error::QueueUnavailable(format!(
                    "unable to open '{}': {error}",
                    self.log_path.display()
                ))
            })?;
        self.transaction_log = Some(transaction_log);

        // The master advertises on the configured port; -1 selects any open
        // port.
        let port = if self.config.port >= 0 {
            self.config.port as u16
        } else {
            0
        };
        let listener = TcpListener::bind(("127.0.0.1", port))
            .map_err(|error| Error::QueueUnavailable(format!("port {port}: {error}")))?;
        listener.set_nonblocking(true)?;

        info!(
            "Started work queue master '{}' on port {} (catalog {}:{}).",
            self.config.project,
            listener.local_addr()?.port(),
            self.config.catalog_server,
            self.config.catalog_port,
        );
        self.listener = Some(listener);

        Ok(())
    }

    fn submit(&mut self, task: Task, priority: i64) -> Result<TaskId, Error> {
        let id = self.next_id;
        self.next_id += 1;
        self.submitted += 1;

        debug!("Scheduled task with id: {id}");

        self.pending.push(PendingTask { id, task, priority });
        self.dispatch();

        Ok(id)
    }

    fn wait(&mut self) -> Option<CompletedTask> {
        if let Some(finished) = self.finished.pop() {
            return Some(finished);
        }

        let completed = self.reap();
        if completed.is_some() {
            self.dispatch();
        }

        completed
    }

    fn cancel(&mut self, task: TaskId) -> bool {
        if let Some(index) = self.pending.iter().position(|pending| pending.id == task) {
            self.pending.remove(index);
            self.cancelled += 1;
            debug!("Cancelled pending task {task}.");
            return true;
        }

        if let Some(mut running) = self.running.remove(&task) {
            if let Err(error) = running.child.kill() {
                warn!("Unable to kill task {task}: {error}");
            }
            let _ = running.child.wait();
            let _ = fs::remove_file(&running.output_path);
            self.cancelled += 1;
            debug!("Cancelled running task {task}.");
            return true;
        }

        false
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted,
            pending: self.pending.len(),
            running: self.running.len(),
            completed: self.completed,
            cancelled: self.cancelled,
        }
    }

    fn shutdown(&mut self) {
        let outstanding: Vec<TaskId> = self.running.keys().copied().collect();
        for id in outstanding {
            self.cancel(id);
        }
        self.pending.clear();
        self.listener = None;
        self.transaction_log = None;
    }
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_micros() as u64)
        .unwrap_or_default()
}

fn read_output(path: &Path) -> String {
    match fs::read(path) {
        Ok(mut bytes) => {
            bytes.truncate(OUTPUT_LIMIT);
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Err(error) => {
            warn!("Unable to read '{}': {error}", path.display());
            String::new()
        }
    }
}
