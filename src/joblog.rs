// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, warn};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::job::Job;
use crate::status::JobState;
use crate::workflow::Workflow;
use crate::WorkflowId;

const SEPARATOR: &str = "#########################";

/// Writer for the operator-facing per-workflow job logs.
///
/// Each workflow is logged at most once, keyed on its id, so repeated
/// terminal transitions do not duplicate entries.
///
#[derive(Debug, Default)]
pub struct JobLogWriter {
    logged: HashSet<WorkflowId>,
}

impl JobLogWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the workflow's job results to its log file, once.
    ///
    /// Workflows without a log path are skipped. Write failures are logged
    /// and otherwise ignored: the operator log is advisory.
    ///
    pub fn write(&mut self, workflow: &Workflow) {
        let Some(path) = workflow.log() else {
            return;
        };

        if !self.logged.insert(workflow.id()) {
            return;
        }

        debug!(
            "WORKFLOW {}: writing results to '{}'.",
            workflow.id(),
            path.display()
        );

        let mut text = String::new();
        for job in workflow.jobs() {
            let _ = writeln!(text, "{SEPARATOR}");
            let _ = writeln!(text, "{}", job.description());
            write_job(&mut text, job);
            let _ = writeln!(text, "{SEPARATOR}");
            let _ = writeln!(text);
        }

        if let Err(error) = append(path, &text) {
            warn!("Unable to write '{}': {error}", path.display());
        }
    }
}

fn write_job(text: &mut String, job: &Job) {
    if job.state() == JobState::Skipped {
        let _ = writeln!(text, "Job: {}", job.command_line());
        let _ = writeln!(text, "Skipped: The analysis was previously generated.");
        return;
    }

    let Some(info) = job.info() else {
        let _ = writeln!(text, "Job: {}", job.command_line());
        let _ = writeln!(text, "The job was not run.");
        return;
    };

    let outputs: Vec<String> = job
        .outputs
        .iter()
        .map(|output| output.path.display().to_string())
        .collect();

    let _ = writeln!(text, "Job: {}", info.cmd);
    let _ = writeln!(text, "Submitted at: {}", info.started);
    let _ = writeln!(text, "Completed at: {}", info.ended);
    let _ = writeln!(text, "Execution time: {} sec", info.elapsed);
    let _ = writeln!(text, "Assigned to task: {}", info.taskid);
    let _ = writeln!(text, "Return status: {}", info.returned);
    let _ = writeln!(text, "Expected outputs: {}", outputs.join(", "));
    let _ = writeln!(text, "Command Output:");
    let _ = writeln!(text, "{}", info.output);
}

fn append(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serde_json::json;
    use serial_test::parallel;
    use std::fs;

    use super::*;
    use crate::job::TaskInfo;
    use crate::workflow::WorkflowSpec;

    fn workflow_with_log(log: &Path) -> Workflow {
        let spec = WorkflowSpec {
            jobs: vec![json!({"cmd": "align", "description": "align reads"})],
            ..WorkflowSpec::default()
        };
        Workflow::new(
            7,
            "logged",
            Some(log.to_path_buf()),
            0,
            spec.build_jobs().unwrap(),
        )
    }

    #[test]
    #[parallel]
    fn logs_job_info() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("workflow.log");

        let mut workflow = workflow_with_log(&log);
        let selected = workflow.next();
        workflow.update_status(
            &selected[0].fingerprint(),
            TaskInfo {
                started: 100,
                ended: 110,
                elapsed: 10.0,
                taskid: 4,
                returned: 0,
                cmd: "align".to_string(),
                output: "aligned 100 reads".to_string(),
            },
        );

        let mut writer = JobLogWriter::new();
        writer.write(&workflow);

        let contents = fs::read_to_string(&log).unwrap();
        assert!(contents.contains("align reads"));
        assert!(contents.contains("Assigned to task: 4"));
        assert!(contents.contains("aligned 100 reads"));
    }

    #[test]
    #[parallel]
    fn writes_each_workflow_once() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("workflow.log");

        let mut workflow = workflow_with_log(&log);
        workflow.cancel();

        let mut writer = JobLogWriter::new();
        writer.write(&workflow);
        writer.write(&workflow);

        let contents = fs::read_to_string(&log).unwrap();
        assert_eq!(contents.matches("The job was not run.").count(), 1);
    }

    #[test]
    #[parallel]
    fn skips_workflows_without_a_log_path() {
        let temp = TempDir::new().unwrap();

        let spec = WorkflowSpec {
            jobs: vec![json!({"cmd": "x"})],
            ..WorkflowSpec::default()
        };
        let workflow = Workflow::new(1, "quiet", None, 0, spec.build_jobs().unwrap());

        let mut writer = JobLogWriter::new();
        writer.write(&workflow);

        assert!(fs::read_dir(temp.path()).unwrap().next().is_none());
    }

    #[test]
    #[parallel]
    fn marks_skipped_jobs() {
        let temp = TempDir::new().unwrap();
        temp.child("done.txt").write_str("x").unwrap();
        let log = temp.path().join("workflow.log");
        let out = temp.path().join("done.txt");

        let spec = WorkflowSpec {
            jobs: vec![json!({"cmd": "x", "outputs": [out]})],
            ..WorkflowSpec::default()
        };
        let mut workflow = Workflow::new(
            2,
            "skippy",
            Some(log.clone()),
            0,
            spec.build_jobs().unwrap(),
        );
        workflow.next();

        let mut writer = JobLogWriter::new();
        writer.write(&workflow);

        let contents = fs::read_to_string(&log).unwrap();
        assert!(contents.contains("Skipped: The analysis was previously generated."));
    }
}
