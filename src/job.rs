// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, trace};
use path_absolutize::Absolutize;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::status::JobState;

/// Options controlling how a job's completion is judged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOptions {
    /// Return codes that count as success.
    pub accepted_return_codes: Vec<i32>,

    /// Whether zero-byte files satisfy input and output checks.
    pub allow_zero_length: bool,

    /// Additional attempts beyond the first.
    pub retries: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            accepted_return_codes: vec![0],
            allow_zero_length: true,
            retries: 0,
        }
    }
}

/// One declared input or output of a job.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobFile {
    pub path: PathBuf,
    pub directory: bool,
}

impl JobFile {
    /// Check that the file or directory is present on disk.
    ///
    /// Directories only need to exist. Plain files must exist and, when
    /// `allow_zero_length` is false, be non-empty.
    ///
    pub fn present(&self, allow_zero_length: bool) -> bool {
        let path = absolute(&self.path);

        if self.directory {
            return path.is_dir();
        }
        if !path.is_file() {
            return false;
        }

        allow_zero_length || !is_empty(&path)
    }
}

/// Information recorded when the task executing a job finishes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskInfo {
    /// Submission time in seconds since the epoch.
    pub started: i64,

    /// Completion time in seconds since the epoch.
    pub ended: i64,

    /// Execution time in seconds.
    pub elapsed: f64,

    /// Identifier of the task in the work queue.
    pub taskid: u64,

    /// The task's return status.
    pub returned: i32,

    /// The command the task executed.
    pub cmd: String,

    /// Captured task output, clipped to [`crate::OUTPUT_LIMIT`].
    pub output: String,
}

/// A single command invocation with declared inputs and outputs.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    cmd: String,
    script: Option<String>,
    arguments: String,
    description: String,

    /// Input files, sorted.
    pub inputs: Vec<JobFile>,

    /// Output files, sorted.
    pub outputs: Vec<JobFile>,

    /// Completion options.
    pub options: JobOptions,

    state: JobState,
    attempts: u32,
    info: Option<TaskInfo>,
    errors: Vec<String>,
}

impl Job {
    /// Construct a job from the client-submitted JSON object.
    ///
    /// # Errors
    /// Returns `Err(reason)` describing the first problem found. The caller
    /// pairs the reason with the job's index in the submission.
    ///
    pub fn from_value(object: &Value) -> Result<Job, String> {
        let Some(map) = object.as_object() else {
            return Err("The job was not an object".to_string());
        };

        let cmd = match map.get("cmd") {
            Some(Value::String(cmd)) if !cmd.is_empty() => cmd.clone(),
            _ => return Err("The command name was not specified".to_string()),
        };

        let script = match map.get("script") {
            None | Some(Value::Null) => None,
            Some(Value::String(script)) => Some(script.clone()),
            Some(_) => return Err("The script was invalid".to_string()),
        };

        let arguments = match map.get("args") {
            None | Some(Value::Null) => String::new(),
            Some(Value::Array(args)) => render_args(args)?,
            Some(_) => return Err("The job expected a list of arguments".to_string()),
        };

        let mut inputs = match parse_files(map.get("inputs")) {
            Err(()) => return Err("The job expected a list of inputs".to_string()),
            Ok(None) => return Err("An input was invalid".to_string()),
            Ok(Some(files)) => files,
        };

        let mut outputs = match parse_files(map.get("outputs")) {
            Err(()) => return Err("The job expected a list of outputs".to_string()),
            Ok(None) => return Err("An output was invalid".to_string()),
            Ok(Some(files)) => files,
        };

        inputs.sort();
        outputs.sort();

        let description = map
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let options = parse_options(map.get("options"))?;

        let job = Job {
            cmd,
            script,
            arguments,
            description,
            inputs,
            outputs,
            options,
            state: JobState::Waiting,
            attempts: 1,
            info: None,
            errors: Vec::new(),
        };

        if truthy(map.get("overwrite")) {
            debug!("The job will overwrite previous results: {}", job.command_line());
            job.clear();
        }

        Ok(job)
    }

    /// Get the full command line the task will execute.
    pub fn command_line(&self) -> String {
        format!("{}{}", self.cmd, self.arguments)
    }

    /// Get the job's command name.
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Get the job's script, if any.
    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    /// Get the job's description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Get the job's lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Set the job's lifecycle state.
    pub fn set_state(&mut self, state: JobState) {
        trace!("JOB: the status has been changed to {state}");
        self.state = state;
    }

    /// Get the number of attempts made, starting at 1.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Check whether the job may be attempted again after a failure.
    pub fn may_retry(&self) -> bool {
        self.attempts < self.options.retries + 1
    }

    /// Account for another attempt.
    pub fn retry(&mut self) {
        self.attempts += 1;
    }

    /// Get the recorded task information, if the job has run.
    pub fn info(&self) -> Option<&TaskInfo> {
        self.info.as_ref()
    }

    /// Record the information observed from the finished task.
    pub fn record_info(&mut self, info: TaskInfo) {
        debug!("JOB (status: {}): the info field has been updated", self.state);
        self.info = Some(info);
    }

    /// Record an error message on the job.
    pub fn push_error(&mut self, error: String) {
        self.errors.push(error);
    }

    /// Get the errors recorded on the job.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Check that all declared inputs are present so the job can run.
    pub fn ready(&self) -> bool {
        self.inputs
            .iter()
            .all(|input| input.present(self.options.allow_zero_length))
    }

    /// Check whether the job has completed.
    ///
    /// Jobs with no declared outputs are judged by their return status alone:
    /// `returned` (or the recorded task info when `returned` is `None`) must
    /// be in the accepted codes. Otherwise every output must be present.
    ///
    pub fn completed(&self, returned: Option<i32>) -> bool {
        if self.outputs.is_empty() {
            let returned = returned.or_else(|| self.info.as_ref().map(|info| info.returned));
            return match returned {
                Some(code) => self.options.accepted_return_codes.contains(&code),
                None => false,
            };
        }

        self.outputs
            .iter()
            .all(|output| output.present(self.options.allow_zero_length))
    }

    /// Build the canonical fingerprint of the job.
    ///
    /// Two jobs with the same command line and the same sorted inputs and
    /// outputs share a fingerprint, and therefore share a task in the queue.
    ///
    pub fn fingerprint(&self) -> String {
        let inputs: Vec<String> = self.inputs.iter().map(file_key).collect();
        let outputs: Vec<String> = self.outputs.iter().map(file_key).collect();

        format!(
            "{}|{}|{}",
            self.command_line(),
            inputs.join(","),
            outputs.join(",")
        )
    }

    /// Remove the job's output files from previous runs.
    pub fn clear(&self) {
        for output in &self.outputs {
            let result = if output.directory {
                fs::remove_dir_all(&output.path)
            } else {
                fs::remove_file(&output.path)
            };

            if let Err(error) = result {
                trace!("Skipped removing '{}': {error}", output.path.display());
            }
        }
    }

    /// Snapshot the job's status, description, errors, and task information.
    pub fn state_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("status".into(), Value::from(self.state.as_str()));
        map.insert("description".into(), Value::from(self.description.clone()));
        map.insert(
            "errors".into(),
            Value::from(self.errors.clone()),
        );

        if let Some(info) = &self.info {
            if let Ok(Value::Object(fields)) = serde_json::to_value(info) {
                map.extend(fields);
            }
        }

        Value::Object(map)
    }
}

/// Resolve a path against the current working directory.
fn absolute(path: &Path) -> PathBuf {
    match path.absolutize() {
        Ok(path) => path.into_owned(),
        Err(_) => path.to_path_buf(),
    }
}

fn is_empty(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(metadata) => metadata.len() == 0,
        Err(_) => true,
    }
}

fn file_key(file: &JobFile) -> String {
    if file.directory {
        format!("{}/", file.path.display())
    } else {
        file.path.display().to_string()
    }
}

/// Render the argument vector into the command line suffix.
///
/// Each argument is a `[flag, value]` or `[flag, value, shorten]` triple.
/// With `shorten == 1`, an absolute path value renders as its basename.
///
fn render_args(args: &[Value]) -> Result<String, String> {
    let mut rendered = String::new();

    for arg in args {
        let Some(parts) = arg.as_array() else {
            return Err("The job expected a list of arguments".to_string());
        };
        if parts.len() < 2 || parts.len() > 3 {
            return Err("The job expected a list of arguments".to_string());
        }

        let flag = scalar_to_string(&parts[0])
            .ok_or_else(|| "The job expected a list of arguments".to_string())?;
        let mut value = scalar_to_string(&parts[1])
            .ok_or_else(|| "The job expected a list of arguments".to_string())?;
        let shorten = parts.get(2).and_then(Value::as_i64).unwrap_or(0);

        if shorten == 1 && Path::new(&value).is_absolute() {
            if let Some(name) = Path::new(&value).file_name() {
                value = name.to_string_lossy().to_string();
            }
        }

        rendered.push(' ');
        rendered.push_str(&flag);
        rendered.push(' ');
        rendered.push_str(&value);
    }

    Ok(rendered)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(string) => Some(string.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(boolean) => Some(boolean.to_string()),
        _ => None,
    }
}

/// Parse an input or output list.
///
/// Returns `Err(())` when the value is not a list, `Ok(None)` when any entry
/// is invalid, and `Ok(Some(files))` otherwise. Entries are either a path
/// string or a `[path, is_directory]` pair.
///
fn parse_files(value: Option<&Value>) -> Result<Option<Vec<JobFile>>, ()> {
    let entries = match value {
        None | Some(Value::Null) => return Ok(Some(Vec::new())),
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(()),
    };

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::String(path) => files.push(JobFile {
                path: PathBuf::from(path),
                directory: false,
            }),
            Value::Array(pair) => {
                let Some(path) = pair.first().and_then(Value::as_str) else {
                    return Ok(None);
                };
                let directory = match pair.get(1) {
                    Some(Value::Bool(directory)) => *directory,
                    Some(Value::Number(number)) => number.as_i64() == Some(1),
                    _ => false,
                };
                files.push(JobFile {
                    path: PathBuf::from(path),
                    directory,
                });
            }
            _ => return Ok(None),
        }
    }

    Ok(Some(files))
}

fn parse_options(value: Option<&Value>) -> Result<JobOptions, String> {
    let mut options = JobOptions::default();

    let Some(value) = value else {
        return Ok(options);
    };
    let Some(map) = value.as_object() else {
        if value.is_null() {
            return Ok(options);
        }
        return Err("The job options were invalid".to_string());
    };

    // Null values leave the defaults in place.
    if let Some(codes) = map.get("accepted-return-codes") {
        if !codes.is_null() {
            let codes = codes
                .as_array()
                .ok_or_else(|| "The job options were invalid".to_string())?;
            options.accepted_return_codes = codes
                .iter()
                .map(|code| code.as_i64().map(|code| code as i32))
                .collect::<Option<Vec<i32>>>()
                .ok_or_else(|| "The job options were invalid".to_string())?;
        }
    }

    if let Some(allow) = map.get("allow-zero-length") {
        if !allow.is_null() {
            options.allow_zero_length = allow
                .as_bool()
                .ok_or_else(|| "The job options were invalid".to_string())?;
        }
    }

    if let Some(retries) = map.get("retries") {
        if !retries.is_null() {
            let retries = retries
                .as_i64()
                .ok_or_else(|| "The job options were invalid".to_string())?;
            options.retries = retries.max(0) as u32;
        }
    }

    Ok(options)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(boolean)) => *boolean,
        Some(Value::Number(number)) => number.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serde_json::json;
    use serial_test::parallel;

    use super::*;

    fn job(value: Value) -> Job {
        Job::from_value(&value).expect("a valid job")
    }

    #[test]
    #[parallel]
    fn minimal_job() {
        let job = job(json!({"cmd": "/bin/true"}));

        assert_eq!(job.command_line(), "/bin/true");
        assert_eq!(job.state(), JobState::Waiting);
        assert_eq!(job.attempts(), 1);
        assert!(job.inputs.is_empty());
        assert!(job.outputs.is_empty());
        assert_eq!(job.options, JobOptions::default());
    }

    #[test]
    #[parallel]
    fn argument_rendering() {
        let job = job(json!({
            "cmd": "blast",
            "args": [["-i", "/data/query.fa", 1], ["-e", 0.001, 0], ["--verbose", true]],
        }));

        assert_eq!(
            job.command_line(),
            "blast -i query.fa -e 0.001 --verbose true"
        );
    }

    #[test]
    #[parallel]
    fn shorten_only_applies_to_absolute_paths() {
        let job = job(json!({
            "cmd": "sort",
            "args": [["-o", "relative/out.txt", 1]],
        }));

        assert_eq!(job.command_line(), "sort -o relative/out.txt");
    }

    #[test]
    #[parallel]
    fn validation_reasons() {
        let cases = [
            (json!({}), "The command name was not specified"),
            (json!({"cmd": ""}), "The command name was not specified"),
            (
                json!({"cmd": "x", "args": "no"}),
                "The job expected a list of arguments",
            ),
            (
                json!({"cmd": "x", "inputs": 7}),
                "The job expected a list of inputs",
            ),
            (
                json!({"cmd": "x", "outputs": {}}),
                "The job expected a list of outputs",
            ),
            (json!({"cmd": "x", "inputs": [null]}), "An input was invalid"),
            (
                json!({"cmd": "x", "outputs": ["a", null]}),
                "An output was invalid",
            ),
        ];

        for (value, reason) in cases {
            let result = Job::from_value(&value);
            assert_eq!(result.unwrap_err(), reason);
        }
    }

    #[test]
    #[parallel]
    fn inputs_and_outputs_are_sorted() {
        let job = job(json!({
            "cmd": "x",
            "inputs": ["b.txt", "a.txt"],
            "outputs": [["z", true], "y"],
        }));

        assert_eq!(job.inputs[0].path, PathBuf::from("a.txt"));
        assert_eq!(job.inputs[1].path, PathBuf::from("b.txt"));
        assert_eq!(job.outputs[0].path, PathBuf::from("y"));
        assert!(job.outputs[1].directory);
    }

    #[test]
    #[parallel]
    fn options_override_defaults() {
        let job = job(json!({
            "cmd": "x",
            "options": {
                "accepted-return-codes": [0, 2],
                "allow-zero-length": false,
                "retries": 3,
            },
        }));

        assert_eq!(job.options.accepted_return_codes, vec![0, 2]);
        assert!(!job.options.allow_zero_length);
        assert_eq!(job.options.retries, 3);
    }

    #[test]
    #[parallel]
    fn null_options_keep_defaults() {
        let job = job(json!({
            "cmd": "x",
            "options": {"retries": null, "allow-zero-length": null},
        }));

        assert_eq!(job.options, JobOptions::default());
    }

    #[test]
    #[parallel]
    fn ready_requires_all_inputs() {
        let temp = TempDir::new().unwrap();
        temp.child("present.txt").write_str("data").unwrap();

        let present = temp.path().join("present.txt");
        let missing = temp.path().join("missing.txt");

        let job_with_missing = job(json!({"cmd": "x", "inputs": [present, missing]}));
        assert!(!job_with_missing.ready());

        let job_with_present = job(json!({"cmd": "x", "inputs": [present]}));
        assert!(job_with_present.ready());
    }

    #[test]
    #[parallel]
    fn zero_length_policy() {
        let temp = TempDir::new().unwrap();
        temp.child("empty.txt").touch().unwrap();
        let empty = temp.path().join("empty.txt");

        let lenient = job(json!({"cmd": "x", "inputs": [empty]}));
        assert!(lenient.ready());

        let strict = job(json!({
            "cmd": "x",
            "inputs": [empty],
            "options": {"allow-zero-length": false},
        }));
        assert!(!strict.ready());
    }

    #[test]
    #[parallel]
    fn empty_directory_input_is_ready() {
        let temp = TempDir::new().unwrap();
        temp.child("data").create_dir_all().unwrap();
        let directory = temp.path().join("data");

        let job = job(json!({
            "cmd": "x",
            "inputs": [[directory, true]],
            "options": {"allow-zero-length": false},
        }));
        assert!(job.ready());
    }

    #[test]
    #[parallel]
    fn directory_input_requires_a_directory() {
        let temp = TempDir::new().unwrap();
        temp.child("data").write_str("a file, not a directory").unwrap();
        let path = temp.path().join("data");

        let job = job(json!({"cmd": "x", "inputs": [[path, true]]}));
        assert!(!job.ready());
    }

    #[test]
    #[parallel]
    fn completed_without_outputs_uses_return_status() {
        let job = job(json!({"cmd": "x", "options": {"accepted-return-codes": [0, 9]}}));

        assert!(job.completed(Some(0)));
        assert!(job.completed(Some(9)));
        assert!(!job.completed(Some(1)));
        assert!(!job.completed(None));
    }

    #[test]
    #[parallel]
    fn completed_without_outputs_falls_back_to_info() {
        let mut job = job(json!({"cmd": "x"}));
        job.record_info(TaskInfo {
            started: 0,
            ended: 1,
            elapsed: 1.0,
            taskid: 1,
            returned: 0,
            cmd: "x".to_string(),
            output: String::new(),
        });

        assert!(job.completed(None));
    }

    #[test]
    #[parallel]
    fn completed_with_outputs_checks_the_filesystem() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("result.txt");

        let job = job(json!({"cmd": "x", "outputs": [output]}));
        assert!(!job.completed(Some(0)));

        temp.child("result.txt").write_str("done").unwrap();
        assert!(job.completed(Some(0)));
    }

    #[test]
    #[parallel]
    fn zero_byte_output_fails_strict_completion() {
        let temp = TempDir::new().unwrap();
        temp.child("result.txt").touch().unwrap();
        let output = temp.path().join("result.txt");

        let job = job(json!({
            "cmd": "x",
            "outputs": [output],
            "options": {"allow-zero-length": false},
        }));
        assert!(!job.completed(Some(0)));
    }

    #[test]
    #[parallel]
    fn fingerprints_ignore_submission_order() {
        let a = job(json!({"cmd": "x", "args": [["-a", "1"]], "inputs": ["p", "q"]}));
        let b = job(json!({"cmd": "x", "args": [["-a", "1"]], "inputs": ["q", "p"]}));
        let c = job(json!({"cmd": "x", "args": [["-a", "2"]], "inputs": ["p", "q"]}));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    #[parallel]
    fn overwrite_removes_outputs() {
        let temp = TempDir::new().unwrap();
        temp.child("stale.txt").write_str("old").unwrap();
        let output = temp.path().join("stale.txt");

        job(json!({"cmd": "x", "outputs": [output.clone()], "overwrite": 1}));
        assert!(!output.exists());
    }

    #[test]
    #[parallel]
    fn retry_accounting() {
        let mut job = job(json!({"cmd": "x", "options": {"retries": 1}}));

        assert!(job.may_retry());
        job.retry();
        assert_eq!(job.attempts(), 2);
        assert!(!job.may_retry());
    }

    #[test]
    #[parallel]
    fn state_value_includes_info() {
        let mut job = job(json!({"cmd": "x", "description": "align reads"}));
        job.push_error("boom".to_string());
        job.record_info(TaskInfo {
            started: 10,
            ended: 15,
            elapsed: 5.0,
            taskid: 3,
            returned: 0,
            cmd: "x".to_string(),
            output: "ok".to_string(),
        });

        let value = job.state_value();
        assert_eq!(value["status"], "waiting");
        assert_eq!(value["description"], "align reads");
        assert_eq!(value["errors"][0], "boom");
        assert_eq!(value["taskid"], 3);
        assert_eq!(value["returned"], 0);
        assert_eq!(value["output"], "ok");
    }
}
