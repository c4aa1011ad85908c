// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{info, warn};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use std::sync::mpsc::Receiver;

use crate::config::Config;
use crate::event::{self, Event};
use crate::manager::WorkflowManager;
use crate::queue::local::LocalQueue;
use crate::queue::TaskQueue;
use crate::router::Router;
use crate::service::ServiceManager;
use crate::status::Status;
use crate::store::WorkflowStore;
use crate::workqueue::WorkQueueService;
use crate::{Error, WorkflowId};

/// The single owner of the daemon's state.
///
/// `Engine` holds the workflow manager, the service registry, and the event
/// channel connecting them. Request handlers and the scheduler both run on
/// the loop thread; events queued during a request are applied before the
/// next request is read, which keeps task completions ordered after the
/// requests that were in flight when they arrived.
///
pub struct Engine {
    manager: WorkflowManager,
    services: ServiceManager,
    scheduler: Rc<RefCell<WorkQueueService>>,
    events: Receiver<Event>,
    running: bool,
}

impl Engine {
    /// Construct an engine backed by the local work queue.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the data directory or store cannot
    /// be opened.
    ///
    pub fn new(config: &Config) -> Result<Self, Error> {
        let queue = LocalQueue::new(config.workqueue.clone(), config.queue_log_path());
        Self::with_queue(config, Box::new(queue))
    }

    /// Construct an engine over any task queue implementation.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the data directory or store cannot
    /// be opened.
    ///
    pub fn with_queue(config: &Config, queue: Box<dyn TaskQueue>) -> Result<Self, Error> {
        fs::create_dir_all(&config.data_directory)
            .map_err(|e| Error::DirectoryCreate(config.data_directory.clone(), e))?;

        let store = WorkflowStore::open(&config.database_path(), config.start_index)?;
        let (notifier, events) = event::channel();

        let manager = WorkflowManager::new(store, notifier.clone());
        let scheduler = Rc::new(RefCell::new(WorkQueueService::new(queue, notifier)));

        let mut services = ServiceManager::new();
        services.register(Box::new(Rc::clone(&scheduler)));

        Ok(Self {
            manager,
            services,
            scheduler,
            events,
            running: true,
        })
    }

    /// Start services and reconcile rows left running by a previous daemon.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when a service fails to initialize; the
    /// daemon exits non-zero.
    ///
    pub fn start(&mut self) -> Result<(), Error> {
        let stopped = self.manager.cleanup()?;
        if stopped > 0 {
            info!("Stopped {stopped} workflows from a previous run.");
        }

        self.services.start()
    }

    /// Tick the services and apply the events they produced.
    pub fn tick(&mut self) {
        self.services.update();
        self.pump();
    }

    /// Drain the event channel, routing each event to its consumer.
    ///
    /// Applying an event may queue more; the pump loops until the channel
    /// is empty.
    ///
    pub fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                Event::ScheduleTask {
                    workflow,
                    priority,
                    jobs,
                } => {
                    self.scheduler
                        .borrow_mut()
                        .schedule(workflow, priority, &jobs);
                }
                Event::CancelTask { workflow } => {
                    self.scheduler.borrow_mut().cancel(workflow);
                }
                Event::TaskDone {
                    workflow,
                    fingerprint,
                    info,
                } => {
                    self.manager.update(workflow, &fingerprint, info);
                }
            }
        }
    }

    /// Stop services and flush the manager's cleanup.
    pub fn stop(&mut self) {
        self.services.stop();

        if let Err(error) = self.manager.cleanup() {
            warn!("Unable to stop running workflows in the store: {error}");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Log an operational snapshot of the queue and live workflows.
    pub fn log_snapshot(&self) {
        let stats = self.scheduler.borrow().stats();
        info!(
            "QUEUE: {} submitted, {} pending, {} running, {} completed, {} cancelled, {} tracked.",
            stats.submitted,
            stats.pending,
            stats.running,
            stats.completed,
            stats.cancelled,
            self.scheduler.borrow().tracked(),
        );

        for workflow in self.manager.live() {
            let (available, running, completed) = workflow.progress();
            info!(
                "WORKFLOW {} ('{}'): {}, {available} available, {running} running, {completed} completed.",
                workflow.id(),
                workflow.name(),
                workflow.status(),
            );
        }
    }

    // Request handlers, bound to routes by `routes()`.

    fn health(&mut self, _data: &Value) -> Value {
        json!({"status": "OK"})
    }

    fn schedule(&mut self, data: &Value) -> Value {
        match self.manager.submit(data) {
            Ok((id, status)) => json!({
                "status": status.name(),
                "id": id,
                "errors": null,
            }),
            Err(Error::InvalidWorkflow { errors }) => json!({
                "status": Status::Error.name(),
                "id": null,
                "errors": errors,
            }),
            Err(Error::EmptyWorkflow) => json!({
                "status": Status::Error.name(),
                "id": null,
                "errors": null,
            }),
            Err(error) => {
                warn!("Unable to submit a workflow: {error}");
                json!({"status": Status::Error.name()})
            }
        }
    }

    fn cancel(&mut self, data: &Value) -> Value {
        let Some(id) = data.get("id").and_then(Value::as_i64) else {
            return json!({"status": Status::NotFound.name()});
        };

        let status = self.manager.cancel(id);
        info!("{}", status.message(id));

        json!({"status": status.name()})
    }

    fn get_status(&mut self, data: &Value) -> Value {
        let Some(id) = data.get("id").and_then(Value::as_i64) else {
            return json!({"status": Status::NotFound.name(), "jobs": []});
        };

        let (status, jobs) = self.manager.status(id);

        json!({"status": status.name(), "jobs": jobs})
    }

    fn workflows(&mut self, data: &Value) -> Value {
        let ids: Option<Vec<WorkflowId>> = data.get("ids").and_then(|ids| {
            ids.as_array()
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        });

        match self.manager.workflows(ids.as_deref()) {
            Ok(rows) => {
                let result: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        json!([row.id, row.submitted, row.completed, row.status.name()])
                    })
                    .collect();
                json!({"workflows": result})
            }
            Err(error) => {
                warn!("Unable to fetch workflows: {error}");
                json!({"status": Status::Error.name()})
            }
        }
    }

    fn shutdown(&mut self, _data: &Value) -> Value {
        info!("Shutdown requested.");
        self.running = false;

        // The shutdown request expects no response.
        Value::Null
    }
}

/// Build the dispatch table over the engine's request handlers.
pub fn routes() -> Router<Engine> {
    let mut router = Router::new();

    router.register("health", |engine: &mut Engine, data: &Value| {
        engine.health(data)
    });
    router.register("schedule", |engine: &mut Engine, data: &Value| {
        engine.schedule(data)
    });
    router.register("cancel", |engine: &mut Engine, data: &Value| {
        engine.cancel(data)
    });
    router.register("get_status", |engine: &mut Engine, data: &Value| {
        engine.get_status(data)
    });
    router.register("workflows", |engine: &mut Engine, data: &Value| {
        engine.workflows(data)
    });
    router.register("shutdown", |engine: &mut Engine, data: &Value| {
        engine.shutdown(data)
    });

    router
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serde_json::json;
    use serial_test::parallel;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn engine(temp: &TempDir) -> (Engine, Router<Engine>) {
        let mut config = Config::default();
        config.data_directory = temp.path().join("data");

        let mut engine = Engine::new(&config).unwrap();
        engine.start().unwrap();

        (engine, routes())
    }

    fn request(
        engine: &mut Engine,
        router: &Router<Engine>,
        request: &str,
        data: Value,
    ) -> Value {
        let message = json!({"request": request, "data": data});
        let response = router.dispatch(engine, &message).unwrap();
        engine.pump();
        response
    }

    /// Tick the engine until the workflow reaches a terminal status.
    fn drive(engine: &mut Engine, router: &Router<Engine>, id: i64) -> Value {
        let deadline = Instant::now() + Duration::from_secs(30);

        loop {
            engine.tick();

            let response = request(engine, router, "get_status", json!({"id": id}));
            let status = response["status"].as_str().unwrap_or_default().to_string();
            if !matches!(status.as_str(), "Scheduled" | "Running" | "Initialized") {
                return response;
            }

            assert!(Instant::now() < deadline, "workflow {id} never settled");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    #[parallel]
    fn health_check() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        let response = request(&mut engine, &router, "health", Value::Null);
        assert_eq!(response["status"], "OK");
    }

    #[test]
    #[parallel]
    fn unknown_routes_fail() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        let result = router.dispatch(&mut engine, &json!({"request": "nope", "data": null}));
        assert!(matches!(result, Err(Error::RouteNotFound(_))));
    }

    #[test]
    #[parallel]
    fn workflow_runs_to_completion() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        let output = temp.path().join("result.txt");
        let response = request(
            &mut engine,
            &router,
            "schedule",
            json!({"name": "w", "jobs": [{
                "cmd": "touch",
                "args": [["", output]],
                "outputs": [output],
            }]}),
        );

        assert_eq!(response["status"], "Scheduled");
        assert_eq!(response["errors"], Value::Null);
        let id = response["id"].as_i64().unwrap();

        let status = drive(&mut engine, &router, id);
        assert_eq!(status["status"], "Completed");
        assert_eq!(status["jobs"][0]["status"], "completed");
        assert_eq!(status["jobs"][0]["returned"], 0);
        assert!(output.is_file());
    }

    #[test]
    #[parallel]
    fn existing_outputs_are_skipped() {
        let temp = TempDir::new().unwrap();
        temp.child("done.txt").write_str("previously generated").unwrap();
        let output = temp.path().join("done.txt");

        let (mut engine, router) = engine(&temp);

        let response = request(
            &mut engine,
            &router,
            "schedule",
            json!({"jobs": [{"cmd": "touch", "args": [["", output]], "outputs": [output]}]}),
        );

        assert_eq!(response["status"], "Completed");

        let id = response["id"].as_i64().unwrap();
        let status = request(&mut engine, &router, "get_status", json!({"id": id}));
        assert_eq!(status["jobs"][0]["status"], "skipped");
    }

    #[test]
    #[parallel]
    fn failing_jobs_retry_then_fail() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        // Appends one line per attempt, always failing.
        let attempts = temp.path().join("attempts.txt");
        let command = format!("echo attempt >> {}; exit 1", attempts.display());

        let response = request(
            &mut engine,
            &router,
            "schedule",
            json!({"jobs": [{
                "cmd": command,
                "options": {"retries": 1},
            }]}),
        );
        let id = response["id"].as_i64().unwrap();

        let status = drive(&mut engine, &router, id);
        assert_eq!(status["status"], "Failed");
        assert_eq!(status["jobs"][0]["status"], "failed");

        let recorded = std::fs::read_to_string(&attempts).unwrap();
        assert_eq!(recorded.lines().count(), 2);
    }

    #[test]
    #[parallel]
    fn validation_errors_are_reported() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        let response = request(
            &mut engine,
            &router,
            "schedule",
            json!({"jobs": [{"cmd": "ok"}, {}]}),
        );

        assert_eq!(response["status"], "Error");
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["errors"][0][0], 1);

        let response = request(&mut engine, &router, "workflows", Value::Null);
        assert_eq!(response["workflows"].as_array().unwrap().len(), 0);
    }

    #[test]
    #[parallel]
    fn cancelled_workflows_release_their_tasks() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        let gate = temp.path().join("gate.txt");
        let response = request(
            &mut engine,
            &router,
            "schedule",
            json!({"jobs": [
                {"cmd": "sleep", "args": [["", 60]]},
                {"cmd": "touch", "args": [["", gate]], "inputs": [gate]},
            ]}),
        );
        let id = response["id"].as_i64().unwrap();

        let response = request(&mut engine, &router, "cancel", json!({"id": id}));
        assert_eq!(response["status"], "Cancelled");

        let status = request(&mut engine, &router, "get_status", json!({"id": id}));
        assert_eq!(status["status"], "Cancelled");
        for job in status["jobs"].as_array().unwrap() {
            assert_eq!(job["status"], "cancelled");
        }

        // Cancel again: the terminal status is unchanged.
        let response = request(&mut engine, &router, "cancel", json!({"id": id}));
        assert_eq!(response["status"], "Cancelled");

        let response = request(&mut engine, &router, "cancel", json!({"id": 404}));
        assert_eq!(response["status"], "NotFound");
    }

    #[test]
    #[parallel]
    fn workflows_listing_matches_the_wire_shape() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        let output = temp.path().join("list.txt");
        let response = request(
            &mut engine,
            &router,
            "schedule",
            json!({"jobs": [{"cmd": "touch", "args": [["", output]], "outputs": [output]}]}),
        );
        let id = response["id"].as_i64().unwrap();
        drive(&mut engine, &router, id);

        let response = request(&mut engine, &router, "workflows", json!({"ids": [id]}));
        let rows = response["workflows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);

        let row = rows[0].as_array().unwrap();
        assert_eq!(row.len(), 4);
        assert_eq!(row[0].as_i64().unwrap(), id);
        assert!(row[1].as_f64().unwrap() > 0.0);
        assert!(row[2].as_f64().unwrap() > 0.0);
        assert_eq!(row[3], "Completed");
    }

    #[test]
    #[parallel]
    fn shutdown_stops_the_engine_without_a_response() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        assert!(engine.is_running());
        let response = request(&mut engine, &router, "shutdown", Value::Null);

        assert!(response.is_null());
        assert!(!engine.is_running());

        engine.stop();
    }

    #[test]
    #[parallel]
    fn coalesced_jobs_complete_both_workflows() {
        let temp = TempDir::new().unwrap();
        let (mut engine, router) = engine(&temp);

        let shared = temp.path().join("shared.txt");
        let marker = temp.path().join("only-b.txt");
        let shared_job = json!({
            "cmd": format!("sleep 0.2; touch {}", shared.display()),
            "outputs": [shared],
        });

        let first = request(
            &mut engine,
            &router,
            "schedule",
            json!({"name": "a", "jobs": [shared_job]}),
        );
        let a = first["id"].as_i64().unwrap();

        // A different jobs blob containing an equal job.
        let second = request(
            &mut engine,
            &router,
            "schedule",
            json!({"name": "b", "jobs": [
                shared_job,
                {"cmd": "touch", "args": [["", marker]], "outputs": [marker]},
            ]}),
        );
        let b = second["id"].as_i64().unwrap();
        assert_ne!(a, b);

        let status_a = drive(&mut engine, &router, a);
        let status_b = drive(&mut engine, &router, b);

        assert_eq!(status_a["status"], "Completed");
        assert_eq!(status_b["status"], "Completed");

        // One execution produced the shared output for both workflows.
        assert_eq!(engine.scheduler.borrow().stats().submitted, 2);
    }
}
