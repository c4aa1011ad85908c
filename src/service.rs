// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, warn};

use crate::Error;

/// A long-lived component driven by the daemon loop.
///
/// Services are identified by `(group, name)`. The manager initializes them
/// at startup, ticks them while the daemon runs, and stops them at shutdown.
///
pub trait Service {
    fn name(&self) -> &'static str;

    fn group(&self) -> &'static str;

    /// Prepare the service before the loop starts.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the service cannot start; the daemon
    /// treats this as fatal.
    ///
    fn initialize(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Perform one unit of background work.
    fn update(&mut self) {}

    /// Release the service's resources.
    fn stop(&mut self) {}
}

/// Registry driving every service through its lifecycle.
#[derive(Default)]
pub struct ServiceManager {
    services: Vec<Box<dyn Service>>,
    running: bool,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service.
    ///
    /// Registration is idempotent: a second service with the same group and
    /// name is dropped with a warning.
    ///
    pub fn register(&mut self, service: Box<dyn Service>) {
        let exists = self
            .services
            .iter()
            .any(|existing| existing.name() == service.name() && existing.group() == service.group());

        if exists {
            warn!(
                "The service {}.{} already exists.",
                service.group(),
                service.name()
            );
            return;
        }

        debug!("Registered service {}.{}.", service.group(), service.name());
        self.services.push(service);
    }

    /// Get a registered service by name and group.
    pub fn get(&self, name: &str, group: &str) -> Option<&dyn Service> {
        self.services
            .iter()
            .find(|service| service.name() == name && service.group() == group)
            .map(Box::as_ref)
    }

    /// Initialize every service in registration order.
    ///
    /// # Errors
    /// Returns the first initialization error; earlier services stay
    /// initialized and are stopped by the caller's shutdown path.
    ///
    pub fn start(&mut self) -> Result<(), Error> {
        for service in &mut self.services {
            service.initialize()?;
        }

        self.running = true;
        Ok(())
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Tick every service once.
    pub fn update(&mut self) {
        for service in &mut self.services {
            service.update();
        }
    }

    /// Stop every service.
    pub fn stop(&mut self) {
        for service in &mut self.services {
            service.stop();
        }

        self.running = false;
    }
}
