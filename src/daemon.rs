// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::{debug, info, trace, warn};
use serde_json::json;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::{self, Engine};
use crate::protocol::Connection;
use crate::router::Router;
use crate::status::Status;
use crate::Error;

/// Pause between loop iterations.
const LOOP_SLEEP: Duration = Duration::from_millis(5);

/// Interval between operational snapshots.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);

/// The daemon's cooperative event loop.
///
/// One thread owns the request socket, the engine, and every connection.
/// Each iteration accepts new clients, answers at most one request per
/// connection, ticks the engine's services, and sleeps briefly. Requests
/// are processed in arrival order, and task completions are drained only
/// between requests.
///
pub struct Daemon {
    listener: TcpListener,
    connections: Vec<Connection>,
    engine: Engine,
    router: Router<Engine>,
    terminate: Arc<AtomicBool>,
}

impl Daemon {
    /// Bind the request socket on the loopback interface.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the port cannot be bound.
    ///
    pub fn new(engine: Engine, port: u16, terminate: Arc<AtomicBool>) -> Result<Self, Error> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;

        info!("Listening on {}.", listener.local_addr()?);

        Ok(Self {
            listener,
            connections: Vec::new(),
            engine,
            router: engine::routes(),
            terminate,
        })
    }

    /// Get the bound socket address.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the address cannot be read.
    ///
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the loop until shutdown is requested or a signal arrives.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the engine fails to start; the
    /// process exits non-zero.
    ///
    pub fn run(&mut self) -> Result<(), Error> {
        self.engine.start()?;

        let mut last_snapshot = Instant::now();

        while self.engine.is_running() && !self.terminate.load(Ordering::Relaxed) {
            self.accept();
            self.serve();
            self.engine.tick();

            if last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
                self.engine.log_snapshot();
                log_host_snapshot();
                last_snapshot = Instant::now();
            }

            thread::sleep(LOOP_SLEEP);
        }

        info!("Shutting down.");
        self.engine.stop();

        Ok(())
    }

    /// Accept every connection waiting on the listener.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    debug!("Accepted a connection from {address}.");
                    match Connection::new(stream) {
                        Ok(connection) => self.connections.push(connection),
                        Err(error) => warn!("Unable to accept a connection: {error}"),
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!("Accept failed: {error}");
                    break;
                }
            }
        }
    }

    /// Answer at most one request per connection.
    fn serve(&mut self) {
        let mut index = 0;

        while index < self.connections.len() {
            match self.connections[index].poll_message() {
                Ok(Some(message)) => {
                    trace!("Received {message}.");

                    let response = match self.router.dispatch(&mut self.engine, &message) {
                        Ok(response) => response,
                        Err(error @ (Error::RouteNotFound(_) | Error::MalformedRequest())) => {
                            info!("{error}");
                            json!({"status": Status::Error.name()})
                        }
                        Err(error) => {
                            warn!("Request failed: {error}");
                            json!({"status": Status::Error.name()})
                        }
                    };

                    // Apply events the request produced before reading the
                    // next message.
                    self.engine.pump();

                    if !response.is_null() {
                        if let Err(error) = self.connections[index].send(&response) {
                            warn!("Dropped a response: {error}");
                            self.connections.swap_remove(index);
                            continue;
                        }
                    }

                    index += 1;
                }
                Ok(None) => index += 1,
                Err(Error::ConnectionClosed()) => {
                    trace!("A peer closed its connection.");
                    self.connections.swap_remove(index);
                }
                Err(error) => {
                    warn!("Dropping a connection: {error}");
                    self.connections.swap_remove(index);
                }
            }
        }
    }
}

/// Log host memory and load information from procfs.
fn log_host_snapshot() {
    if let Ok(meminfo) = fs::read_to_string("/proc/meminfo") {
        let mut fields = Vec::new();
        for line in meminfo.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if matches!(key, "MemTotal" | "MemFree" | "MemAvailable") {
                fields.push(format!("{key} {}", value.trim()));
            }
        }
        info!("HOST: {}.", fields.join(", "));
    }

    if let Ok(loadavg) = fs::read_to_string("/proc/loadavg") {
        info!("HOST: load average {}.", loadavg.trim());
    }
}
