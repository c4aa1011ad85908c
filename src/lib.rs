// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![warn(clippy::format_push_string)]

pub mod config;
pub mod daemon;
pub mod engine;
pub mod event;
pub mod job;
pub mod joblog;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod service;
pub mod status;
pub mod store;
pub mod workflow;
pub mod workqueue;

use std::io;
use std::path::PathBuf;

pub const DATA_DIRECTORY_NAME: &str = ".yerba";
pub const CONFIG_FILE_NAME: &str = "yerba.toml";
pub const DATABASE_FILE_NAME: &str = "yerba.db";

/// Captured task output is clipped to this many bytes.
pub const OUTPUT_LIMIT: usize = 64 * 1024;

/// Identifier assigned to each workflow by the store.
pub type WorkflowId = i64;

/// Errors that may be encountered when using the yerba crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // IO errors
    #[error("I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("No home directory")]
    NoHome(),

    #[error("Unable to read '{0}': {1}")]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Unable to write '{0}': {1}")]
    FileWrite(PathBuf, #[source] io::Error),

    #[error("Unable to create directory '{0}': {1}")]
    DirectoryCreate(PathBuf, #[source] io::Error),

    #[error("Unable to spawn '{0}': {1}")]
    SpawnProcess(String, #[source] io::Error),

    // serialization errors
    #[error("Unable to parse '{0}'.\n{1}")]
    TOMLParse(PathBuf, #[source] toml::de::Error),

    #[error("Unable to parse message: {0}")]
    JSONParse(#[from] serde_json::Error),

    // store errors
    #[error("Workflow store error: {0}")]
    Store(#[from] rusqlite::Error),

    // workflow errors
    #[error("The workflow does not contain any jobs.")]
    EmptyWorkflow,

    #[error("{} jobs were not valid.", .errors.len())]
    InvalidWorkflow { errors: Vec<(usize, String)> },

    #[error("Workflow {0} was not found.")]
    WorkflowNotFound(WorkflowId),

    // request errors
    #[error("The request '{0}' could not be routed.")]
    RouteNotFound(String),

    #[error("The message envelope is missing 'request' or 'data'.")]
    MalformedRequest(),

    #[error("Message of {0} bytes exceeds the frame limit.")]
    MessageTooLarge(usize),

    #[error("The connection was closed by the peer.")]
    ConnectionClosed(),

    #[error("The response send would block.")]
    ResponseBlocked(),

    // queue errors
    #[error("Unable to start the work queue: {0}")]
    QueueUnavailable(String),
}
