// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

#![warn(clippy::pedantic)]

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use yerba::config::Config;
use yerba::daemon::Daemon;
use yerba::engine::Engine;

/// Yerba schedules bioinformatics workflows onto a distributed work queue.
///
/// The daemon listens for workflow submissions on a local request socket,
/// decomposes each workflow into jobs, runs the ready jobs through the work
/// queue, and records every workflow's lifecycle in an embedded database.
///
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Options {
    /// Path to the configuration file.
    ///
    /// Defaults to `$YERBA_HOME/yerba.toml`, falling back to
    /// `~/.yerba/yerba.toml`. A missing file uses the built-in defaults.
    #[arg(long, env = "YERBA_CONFIG")]
    config: Option<PathBuf>,

    /// Override the request socket port.
    #[arg(long, env = "YERBA_PORT")]
    port: Option<u16>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn main_detail() -> Result<(), yerba::Error> {
    let options = Options::parse();

    let log_level = match options.verbose.log_level_filter() {
        clap_verbosity_flag::LevelFilter::Off => "off",
        clap_verbosity_flag::LevelFilter::Error => "error",
        clap_verbosity_flag::LevelFilter::Warn => "warn",
        clap_verbosity_flag::LevelFilter::Info => "info",
        clap_verbosity_flag::LevelFilter::Debug => "debug",
        clap_verbosity_flag::LevelFilter::Trace => "trace",
    };

    let env = env_logger::Env::default()
        .filter_or("YERBA_LOG", log_level)
        .write_style_or("YERBA_LOG_STYLE", "auto");
    env_logger::Builder::from_env(env).init();

    let mut config = Config::open(options.config.as_deref())?;
    if let Some(port) = options.port {
        config.port = port;
    }

    let terminate = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&terminate))?;
    flag::register(SIGINT, Arc::clone(&terminate))?;

    let engine = Engine::new(&config)?;
    let mut daemon = Daemon::new(engine, config.port, terminate)?;

    daemon.run()?;

    info!("Goodbye.");
    Ok(())
}

fn main() -> ExitCode {
    if let Err(error) = main_detail() {
        error!("{error}");
        eprintln!("yerba: {error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
