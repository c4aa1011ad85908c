// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::trace;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{Error, CONFIG_FILE_NAME, DATABASE_FILE_NAME, DATA_DIRECTORY_NAME};

/// Daemon configuration, loaded from `yerba.toml`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Port for the request socket.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the workflow database, relative to the data directory.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Optional floor for assigned workflow identifiers.
    #[serde(default)]
    pub start_index: Option<i64>,

    /// Work queue master configuration.
    #[serde(default)]
    pub workqueue: WorkQueueConfig,

    /// Directory holding the database and default log files.
    #[serde(skip)]
    pub data_directory: PathBuf,
}

/// Configuration for the work queue master.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkQueueConfig {
    /// Project name advertised to the catalog.
    #[serde(default = "default_project")]
    pub project: String,

    /// Catalog endpoint workers use to discover the master.
    #[serde(default = "default_catalog_server")]
    pub catalog_server: String,

    #[serde(default = "default_catalog_port")]
    pub catalog_port: u16,

    /// Preferred listening port for the master; -1 selects any open port.
    #[serde(default = "default_queue_port")]
    pub port: i64,

    /// Path for the queue's transaction log, relative to the data directory.
    #[serde(default = "default_queue_log")]
    pub log: PathBuf,

    /// Enable verbose queue logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_port() -> u16 {
    5151
}

fn default_database() -> PathBuf {
    PathBuf::from(DATABASE_FILE_NAME)
}

fn default_project() -> String {
    "yerba".to_string()
}

fn default_catalog_server() -> String {
    "localhost".to_string()
}

fn default_catalog_port() -> u16 {
    9097
}

fn default_queue_port() -> i64 {
    -1
}

fn default_queue_log() -> PathBuf {
    PathBuf::from("workqueue.log")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database: default_database(),
            start_index: None,
            workqueue: WorkQueueConfig::default(),
            data_directory: PathBuf::new(),
        }
    }
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            catalog_server: default_catalog_server(),
            catalog_port: default_catalog_port(),
            port: default_queue_port(),
            log: default_queue_log(),
            debug: false,
        }
    }
}

impl Config {
    /// Open the daemon configuration.
    ///
    /// Reads the file at `path` when given, otherwise
    /// `$YERBA_HOME/yerba.toml`, falling back to `~/.yerba/yerba.toml`.
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the file cannot be read or parsed,
    /// or no home directory can be found.
    ///
    pub fn open(path: Option<&Path>) -> Result<Self, Error> {
        let data_directory = data_directory()?;

        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => data_directory.join(CONFIG_FILE_NAME),
        };

        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                trace!(
                    "'{}' does not exist, using the default configuration.",
                    config_path.display()
                );
                let mut config = Config::default();
                config.data_directory = data_directory;
                return Ok(config);
            }
            Err(error) => return Err(Error::FileRead(config_path, error)),
        };

        trace!("Parsing '{}'.", config_path.display());
        let mut config = Self::parse_str(&config_path, &contents)?;
        config.data_directory = data_directory;
        Ok(config)
    }

    /// Parse a configuration from a TOML string.
    pub(crate) fn parse_str(path: &Path, toml: &str) -> Result<Self, Error> {
        let config: Config =
            toml::from_str(toml).map_err(|e| Error::TOMLParse(path.to_path_buf(), e))?;
        Ok(config)
    }

    /// Get the absolute path of the workflow database.
    pub fn database_path(&self) -> PathBuf {
        resolve(&self.data_directory, &self.database)
    }

    /// Get the absolute path of the queue's transaction log.
    pub fn queue_log_path(&self) -> PathBuf {
        resolve(&self.data_directory, &self.workqueue.log)
    }
}

/// Resolve a configured path against the data directory.
fn resolve(data_directory: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_directory.join(path)
    }
}

/// Locate the data directory: `$YERBA_HOME`, or `~/.yerba`.
fn data_directory() -> Result<PathBuf, Error> {
    match env::var("YERBA_HOME") {
        Ok(yerba_home) => Ok(PathBuf::from(yerba_home)),
        Err(_) => {
            let home = home::home_dir().ok_or_else(Error::NoHome)?;
            Ok(home.join(DATA_DIRECTORY_NAME))
        }
    }
}
