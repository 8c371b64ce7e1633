//! Configuration (`pilot.toml`).
//!
//! ```toml
//! [task-db]
//! url = "http://localhost:5984"
//! database = "tasks"
//!
//! [job-db]            # optional, defaults to task-db
//! database = "jobs"
//!
//! [webdav]            # optional, attachments go inline without it
//! url = "https://dav.example.org/pilot"
//!
//! [hosts.lisa]
//! method = "ssh"
//! host = "user@lisa.example.org"
//! path = "pilot"
//! script = "run.sh"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;
use crate::error::{PilotError, Result};

pub const DEFAULT_PATH: &str = "pilot.toml";

/// `url` value selecting the in-memory store.
pub const MEMORY_URL: &str = "memory://";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "task-db", default)]
    pub task_db: DatabaseConfig,
    #[serde(rename = "job-db", default)]
    pub job_db: Option<DatabaseConfig>,
    #[serde(default)]
    pub webdav: Option<WebDavConfig>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_db_url() -> String {
    "http://localhost:5984".into()
}
fn default_database() -> String {
    "pilot".into()
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            database: default_database(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url == MEMORY_URL
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn bool_true() -> bool {
    true
}

/// Directories the execute worker creates per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("pilot").join("tmp")
}
fn default_input_dir() -> PathBuf {
    std::env::temp_dir().join("pilot").join("input")
}
fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("pilot").join("output")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between passes of an endless iterator.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Safety factor on the average task duration.
    #[serde(default = "default_margin")]
    pub margin: f64,
    /// Rows fetched per view query while claiming.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_margin() -> f64 {
    1.5
}
fn default_page_size() -> usize {
    20
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            margin: default_margin(),
            page_size: default_page_size(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// A place jobs can be submitted to, keyed by `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum HostConfig {
    /// `qsub` on a remote login node.
    Ssh {
        host: String,
        #[serde(default)]
        path: Option<String>,
        script: String,
    },
    /// `qsub` on this machine.
    Local {
        #[serde(default)]
        path: Option<String>,
        script: String,
    },
    /// HTTP job API.
    Osmium {
        url: String,
        script: String,
        #[serde(default)]
        token: Option<String>,
    },
    /// `xenon` command line client.
    Xenon {
        adaptor: String,
        location: String,
        script: String,
        #[serde(default)]
        path: Option<String>,
    },
}

impl HostConfig {
    pub fn method(&self) -> &'static str {
        match self {
            HostConfig::Ssh { .. } => "ssh",
            HostConfig::Local { .. } => "local",
            HostConfig::Osmium { .. } => "osmium",
            HostConfig::Xenon { .. } => "xenon",
        }
    }

    pub fn script(&self) -> &str {
        match self {
            HostConfig::Ssh { script, .. }
            | HostConfig::Local { script, .. }
            | HostConfig::Osmium { script, .. }
            | HostConfig::Xenon { script, .. } => script,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_db: DatabaseConfig::default(),
            job_db: None,
            webdav: None,
            execution: ExecutionConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            hosts: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Configuration for a single process with in-memory databases.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.task_db.url = MEMORY_URL.into();
        config
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PilotError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PilotError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// The job database; shares the task database when not configured.
    pub fn job_db(&self) -> &DatabaseConfig {
        self.job_db.as_ref().unwrap_or(&self.task_db)
    }

    pub fn webdav(&self) -> Option<&WebDavConfig> {
        self.webdav.as_ref().filter(|w| w.enabled)
    }

    pub fn host(&self, name: &str) -> Result<&HostConfig> {
        self.hosts
            .get(name)
            .ok_or_else(|| PilotError::Config(format!("host '{name}' is not configured")))
    }

    pub fn validate(&self) -> Result<()> {
        for db in [&self.task_db, self.job_db()] {
            if db.database.is_empty() {
                return Err(PilotError::Config("database name must not be empty".into()));
            }
        }
        if !(self.worker.margin >= 1.0) {
            return Err(PilotError::Config(format!(
                "worker.margin must be >= 1.0, got {}",
                self.worker.margin
            )));
        }
        if self.worker.page_size == 0 {
            return Err(PilotError::Config("worker.page_size must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PilotError::Config("retry.max_attempts must be > 0".into()));
        }
        for (name, host) in &self.hosts {
            if host.script().is_empty() {
                return Err(PilotError::Config(format!("host '{name}' has no script")));
            }
            if let HostConfig::Osmium { url, .. } = host
                && reqwest::Url::parse(url).is_err()
            {
                return Err(PilotError::Config(format!("host '{name}' has invalid url {url}")));
            }
        }
        Ok(())
    }
}
