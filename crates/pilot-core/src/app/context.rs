//! Context - プロセス全体で共有する依存関係
//!
//! Everything an operation needs is passed in explicitly: the two stores,
//! the attachment backend, time, id generation, retry policy, and the id of
//! the job this process runs as (if any).
//!
//! # Fail-fast 設計
//! `ContextBuilder::build()` rejects a context without a task store instead
//! of failing on first use.

use std::sync::Arc;

use crate::app::jobs::JobRepository;
use crate::app::retry::RetryPolicy;
use crate::app::tasks::TaskRepository;
use crate::config::Config;
use crate::domain::ids::JobId;
use crate::error::{PilotError, Result};
use crate::impls::{self, WebDav};
use crate::ports::{Clock, DocumentStore, IdGenerator, SystemClock, UlidGenerator};

/// Environment variable carrying the current job id into a worker.
pub const JOB_ID_ENV: &str = "PILOT_JOBID";

#[derive(Clone)]
pub struct Context {
    pub task_db: Arc<dyn DocumentStore>,
    pub job_db: Arc<dyn DocumentStore>,
    pub webdav: Option<Arc<WebDav>>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub retry: RetryPolicy,
    pub job_id: Option<JobId>,
    pub config: Arc<Config>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Wire stores and attachment storage from configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let task_db = impls::open_store(&config.task_db)?;
        let job_db = match &config.job_db {
            Some(db) => impls::open_store(db)?,
            None => task_db.clone(),
        };
        let webdav = config.webdav().map(WebDav::new).transpose()?.map(Arc::new);

        let mut builder = ContextBuilder::new()
            .task_db(task_db)
            .job_db(job_db)
            .retry(config.retry.policy())
            .config(config);
        if let Some(webdav) = webdav {
            builder = builder.webdav(webdav);
        }
        builder.build()
    }

    pub fn tasks(&self) -> TaskRepository<'_> {
        TaskRepository::new(self)
    }

    pub fn jobs(&self) -> JobRepository<'_> {
        JobRepository::new(self)
    }

    pub fn now(&self) -> i64 {
        self.clock.timestamp()
    }

    /// The job this process runs as.
    pub fn require_job_id(&self) -> Result<&JobId> {
        self.job_id.as_ref().ok_or_else(|| {
            PilotError::Config(format!("no job id given (set {JOB_ID_ENV} or pass one)"))
        })
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

pub struct ContextBuilder {
    task_db: Option<Arc<dyn DocumentStore>>,
    job_db: Option<Arc<dyn DocumentStore>>,
    webdav: Option<Arc<WebDav>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    retry: RetryPolicy,
    job_id: Option<JobId>,
    config: Option<Config>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            task_db: None,
            job_db: None,
            webdav: None,
            clock: None,
            ids: None,
            retry: RetryPolicy::default(),
            job_id: None,
            config: None,
        }
    }

    pub fn task_db(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.task_db = Some(store);
        self
    }

    /// Defaults to the task store.
    pub fn job_db(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.job_db = Some(store);
        self
    }

    pub fn webdav(mut self, webdav: Arc<WebDav>) -> Self {
        self.webdav = Some(webdav);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to ULIDs stamped by the context clock.
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn job_id(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Context> {
        let task_db = self
            .task_db
            .ok_or_else(|| PilotError::Config("task database not configured".into()))?;
        let job_db = self.job_db.unwrap_or_else(|| task_db.clone());
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        Ok(Context {
            task_db,
            job_db,
            webdav: self.webdav,
            clock,
            ids,
            retry: self.retry,
            job_id: self.job_id,
            config: Arc::new(self.config.unwrap_or_else(Config::in_memory)),
        })
    }
}
