//! JobLauncher port - どこでワーカーを起動するか
//!
//! A launcher starts one worker process on some infrastructure and reports
//! the resource manager's batch id. It knows nothing about the job database;
//! the bookkeeping around a launch lives in `submit`.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::ids::JobId;
use crate::error::Result;

#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Method name recorded on the job (`ssh`, `local`, `osmium`, `xenon`).
    fn method(&self) -> &str;

    /// Configured host name recorded on the job.
    fn host(&self) -> &str;

    /// Launch a worker that will run as `job_id`; returns the batch id.
    async fn launch(&self, job_id: &JobId) -> Result<String>;

    /// Batch ids the resource manager still knows about.
    ///
    /// `None` means the backend cannot be inspected; callers then fall back
    /// to age-based judgement.
    async fn queued_batch_ids(&self) -> Result<Option<HashSet<String>>>;
}
