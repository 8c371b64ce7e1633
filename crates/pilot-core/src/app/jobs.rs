//! Job transitions made durable.
//!
//! Every transition is fetch-or-create, mutate, save. A `Conflict` means some
//! other process (the worker, the submitter, the checker) wrote the job in
//! between; the transition is then re-applied to a fresh copy, bounded by the
//! context's `RetryPolicy`.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};

use crate::app::context::Context;
use crate::domain::ids::JobId;
use crate::domain::job::Job;
use crate::error::{PilotError, Result};
use crate::ports::ViewOptions;

pub struct JobRepository<'a> {
    ctx: &'a Context,
}

impl<'a> JobRepository<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, id: &JobId) -> Result<Job> {
        Job::from_document(self.ctx.job_db.get(id.as_str()).await?)
    }

    /// Read-modify-write with conflict retry.
    ///
    /// The first attempt works on `initial` when given; later attempts
    /// re-fetch. `mutate` returns whether anything changed, so no-op
    /// transitions do not bump the revision.
    async fn update<F>(
        &self,
        operation: &'static str,
        id: &JobId,
        initial: Option<Job>,
        create_if_missing: bool,
        mutate: F,
    ) -> Result<Job>
    where
        F: Fn(&mut Job, i64) -> Result<bool> + Send + Sync,
    {
        let this = self;
        let mutate = &mutate;
        let mut initial = initial;

        self.ctx
            .retry
            .on_conflict(operation, id.as_str(), move |_| {
                let first = initial.take();
                async move {
                    let mut job = match first {
                        Some(job) => job,
                        None => match this.get(id).await {
                            Ok(job) => job,
                            Err(PilotError::NotFound(_)) if create_if_missing => Job::new(id.clone()),
                            Err(e) => return Err(e),
                        },
                    };
                    if !mutate(&mut job, this.ctx.now())? {
                        return Ok(job);
                    }
                    let saved = this.ctx.job_db.save(job.to_document()?).await?;
                    Job::from_document(saved)
                }
            })
            .await
    }

    /// Record that `job` was submitted through `method` to `host`.
    ///
    /// `job` is usually a fresh record built by the submitter; it is saved as
    /// is and merged with the stored copy only on conflict.
    pub async fn queue(&self, job: Job, method: &str, host: &str) -> Result<Job> {
        let id = job.id.clone();
        let extra = job.clone();
        let saved = self
            .update("queue", &id, Some(job), true, |j, now| {
                if j.batch_id.is_none() {
                    j.batch_id = extra.batch_id.clone();
                }
                j.mark_queued(method, host, now)?;
                Ok(true)
            })
            .await?;
        tracing::info!(job_id = %saved.id, method, host, archived = saved.archive > 0, "job queued");
        Ok(saved)
    }

    /// Mark the job running, creating it when the worker was started by hand.
    pub async fn start(&self, id: &JobId, properties: &Map<String, Value>) -> Result<Job> {
        let saved = self
            .update("start", id, None, true, |j, now| {
                j.mark_started(now, properties)?;
                Ok(true)
            })
            .await?;
        tracing::info!(job_id = %id, hostname = ?saved.hostname, "job started");
        Ok(saved)
    }

    /// Mark the job finished; archives it when its submission is recorded.
    /// Finishing an archived job is a no-op.
    pub async fn finish(&self, id: &JobId) -> Result<Job> {
        let saved = self
            .update("finish", id, None, false, |j, now| {
                if j.archive > 0 {
                    return Ok(false);
                }
                j.mark_finished(now)?;
                Ok(true)
            })
            .await?;
        tracing::info!(job_id = %id, archived = saved.archive > 0, "job finished");
        Ok(saved)
    }

    /// Finish a job whose worker is gone. `None` if the job finished on its
    /// own in the meantime; such a job is never overwritten.
    pub async fn finish_dead(&self, id: &JobId) -> Result<Option<Job>> {
        let changed = AtomicBool::new(false);
        let saved = self
            .update("finish", id, None, false, |j, now| {
                let dead = j.done == 0 && j.archive == 0;
                changed.store(dead, Ordering::SeqCst);
                if dead {
                    j.mark_finished(now)?;
                }
                Ok(dead)
            })
            .await?;
        if !changed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        tracing::info!(job_id = %id, archived = saved.archive > 0, "finished dead job");
        Ok(Some(saved))
    }

    /// Ask the worker running as `id` to stop after its current task.
    pub async fn cancel(&self, id: &JobId) -> Result<Job> {
        let saved = self
            .update("cancel", id, None, false, |j, now| {
                if j.cancel > 0 {
                    return Ok(false);
                }
                j.mark_cancelled(now)?;
                Ok(true)
            })
            .await?;
        tracing::info!(job_id = %id, "job cancelled");
        Ok(saved)
    }

    pub async fn archive(&self, id: &JobId) -> Result<Job> {
        let saved = self
            .update("archive", id, None, false, |j, now| {
                if j.archive > 0 {
                    return Ok(false);
                }
                j.mark_archived(now)?;
                Ok(true)
            })
            .await?;
        tracing::info!(job_id = %id, "job archived");
        Ok(saved)
    }

    /// Delete every job in `view`. Returns `(deleted, total)`; jobs changed
    /// concurrently are left alone.
    pub async fn delete_from_view(&self, view: &str) -> Result<(usize, usize)> {
        let result = self
            .ctx
            .job_db
            .view(view, ViewOptions::default().include_docs())
            .await?;
        let total = result.rows.len();
        let mut deleted = 0;
        for row in result.rows {
            let Some(doc) = row.doc else { continue };
            match self.ctx.job_db.delete(&doc).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    tracing::debug!(job_id = %doc.id, "job changed during delete, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(view, deleted, total, "deleted jobs");
        Ok((deleted, total))
    }

    /// Whether the job has been asked to stop. A missing job is not cancelled.
    pub async fn is_cancelled(&self, id: &JobId) -> Result<bool> {
        match self.get(id).await {
            Ok(job) => Ok(job.is_cancelled()),
            Err(PilotError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::app::context::ContextBuilder;
    use crate::app::retry::RetryPolicy;
    use crate::domain::state::JobState;
    use crate::impls::InMemoryStore;
    use crate::ports::{Document, DocumentStore, FixedClock};
    use serde_json::json;

    fn ctx() -> (Context, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::at(1_000));
        let ctx = ContextBuilder::new()
            .task_db(Arc::new(InMemoryStore::default()))
            .clock(clock.clone())
            .retry(RetryPolicy::immediate(5))
            .build()
            .unwrap();
        (ctx, clock)
    }

    #[tokio::test]
    async fn start_creates_missing_job() {
        let (ctx, _) = ctx();
        let props = json!({"hostname": "node-1"});
        let job = ctx
            .jobs()
            .start(&JobId::new("j1"), props.as_object().unwrap())
            .await
            .unwrap();

        assert_eq!(job.start, 1_000);
        assert_eq!(job.hostname.as_deref(), Some("node-1"));
        assert_eq!(job.state().unwrap(), JobState::Running);
    }

    #[tokio::test]
    async fn finish_without_queue_is_not_archived() {
        let (ctx, clock) = ctx();
        let id = JobId::new("j1");
        ctx.jobs().start(&id, &Map::new()).await.unwrap();
        clock.advance(chrono::Duration::seconds(60));

        let job = ctx.jobs().finish(&id).await.unwrap();
        assert!(job.done > 0);
        assert_eq!(job.archive, 0);
        assert_eq!(job.queue, 0);
    }

    #[tokio::test]
    async fn late_queue_archives_finished_job() {
        let (ctx, _) = ctx();
        let id = JobId::new("j1");
        ctx.jobs().start(&id, &Map::new()).await.unwrap();
        ctx.jobs().finish(&id).await.unwrap();

        // the submitter's fresh record conflicts with the stored one
        let mut fresh = Job::new(id.clone());
        fresh.batch_id = Some("42.pbs".into());
        let job = ctx.jobs().queue(fresh, "ssh", "lisa").await.unwrap();

        assert_eq!(job.state().unwrap(), JobState::Archived);
        assert_eq!(job.batch_id.as_deref(), Some("42.pbs"));
        assert_eq!(job.host.as_deref(), Some("lisa"));
    }

    #[tokio::test]
    async fn finish_after_queue_archives() {
        let (ctx, _) = ctx();
        let id = JobId::new("j1");
        ctx.jobs().queue(Job::new(id.clone()), "local", "here").await.unwrap();
        ctx.jobs().start(&id, &Map::new()).await.unwrap();

        let job = ctx.jobs().finish(&id).await.unwrap();
        assert_eq!(job.state().unwrap(), JobState::Archived);

        // a second finish (signal after normal exit) changes nothing
        let again = ctx.jobs().finish(&id).await.unwrap();
        assert_eq!(again.rev, job.rev);
    }

    #[tokio::test]
    async fn cancel_missing_job_is_not_found() {
        let (ctx, _) = ctx();
        let err = ctx.jobs().cancel(&JobId::new("nope")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!ctx.jobs().is_cancelled(&JobId::new("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_sets_flag() {
        let (ctx, _) = ctx();
        let id = JobId::new("j1");
        ctx.jobs().start(&id, &Map::new()).await.unwrap();
        ctx.jobs().cancel(&id).await.unwrap();
        assert!(ctx.jobs().is_cancelled(&id).await.unwrap());
    }

    #[tokio::test]
    async fn archive_requires_finished_job() {
        let (ctx, _) = ctx();
        let id = JobId::new("j1");
        ctx.jobs().start(&id, &Map::new()).await.unwrap();

        let err = ctx.jobs().archive(&id).await.unwrap_err();
        assert!(matches!(err, PilotError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn delete_from_view_removes_only_that_view() {
        let (ctx, _) = ctx();
        ctx.jobs().start(&JobId::new("running"), &Map::new()).await.unwrap();
        ctx.jobs().start(&JobId::new("done"), &Map::new()).await.unwrap();
        ctx.jobs().finish(&JobId::new("done")).await.unwrap();

        let (deleted, total) = ctx.jobs().delete_from_view("finished_jobs").await.unwrap();

        assert_eq!((deleted, total), (1, 1));
        assert!(ctx.jobs().get(&JobId::new("done")).await.unwrap_err().is_not_found());
        assert!(ctx.jobs().get(&JobId::new("running")).await.is_ok());
    }

    #[tokio::test]
    async fn corrupted_job_is_invalid_state() {
        let (ctx, _) = ctx();
        let doc = Document::new("bad")
            .with_field("type", json!("job"))
            .with_field("archive", json!(10));
        ctx.job_db.save(doc).await.unwrap();

        let err = ctx.jobs().finish(&JobId::new("bad")).await.unwrap_err();
        assert!(matches!(err, PilotError::InvalidState { .. }));
    }
}
