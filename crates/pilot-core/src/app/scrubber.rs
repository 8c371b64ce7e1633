//! Scrubber - クラッシュしたワーカーの後片付け
//!
//! Workers die without releasing what they hold: tasks stay `in_progress`
//! and jobs stay `running`. The scrubber returns such documents to a state
//! from which work can continue.
//!
//! # フロー
//! 1. task views: unlock tasks whose claim is older than `age`
//! 2. job views: ask the resource manager whether stale jobs still exist;
//!    finish the dead ones and release the tasks they held
//!
//! Both steps re-fetch on conflict and never overwrite a document that
//! reached `done` in the meantime, so running the scrubber next to live
//! workers is safe. A second run without intervening activity scrubs nothing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;

use crate::app::context::Context;
use crate::domain::ids::{JobId, TaskId};
use crate::domain::job::Job;
use crate::domain::task::Task;
use crate::error::{PilotError, Result};
use crate::ports::{Document, DocumentStore, ViewOptions, ViewRow};
use crate::submit::{self, Launchers, batch_key};

pub const TASK_SCRUB_VIEWS: [&str; 3] = ["in_progress", "locked", "error"];
pub const JOB_SCRUB_VIEWS: [&str; 3] = ["pending_jobs", "running_jobs", "active_jobs"];

/// Error recorded on tasks released by `check`.
pub const STOPPED_JOB_MESSAGE: &str = "Failed to finish task in time, the job has stopped already.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrubReport {
    pub scrubbed: usize,
    pub considered: usize,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    /// Active jobs the resource manager no longer knows.
    pub stopped_jobs: Vec<JobId>,
    /// Tasks released because their job stopped.
    pub failed_tasks: Vec<TaskId>,
    pub submitted: Vec<Job>,
    /// Jobs a dry run would have submitted.
    pub would_submit: usize,
}

/// What the resource manager says about a host's queue.
enum QueueState {
    Known(HashSet<String>),
    Uninspectable,
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
enum Liveness {
    Alive,
    Dead,
    Unknown,
}

pub struct Scrubber<'a> {
    ctx: &'a Context,
    launchers: &'a Launchers,
    dry_run: bool,
}

impl<'a> Scrubber<'a> {
    pub fn new(ctx: &'a Context, launchers: &'a Launchers) -> Self {
        Self {
            ctx,
            launchers,
            dry_run: false,
        }
    }

    /// Report what would change without writing or launching anything.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn scrub(&self, view: &str, age: Duration) -> Result<ScrubReport> {
        let age = i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
        let threshold = self.ctx.now().saturating_sub(age);
        let report = if TASK_SCRUB_VIEWS.contains(&view) {
            self.scrub_tasks(view, threshold).await?
        } else if JOB_SCRUB_VIEWS.contains(&view) {
            self.scrub_jobs(view, threshold).await?
        } else {
            return Err(PilotError::InvalidView(view.to_string()));
        };
        tracing::info!(
            view,
            scrubbed = report.scrubbed,
            considered = report.considered,
            dry_run = self.dry_run,
            "scrub finished"
        );
        Ok(report)
    }

    async fn scrub_tasks(&self, view: &str, threshold: i64) -> Result<ScrubReport> {
        let rows = self.rows(self.ctx.task_db.as_ref(), view).await?;
        let mut report = ScrubReport {
            considered: rows.len(),
            ..ScrubReport::default()
        };

        for row in rows {
            let lock = row.value_int("lock");
            if !(lock > 0 && lock < threshold) || row.value_int("done") > 0 {
                continue;
            }
            let id = TaskId::new(row.id.clone());
            let outcome = self
                .release_task(&id, row.doc, |task| task.lock > 0 && task.lock < threshold, None)
                .await;
            if self.tally(&id, outcome)? {
                report.scrubbed += 1;
            }
        }
        Ok(report)
    }

    async fn scrub_jobs(&self, view: &str, threshold: i64) -> Result<ScrubReport> {
        let rows = self.rows(self.ctx.job_db.as_ref(), view).await?;
        let mut report = ScrubReport {
            considered: rows.len(),
            ..ScrubReport::default()
        };
        let mut queues = HashMap::new();

        for row in rows {
            let Some(job) = Self::job_of(row) else { continue };
            let since = match view {
                "pending_jobs" => job.queue,
                "running_jobs" => job.start,
                _ => job.queue.max(job.start),
            };
            if since == 0 || since >= threshold {
                continue;
            }
            match self.liveness(&job, &mut queues, true).await {
                Liveness::Alive | Liveness::Unknown => continue,
                Liveness::Dead => {}
            }
            if self.kill(&job.id).await? {
                report.scrubbed += 1;
            }
        }
        Ok(report)
    }

    /// Consistency check, meant to run from cron:
    /// 1. finish active jobs their resource manager no longer lists
    /// 2. release tasks still held by stopped jobs
    /// 3. submit jobs to `host` while there is work and room
    pub async fn check(&self, host: Option<&str>, max_jobs: usize) -> Result<CheckReport> {
        let mut report = CheckReport::default();

        let mut queues = HashMap::new();
        for row in self.rows(self.ctx.job_db.as_ref(), "active_jobs").await? {
            let Some(job) = Self::job_of(row) else { continue };
            if self.liveness(&job, &mut queues, false).await != Liveness::Dead {
                continue;
            }
            if self.dry_run {
                report.stopped_jobs.push(job.id);
                continue;
            }
            if self.ctx.jobs().finish_dead(&job.id).await?.is_some() {
                tracing::info!(job_id = %job.id, "stopped job archived");
                report.stopped_jobs.push(job.id);
            }
        }

        let stopped = self.stopped_jobs_holding_tasks().await?;
        report.failed_tasks = self.release_tasks_of(&stopped, STOPPED_JOB_MESSAGE).await?;

        if let Some(host) = host {
            let launcher = self
                .launchers
                .get(host)
                .ok_or_else(|| PilotError::Config(format!("host '{host}' is not configured")))?;
            if self.dry_run {
                report.would_submit = submit::jobs_needed(self.ctx, max_jobs).await?;
            } else {
                report.submitted =
                    submit::submit_while_needed(self.ctx, launcher.as_ref(), max_jobs).await?;
            }
        }
        Ok(report)
    }

    async fn rows(&self, store: &dyn DocumentStore, view: &str) -> Result<Vec<ViewRow>> {
        Ok(store
            .view(view, ViewOptions::default().include_docs())
            .await?
            .rows)
    }

    fn job_of(row: ViewRow) -> Option<Job> {
        let doc = row.doc?;
        match Job::from_document(doc) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!(job_id = %row.id, error = %e, "skipping unreadable job");
                None
            }
        }
    }

    /// Whether `job`'s worker can still be running.
    ///
    /// With `assume_dead_if_unknown`, a job whose queue cannot be inspected
    /// (no batch id, unknown host, backend without listing) counts as dead.
    async fn liveness(
        &self,
        job: &Job,
        queues: &mut HashMap<String, QueueState>,
        assume_dead_if_unknown: bool,
    ) -> Liveness {
        let unknown = if assume_dead_if_unknown {
            Liveness::Dead
        } else {
            Liveness::Unknown
        };
        let (Some(host), Some(batch_id)) = (&job.host, &job.batch_id) else {
            return unknown;
        };
        let Some(launcher) = self.launchers.get(host) else {
            return unknown;
        };

        if !queues.contains_key(host) {
            let state = match launcher.queued_batch_ids().await {
                Ok(Some(ids)) => QueueState::Known(ids),
                Ok(None) => QueueState::Uninspectable,
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "cannot list queue, skipping its jobs");
                    QueueState::Failed
                }
            };
            queues.insert(host.clone(), state);
        }
        match queues.get(host) {
            Some(QueueState::Known(ids)) if ids.contains(batch_key(batch_id)) => Liveness::Alive,
            Some(QueueState::Known(_)) => Liveness::Dead,
            Some(QueueState::Uninspectable) => unknown,
            Some(QueueState::Failed) | None => Liveness::Unknown,
        }
    }

    /// Finish a dead job and release its tasks. `false` if it finished on
    /// its own meanwhile.
    async fn kill(&self, job_id: &JobId) -> Result<bool> {
        if self.dry_run {
            return Ok(true);
        }
        if self.ctx.jobs().finish_dead(job_id).await?.is_none() {
            return Ok(false);
        }
        let message = format!("Job {job_id} stopped without finishing this task");
        let jobs = BTreeSet::from([job_id.to_string()]);
        self.release_tasks_of(&jobs, &message).await?;
        Ok(true)
    }

    /// Finished, archived or vanished jobs that still hold claimed tasks.
    async fn stopped_jobs_holding_tasks(&self) -> Result<BTreeSet<String>> {
        let held: BTreeSet<String> = self
            .ctx
            .task_db
            .view("in_progress", ViewOptions::default())
            .await?
            .rows
            .iter()
            .filter_map(|row| row.value.get("job").and_then(Value::as_str).map(str::to_string))
            .collect();

        let mut stopped = BTreeSet::new();
        for job_id in held {
            match self.ctx.jobs().get(&JobId::new(job_id.clone())).await {
                Ok(job) if job.done > 0 || job.archive > 0 => {
                    stopped.insert(job_id);
                }
                Ok(_) => {}
                Err(PilotError::NotFound(_)) => {
                    stopped.insert(job_id);
                }
                Err(PilotError::InvalidState { .. }) => {
                    tracing::warn!(job_id = %job_id, "job document is corrupt, leaving its tasks");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(stopped)
    }

    /// Record `message` on every claimed task held by one of `jobs`, and
    /// release it.
    async fn release_tasks_of(&self, jobs: &BTreeSet<String>, message: &str) -> Result<Vec<TaskId>> {
        let mut released = Vec::new();
        if jobs.is_empty() {
            return Ok(released);
        }
        let rows = self.rows(self.ctx.task_db.as_ref(), "in_progress").await?;
        for row in rows {
            let held_by = row.value.get("job").and_then(Value::as_str);
            let Some(job) = held_by.filter(|j| jobs.contains(*j)).map(str::to_string) else {
                continue;
            };
            let id = TaskId::new(row.id.clone());
            let outcome = self
                .release_task(
                    &id,
                    row.doc,
                    |task| task.lock > 0 && task.job.as_ref().map(|j| j.as_str()) == Some(job.as_str()),
                    Some(message),
                )
                .await;
            if self.tally(&id, outcome)? {
                tracing::info!(task_id = %id, job_id = %job, "released task of stopped job");
                released.push(id);
            }
        }
        Ok(released)
    }

    /// Unlock one task (optionally recording an error) if `still_held` holds
    /// for the freshest copy. Done tasks are never touched.
    async fn release_task<P>(
        &self,
        id: &TaskId,
        prefetched: Option<Document>,
        still_held: P,
        message: Option<&str>,
    ) -> Result<bool>
    where
        P: Fn(&Task) -> bool + Send + Sync,
    {
        let this = self;
        let still_held = &still_held;
        let mut prefetched = prefetched;

        self.ctx
            .retry
            .on_conflict("unlock", id.as_str(), move |_| {
                let first = prefetched.take();
                async move {
                    let mut task = match first {
                        Some(doc) => Task::from_document(doc)?,
                        None => match this.ctx.tasks().get(id).await {
                            Ok(task) => task,
                            Err(PilotError::NotFound(_)) => return Ok(false),
                            Err(e) => return Err(e),
                        },
                    };
                    if task.is_done() || !still_held(&task) {
                        return Ok(false);
                    }
                    if this.dry_run {
                        return Ok(true);
                    }
                    if let Some(message) = message {
                        task.error(message, None, this.ctx.now());
                    }
                    task.unlock();
                    match this.ctx.tasks().save(&task).await {
                        Ok(_) => Ok(true),
                        Err(PilotError::NotFound(_)) => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            })
            .await
    }

    /// Count a release outcome; corrupt or hopelessly contended tasks are
    /// logged and skipped.
    fn tally(&self, id: &TaskId, outcome: Result<bool>) -> Result<bool> {
        match outcome {
            Ok(changed) => Ok(changed),
            Err(e @ (PilotError::InvalidState { .. } | PilotError::RetriesExhausted { .. })) => {
                tracing::warn!(task_id = %id, error = %e, "could not scrub task");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
