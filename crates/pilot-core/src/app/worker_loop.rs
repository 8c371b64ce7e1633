//! WorkerLoop - ジョブ一つ分のタスク実行ループ
//!
//! # フロー
//! 1. `JobRepository::start()` でジョブを running に
//! 2. キャンセル / 時間予算をチェック
//! 3. `TaskIterator::next_task()` で claim 済みタスクを取得
//! 4. `TaskProcessor::process()` を実行、失敗は `Task::error` に記録
//! 5. 結果を保存（Conflict 時は再取得して再適用）
//! 6. `JobRepository::finish()` でジョブを終了
//!
//! A failed task does not stop the loop; it stays claimed with its error so
//! the scrubber can hand it out again. Errors from the iterator or the store
//! are fatal: the job is still finished (best effort) before the error is
//! returned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::app::context::Context;
use crate::app::iterator::TaskIterator;
use crate::domain::ids::JobId;
use crate::domain::task::Task;
use crate::error::{PilotError, Result};

/// Application code run on each claimed task.
///
/// Mutate `task` in place (`output`, attachments, `done`); the loop saves it.
/// An `Err` is recorded on the task and the loop moves on.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, ctx: &Context, task: &mut Task) -> Result<()>;
}

#[async_trait]
impl<P: TaskProcessor + ?Sized> TaskProcessor for Arc<P> {
    async fn process(&self, ctx: &Context, task: &mut Task) -> Result<()> {
        (**self).process(ctx, task).await
    }
}

/// Time budget of one job.
///
/// The loop stops taking tasks once `elapsed + average * margin` would pass
/// `max`, so the job ends before the resource manager kills it.
#[derive(Debug, Clone)]
pub struct RunBudget {
    max: Option<Duration>,
    margin: f64,
    started: Instant,
    tasks: u32,
    busy: Duration,
}

impl RunBudget {
    pub fn new(max: Option<Duration>, margin: f64) -> Self {
        Self {
            max,
            margin,
            started: Instant::now(),
            tasks: 0,
            busy: Duration::ZERO,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, 1.0)
    }

    pub fn record(&mut self, took: Duration) {
        self.tasks += 1;
        self.busy += took;
    }

    /// Mean processing time so far.
    pub fn average(&self) -> Option<Duration> {
        (self.tasks > 0).then(|| self.busy / self.tasks)
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted_after(self.started.elapsed())
    }

    fn exhausted_after(&self, elapsed: Duration) -> bool {
        let Some(max) = self.max else { return false };
        let expected = self
            .average()
            .map(|avg| avg.mul_f64(self.margin))
            .unwrap_or(Duration::ZERO);
        elapsed + expected > max
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopReason {
    #[default]
    Exhausted,
    Cancelled,
    OutOfTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub processed: usize,
    pub failed: usize,
    /// Results dropped because someone else finished the task first.
    pub abandoned: usize,
    pub stop: StopReason,
}

pub struct JobActor {
    ctx: Context,
    iterator: Box<dyn TaskIterator>,
    processor: Arc<dyn TaskProcessor>,
    budget: RunBudget,
    properties: Map<String, Value>,
}

impl JobActor {
    pub fn new(ctx: Context, iterator: Box<dyn TaskIterator>, processor: Arc<dyn TaskProcessor>) -> Self {
        Self {
            ctx,
            iterator,
            processor,
            budget: RunBudget::unlimited(),
            properties: Map::new(),
        }
    }

    pub fn with_budget(mut self, budget: RunBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Properties recorded on the job when it starts (`hostname`, ...).
    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub async fn run(mut self) -> Result<RunReport> {
        let job_id = self.ctx.require_job_id()?.clone();
        self.ctx.jobs().start(&job_id, &self.properties).await?;

        match self.run_tasks(&job_id).await {
            Ok(report) => {
                self.ctx.jobs().finish(&job_id).await?;
                tracing::info!(
                    job_id = %job_id,
                    processed = report.processed,
                    failed = report.failed,
                    abandoned = report.abandoned,
                    stop = ?report.stop,
                    "job done"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "worker loop aborted");
                if let Err(finish_err) = self.ctx.jobs().finish(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %finish_err, "could not finish job");
                }
                Err(e)
            }
        }
    }

    async fn run_tasks(&mut self, job_id: &JobId) -> Result<RunReport> {
        let mut report = RunReport::default();
        loop {
            if self.ctx.jobs().is_cancelled(job_id).await? {
                tracing::info!(job_id = %job_id, "job cancelled, stopping");
                report.stop = StopReason::Cancelled;
                break;
            }
            if self.budget.exhausted() {
                tracing::info!(job_id = %job_id, average = ?self.budget.average(), "out of time, stopping");
                report.stop = StopReason::OutOfTime;
                break;
            }
            let Some(mut task) = self.iterator.next_task().await? else {
                report.stop = StopReason::Exhausted;
                break;
            };

            tracing::info!(task_id = %task.id, "processing task");
            let claim = Claim::of(&task);
            let started = Instant::now();
            let outcome = self.processor.process(&self.ctx, &mut task).await;
            self.budget.record(started.elapsed());

            match outcome {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "task failed");
                    task.error(
                        format!("Error occurred during processing: {e}"),
                        Some(format!("{e:?}")),
                        self.ctx.now(),
                    );
                    report.failed += 1;
                }
            }

            if !self.persist(task, &claim).await? {
                report.abandoned += 1;
            }
        }
        Ok(report)
    }

    /// Save a processed task. On conflict the result is rebuilt on the
    /// stored revision, unless that one is done or claimed by someone else.
    /// `false` if the result was abandoned.
    async fn persist(&self, processed: Task, claim: &Claim) -> Result<bool> {
        let ctx = &self.ctx;
        let processed = &processed;
        let id = &processed.id;

        let outcome = ctx
            .retry
            .on_conflict("persist", id.as_str(), |attempt| async move {
                if attempt == 1 {
                    return ctx.tasks().save(processed).await.map(|_| true);
                }
                let stored = match ctx.tasks().get(id).await {
                    Ok(stored) => stored,
                    Err(PilotError::NotFound(_)) => {
                        tracing::warn!(task_id = %id, "task deleted while processing");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                };
                if stored.is_done() {
                    tracing::warn!(task_id = %id, "task finished elsewhere, dropping result");
                    return Ok(false);
                }
                if !claim.holds(&stored) {
                    tracing::warn!(
                        task_id = %id,
                        holder = ?stored.job,
                        "claim lost while processing, dropping result"
                    );
                    return Ok(false);
                }
                ctx.tasks().save(&claim.rebase(stored, processed)).await.map(|_| true)
            })
            .await;

        match outcome {
            Err(e @ PilotError::RetriesExhausted { .. }) => {
                tracing::warn!(task_id = %id, error = %e, "could not save result");
                Ok(false)
            }
            other => other,
        }
    }
}

/// The claim a task was processed under.
struct Claim {
    lock: i64,
    job: Option<JobId>,
    known_errors: usize,
}

impl Claim {
    fn of(task: &Task) -> Self {
        Self {
            lock: task.lock,
            job: task.job.clone(),
            known_errors: task.errors.len(),
        }
    }

    fn holds(&self, stored: &Task) -> bool {
        stored.lock == self.lock && stored.job == self.job
    }

    /// The worker's result applied on top of `stored`: errors are appended,
    /// never replaced.
    fn rebase(&self, mut stored: Task, processed: &Task) -> Task {
        let fresh = processed.errors.iter().skip(self.known_errors).cloned();
        stored.errors.extend(fresh);
        stored.output = processed.output.clone();
        stored.attachments.extend(processed.attachments.clone());
        stored.uploads.extend(processed.uploads.clone());
        stored.extra.extend(processed.extra.clone());
        stored.lock = processed.lock;
        stored.done = processed.done;
        stored
    }
}
