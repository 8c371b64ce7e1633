//! Claim-on-read task iteration.
//!
//! Every iterator yields tasks that are already claimed: `lock` and `job` are
//! set and saved. Claims are plain compare-and-swap saves, so a worker that
//! loses the race simply moves on to the next candidate.
//!
//! - `ViewIterator`: one view, in key order (the `pending` view is id order)
//! - `PrioritizedIterator`: `pending_priority` first, then `pending`
//! - `EndlessIterator`: restarts an exhausted iterator until told to stop

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::app::context::Context;
use crate::domain::ids::JobId;
use crate::domain::task::Task;
use crate::error::{PilotError, Result};
use crate::ports::{ViewOptions, ViewRow};

#[async_trait]
pub trait TaskIterator: Send {
    /// Next claimed task, or `None` when the iterator is exhausted.
    async fn next_task(&mut self) -> Result<Option<Task>>;

    /// Forget what has been seen and start over from a fresh view query.
    fn restart(&mut self);
}

#[async_trait]
impl<I: TaskIterator + ?Sized> TaskIterator for Box<I> {
    async fn next_task(&mut self) -> Result<Option<Task>> {
        (**self).next_task().await
    }

    fn restart(&mut self) {
        (**self).restart()
    }
}

pub struct ViewIterator {
    ctx: Context,
    view: String,
    page_size: usize,
    buffer: VecDeque<ViewRow>,
    seen: HashSet<String>,
    exhausted: bool,
}

impl ViewIterator {
    pub fn new(ctx: Context, view: impl Into<String>) -> Self {
        let page_size = ctx.config.worker.page_size.max(1);
        Self {
            ctx,
            view: view.into(),
            page_size,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            exhausted: false,
        }
    }

    pub fn pending(ctx: Context) -> Self {
        Self::new(ctx, "pending")
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rows not seen in this pass, paging past seen ones.
    async fn fetch_unseen(&self) -> Result<Vec<ViewRow>> {
        let mut skip = 0;
        loop {
            let options = ViewOptions::default()
                .limit(self.page_size)
                .skip(skip)
                .include_docs();
            let result = self.ctx.task_db.view(&self.view, options).await?;
            let fetched = result.rows.len();
            let fresh: Vec<ViewRow> = result
                .rows
                .into_iter()
                .filter(|row| !self.seen.contains(&row.id))
                .collect();
            if !fresh.is_empty() || fetched < self.page_size {
                return Ok(fresh);
            }
            skip += fetched;
        }
    }

    /// Try to claim the task behind `row`; `None` if someone else has it.
    async fn claim(&self, row: ViewRow) -> Result<Option<Task>> {
        let doc = match row.doc {
            Some(doc) => doc,
            None => match self.ctx.task_db.get(&row.id).await {
                Ok(doc) => doc,
                Err(PilotError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            },
        };
        let mut task = match Task::from_document(doc) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %row.id, error = %e, "skipping unreadable task");
                return Ok(None);
            }
        };
        if !task.state()?.is_claimable() {
            return Ok(None);
        }

        task.lock(self.ctx.job_id.as_ref(), self.ctx.now())?;
        match self.ctx.task_db.save(task.to_document()?).await {
            Ok(saved) => Ok(Some(Task::from_document(saved)?)),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                tracing::debug!(task_id = %task.id, "claim lost, moving on");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TaskIterator for ViewIterator {
    async fn next_task(&mut self) -> Result<Option<Task>> {
        loop {
            if self.buffer.is_empty() {
                if self.exhausted {
                    return Ok(None);
                }
                let fresh = self.fetch_unseen().await?;
                if fresh.is_empty() {
                    self.exhausted = true;
                    return Ok(None);
                }
                self.buffer.extend(fresh);
            }

            let Some(row) = self.buffer.pop_front() else {
                continue;
            };
            self.seen.insert(row.id.clone());
            if let Some(task) = self.claim(row).await? {
                tracing::debug!(task_id = %task.id, view = %self.view, "claimed task");
                return Ok(Some(task));
            }
        }
    }

    fn restart(&mut self) {
        self.buffer.clear();
        self.seen.clear();
        self.exhausted = false;
    }
}

/// Highest priority first, then everything else in id order.
pub struct PrioritizedIterator {
    primary: ViewIterator,
    fallback: ViewIterator,
    primary_done: bool,
}

impl PrioritizedIterator {
    pub fn new(ctx: Context) -> Self {
        Self {
            primary: ViewIterator::new(ctx.clone(), "pending_priority"),
            fallback: ViewIterator::pending(ctx),
            primary_done: false,
        }
    }
}

#[async_trait]
impl TaskIterator for PrioritizedIterator {
    async fn next_task(&mut self) -> Result<Option<Task>> {
        if !self.primary_done {
            if let Some(task) = self.primary.next_task().await? {
                return Ok(Some(task));
            }
            self.primary_done = true;
        }
        self.fallback.next_task().await
    }

    fn restart(&mut self) {
        self.primary.restart();
        self.fallback.restart();
        self.primary_done = false;
    }
}

/// Tells an endless iterator to stop handing out tasks.
#[async_trait]
pub trait StopCondition: Send + Sync {
    async fn should_stop(&self) -> Result<bool>;
}

#[async_trait]
impl StopCondition for AtomicBool {
    async fn should_stop(&self) -> Result<bool> {
        Ok(self.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl<S: StopCondition + ?Sized> StopCondition for Arc<S> {
    async fn should_stop(&self) -> Result<bool> {
        (**self).should_stop().await
    }
}

/// Stop once the job has been cancelled.
pub struct JobCancelled {
    ctx: Context,
    job_id: JobId,
}

impl JobCancelled {
    pub fn new(ctx: Context, job_id: JobId) -> Self {
        Self { ctx, job_id }
    }
}

#[async_trait]
impl StopCondition for JobCancelled {
    async fn should_stop(&self) -> Result<bool> {
        self.ctx.jobs().is_cancelled(&self.job_id).await
    }
}

/// Never stops on its own (the worker's time budget still applies).
pub struct Never;

#[async_trait]
impl StopCondition for Never {
    async fn should_stop(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Keeps polling an inner iterator, sleeping `poll_interval` whenever it runs
/// dry. Fused: once the stop condition held, it only yields `None`.
pub struct EndlessIterator<I, S> {
    inner: I,
    stop: S,
    poll_interval: Duration,
    stopped: bool,
}

impl<I: TaskIterator, S: StopCondition> EndlessIterator<I, S> {
    pub fn new(inner: I, stop: S, poll_interval: Duration) -> Self {
        Self {
            inner,
            stop,
            poll_interval,
            stopped: false,
        }
    }
}

#[async_trait]
impl<I: TaskIterator, S: StopCondition> TaskIterator for EndlessIterator<I, S> {
    async fn next_task(&mut self) -> Result<Option<Task>> {
        loop {
            if self.stopped {
                return Ok(None);
            }
            if self.stop.should_stop().await? {
                tracing::info!("stop requested, no more tasks");
                self.stopped = true;
                return Ok(None);
            }
            if let Some(task) = self.inner.next_task().await? {
                return Ok(Some(task));
            }
            tracing::debug!(poll_interval = ?self.poll_interval, "no pending tasks, waiting");
            tokio::time::sleep(self.poll_interval).await;
            self.inner.restart();
        }
    }

    fn restart(&mut self) {
        self.inner.restart();
    }
}

/// The iterator `pilot run` uses.
pub fn task_iterator(
    ctx: &Context,
    prioritize: bool,
    endless: bool,
    stop: Arc<dyn StopCondition>,
) -> Box<dyn TaskIterator> {
    let inner: Box<dyn TaskIterator> = if prioritize {
        Box::new(PrioritizedIterator::new(ctx.clone()))
    } else {
        Box::new(ViewIterator::pending(ctx.clone()))
    };
    if endless {
        Box::new(EndlessIterator::new(inner, stop, ctx.config.worker.poll_interval()))
    } else {
        inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::context::ContextBuilder;
    use crate::domain::state::TaskState;
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;
    use serde_json::{Map, Value, json};

    fn ctx() -> Context {
        ContextBuilder::new()
            .task_db(Arc::new(InMemoryStore::new("tasks")))
            .job_db(Arc::new(InMemoryStore::new("jobs")))
            .clock(Arc::new(FixedClock::at(1_000)))
            .job_id(Some(JobId::new("job-a")))
            .build()
            .unwrap()
    }

    async fn add(ctx: &Context, fields: Value) -> Task {
        let fields: Map<String, Value> = fields.as_object().cloned().unwrap();
        ctx.tasks().add(fields).await.unwrap()
    }

    async fn drain(it: &mut dyn TaskIterator) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(task) = it.next_task().await.unwrap() {
            ids.push(task.id.to_string());
        }
        ids
    }

    #[tokio::test]
    async fn claims_pending_tasks_in_id_order() {
        let ctx = ctx();
        for id in ["t2", "t1", "t3"] {
            add(&ctx, json!({"_id": id})).await;
        }

        let mut it = ViewIterator::pending(ctx.clone()).with_page_size(2);
        assert_eq!(drain(&mut it).await, ["t1", "t2", "t3"]);

        let t1 = ctx.tasks().get(&"t1".into()).await.unwrap();
        assert_eq!(t1.state().unwrap(), TaskState::InProgress);
        assert_eq!(t1.job, Some(JobId::new("job-a")));
        assert_eq!(t1.lock, 1_000);
    }

    #[tokio::test]
    async fn lost_claim_moves_to_next_candidate() {
        let ctx = ctx();
        add(&ctx, json!({"_id": "t1"})).await;
        add(&ctx, json!({"_id": "t2"})).await;

        let mut it = ViewIterator::pending(ctx.clone());
        // prime the buffer, then let another worker take t2 behind our back
        let first = it.next_task().await.unwrap().unwrap();
        assert_eq!(first.id.as_str(), "t1");

        let mut stolen = ctx.tasks().get(&"t2".into()).await.unwrap();
        stolen.lock(Some(&JobId::new("job-b")), 999).unwrap();
        ctx.tasks().save(&stolen).await.unwrap();

        assert!(it.next_task().await.unwrap().is_none());
        let t2 = ctx.tasks().get(&"t2".into()).await.unwrap();
        assert_eq!(t2.job, Some(JobId::new("job-b")));
    }

    #[tokio::test]
    async fn skips_unclaimable_rows_beyond_the_first_page() {
        let ctx = ctx();
        // a corrupt pending task that can never be claimed
        let bad = crate::ports::Document::new("t0")
            .with_field("type", json!("task"))
            .with_field("errors", json!("not a list"));
        ctx.task_db.save(bad).await.unwrap();
        add(&ctx, json!({"_id": "t1"})).await;

        let mut it = ViewIterator::pending(ctx.clone()).with_page_size(1);
        assert_eq!(drain(&mut it).await, ["t1"]);
    }

    #[tokio::test]
    async fn prioritized_takes_highest_priority_first() {
        let ctx = ctx();
        add(&ctx, json!({"_id": "t1"})).await;
        add(&ctx, json!({"_id": "t2", "priority": 1})).await;
        add(&ctx, json!({"_id": "t3", "priority": 10})).await;

        let mut it = PrioritizedIterator::new(ctx.clone());
        assert_eq!(drain(&mut it).await, ["t3", "t2", "t1"]);
    }

    #[tokio::test]
    async fn endless_stops_with_tasks_left() {
        let ctx = ctx();
        add(&ctx, json!({"_id": "t1"})).await;
        add(&ctx, json!({"_id": "t2"})).await;

        let stop = Arc::new(AtomicBool::new(false));
        let mut it = EndlessIterator::new(
            ViewIterator::pending(ctx.clone()),
            stop.clone(),
            Duration::from_millis(1),
        );

        assert!(it.next_task().await.unwrap().is_some());
        stop.store(true, Ordering::SeqCst);
        assert!(it.next_task().await.unwrap().is_none());

        // fused, even after the flag is cleared
        stop.store(false, Ordering::SeqCst);
        assert!(it.next_task().await.unwrap().is_none());
        let left = ctx.task_db.view("pending", ViewOptions::default()).await.unwrap();
        assert_eq!(left.total_rows, 1);
    }

    #[tokio::test]
    async fn endless_picks_up_tasks_added_later() {
        let ctx = ctx();
        let stop = Arc::new(AtomicBool::new(false));
        let mut it = EndlessIterator::new(
            ViewIterator::pending(ctx.clone()),
            stop.clone(),
            Duration::from_millis(5),
        );

        let producer = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                add(&ctx, json!({"_id": "late"})).await;
            })
        };

        let task = it.next_task().await.unwrap().unwrap();
        assert_eq!(task.id.as_str(), "late");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn job_cancelled_stops_iteration() {
        let ctx = ctx();
        let job_id = JobId::new("job-a");
        ctx.jobs().start(&job_id, &Map::new()).await.unwrap();
        let cond = JobCancelled::new(ctx.clone(), job_id.clone());

        assert!(!cond.should_stop().await.unwrap());
        ctx.jobs().cancel(&job_id).await.unwrap();
        assert!(cond.should_stop().await.unwrap());
    }
}
