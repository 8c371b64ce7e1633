//! Submit, run, crash and recover, end to end on the in-memory store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pilot_core::app::{
    Context, ContextBuilder, JobActor, RetryPolicy, Scrubber, StopReason, TaskIterator,
    TaskProcessor, ViewIterator,
};
use pilot_core::domain::{JobId, JobState, Task, TaskState};
use pilot_core::impls::InMemoryStore;
use pilot_core::ports::{FixedClock, JobLauncher};
use pilot_core::submit::{self, Launchers};
use pilot_core::Result;
use serde_json::{Map, json};

const T0: i64 = 1_700_000_000;

/// Resource manager whose queue is whatever the test says it is.
#[derive(Default)]
struct Cluster {
    launched: Mutex<Vec<JobId>>,
    queue: Mutex<HashSet<String>>,
}

#[async_trait]
impl JobLauncher for Cluster {
    fn method(&self) -> &str {
        "local"
    }

    fn host(&self) -> &str {
        "cluster"
    }

    async fn launch(&self, job_id: &JobId) -> Result<String> {
        let mut launched = self.launched.lock().unwrap();
        launched.push(job_id.clone());
        let batch = launched.len().to_string();
        self.queue.lock().unwrap().insert(batch.clone());
        Ok(format!("{batch}.cluster.example.org"))
    }

    async fn queued_batch_ids(&self) -> Result<Option<HashSet<String>>> {
        Ok(Some(self.queue.lock().unwrap().clone()))
    }
}

struct Square;

#[async_trait]
impl TaskProcessor for Square {
    async fn process(&self, ctx: &Context, task: &mut Task) -> Result<()> {
        let n = task.input["n"].as_i64().unwrap_or(0);
        task.output = json!({"square": n * n});
        task.done(ctx.now())
    }
}

struct Setup {
    ctx: Context,
    clock: Arc<FixedClock>,
    cluster: Arc<Cluster>,
    launchers: Launchers,
}

fn setup() -> Setup {
    let clock = Arc::new(FixedClock::at(T0));
    let ctx = ContextBuilder::new()
        .task_db(Arc::new(InMemoryStore::new("tasks")))
        .job_db(Arc::new(InMemoryStore::new("jobs")))
        .clock(clock.clone())
        .retry(RetryPolicy::immediate(5))
        .build()
        .unwrap();
    let cluster = Arc::new(Cluster::default());
    let launcher: Arc<dyn JobLauncher> = cluster.clone();
    let launchers = Launchers::from([("cluster".to_string(), launcher)]);
    Setup {
        ctx,
        clock,
        cluster,
        launchers,
    }
}

async fn add_tasks(ctx: &Context, n: i64) {
    for i in 0..n {
        let fields = json!({"_id": format!("task-{i:02}"), "input": {"n": i}});
        ctx.tasks().add(fields.as_object().cloned().unwrap()).await.unwrap();
    }
}

fn actor(ctx: &Context, job_id: &JobId) -> JobActor {
    let ctx = ctx.clone().with_job_id(job_id.clone());
    let iterator = Box::new(ViewIterator::pending(ctx.clone()));
    JobActor::new(ctx, iterator, Arc::new(Square))
}

#[tokio::test]
async fn submitted_job_processes_everything_and_is_archived() {
    let s = setup();
    add_tasks(&s.ctx, 5).await;

    let launcher = s.launchers["cluster"].clone();
    let job = submit::submit_if_needed(&s.ctx, launcher.as_ref(), 1)
        .await
        .unwrap()
        .expect("a job is needed");
    assert_eq!(job.state().unwrap(), JobState::Queued);
    // one active job is the maximum
    assert!(submit::submit_if_needed(&s.ctx, launcher.as_ref(), 1).await.unwrap().is_none());

    s.clock.advance(chrono::Duration::seconds(30));
    let report = actor(&s.ctx, &job.id).run().await.unwrap();
    assert_eq!(report.processed, 5);
    assert_eq!(report.stop, StopReason::Exhausted);

    let job = s.ctx.jobs().get(&job.id).await.unwrap();
    assert_eq!(job.state().unwrap(), JobState::Archived);

    let t3 = s.ctx.tasks().get(&"task-03".into()).await.unwrap();
    assert_eq!(t3.output, json!({"square": 9}));
    assert_eq!(t3.job.as_ref(), Some(&job.id));
    assert_eq!(s.ctx.tasks().overview_total().await.unwrap()["done"], 5);
}

#[tokio::test]
async fn crashed_job_is_detected_and_its_task_recovered() {
    let s = setup();
    add_tasks(&s.ctx, 2).await;

    let launcher = s.launchers["cluster"].clone();
    let crashed = submit::submit(&s.ctx, launcher.as_ref()).await.unwrap();

    // the worker starts, claims a task and dies without a trace
    let worker = s.ctx.clone().with_job_id(crashed.id.clone());
    s.ctx.jobs().start(&crashed.id, &Map::new()).await.unwrap();
    let mut iterator = ViewIterator::pending(worker);
    let held = iterator.next_task().await.unwrap().unwrap();
    s.cluster.queue.lock().unwrap().clear();

    s.clock.advance(chrono::Duration::minutes(5));
    let report = Scrubber::new(&s.ctx, &s.launchers).check(None, 1).await.unwrap();
    assert_eq!(report.stopped_jobs, vec![crashed.id.clone()]);
    assert_eq!(report.failed_tasks, vec![held.id.clone()]);

    let job = s.ctx.jobs().get(&crashed.id).await.unwrap();
    assert_eq!(job.state().unwrap(), JobState::Archived);
    let task = s.ctx.tasks().get(&held.id).await.unwrap();
    assert_eq!(task.state().unwrap(), TaskState::Pending);
    assert!(task.has_errors());

    // checking again finds nothing new
    let again = Scrubber::new(&s.ctx, &s.launchers).check(None, 1).await.unwrap();
    assert!(again.stopped_jobs.is_empty());
    assert!(again.failed_tasks.is_empty());

    // a replacement job finishes both tasks; the old error stays on record
    let replacement = JobId::new("job-replacement");
    let report = actor(&s.ctx, &replacement).run().await.unwrap();
    assert_eq!(report.processed, 2);

    let task = s.ctx.tasks().get(&held.id).await.unwrap();
    assert!(task.is_done());
    assert!(task.has_errors());
    let job = s.ctx.jobs().get(&replacement).await.unwrap();
    assert_eq!(job.state().unwrap(), JobState::Finished);
}

#[tokio::test]
async fn stale_claims_are_scrubbed_by_age() {
    let s = setup();
    add_tasks(&s.ctx, 1).await;

    let worker = s.ctx.clone().with_job_id(JobId::new("job-gone"));
    let mut iterator = ViewIterator::pending(worker);
    iterator.next_task().await.unwrap().unwrap();

    let scrubber = Scrubber::new(&s.ctx, &s.launchers);
    s.clock.advance(chrono::Duration::minutes(10));
    let early = scrubber.scrub("in_progress", std::time::Duration::from_secs(3600)).await.unwrap();
    assert_eq!(early.scrubbed, 0);

    s.clock.advance(chrono::Duration::hours(1));
    let late = scrubber.scrub("in_progress", std::time::Duration::from_secs(3600)).await.unwrap();
    assert_eq!(late.scrubbed, 1);

    let task = s.ctx.tasks().get(&"task-00".into()).await.unwrap();
    assert_eq!(task.state().unwrap(), TaskState::Pending);
}

#[tokio::test]
async fn finish_before_queue_record_is_archived_late() {
    let s = setup();
    let id = JobId::new("job-fast");

    // the worker ran and finished before the submitter recorded the queueing
    s.ctx.jobs().start(&id, &Map::new()).await.unwrap();
    let finished = s.ctx.jobs().finish(&id).await.unwrap();
    assert_eq!((finished.queue, finished.archive), (0, 0));
    assert!(finished.done > 0);

    let mut record = pilot_core::domain::Job::new(id.clone());
    record.batch_id = Some("7.cluster".into());
    let queued = s.ctx.jobs().queue(record, "local", "cluster").await.unwrap();
    assert_eq!(queued.state().unwrap(), JobState::Archived);
}
