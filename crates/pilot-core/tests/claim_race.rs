//! Many workers draining one task database at the same time.

use std::collections::HashSet;
use std::sync::Arc;

use pilot_core::app::{Context, ContextBuilder, TaskIterator, ViewIterator};
use pilot_core::domain::{JobId, Task, TaskState};
use pilot_core::impls::InMemoryStore;
use pilot_core::ports::{DocumentStore, SystemClock};
use pilot_core::PilotError;
use serde_json::Map;

fn worker_ctx(store: Arc<InMemoryStore>, job: &str) -> Context {
    ContextBuilder::new()
        .task_db(store)
        .clock(Arc::new(SystemClock))
        .job_id(Some(JobId::new(job)))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_iterators_never_share_a_task() {
    let store = Arc::new(InMemoryStore::new("tasks"));
    let producer = worker_ctx(store.clone(), "producer");
    for _ in 0..60 {
        producer.tasks().add(Map::new()).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..6 {
        let ctx = worker_ctx(store.clone(), &format!("job-w{w}"));
        handles.push(tokio::spawn(async move {
            let mut iterator = ViewIterator::pending(ctx).with_page_size(4);
            let mut claimed = Vec::new();
            while let Some(task) = iterator.next_task().await.unwrap() {
                claimed.push(task.id.to_string());
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 60, "every task claimed once");
    assert_eq!(unique.len(), 60, "no task claimed twice");

    let pending = store
        .view("pending", Default::default())
        .await
        .unwrap();
    assert_eq!(pending.total_rows, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_claims_wins() {
    let store = Arc::new(InMemoryStore::new("tasks"));
    let producer = worker_ctx(store.clone(), "producer");
    let task = producer.tasks().add(Map::new()).await.unwrap();

    // every contender starts from the same revision
    let snapshot = store.get(task.id.as_str()).await.unwrap();
    let mut handles = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        let doc = snapshot.clone();
        handles.push(tokio::spawn(async move {
            let job = JobId::new(format!("job-{w}"));
            let mut task = Task::from_document(doc).unwrap();
            task.lock(Some(&job), 1_000 + w).unwrap();
            store.save(task.to_document().unwrap()).await.map(|_| job)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(job) => winners.push(job),
            Err(e) => assert!(matches!(e, PilotError::Conflict { .. })),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = producer.tasks().get(&task.id).await.unwrap();
    assert_eq!(stored.state().unwrap(), TaskState::InProgress);
    assert_eq!(stored.job.as_ref(), Some(&winners[0]));
}

#[tokio::test]
async fn loser_with_stale_copy_moves_on() {
    let store = Arc::new(InMemoryStore::new("tasks"));
    let a = worker_ctx(store.clone(), "job-a");
    let b = worker_ctx(store.clone(), "job-b");
    for id in ["t1", "t2"] {
        let mut fields = Map::new();
        fields.insert("_id".into(), id.into());
        a.tasks().add(fields).await.unwrap();
    }

    // B read t1 before A claimed it
    let stale = store.get("t1").await.unwrap();
    let mut b_iter = ViewIterator::pending(b).with_page_size(10);
    let mut a_iter = ViewIterator::pending(a.clone());
    let first = a_iter.next_task().await.unwrap().unwrap();
    assert_eq!(first.id.as_str(), "t1");

    let mut late = Task::from_document(stale).unwrap();
    late.lock(Some(&JobId::new("job-b")), 5).unwrap();
    let err = store.save(late.to_document().unwrap()).await.unwrap_err();
    assert!(err.is_conflict());

    let next = b_iter.next_task().await.unwrap().unwrap();
    assert_eq!(next.id.as_str(), "t2");
    let t1 = a.tasks().get(&"t1".into()).await.unwrap();
    assert_eq!(t1.job.as_ref().map(|j| j.as_str()), Some("job-a"));
}
