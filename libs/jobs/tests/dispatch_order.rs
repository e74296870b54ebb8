//! Dispatch ordering and status-set bookkeeping of the job queue.

use std::collections::HashSet;
use std::sync::Arc;

use std::time::Duration;

use async_trait::async_trait;
use calcbridge_jobs::{
    job_key, tenant_key, Job, JobStatus, JobSubmission, JobUpdate, MemoryRecordStore,
    PriorityJobQueue, RecordStore, StoreError, StoreOp,
};
use chrono::{DateTime, TimeZone, Utc};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn test_queue() -> PriorityJobQueue {
    PriorityJobQueue::new(Arc::new(MemoryRecordStore::new()))
}

fn test_job(priority: u8, created_at: DateTime<Utc>) -> Job {
    let mut job = Job::from_submission(
        JobSubmission {
            tenant_id: "tenant-a".to_string(),
            user_id: "user-1".to_string(),
            model_name: Some("annuity-reserve".to_string()),
            priority,
            package_path: "packages/tenant-a/pkg.zip".to_string(),
            package_hash: "sha256:1234".to_string(),
        },
        "http://localhost:8080",
    );
    job.created_at = created_at;
    job
}

/// Every known job appears in exactly one status set, the one its record names.
async fn assert_status_sets_exclusive(queue: &PriorityJobQueue, jobs: &[Job]) {
    let mut seen = HashSet::new();
    for status in JobStatus::ALL {
        for id in queue.ids_in_status(status).await.unwrap() {
            assert!(seen.insert(id.clone()), "{id} is in more than one status set");
            let job = queue.get(&id.parse().unwrap()).await.unwrap().unwrap();
            assert_eq!(job.status, status, "{id} is in the wrong status set");
        }
    }
    for job in jobs {
        assert!(seen.contains(&job.id.to_string()), "{} is in no status set", job.id);
    }
}

#[tokio::test]
async fn test_higher_priority_dequeues_first() {
    let queue = test_queue();
    let a = test_job(3, at(100));
    let b = test_job(7, at(200));
    queue.enqueue(&a).await.unwrap();
    queue.enqueue(&b).await.unwrap();

    let first = queue.dequeue_next().await.unwrap().unwrap();
    let second = queue.dequeue_next().await.unwrap().unwrap();

    assert_eq!(first.id, b.id);
    assert_eq!(second.id, a.id);
    assert!(queue.dequeue_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let queue = test_queue();
    let later = test_job(5, at(101));
    let earlier = test_job(5, at(100));
    queue.enqueue(&later).await.unwrap();
    queue.enqueue(&earlier).await.unwrap();

    assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, earlier.id);
    assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, later.id);
}

#[tokio::test]
async fn test_dequeue_moves_job_to_initializing() {
    let queue = test_queue();
    let job = test_job(5, at(100));
    queue.enqueue(&job).await.unwrap();
    assert_eq!(queue.queue_depth().await.unwrap(), 1);

    let dequeued = queue.dequeue_next().await.unwrap().unwrap();

    assert_eq!(dequeued.status, JobStatus::Initializing);
    assert!(dequeued.started_at.is_some());
    assert_eq!(queue.queue_depth().await.unwrap(), 0);
    assert_eq!(
        queue.ids_in_status(JobStatus::Initializing).await.unwrap(),
        vec![job.id.to_string()]
    );
}

#[tokio::test]
async fn test_status_sets_stay_exclusive_through_lifecycle() {
    let queue = test_queue();
    let jobs: Vec<Job> = (0..4).map(|i| test_job(i * 2, at(100 + i64::from(i)))).collect();
    for job in &jobs {
        queue.enqueue(job).await.unwrap();
    }
    assert_status_sets_exclusive(&queue, &jobs).await;

    let running = queue.dequeue_next().await.unwrap().unwrap();
    queue
        .update_status(&running.id, JobStatus::Running, JobUpdate::default())
        .await
        .unwrap();
    assert_status_sets_exclusive(&queue, &jobs).await;

    queue
        .update_status(
            &running.id,
            JobStatus::Completed,
            JobUpdate::completed(serde_json::json!({"bel": 1204.5})),
        )
        .await
        .unwrap();
    let cancelled = queue.dequeue_next().await.unwrap().unwrap();
    queue
        .update_status(&cancelled.id, JobStatus::Cancelled, JobUpdate::default())
        .await
        .unwrap();
    assert_status_sets_exclusive(&queue, &jobs).await;

    let completed = queue.get(&running.id).await.unwrap().unwrap();
    assert!(completed.completed_at.is_some());
    assert!(completed.duration_seconds.is_some());
    assert_eq!(queue.queue_depth().await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_consumers_never_share_a_job() {
    let queue = test_queue();
    let mut expected = HashSet::new();
    for i in 0..40 {
        let job = test_job((i % 11) as u8, at(1_000 + i64::from(i)));
        expected.insert(job.id);
        queue.enqueue(&job).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            while let Some(job) = queue.dequeue_next().await.unwrap() {
                taken.push(job.id);
            }
            taken
        }));
    }

    let mut received = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(received.insert(id), "{id} was dequeued twice");
        }
    }
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_enqueue_then_get_round_trips_every_field() {
    let queue = test_queue();
    let mut job = test_job(9, Utc::now());
    job.stream_url = "https://bridge.example/jobs/x/stream".to_string();
    job.result = Some(serde_json::json!({"scenarios": [1, 2, 3]}));
    job.duration_seconds = Some(12.25);
    job.error = Some("previous attempt timed out".to_string());
    queue.enqueue(&job).await.unwrap();

    let stored = queue.get(&job.id).await.unwrap().unwrap();

    assert_eq!(stored, job);
}

/// Memory store that yields right after every read, so two transitions of
/// one job interleave between reading the record and writing the batch.
#[derive(Default)]
struct InterleavingStore {
    inner: MemoryRecordStore,
}

#[async_trait]
impl RecordStore for InterleavingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self.inner.get(key).await?;
        tokio::task::yield_now().await;
        Ok(value)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        self.inner.apply(ops).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.set_members(key).await
    }

    async fn pop_min(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        self.inner.pop_min(key).await
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.sorted_len(key).await
    }

    async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.sorted_members(key).await
    }
}

#[tokio::test]
async fn test_racing_transitions_leave_one_status_set() {
    let queue = PriorityJobQueue::new(Arc::new(InterleavingStore::default()));
    let job = test_job(5, at(100));
    queue.enqueue(&job).await.unwrap();
    let dispatched = queue.dequeue_next().await.unwrap().unwrap();

    let (cancel, start) = tokio::join!(
        queue.update_status(&dispatched.id, JobStatus::Cancelled, JobUpdate::default()),
        queue.update_status(&dispatched.id, JobStatus::Running, JobUpdate::default()),
    );
    cancel.unwrap();
    start.unwrap();

    assert_status_sets_exclusive(&queue, &[job]).await;
}

#[tokio::test]
async fn test_expired_records_are_pruned_from_indexes() {
    let store = Arc::new(MemoryRecordStore::new());
    let queue = PriorityJobQueue::new(store.clone());
    let kept = test_job(5, at(100));
    let gone = test_job(5, at(200));
    for job in [&kept, &gone] {
        queue.enqueue(job).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        queue
            .update_status(&job.id, JobStatus::Completed, JobUpdate::completed(serde_json::json!({})))
            .await
            .unwrap();
    }

    // Let one record lapse past its retention window.
    store
        .apply(vec![StoreOp::Put {
            key: job_key(&gone.id),
            value: serde_json::to_string(&gone).unwrap(),
            ttl: Duration::ZERO,
        }])
        .await
        .unwrap();

    assert_eq!(queue.prune_expired().await.unwrap(), 1);
    assert_eq!(
        queue.ids_in_status(JobStatus::Completed).await.unwrap(),
        vec![kept.id.to_string()]
    );
    assert_eq!(queue.prune_expired().await.unwrap(), 0);

    let listed = queue.list_for_tenant("tenant-a", 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(
        store.set_members(&tenant_key("tenant-a")).await.unwrap(),
        vec![kept.id.to_string()]
    );
}
