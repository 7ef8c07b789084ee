use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Map, Value};

use progress::{
    Completion, Coordinator, JobListing, MemoryStore, MemoryTopic, NewJob, Notifier, Part,
    ProgressConfig, ProgressError, ProgressStore, StoreConfig,
};

const TOPIC: &str = "arn:aws:sns:us-east-1:000000000000:work";

fn config() -> ProgressConfig {
    ProgressConfig::new(TOPIC, StoreConfig::Memory)
}

fn tiles(n: usize) -> Vec<Map<String, Value>> {
    (0..n)
        .map(|i| {
            json!({ "source": format!("{i}.tif") })
                .as_object()
                .unwrap()
                .clone()
        })
        .collect()
}

/// Topic that rejects its first publish and records the rest.
#[derive(Default)]
struct ThrottledOnce {
    calls: AtomicUsize,
    inner: MemoryTopic,
}

#[async_trait]
impl Notifier for ThrottledOnce {
    async fn publish(&self, target: &str, subject: &str, message: &Value) -> progress::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ProgressError::Sns("throttled".into()));
        }
        self.inner.publish(target, subject, message).await
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    topic: Arc<MemoryTopic>,
    config: ProgressConfig,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            topic: Arc::new(MemoryTopic::new()),
            config: config(),
        }
    }

    fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.store.clone(), self.topic.clone(), &self.config)
    }

    fn part(&self, jobid: &str, partid: u64) -> Part {
        Part::new(
            jobid,
            partid,
            self.store.clone(),
            self.topic.clone(),
            &self.config,
        )
    }

    async fn complete(&self, jobid: &str, partid: u64) -> Completion {
        self.part(jobid, partid)
            .run(|| async { Ok(()) })
            .await
            .unwrap()
            .completion
    }
}

#[tokio::test]
async fn test_create_job_sends_map_messages() {
    let h = Harness::new();
    let jobid = h
        .coordinator()
        .create_job(NewJob::new(vec![Map::new(), Map::new(), Map::new()]))
        .await
        .unwrap();

    let maps = h.topic.with_subject("map").await;
    assert_eq!(maps.len(), 3);
    assert!(maps.iter().all(|m| m.target == TOPIC));

    let mut partids: Vec<u64> = maps
        .iter()
        .map(|m| {
            assert_eq!(m.body["jobid"], json!(jobid));
            m.body["partid"].as_u64().unwrap()
        })
        .collect();
    partids.sort_unstable();
    assert_eq!(partids, vec![0, 1, 2]);

    let status = h.store.status(&jobid, None).await.unwrap();
    assert_eq!(status.total, 3);
    assert_eq!(status.remaining, 3);
    assert_eq!(status.progress, 0.0);
}

#[tokio::test]
async fn test_create_job_with_id_and_metadata() {
    let h = Harness::new();
    let mut metadata = Map::new();
    metadata.insert("zoom".into(), json!(12));

    let jobid = h
        .coordinator()
        .create_job(
            NewJob::new(tiles(2))
                .jobid("000-123")
                .workers(1)
                .metadata(metadata.clone()),
        )
        .await
        .unwrap();
    assert_eq!(jobid, "000-123");

    let maps = h.topic.with_subject("map").await;
    assert_eq!(maps.len(), 2);
    for message in &maps {
        assert_eq!(message.body["metadata"], json!({"zoom": 12}));
        assert!(message.body["source"].as_str().unwrap().ends_with(".tif"));
    }

    let status = h.store.status("000-123", None).await.unwrap();
    assert_eq!(status.metadata, metadata);
}

#[tokio::test]
async fn test_create_job_generates_unique_ids() {
    let h = Harness::new();
    let a = h.coordinator().create_job(NewJob::new(tiles(1))).await.unwrap();
    let b = h.coordinator().create_job(NewJob::new(tiles(1))).await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_create_empty_job_fails() {
    let h = Harness::new();
    let err = h.coordinator().create_job(NewJob::new(vec![])).await.unwrap_err();
    assert!(matches!(err, ProgressError::EmptyJob));
    assert!(h.topic.messages().await.is_empty());
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_failed_map_send_still_returns_jobid() {
    let store = Arc::new(MemoryStore::new());
    let topic = Arc::new(ThrottledOnce::default());
    let coordinator = Coordinator::new(store.clone(), topic.clone(), &config());

    let err = coordinator
        .create_job(NewJob::new(tiles(3)).workers(1))
        .await
        .unwrap_err();
    let (jobid, source) = match err {
        ProgressError::MapFanout { jobid, source } => (jobid, source),
        other => panic!("unexpected error: {other}"),
    };
    assert!(matches!(*source, ProgressError::Sns(_)));

    // Every send was attempted and the job is reachable by its id.
    assert_eq!(topic.calls.load(Ordering::SeqCst), 3);
    assert_eq!(topic.inner.count("map").await, 2);
    let status = store.status(&jobid, None).await.unwrap();
    assert_eq!(status.total, 3);
    assert_eq!(status.remaining, 3);
}

#[tokio::test]
async fn test_status_before_set_total() {
    let h = Harness::new();
    assert!(matches!(
        h.store.status("123", None).await,
        Err(ProgressError::JobDoesNotExist(_))
    ));
    assert!(matches!(
        h.store.list_pending_parts("123").await,
        Err(ProgressError::JobDoesNotExist(_))
    ));
}

#[tokio::test]
async fn test_three_part_scenario() {
    let h = Harness::new();
    let jobid = h
        .coordinator()
        .create_job(NewJob::new(vec![Map::new(), Map::new(), Map::new()]))
        .await
        .unwrap();

    assert_eq!(h.complete(&jobid, 0).await, Completion::Pending);
    let status = h.store.status(&jobid, None).await.unwrap();
    assert_eq!(status.remaining, 2);
    assert_eq!(h.topic.count("reduce").await, 0);

    assert_eq!(h.complete(&jobid, 1).await, Completion::Pending);
    assert_eq!(h.complete(&jobid, 2).await, Completion::ReduceSent);

    let status = h.store.status(&jobid, None).await.unwrap();
    assert_eq!(status.remaining, 0);
    assert_eq!(status.progress, 1.0);
    assert!(status.reduce_sent);

    let reduces = h.topic.with_subject("reduce").await;
    assert_eq!(reduces.len(), 1);
    assert_eq!(reduces[0].body, json!({"jobid": jobid, "metadata": {}}));
    assert_eq!(reduces[0].target, TOPIC);

    // Duplicate delivery of an already completed part.
    assert_eq!(h.complete(&jobid, 0).await, Completion::ReduceAlreadySent);
    assert_eq!(h.topic.count("reduce").await, 1);

    let status = h.store.status(&jobid, None).await.unwrap();
    assert_eq!(status.remaining, 0);
    assert!(status.reduce_sent);
}

#[tokio::test]
async fn test_completion_is_order_independent() {
    let orders: [&[u64]; 4] = [
        &[0, 1, 2, 3, 4],
        &[4, 3, 2, 1, 0],
        &[2, 0, 4, 1, 3],
        &[1, 1, 3, 0, 3, 2, 4],
    ];

    for order in orders {
        let h = Harness::new();
        let jobid = h.coordinator().create_job(NewJob::new(tiles(5))).await.unwrap();

        for &partid in order {
            h.complete(&jobid, partid).await;
        }

        let status = h.store.status(&jobid, None).await.unwrap();
        assert_eq!(status.remaining, 0, "order {:?}", order);
        assert_eq!(h.topic.count("reduce").await, 1, "order {:?}", order);
    }
}

#[tokio::test]
async fn test_concurrent_parts_send_one_reduce() {
    let h = Arc::new(Harness::new());
    let n = 200;
    let jobid = h
        .coordinator()
        .create_job(NewJob::new(tiles(n)).workers(25))
        .await
        .unwrap();
    assert_eq!(h.topic.count("map").await, n);

    let mut tasks = tokio::task::JoinSet::new();
    for partid in 0..n as u64 {
        let h = h.clone();
        let jobid = jobid.clone();
        tasks.spawn(async move { h.complete(&jobid, partid).await });
    }

    let mut sent = 0;
    while let Some(completion) = tasks.join_next().await {
        if completion.unwrap() == Completion::ReduceSent {
            sent += 1;
        }
    }

    assert_eq!(sent, 1);
    assert_eq!(h.topic.count("reduce").await, 1);
    assert!(h.store.list_pending_parts(&jobid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_part_status() {
    let h = Harness::new();
    let jobid = h.coordinator().create_job(NewJob::new(tiles(3))).await.unwrap();
    h.complete(&jobid, 0).await;

    let status = h.store.status(&jobid, Some(0)).await.unwrap();
    assert_eq!(status.part_complete, Some(true));
    let status = h.store.status(&jobid, Some(1)).await.unwrap();
    assert_eq!(status.part_complete, Some(false));

    assert_eq!(h.store.list_pending_parts(&jobid).await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_list_jobs() {
    let h = Harness::new();
    let done = h.coordinator().create_job(NewJob::new(tiles(1))).await.unwrap();
    let open = h.coordinator().create_job(NewJob::new(tiles(2))).await.unwrap();
    h.complete(&done, 0).await;

    let listings: Vec<JobListing> = h.store.list_jobs(true).try_collect().await.unwrap();
    assert_eq!(listings.len(), 2);

    let open_jobs: Vec<&str> = listings
        .iter()
        .filter(|l| l.remaining() > Some(0))
        .map(|l| l.jobid())
        .collect();
    assert_eq!(open_jobs, vec![open.as_str()]);

    let ids: Vec<JobListing> = h.store.list_jobs(false).try_collect().await.unwrap();
    assert!(ids.iter().all(|l| matches!(l, JobListing::Id(_))));
}
