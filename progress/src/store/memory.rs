use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::error;

use crate::error::{ProgressError, Result};
use crate::store::{JobListing, ProgressStore};
use crate::{JobStatus, Metadata};

#[derive(Debug, Clone, Default)]
struct JobRecord {
    /// Set by `set_total`; a record without it is not a job yet.
    total: Option<u64>,
    parts: BTreeSet<u64>,
    metadata: Metadata,
    error: Option<String>,
}

impl JobRecord {
    fn status(&self, jobid: &str) -> JobStatus {
        JobStatus::new(
            jobid,
            self.total.unwrap_or_default(),
            self.parts.len() as u64,
            self.metadata.clone(),
            self.error.clone(),
        )
    }
}

/// Job store held in process memory.
///
/// Each operation runs under one lock, which makes `complete_part`
/// atomic with respect to every other operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs held.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn set_total(&self, jobid: &str, total: u64) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let record = jobs.entry(jobid.to_string()).or_default();
        record.total = Some(total);
        record.parts = (0..total).collect();
        Ok(())
    }

    async fn complete_part(&self, jobid: &str, partid: u64) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get_mut(jobid)
            .filter(|record| record.total.is_some())
            .ok_or_else(|| ProgressError::JobDoesNotExist(jobid.to_string()))?;
        record.parts.remove(&partid);
        Ok(record.parts.is_empty())
    }

    async fn fail_job(&self, jobid: &str, reason: &str) -> Result<()> {
        error!("[fail_job] {} failed because {}.", jobid, reason);
        let mut jobs = self.jobs.lock().await;
        jobs.entry(jobid.to_string()).or_default().error = Some(reason.to_string());
        Ok(())
    }

    async fn set_metadata(&self, jobid: &str, metadata: &Metadata) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let record = jobs.entry(jobid.to_string()).or_default();
        for (key, value) in metadata {
            record.metadata.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn status(&self, jobid: &str, part: Option<u64>) -> Result<JobStatus> {
        let jobs = self.jobs.lock().await;
        let record = jobs
            .get(jobid)
            .filter(|record| record.total.is_some())
            .ok_or_else(|| ProgressError::JobDoesNotExist(jobid.to_string()))?;

        let status = record.status(jobid);
        Ok(match part {
            Some(partid) => status.with_part(!record.parts.contains(&partid)),
            None => status,
        })
    }

    async fn list_pending_parts(&self, jobid: &str) -> Result<Vec<u64>> {
        let jobs = self.jobs.lock().await;
        jobs.get(jobid)
            .filter(|record| record.total.is_some())
            .map(|record| record.parts.iter().copied().collect())
            .ok_or_else(|| ProgressError::JobDoesNotExist(jobid.to_string()))
    }

    fn list_jobs(&self, with_status: bool) -> BoxStream<'_, Result<JobListing>> {
        stream::once(async move {
            let jobs = self.jobs.lock().await;
            let listings: Vec<Result<JobListing>> = jobs
                .iter()
                .filter(|(_, record)| record.total.is_some())
                .map(|(jobid, record)| {
                    Ok(if with_status {
                        JobListing::Status(record.status(jobid))
                    } else {
                        JobListing::Id(jobid.clone())
                    })
                })
                .collect();
            stream::iter(listings)
        })
        .flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn completing_twice_is_idempotent() {
        let store = MemoryStore::new();
        store.set_total("job", 2).await.unwrap();

        assert!(!store.complete_part("job", 0).await.unwrap());
        assert!(!store.complete_part("job", 0).await.unwrap());
        assert_eq!(store.list_pending_parts("job").await.unwrap(), vec![1]);

        assert!(store.complete_part("job", 1).await.unwrap());
        assert!(store.complete_part("job", 1).await.unwrap());
        assert_eq!(store.status("job", None).await.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn unknown_job() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.status("nope", None).await,
            Err(ProgressError::JobDoesNotExist(_))
        ));
        assert!(matches!(
            store.complete_part("nope", 0).await,
            Err(ProgressError::JobDoesNotExist(_))
        ));

        // Metadata alone does not make a job.
        store.set_metadata("nope", &Metadata::new()).await.unwrap();
        assert!(matches!(
            store.list_pending_parts("nope").await,
            Err(ProgressError::JobDoesNotExist(_))
        ));
    }

    #[tokio::test]
    async fn zero_total_job_exists() {
        let store = MemoryStore::new();
        store.set_total("empty", 0).await.unwrap();

        let status = store.status("empty", Some(0)).await.unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.progress, 1.0);
        assert!(store.list_pending_parts("empty").await.unwrap().is_empty());
        assert!(store.complete_part("empty", 0).await.unwrap());

        let listed: Vec<JobListing> = store.list_jobs(false).try_collect().await.unwrap();
        assert_eq!(listed, vec![JobListing::Id("empty".into())]);
    }

    #[tokio::test]
    async fn set_total_overwrites() {
        let store = MemoryStore::new();
        store.set_total("job", 3).await.unwrap();
        store.complete_part("job", 0).await.unwrap();
        store.set_total("job", 5).await.unwrap();

        let status = store.status("job", None).await.unwrap();
        assert_eq!(status.total, 5);
        assert_eq!(status.remaining, 5);
    }

    #[tokio::test]
    async fn scan_lists_initialised_jobs() {
        let store = MemoryStore::new();
        store.set_total("a", 1).await.unwrap();
        store.set_total("b", 2).await.unwrap();
        store.fail_job("c", "never started").await.unwrap();

        let mut ids: Vec<String> = store
            .list_jobs(false)
            .map_ok(|listing| listing.jobid().to_string())
            .try_collect()
            .await
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
