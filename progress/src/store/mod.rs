//! Durable job state. Every backend implements [`ProgressStore`]; the
//! coordinator and part scopes hold no state of their own, so correctness
//! rests on `complete_part` being a single atomic backend operation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::config::{AwsConfig, StoreConfig};
use crate::error::Result;
use crate::{JobStatus, Metadata};

mod dynamodb;
mod memory;
mod redis;

pub use self::dynamodb::DynamoStore;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// One entry of a job scan.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum JobListing {
    Id(String),
    Status(JobStatus),
}

impl JobListing {
    pub fn jobid(&self) -> &str {
        match self {
            JobListing::Id(jobid) => jobid,
            JobListing::Status(status) => &status.jobid,
        }
    }

    /// Remaining parts, if the listing carries a status.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            JobListing::Id(_) => None,
            JobListing::Status(status) => Some(status.remaining),
        }
    }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Record `total` and mark parts `0..total` pending. Calling it again
    /// for the same job overwrites both.
    async fn set_total(&self, jobid: &str, total: u64) -> Result<()>;

    /// Remove `partid` from the pending set and report whether the set is
    /// now empty. Removing an absent part is a no-op that still reports
    /// the current state.
    async fn complete_part(&self, jobid: &str, partid: u64) -> Result<bool>;

    /// Mark the job failed. Pending parts are left untouched.
    async fn fail_job(&self, jobid: &str, reason: &str) -> Result<()>;

    /// Merge `metadata` into the job's metadata. Keys are never removed.
    async fn set_metadata(&self, jobid: &str, metadata: &Metadata) -> Result<()>;

    /// Current state of the job, plus the state of `part` if given.
    /// A job exists once `set_total` has recorded its total, even zero.
    async fn status(&self, jobid: &str, part: Option<u64>) -> Result<JobStatus>;

    /// Part ids still pending, in ascending order.
    async fn list_pending_parts(&self, jobid: &str) -> Result<Vec<u64>>;

    /// Scan every job in the store, lazily. Order is unspecified.
    fn list_jobs(&self, with_status: bool) -> BoxStream<'_, Result<JobListing>>;
}

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig, aws: &AwsConfig) -> Result<Arc<dyn ProgressStore>> {
    let store: Arc<dyn ProgressStore> = match config {
        StoreConfig::DynamoDb { table } => Arc::new(DynamoStore::new(aws.dynamodb_client()?, table)),
        StoreConfig::Redis { url } => Arc::new(RedisStore::connect(url).await?),
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
    };

    Ok(store)
}
