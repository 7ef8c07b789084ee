//! Progress accounting for scatter/gather jobs. A job is split into parts,
//! each part is announced on a topic with a "map" message, and the worker
//! that completes the last part triggers a single "reduce" message.
//! Job state lives in a durable store (DynamoDB or Redis), so any number
//! of workers can complete parts concurrently without client-side locks.

use std::fmt;
use std::fmt::Formatter;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod config;
pub mod coordinator;
pub mod error;
pub mod notify;
pub mod part;
pub mod store;
pub mod utils;

pub use config::{AwsConfig, ProgressConfig, StoreConfig};
pub use coordinator::{Coordinator, NewJob};
pub use error::{ProgressError, Result};
pub use notify::{broadcast, MemoryTopic, Notifier, SnsTopic};
pub use part::{Completion, FailJobOn, Finished, Part};
pub use store::{DynamoStore, JobListing, MemoryStore, ProgressStore, RedisStore};

/// Subject of the per-part messages sent at job creation.
pub const MAP_SUBJECT: &str = "map";

/// Subject of the single message sent once every part has completed.
pub const REDUCE_SUBJECT: &str = "reduce";

/// Reserved metadata key marking that the reduce message went out.
pub const REDUCE_SENT_KEY: &str = "reduce_message_sent";

/// Default size of the worker pool used to fan out map messages.
pub const DEFAULT_WORKERS: usize = 25;

/// Job-level attributes. Values are arbitrary JSON.
pub type Metadata = Map<String, Value>;

/////////////////////////////////////////////////////////////////////////////
// Job status
/////////////////////////////////////////////////////////////////////////////

/// Snapshot of a job as reported by a [`ProgressStore`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobStatus {
    /// The job id.
    pub jobid: String,

    /// Fraction of parts completed, in `[0, 1]`.
    pub progress: f64,

    /// Number of parts the job was created with.
    pub total: u64,

    /// Number of parts still pending.
    pub remaining: u64,

    /// Job metadata, including the reserved reduce marker once set.
    #[serde(default)]
    pub metadata: Metadata,

    /// Failure reason, if the job was marked failed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failed: Option<String>,

    /// Whether the reduce message was already sent.
    #[serde(default)]
    pub reduce_sent: bool,

    /// Whether the requested part is complete, when a part was asked for.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub part_complete: Option<bool>,
}

impl JobStatus {
    /// Build a status record from the raw stored fields.
    ///
    /// `progress` is derived from `total` and `remaining`, and
    /// `reduce_sent` from the reserved metadata key.
    pub fn new(
        jobid: &str,
        total: u64,
        remaining: u64,
        metadata: Metadata,
        failed: Option<String>,
    ) -> Self {
        let progress = if total == 0 {
            1.0
        } else {
            total.saturating_sub(remaining) as f64 / total as f64
        };
        let reduce_sent = reduce_marker_set(&metadata);

        Self {
            jobid: jobid.to_string(),
            progress,
            total,
            remaining,
            metadata,
            failed,
            reduce_sent,
            part_complete: None,
        }
    }

    /// Attach the completion state of a single part.
    pub fn with_part(mut self, part_complete: bool) -> Self {
        self.part_complete = Some(part_complete);
        self
    }

    /// True once no parts are pending.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// True once the job has been marked failed.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} parts remaining ({:.1}%)",
            self.jobid,
            self.remaining,
            self.total,
            self.progress * 100.0
        )?;
        if let Some(reason) = &self.failed {
            write!(f, " failed: {}", reason)?;
        }
        Ok(())
    }
}

/// The marker may come back as a JSON bool or, from string-typed
/// backends, as the text `"true"`.
pub fn reduce_marker_set(metadata: &Metadata) -> bool {
    match metadata.get(REDUCE_SENT_KEY) {
        Some(Value::Bool(sent)) => *sent,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/////////////////////////////////////////////////////////////////////////////
// Messages
/////////////////////////////////////////////////////////////////////////////

/// Body of the message sent when the last part of a job completes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReduceMessage {
    pub jobid: String,
    pub metadata: Metadata,
}

impl ReduceMessage {
    pub fn new(jobid: &str, metadata: Metadata) -> Self {
        Self {
            jobid: jobid.to_string(),
            metadata,
        }
    }

    /// The message as a JSON value, ready to publish.
    pub fn to_value(&self) -> Value {
        let mut body = Map::new();
        body.insert("jobid".to_string(), Value::String(self.jobid.clone()));
        body.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        Value::Object(body)
    }
}
