use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::config::ProgressConfig;
use crate::error::{ProgressError, Result};
use crate::notify::{broadcast, Notifier};
use crate::store::ProgressStore;
use crate::{Metadata, MAP_SUBJECT};

/// A job to be created: one JSON object per part, plus optional settings.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    parts: Vec<Map<String, Value>>,
    jobid: Option<String>,
    workers: Option<usize>,
    metadata: Option<Metadata>,
}

impl NewJob {
    pub fn new(parts: Vec<Map<String, Value>>) -> Self {
        Self {
            parts,
            ..Default::default()
        }
    }

    /// Use this id instead of a generated one.
    pub fn jobid(mut self, jobid: impl Into<String>) -> Self {
        self.jobid = Some(jobid.into());
        self
    }

    /// Override the configured worker pool size for this job.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Build the map message for each part: the caller's payload plus
/// `partid`, `jobid` and, when present, the job metadata.
pub fn annotate_parts(
    parts: Vec<Map<String, Value>>,
    jobid: &str,
    metadata: Option<&Metadata>,
) -> Vec<Value> {
    parts
        .into_iter()
        .enumerate()
        .map(|(partid, mut part)| {
            part.insert("partid".to_string(), Value::from(partid as u64));
            part.insert("jobid".to_string(), Value::String(jobid.to_string()));
            if let Some(metadata) = metadata {
                part.insert("metadata".to_string(), Value::Object(metadata.clone()));
            }
            Value::Object(part)
        })
        .collect()
}

/// Creates jobs: records them in the store and fans out map messages.
pub struct Coordinator {
    store: Arc<dyn ProgressStore>,
    notifier: Arc<dyn Notifier>,
    topic: String,
    workers: usize,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        notifier: Arc<dyn Notifier>,
        config: &ProgressConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            topic: config.topic.clone(),
            workers: config.workers,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Create a job and send one map message per part.
    ///
    /// The part count is durable before any message goes out, so a worker
    /// can never complete a part the store does not know about. Returns
    /// the job id once every map message has been attempted. If any send
    /// failed the job still exists, and [`ProgressError::MapFanout`]
    /// carries its id.
    pub async fn create_job(&self, job: NewJob) -> Result<String> {
        if job.is_empty() {
            return Err(ProgressError::EmptyJob);
        }

        let jobid = job.jobid.unwrap_or_else(|| Uuid::new_v4().to_string());
        let workers = job.workers.unwrap_or(self.workers);
        let total = job.parts.len();

        self.store.set_total(&jobid, total as u64).await?;

        let metadata = job.metadata.filter(|m| !m.is_empty());
        if let Some(metadata) = &metadata {
            self.store.set_metadata(&jobid, metadata).await?;
        }

        info!("Created job {} with {} parts", jobid, total);

        let messages = annotate_parts(job.parts, &jobid, metadata.as_ref());
        let sent = broadcast(
            self.notifier.clone(),
            messages,
            MAP_SUBJECT,
            &self.topic,
            workers,
        )
        .await
        .map_err(|e| ProgressError::MapFanout {
            jobid: jobid.clone(),
            source: Box::new(e),
        })?;

        info!("Sent {} map messages for job {}", sent, jobid);
        Ok(jobid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parts_carry_ids_and_metadata() {
        let parts = vec![
            json!({"source": "a.tif"}).as_object().unwrap().clone(),
            json!({"source": "b.tif"}).as_object().unwrap().clone(),
        ];
        let mut metadata = Metadata::new();
        metadata.insert("zoom".into(), json!(12));

        let messages = annotate_parts(parts.clone(), "abc", Some(&metadata));
        assert_eq!(
            messages[1],
            json!({"source": "b.tif", "partid": 1, "jobid": "abc", "metadata": {"zoom": 12}})
        );

        let messages = annotate_parts(parts, "abc", None);
        assert_eq!(messages[0], json!({"source": "a.tif", "partid": 0, "jobid": "abc"}));
    }
}
