//! Scoped execution of a single part.
//!
//! [`Part::run`] wraps the caller's work for one part. When the work
//! succeeds the part is completed in the store, and if that emptied the
//! job's pending set the reduce message is sent. When the work fails the
//! job may be marked failed, and the caller's error is handed back as is.
//!
//! Sending the reduce message is check-then-act: the reserved
//! `reduce_message_sent` metadata key is read, the message is sent, then
//! the key is written. Only the caller whose removal emptied the pending
//! set gets here, so the key guards against re-running parts of a job
//! that already drained (duplicate deliveries), not against two
//! concurrent last completions. A backend whose `complete_part` is not
//! atomic could still send twice.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::ProgressConfig;
use crate::error::ProgressError;
use crate::notify::Notifier;
use crate::store::ProgressStore;
use crate::{reduce_marker_set, Metadata, ReduceMessage, REDUCE_SENT_KEY, REDUCE_SUBJECT};

/// Selects caller errors that should mark the whole job failed.
#[derive(Clone, Copy)]
pub struct FailJobOn {
    name: &'static str,
    matches: fn(&anyhow::Error) -> bool,
}

impl FailJobOn {
    /// Errors of type `E`, including ones wrapped with `anyhow` context.
    pub fn error<E>() -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            name: std::any::type_name::<E>(),
            matches: |err| err.is::<E>(),
        }
    }

    /// Every error.
    pub fn any() -> Self {
        Self {
            name: "any error",
            matches: |_| true,
        }
    }

    pub fn matches(&self, err: &anyhow::Error) -> bool {
        (self.matches)(err)
    }
}

impl fmt::Debug for FailJobOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FailJobOn").field(&self.name).finish()
    }
}

/// What completing a part did to its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Other parts are still pending.
    Pending,

    /// This part drained the job and the reduce message was sent.
    ReduceSent,

    /// The job was already drained and reduced; nothing was sent.
    ReduceAlreadySent,
}

/// Output of the caller's work, plus what happened to the job.
#[derive(Debug)]
pub struct Finished<T> {
    pub output: T,
    pub completion: Completion,
}

/// The guarded region around one part of a job.
pub struct Part {
    jobid: String,
    partid: u64,
    store: Arc<dyn ProgressStore>,
    notifier: Arc<dyn Notifier>,
    topic: String,
    fail_job_on: Vec<FailJobOn>,
    on_reduce: Option<Arc<dyn Notifier>>,
}

impl Part {
    pub fn new(
        jobid: impl Into<String>,
        partid: u64,
        store: Arc<dyn ProgressStore>,
        notifier: Arc<dyn Notifier>,
        config: &ProgressConfig,
    ) -> Self {
        Self {
            jobid: jobid.into(),
            partid,
            store,
            notifier,
            topic: config.topic.clone(),
            fail_job_on: vec![],
            on_reduce: None,
        }
    }

    /// Build a part from a map message, reading its `jobid` and `partid`.
    /// Other fields of the message are ignored.
    pub fn from_message(
        message: &Value,
        store: Arc<dyn ProgressStore>,
        notifier: Arc<dyn Notifier>,
        config: &ProgressConfig,
    ) -> Result<Self, ProgressError> {
        let jobid = message
            .get("jobid")
            .and_then(Value::as_str)
            .ok_or_else(|| ProgressError::InvalidMessage("missing `jobid`".into()))?;
        let partid = message
            .get("partid")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProgressError::InvalidMessage("missing `partid`".into()))?;

        Ok(Self::new(jobid, partid, store, notifier, config))
    }

    /// Mark the job failed when the work fails with an error matching
    /// `filter`. Adding any filter also makes the part refuse to start
    /// for a job that has already failed.
    pub fn fail_job_on(mut self, filter: FailJobOn) -> Self {
        self.fail_job_on.push(filter);
        self
    }

    /// Send the reduce message through `notifier` instead of the topic.
    pub fn on_reduce(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.on_reduce = Some(notifier);
        self
    }

    pub fn jobid(&self) -> &str {
        &self.jobid
    }

    pub fn partid(&self) -> u64 {
        self.partid
    }

    /// Run `work` for this part and do the bookkeeping for its outcome.
    ///
    /// Errors returned by `work` are passed back and stay downcastable to
    /// their own type. If marking the job failed also errors, that store
    /// error is attached as context. Errors from
    /// the scope itself are [`ProgressError`]s; a part started for a
    /// failed job gets [`ProgressError::JobFailed`] and `work` never runs.
    /// A panic in `work` unwinds through the scope and leaves the part
    /// pending.
    pub async fn run<F, Fut, T>(self, work: F) -> anyhow::Result<Finished<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Only pay for the status read when failures matter to the caller.
        if !self.fail_job_on.is_empty() {
            let status = self.store.status(&self.jobid, None).await?;
            if status.is_failed() {
                return Err(ProgressError::JobFailed(self.jobid.clone()).into());
            }
        }

        debug!("Running part {} of job {}", self.partid, self.jobid);

        match work().await {
            Ok(output) => {
                let completion = self.complete().await?;
                Ok(Finished { output, completion })
            }
            Err(err) => match self.record_failure(&err).await {
                Some(e) => Err(err.context(format!(
                    "could not mark job {} failed: {}",
                    self.jobid, e
                ))),
                None => Err(err),
            },
        }
    }

    /// Returns the store error if the job should have been marked failed
    /// but could not be.
    async fn record_failure(&self, err: &anyhow::Error) -> Option<ProgressError> {
        let Some(filter) = self.fail_job_on.iter().find(|f| f.matches(err)) else {
            debug!(
                "Part {} of job {} failed, job left running: {:#}",
                self.partid, self.jobid, err
            );
            return None;
        };

        debug!("Part {} of job {} failed with {:?}", self.partid, self.jobid, filter);
        let e = self
            .store
            .fail_job(&self.jobid, &self.partid.to_string())
            .await
            .err()?;
        error!("Could not mark job {} failed: {}", self.jobid, e);
        Some(e)
    }

    async fn complete(&self) -> Result<Completion, ProgressError> {
        let all_done = self.store.complete_part(&self.jobid, self.partid).await?;
        if !all_done {
            return Ok(Completion::Pending);
        }

        let status = self.store.status(&self.jobid, None).await?;
        if reduce_marker_set(&status.metadata) {
            warn!("skip reduce message, already sent for job {}", self.jobid);
            return Ok(Completion::ReduceAlreadySent);
        }

        let message = ReduceMessage::new(&self.jobid, status.metadata).to_value();
        let notifier = self.on_reduce.as_ref().unwrap_or(&self.notifier);
        notifier
            .publish(&self.topic, REDUCE_SUBJECT, &message)
            .await?;

        let mut marker = Metadata::new();
        marker.insert(REDUCE_SENT_KEY.to_string(), Value::Bool(true));
        self.store.set_metadata(&self.jobid, &marker).await?;

        info!("Sent reduce message for job {}", self.jobid);
        Ok(Completion::ReduceSent)
    }
}
