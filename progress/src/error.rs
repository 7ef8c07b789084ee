use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgressError {
    /// `set_total` has not been run for this job.
    #[error("job {0} does not exist")]
    JobDoesNotExist(String),

    /// A part was started for a job that is already marked failed.
    #[error("job {0} already failed")]
    JobFailed(String),

    /// The supplied store does not satisfy the progress store contract.
    #[error("progress type error: {0}")]
    ProgressTypeError(String),

    #[error("a job needs at least one part")]
    EmptyJob,

    /// The job was recorded but some of its map messages were not sent.
    #[error("job {jobid} created, but sending its map messages failed: {source}")]
    MapFanout {
        jobid: String,
        source: Box<ProgressError>,
    },

    #[error("invalid part message: {0}")]
    InvalidMessage(String),

    #[error("invalid record for job {jobid}: {reason}")]
    InvalidRecord { jobid: String, reason: String },

    #[error("DynamoDB error: {0}")]
    DynamoDb(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("SNS error: {0}")]
    Sns(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProgressError {
    pub(crate) fn invalid_record(jobid: &str, reason: impl Into<String>) -> Self {
        ProgressError::InvalidRecord {
            jobid: jobid.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProgressError>;
