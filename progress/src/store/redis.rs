use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{ProgressError, Result};
use crate::store::{JobListing, ProgressStore};
use crate::{JobStatus, Metadata};

const JOB_SUFFIX: &str = "-job";
const PARTS_SUFFIX: &str = "-parts";
const METADATA_SUFFIX: &str = "-metadata";

const TOTAL_FIELD: &str = "total";
const ERROR_FIELD: &str = "error";

const SCAN_BATCH: usize = 100;

/// Job store backed by Redis.
///
/// Each job uses three keys:
/// - `{jobid}-job`: hash with `total` and, once failed, `error`
/// - `{jobid}-parts`: set of pending part ids
/// - `{jobid}-metadata`: hash of metadata fields, each value JSON encoded
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

fn job_key(jobid: &str) -> String {
    format!("{jobid}{JOB_SUFFIX}")
}

fn parts_key(jobid: &str) -> String {
    format!("{jobid}{PARTS_SUFFIX}")
}

fn metadata_key(jobid: &str) -> String {
    format!("{jobid}{METADATA_SUFFIX}")
}

/// Values written by other clients may not be JSON; keep those as strings.
fn decode_metadata(raw: HashMap<String, String>) -> Metadata {
    raw.into_iter()
        .map(|(key, value)| {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            (key, value)
        })
        .collect()
}

fn encode_metadata(metadata: &Metadata) -> Result<Vec<(String, String)>> {
    metadata
        .iter()
        .map(|(key, value)| Ok((key.clone(), serde_json::to_string(value)?)))
        .collect()
}

type Fields = HashMap<String, String>;

/// Reads the job hash, pending count, metadata and, when `part` is given,
/// that part's membership in one `MULTI`, so all fields share a snapshot.
fn status_pipeline(jobid: &str, part: Option<u64>) -> redis::Pipeline {
    let parts = parts_key(jobid);
    let mut pipe = redis::pipe();
    pipe.atomic()
        .hgetall(job_key(jobid))
        .scard(&parts)
        .hgetall(metadata_key(jobid));
    if let Some(partid) = part {
        pipe.sismember(&parts, partid);
    }
    pipe
}

/// SCAN may return a key more than once while the keyspace changes.
fn unique_keys<S>(keys: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = Result<String>>,
{
    let mut seen = HashSet::new();
    keys.try_filter(move |key| future::ready(seen.insert(key.clone())))
}

fn parse_total(jobid: &str, job: &HashMap<String, String>) -> Result<u64> {
    let total = job
        .get(TOTAL_FIELD)
        .ok_or_else(|| ProgressError::JobDoesNotExist(jobid.to_string()))?;
    total
        .parse()
        .map_err(|_| ProgressError::invalid_record(jobid, format!("bad total `{total}`")))
}

impl RedisStore {
    /// Connect to the server at `url`, e.g. `redis://localhost:6379/0`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("Connected to redis at {}", url);
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProgressStore for RedisStore {
    async fn set_total(&self, jobid: &str, total: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let parts = parts_key(jobid);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&parts)
            .ignore()
            .hset(job_key(jobid), TOTAL_FIELD, total)
            .ignore();
        if total > 0 {
            pipe.sadd(&parts, (0..total).collect::<Vec<u64>>()).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn complete_part(&self, jobid: &str, partid: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let parts = parts_key(jobid);

        // Remove and count in one MULTI so no other client sees the gap.
        let (_removed, remaining, exists): (u64, u64, bool) = redis::pipe()
            .atomic()
            .srem(&parts, partid)
            .scard(&parts)
            .hexists(job_key(jobid), TOTAL_FIELD)
            .query_async(&mut conn)
            .await?;

        if !exists {
            return Err(ProgressError::JobDoesNotExist(jobid.to_string()));
        }

        Ok(remaining == 0)
    }

    async fn fail_job(&self, jobid: &str, reason: &str) -> Result<()> {
        error!("[fail_job] {} failed because {}.", jobid, reason);
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(job_key(jobid), ERROR_FIELD, reason)
            .await?;
        Ok(())
    }

    async fn set_metadata(&self, jobid: &str, metadata: &Metadata) -> Result<()> {
        let fields = encode_metadata(metadata)?;
        if fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(metadata_key(jobid), &fields)
            .await?;
        Ok(())
    }

    async fn status(&self, jobid: &str, part: Option<u64>) -> Result<JobStatus> {
        let mut conn = self.conn.clone();
        let pipe = status_pipeline(jobid, part);

        let (job, remaining, metadata, part_complete) = match part {
            Some(_) => {
                let (job, remaining, metadata, pending): (Fields, u64, Fields, bool) =
                    pipe.query_async(&mut conn).await?;
                (job, remaining, metadata, Some(!pending))
            }
            None => {
                let (job, remaining, metadata): (Fields, u64, Fields) =
                    pipe.query_async(&mut conn).await?;
                (job, remaining, metadata, None)
            }
        };

        let total = parse_total(jobid, &job)?;
        let status = JobStatus::new(
            jobid,
            total,
            remaining,
            decode_metadata(metadata),
            job.get(ERROR_FIELD).cloned(),
        );

        Ok(match part_complete {
            Some(complete) => status.with_part(complete),
            None => status,
        })
    }

    async fn list_pending_parts(&self, jobid: &str) -> Result<Vec<u64>> {
        let mut conn = self.conn.clone();

        let (exists, mut parts): (bool, Vec<u64>) = redis::pipe()
            .atomic()
            .hexists(job_key(jobid), TOTAL_FIELD)
            .smembers(parts_key(jobid))
            .query_async(&mut conn)
            .await?;

        if !exists {
            return Err(ProgressError::JobDoesNotExist(jobid.to_string()));
        }

        parts.sort_unstable();
        Ok(parts)
    }

    fn list_jobs(&self, with_status: bool) -> BoxStream<'_, Result<JobListing>> {
        let conn = self.conn.clone();
        let pattern = format!("*{JOB_SUFFIX}");

        let pages = stream::try_unfold(Some(0u64), move |cursor| {
            let mut conn = conn.clone();
            let pattern = pattern.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok(None);
                };
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                let next = (next != 0).then_some(next);
                Ok::<_, ProgressError>(Some((keys, next)))
            }
        });

        let keys = pages
            .map_ok(|keys| stream::iter(keys.into_iter().map(Ok)))
            .try_flatten();

        unique_keys(keys)
            .and_then(move |key| async move {
                let jobid = key.strip_suffix(JOB_SUFFIX).unwrap_or(&key).to_string();
                if with_status {
                    self.status(&jobid, None).await.map(JobListing::Status)
                } else {
                    Ok(JobListing::Id(jobid))
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_layout() {
        assert_eq!(job_key("abc"), "abc-job");
        assert_eq!(parts_key("abc"), "abc-parts");
        assert_eq!(metadata_key("abc"), "abc-metadata");
    }

    #[test]
    fn metadata_survives_encoding() {
        let mut metadata = Metadata::new();
        metadata.insert("reduce_message_sent".into(), json!(true));
        metadata.insert("source".into(), json!("s3://bucket/a.tif"));
        metadata.insert("zoom".into(), json!(12));

        let raw: HashMap<String, String> = encode_metadata(&metadata).unwrap().into_iter().collect();
        assert_eq!(raw["reduce_message_sent"], "true");
        assert_eq!(decode_metadata(raw), metadata);
    }

    #[test]
    fn foreign_metadata_stays_text() {
        let raw = HashMap::from([("owner".to_string(), "ops team".to_string())]);
        assert_eq!(decode_metadata(raw)["owner"], json!("ops team"));
    }

    fn position(packed: &[u8], needle: &str) -> Option<usize> {
        packed
            .windows(needle.len())
            .position(|w| w == needle.as_bytes())
    }

    #[test]
    fn part_membership_read_in_same_transaction() {
        let packed = status_pipeline("abc", Some(3)).get_packed_pipeline();
        let multi = position(&packed, "MULTI").unwrap();
        let sismember = position(&packed, "SISMEMBER").unwrap();
        let exec = position(&packed, "EXEC").unwrap();
        assert!(multi < sismember && sismember < exec);

        let packed = status_pipeline("abc", None).get_packed_pipeline();
        assert!(position(&packed, "SISMEMBER").is_none());
    }

    #[tokio::test]
    async fn scan_keys_are_deduplicated() {
        let keys = stream::iter(
            ["a-job", "b-job", "a-job", "c-job", "b-job"].map(|k| Ok(k.to_string())),
        );
        let keys: Vec<String> = unique_keys(keys).try_collect().await.unwrap();
        assert_eq!(keys, vec!["a-job", "b-job", "c-job"]);
    }

    #[test]
    fn missing_total_means_no_job() {
        let job = HashMap::from([(ERROR_FIELD.to_string(), "boom".to_string())]);
        assert!(matches!(
            parse_total("abc", &job),
            Err(ProgressError::JobDoesNotExist(_))
        ));

        let job = HashMap::from([(TOTAL_FIELD.to_string(), "3".to_string())]);
        assert_eq!(parse_total("abc", &job).unwrap(), 3);
    }
}
