use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use progress::store::{self, ProgressStore};
use progress::{
    AwsConfig, Completion, Coordinator, MemoryTopic, Metadata, NewJob, Notifier, Part,
    ProgressConfig, ProgressError, SnsTopic, StoreConfig,
};

const LOCAL_TOPIC: &str = "local";

async fn open(database: &StoreConfig, aws: &AwsConfig) -> Result<Arc<dyn ProgressStore>> {
    store::connect(database, aws)
        .await
        .with_context(|| format!("could not open store {}", database))
}

// Tasks
pub async fn info(jobid: &str, database: &StoreConfig, aws: &AwsConfig) -> Result<()> {
    let store = open(database, aws).await?;
    let status = store.status(jobid, None).await?;
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

pub async fn ls(
    database: &StoreConfig,
    aws: &AwsConfig,
    with_status: bool,
    hide_completed: bool,
) -> Result<()> {
    let store = open(database, aws).await?;

    // Completion can only be judged from a status record.
    let mut jobs = store.list_jobs(with_status || hide_completed);
    while let Some(job) = jobs.next().await {
        let job = job?;
        if hide_completed && job.remaining() == Some(0) {
            continue;
        }
        if with_status {
            println!("{}", serde_json::to_string(&job)?);
        } else {
            println!("{}", job.jobid());
        }
    }

    Ok(())
}

pub async fn pending(jobid: &str, database: &StoreConfig, aws: &AwsConfig, array: bool) -> Result<()> {
    let store = open(database, aws).await?;
    let parts = store.list_pending_parts(jobid).await?;

    if array {
        println!("{}", serde_json::to_string(&parts)?);
    } else {
        for part in parts {
            println!("{}", part);
        }
    }

    Ok(())
}

fn read_parts(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parts: Vec<Value> =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;

    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| match part {
            Value::Object(part) => Ok(part),
            other => Err(anyhow!("part {} is not a JSON object: {}", i, other)),
        })
        .collect()
}

fn parse_metadata(metadata: Option<&str>) -> Result<Option<Metadata>> {
    let Some(metadata) = metadata else {
        return Ok(None);
    };
    match serde_json::from_str(metadata).context("parsing metadata")? {
        Value::Object(metadata) => Ok(Some(metadata)),
        _ => Err(anyhow!("metadata must be a JSON object")),
    }
}

pub struct Submit<'a> {
    pub parts: &'a Path,
    pub database: StoreConfig,
    pub topic: String,
    pub jobid: Option<String>,
    pub workers: usize,
    pub metadata: Option<&'a str>,
}

pub async fn submit(request: Submit<'_>, aws: AwsConfig) -> Result<()> {
    let parts = read_parts(request.parts)?;
    let metadata = parse_metadata(request.metadata)?;

    let store = open(&request.database, &aws).await?;
    let topic: Arc<dyn Notifier> = Arc::new(SnsTopic::new(aws.sns_client()?));

    let mut config = ProgressConfig::new(request.topic, request.database);
    config.workers = request.workers;
    config.aws = aws;

    let mut job = NewJob::new(parts);
    if let Some(jobid) = request.jobid {
        job = job.jobid(jobid);
    }
    if let Some(metadata) = metadata {
        job = job.metadata(metadata);
    }

    match Coordinator::new(store, topic, &config).create_job(job).await {
        Ok(jobid) => {
            println!("{}", jobid);
            Ok(())
        }
        // Print the id anyway, the parts that did go out can still be run.
        Err(ProgressError::MapFanout { jobid, source }) => {
            println!("{}", jobid);
            Err(anyhow::Error::new(*source)
                .context(format!("job {} created with unsent map messages", jobid)))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn bench(
    database: StoreConfig,
    aws: AwsConfig,
    number: usize,
    workers: usize,
    topic: Option<String>,
) -> Result<()> {
    let store = open(&database, &aws).await?;
    let local = Arc::new(MemoryTopic::new());
    let notifier: Arc<dyn Notifier> = match &topic {
        Some(_) => Arc::new(SnsTopic::new(aws.sns_client()?)),
        None => local.clone(),
    };

    let local_only = topic.is_none();
    let mut config = ProgressConfig::new(topic.unwrap_or_else(|| LOCAL_TOPIC.to_string()), database);
    config.workers = workers;

    let started = Instant::now();
    let parts = vec![Map::new(); number];
    let jobid = Coordinator::new(store.clone(), notifier.clone(), &config)
        .create_job(NewJob::new(parts))
        .await?;
    info!("Created job {} in {:?}", jobid, started.elapsed());

    // Simulates the map messages being processed concurrently.
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    for partid in 0..number as u64 {
        let permit = permits.clone().acquire_owned().await?;
        let part = Part::new(jobid.clone(), partid, store.clone(), notifier.clone(), &config);
        tasks.spawn(async move {
            let finished = part.run(|| async { Ok(()) }).await;
            drop(permit);
            finished.map(|f| f.completion)
        });
    }

    let mut reduces = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined?? == Completion::ReduceSent {
            reduces += 1;
        }
    }

    let status = store.status(&jobid, None).await?;
    println!(
        "completed {} parts of job {} using {} in {:?}: {} reduce message(s), {} remaining",
        number,
        jobid,
        config.store,
        started.elapsed(),
        reduces,
        status.remaining
    );
    if local_only {
        info!("{} messages kept in process", local.messages().await.len());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_must_be_an_object() {
        assert!(parse_metadata(None).unwrap().is_none());
        assert_eq!(
            parse_metadata(Some(r#"{"zoom": 12}"#)).unwrap().unwrap()["zoom"],
            12
        );
        assert!(parse_metadata(Some("[1, 2]")).is_err());
        assert!(parse_metadata(Some("not json")).is_err());
    }

    #[tokio::test]
    async fn bench_in_memory() {
        bench(StoreConfig::Memory, AwsConfig::default(), 50, 8, None)
            .await
            .unwrap();
    }
}
