//! Publish-only notification channel used for map and reduce messages.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::{ProgressError, Result};
use crate::utils::{chunk_size, chunker};

mod memory;
mod sns;

pub use self::memory::{MemoryTopic, Published};
pub use self::sns::SnsTopic;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `message` to `target`, tagged with `subject`. No delivery or
    /// ordering guarantee beyond what the channel itself gives.
    async fn publish(&self, target: &str, subject: &str, message: &Value) -> Result<()>;
}

/// Publish every message through a pool of `concurrency` workers.
///
/// Messages are split into at most `concurrency` chunks which the workers
/// pull from a shared queue. Every message is attempted even if earlier
/// sends fail; the first failure is returned once the pool has drained.
/// On success, returns the number of messages sent.
pub async fn broadcast(
    notifier: Arc<dyn Notifier>,
    messages: Vec<Value>,
    subject: &str,
    target: &str,
    concurrency: usize,
) -> Result<usize> {
    let size = chunk_size(messages.len(), concurrency);
    let chunks: VecDeque<Vec<Value>> = chunker(messages, size).into();
    let workers = concurrency.max(1).min(chunks.len());
    let queue = Arc::new(Mutex::new(chunks));

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let queue = queue.clone();
        let notifier = notifier.clone();
        let subject = subject.to_string();
        let target = target.to_string();

        pool.spawn(async move {
            let mut sent = 0usize;
            let mut first_error = None;

            loop {
                let Some(chunk) = queue.lock().await.pop_front() else {
                    break;
                };
                debug!("worker {} sending {} `{}` messages", worker, chunk.len(), subject);

                for message in &chunk {
                    match notifier.publish(&target, &subject, message).await {
                        Ok(()) => sent += 1,
                        Err(e) => {
                            error!("failed to send `{}` message to {}: {}", subject, target, e);
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }

            (sent, first_error)
        });
    }

    let mut sent = 0;
    let mut failure: Option<ProgressError> = None;
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok((count, err)) => {
                sent += count;
                if failure.is_none() {
                    failure = err;
                }
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => error!("broadcast worker did not finish: {}", e),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(sent),
    }
}
