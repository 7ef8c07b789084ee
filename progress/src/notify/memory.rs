use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::notify::Notifier;

/// A message recorded by [`MemoryTopic`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub target: String,
    pub subject: String,
    pub body: Value,
}

/// Topic that keeps every published message in memory.
#[derive(Debug, Default)]
pub struct MemoryTopic {
    published: Mutex<Vec<Published>>,
}

impl MemoryTopic {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages, in the order they were published.
    pub async fn messages(&self) -> Vec<Published> {
        self.published.lock().await.clone()
    }

    /// Messages published with `subject`.
    pub async fn with_subject(&self, subject: &str) -> Vec<Published> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    pub async fn count(&self, subject: &str) -> usize {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.subject == subject)
            .count()
    }
}

#[async_trait]
impl Notifier for MemoryTopic {
    async fn publish(&self, target: &str, subject: &str, message: &Value) -> Result<()> {
        self.published.lock().await.push(Published {
            target: target.to_string(),
            subject: subject.to_string(),
            body: message.clone(),
        });
        Ok(())
    }
}
