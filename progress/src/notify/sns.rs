use async_trait::async_trait;
use aws_sdk_sns as sns;
use aws_sdk_sns::error::DisplayErrorContext;
use serde_json::Value;
use tracing::debug;

use crate::error::{ProgressError, Result};
use crate::notify::Notifier;

/// Publishes JSON messages to an SNS topic. The subject travels as the
/// SNS `Subject`, not inside the body.
#[derive(Debug, Clone)]
pub struct SnsTopic {
    client: sns::Client,
}

impl SnsTopic {
    pub fn new(client: sns::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for SnsTopic {
    async fn publish(&self, target: &str, subject: &str, message: &Value) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let output = self
            .client
            .publish()
            .target_arn(target)
            .subject(subject)
            .message(body)
            .send()
            .await
            .map_err(|e| ProgressError::Sns(DisplayErrorContext(&e).to_string()))?;

        debug!(
            "Published `{}` to {} ({})",
            subject,
            target,
            output.message_id().unwrap_or("no message id")
        );
        Ok(())
    }
}
