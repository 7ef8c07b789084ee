use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb as dynamodb;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Number, Value};
use tracing::error;

use crate::error::{ProgressError, Result};
use crate::store::{JobListing, ProgressStore};
use crate::{JobStatus, Metadata};

type Item = HashMap<String, AttributeValue>;

const ID_ATTR: &str = "id";
const TOTAL_ATTR: &str = "total";
const PARTS_ATTR: &str = "parts";
const METADATA_ATTR: &str = "metadata";
const ERROR_ATTR: &str = "error";

/// Job store backed by a DynamoDB table with a string hash key `id`.
///
/// A job is one item: `{id, total: N, parts: NS, metadata: M, error: S}`.
/// Pending parts are a number set, so completing a part is a single
/// `DELETE` update that returns the new item.
#[derive(Debug, Clone)]
pub struct DynamoStore {
    client: dynamodb::Client,
    table: String,
}

fn dynamo_error<E: std::error::Error>(err: E) -> ProgressError {
    ProgressError::DynamoDb(DisplayErrorContext(&err).to_string())
}

fn key(jobid: &str) -> AttributeValue {
    AttributeValue::S(jobid.to_string())
}

/////////////////////////////////////////////////////////////////////////////
// Attribute conversion
/////////////////////////////////////////////////////////////////////////////

pub(crate) fn json_to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(values) => AttributeValue::L(values.iter().map(json_to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                .collect(),
        ),
    }
}

fn number_to_json(n: &str) -> Value {
    if let Ok(i) = n.parse::<i64>() {
        return Value::Number(i.into());
    }
    n.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(n.to_string()))
}

pub(crate) fn attribute_to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::N(n) => number_to_json(n),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::L(values) => Value::Array(values.iter().map(attribute_to_json).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
        ),
        AttributeValue::Ns(values) => {
            Value::Array(values.iter().map(|n| number_to_json(n)).collect())
        }
        AttributeValue::Ss(values) => {
            Value::Array(values.iter().cloned().map(Value::String).collect())
        }
        // Binary attributes have no JSON form.
        _ => Value::Null,
    }
}

/// Pending part ids of an item. A drained number set is removed from the
/// item entirely, so a missing attribute means no parts remain.
fn pending_parts(jobid: &str, item: &Item) -> Result<Vec<u64>> {
    let Some(parts) = item.get(PARTS_ATTR) else {
        return Ok(vec![]);
    };
    let parts = parts
        .as_ns()
        .map_err(|_| ProgressError::invalid_record(jobid, "parts is not a number set"))?;

    let mut ids = parts
        .iter()
        .map(|p| {
            p.parse::<u64>()
                .map_err(|_| ProgressError::invalid_record(jobid, format!("bad part id `{p}`")))
        })
        .collect::<Result<Vec<_>>>()?;
    ids.sort_unstable();
    Ok(ids)
}

fn item_total(jobid: &str, item: &Item) -> Result<u64> {
    let total = item
        .get(TOTAL_ATTR)
        .ok_or_else(|| ProgressError::JobDoesNotExist(jobid.to_string()))?
        .as_n()
        .map_err(|_| ProgressError::invalid_record(jobid, "total is not a number"))?;
    total
        .parse()
        .map_err(|_| ProgressError::invalid_record(jobid, format!("bad total `{total}`")))
}

fn item_to_status(jobid: &str, item: &Item) -> Result<JobStatus> {
    let total = item_total(jobid, item)?;
    let remaining = item
        .get(PARTS_ATTR)
        .and_then(|parts| parts.as_ns().ok())
        .map_or(0, |parts| parts.len() as u64);

    let metadata = match item.get(METADATA_ATTR).map(attribute_to_json) {
        Some(Value::Object(metadata)) => metadata,
        _ => Metadata::new(),
    };

    // Reasons written by other clients may be numbers (e.g. a part id).
    let failed = item.get(ERROR_ATTR).map(|e| match attribute_to_json(e) {
        Value::String(reason) => reason,
        other => other.to_string(),
    });

    Ok(JobStatus::new(jobid, total, remaining, metadata, failed))
}

/////////////////////////////////////////////////////////////////////////////
// Store
/////////////////////////////////////////////////////////////////////////////

impl DynamoStore {
    pub fn new(client: dynamodb::Client, table: &str) -> Self {
        Self {
            client,
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn get_item(&self, jobid: &str) -> Result<Item> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(ID_ATTR, key(jobid))
            .consistent_read(true)
            .send()
            .await
            .map_err(dynamo_error)?;

        output
            .item
            .ok_or_else(|| ProgressError::JobDoesNotExist(jobid.to_string()))
    }
}

#[async_trait]
impl ProgressStore for DynamoStore {
    async fn set_total(&self, jobid: &str, total: u64) -> Result<()> {
        let request = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(ID_ATTR, key(jobid))
            .expression_attribute_names("#t", TOTAL_ATTR)
            .expression_attribute_names("#p", PARTS_ATTR)
            .expression_attribute_values(":t", AttributeValue::N(total.to_string()));

        // Number sets cannot be empty.
        let request = if total > 0 {
            request
                .update_expression("SET #p = :p, #t = :t")
                .expression_attribute_values(
                    ":p",
                    AttributeValue::Ns((0..total).map(|p| p.to_string()).collect()),
                )
        } else {
            request.update_expression("SET #t = :t REMOVE #p")
        };

        request.send().await.map_err(dynamo_error)?;
        Ok(())
    }

    async fn complete_part(&self, jobid: &str, partid: u64) -> Result<bool> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(ID_ATTR, key(jobid))
            .update_expression("DELETE #p :p")
            .condition_expression("attribute_exists(#t)")
            .expression_attribute_names("#p", PARTS_ATTR)
            .expression_attribute_names("#t", TOTAL_ATTR)
            .expression_attribute_values(":p", AttributeValue::Ns(vec![partid.to_string()]))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => {
                let remaining = output
                    .attributes()
                    .and_then(|item| item.get(PARTS_ATTR))
                    .and_then(|parts| parts.as_ns().ok())
                    .map_or(0, Vec::len);
                Ok(remaining == 0)
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Err(ProgressError::JobDoesNotExist(jobid.to_string()))
            }
            Err(err) => Err(dynamo_error(err)),
        }
    }

    async fn fail_job(&self, jobid: &str, reason: &str) -> Result<()> {
        error!("[fail_job] {} failed because {}.", jobid, reason);
        self.client
            .update_item()
            .table_name(&self.table)
            .key(ID_ATTR, key(jobid))
            .update_expression("SET #e = :e")
            .expression_attribute_names("#e", ERROR_ATTR)
            .expression_attribute_values(":e", AttributeValue::S(reason.to_string()))
            .send()
            .await
            .map_err(dynamo_error)?;
        Ok(())
    }

    async fn set_metadata(&self, jobid: &str, metadata: &Metadata) -> Result<()> {
        if metadata.is_empty() {
            return Ok(());
        }

        // A document path cannot be set under a map that does not exist
        // yet, and both cannot be written in one expression.
        self.client
            .update_item()
            .table_name(&self.table)
            .key(ID_ATTR, key(jobid))
            .update_expression("SET #m = if_not_exists(#m, :empty)")
            .expression_attribute_names("#m", METADATA_ATTR)
            .expression_attribute_values(":empty", AttributeValue::M(HashMap::new()))
            .send()
            .await
            .map_err(dynamo_error)?;

        let mut request = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(ID_ATTR, key(jobid))
            .expression_attribute_names("#m", METADATA_ATTR);
        let mut assignments = Vec::with_capacity(metadata.len());
        for (i, (name, value)) in metadata.iter().enumerate() {
            assignments.push(format!("#m.#k{i} = :v{i}"));
            request = request
                .expression_attribute_names(format!("#k{i}"), name)
                .expression_attribute_values(format!(":v{i}"), json_to_attribute(value));
        }

        request
            .update_expression(format!("SET {}", assignments.join(", ")))
            .send()
            .await
            .map_err(dynamo_error)?;
        Ok(())
    }

    async fn status(&self, jobid: &str, part: Option<u64>) -> Result<JobStatus> {
        let item = self.get_item(jobid).await?;
        let status = item_to_status(jobid, &item)?;

        match part {
            Some(partid) => {
                let pending = pending_parts(jobid, &item)?;
                Ok(status.with_part(!pending.contains(&partid)))
            }
            None => Ok(status),
        }
    }

    async fn list_pending_parts(&self, jobid: &str) -> Result<Vec<u64>> {
        let item = self.get_item(jobid).await?;
        item_total(jobid, &item)?;
        pending_parts(jobid, &item)
    }

    fn list_jobs(&self, with_status: bool) -> BoxStream<'_, Result<JobListing>> {
        let items = self
            .client
            .scan()
            .table_name(&self.table)
            .consistent_read(true)
            .into_paginator()
            .items()
            .send();

        stream::unfold(items, |mut items| async move {
            items.next().await.map(|item| (item, items))
        })
        .filter_map(move |item| async move {
            let item = match item {
                Ok(item) => item,
                Err(err) => return Some(Err(dynamo_error(err))),
            };
            let jobid = item.get(ID_ATTR)?.as_s().ok()?.clone();

            // Items with metadata but no total were never initialised.
            if !item.contains_key(TOTAL_ATTR) {
                return None;
            }

            Some(if with_status {
                item_to_status(&jobid, &item).map(JobListing::Status)
            } else {
                Ok(JobListing::Id(jobid))
            })
        })
        .boxed()
    }
}
