//! Configuration for the progress store, the notification topic and the
//! AWS clients behind them.

use std::env;
use std::fmt;
use std::str::FromStr;

use aws_sdk_dynamodb as dynamodb;
use aws_sdk_sns as sns;
use url::Url;

use crate::error::{ProgressError, Result};
use crate::utils::table_name_from_arn;
use crate::DEFAULT_WORKERS;

const STORE_HELP: &str =
    "a dynamodb table ARN or a redis URI connection string e.g. `redis://localhost:6379`";

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_REDIS_PORT: u16 = 6379;

/////////////////////////////////////////////////////////////////////////////
// Store selection
/////////////////////////////////////////////////////////////////////////////

/// Which backend holds job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// A DynamoDB table, keyed by job id.
    DynamoDb { table: String },

    /// A Redis server. `url` is normalised to `redis://host:port/db`.
    Redis { url: String },

    /// Process-local store, lost on exit.
    Memory,
}

impl FromStr for StoreConfig {
    type Err = ProgressError;

    fn from_str(value: &str) -> Result<Self> {
        if value.starts_with("redis") {
            return parse_redis_uri(value);
        }

        if value.starts_with("arn:") {
            if !value.contains(":table/") {
                return Err(ProgressError::ProgressTypeError(format!(
                    "`{value}` is not a DynamoDB table ARN"
                )));
            }
            return Ok(StoreConfig::DynamoDb {
                table: table_name_from_arn(value).to_string(),
            });
        }

        if let Some(table) = value.strip_prefix("dynamodb://") {
            if table.is_empty() {
                return Err(ProgressError::Config("missing DynamoDB table name".into()));
            }
            return Ok(StoreConfig::DynamoDb {
                table: table.trim_end_matches('/').to_string(),
            });
        }

        if value == "memory" || value == "memory://" {
            return Ok(StoreConfig::Memory);
        }

        Err(ProgressError::ProgressTypeError(format!(
            "`{value}` needs to be {STORE_HELP}"
        )))
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreConfig::DynamoDb { table } => write!(f, "dynamodb://{table}"),
            StoreConfig::Redis { url } => write!(f, "{url}"),
            StoreConfig::Memory => write!(f, "memory://"),
        }
    }
}

/// Accepts both `redis://host:port/2` and `redis://host:port?db=2`.
fn parse_redis_uri(value: &str) -> Result<StoreConfig> {
    let url = Url::parse(value).map_err(|e| ProgressError::Config(format!("{value}: {e}")))?;

    if url.scheme() != "redis" {
        return Err(ProgressError::ProgressTypeError(format!(
            "`{value}` needs to be {STORE_HELP}"
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ProgressError::Config(format!("{value}: missing redis host")))?;
    let port = url.port().unwrap_or(DEFAULT_REDIS_PORT);

    let mut db = match url.path().trim_start_matches('/') {
        "" => 0,
        path => path
            .parse::<i64>()
            .map_err(|_| ProgressError::Config(format!("{value}: bad redis db `{path}`")))?,
    };
    for (key, val) in url.query_pairs() {
        if key == "db" {
            db = val
                .parse::<i64>()
                .map_err(|_| ProgressError::Config(format!("{value}: bad redis db `{val}`")))?;
        }
    }

    let auth = match (url.username(), url.password()) {
        ("", None) => String::new(),
        (user, Some(password)) => format!("{user}:{password}@"),
        (user, None) => format!("{user}@"),
    };

    Ok(StoreConfig::Redis {
        url: format!("redis://{auth}{host}:{port}/{db}"),
    })
}

/////////////////////////////////////////////////////////////////////////////
// AWS clients
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Default)]
pub struct AwsConfig {
    /// AWS region.
    pub region: Option<String>,

    /// Endpoint override, e.g. a local DynamoDB.
    pub endpoint_url: Option<String>,

    /// id
    pub access_key_id: Option<String>,

    /// password
    pub secret_access_key: Option<String>,

    pub session_token: Option<String>,
}

impl AwsConfig {
    /// Read the standard `AWS_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            region: env::var("AWS_REGION")
                .or_else(|_| env::var("AWS_DEFAULT_REGION"))
                .ok(),
            endpoint_url: env::var("AWS_ENDPOINT_URL").ok(),
            access_key_id: env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: env::var("AWS_SECRET_ACCESS_KEY").ok(),
            session_token: env::var("AWS_SESSION_TOKEN").ok(),
        }
    }

    fn region(&self) -> String {
        self.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    fn credentials(&self) -> Result<(String, String)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Ok((id.clone(), secret.clone())),
            _ => Err(ProgressError::Config(
                "AWS access key id and secret access key are required".into(),
            )),
        }
    }

    pub fn dynamodb_client(&self) -> Result<dynamodb::Client> {
        let (id, secret) = self.credentials()?;
        let cred = dynamodb::config::Credentials::new(
            id,
            secret,
            self.session_token.clone(),
            None,
            "mrl-progress",
        );
        let mut conf_builder = dynamodb::config::Builder::new()
            .credentials_provider(cred)
            .region(dynamodb::config::Region::new(self.region()))
            .behavior_version_latest();
        if let Some(url) = &self.endpoint_url {
            conf_builder = conf_builder.endpoint_url(url);
        }

        Ok(dynamodb::Client::from_conf(conf_builder.build()))
    }

    pub fn sns_client(&self) -> Result<sns::Client> {
        let (id, secret) = self.credentials()?;
        let cred = sns::config::Credentials::new(
            id,
            secret,
            self.session_token.clone(),
            None,
            "mrl-progress",
        );
        let mut conf_builder = sns::config::Builder::new()
            .credentials_provider(cred)
            .region(sns::config::Region::new(self.region()))
            .behavior_version_latest();
        if let Some(url) = &self.endpoint_url {
            conf_builder = conf_builder.endpoint_url(url);
        }

        Ok(sns::Client::from_conf(conf_builder.build()))
    }
}

/////////////////////////////////////////////////////////////////////////////
// Top-level configuration
/////////////////////////////////////////////////////////////////////////////

/// Everything a [`crate::Coordinator`] or [`crate::Part`] needs to know
/// about its environment. Built once and passed in explicitly.
#[derive(Clone, Debug)]
pub struct ProgressConfig {
    /// Size of the map message worker pool.
    pub workers: usize,

    /// Topic that map and reduce messages are published to.
    pub topic: String,

    /// Where job state is kept.
    pub store: StoreConfig,

    pub aws: AwsConfig,
}

impl ProgressConfig {
    pub fn new(topic: impl Into<String>, store: StoreConfig) -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            topic: topic.into(),
            store,
            aws: AwsConfig::default(),
        }
    }

    /// Reads `WorkTopic`, `ProgressTable`, the optional `ProgressWorkers`
    /// and the `AWS_*` variables.
    pub fn from_env() -> Result<Self> {
        let topic = env::var("WorkTopic")
            .map_err(|_| ProgressError::Config("WorkTopic is not set".into()))?;
        let store = env::var("ProgressTable")
            .map_err(|_| ProgressError::Config("ProgressTable is not set".into()))?
            .parse()?;
        let workers = match env::var("ProgressWorkers") {
            Ok(workers) => workers
                .parse()
                .map_err(|_| ProgressError::Config(format!("bad ProgressWorkers `{workers}`")))?,
            Err(_) => DEFAULT_WORKERS,
        };

        Ok(Self {
            workers,
            topic,
            store,
            aws: AwsConfig::from_env(),
        })
    }
}
