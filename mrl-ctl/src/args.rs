use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use progress::{AwsConfig, StoreConfig};

const STORE_HELP: &str =
    "A dynamodb table ARN or a redis URI connection string e.g. `redis://localhost:6379`";

//
// For parsing user specified command.
//
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub aws: AwsArgs,
}

/// AWS connection settings, used by the DynamoDB store and SNS topic.
#[derive(ClapArgs, Debug)]
pub struct AwsArgs {
    /// AWS region.
    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Endpoint override, e.g. a local DynamoDB.
    #[arg(long, global = true, env = "AWS_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Access key / user ID.
    #[arg(long, global = true, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: Option<String>,

    /// Secret key / password.
    #[arg(long, global = true, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,

    #[arg(long, global = true, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,
}

impl From<AwsArgs> for AwsConfig {
    fn from(args: AwsArgs) -> Self {
        AwsConfig {
            region: args.region,
            endpoint_url: args.endpoint_url,
            access_key_id: args.access_key_id,
            secret_access_key: args.secret_access_key,
            session_token: args.session_token,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the status of a job as a single JSON object.
    Info {
        jobid: String,

        #[arg(short, long, env = "ProgressTable", help = STORE_HELP)]
        database: StoreConfig,
    },
    /// Scan the store and list every job.
    Ls {
        #[arg(short, long, env = "ProgressTable", help = STORE_HELP)]
        database: StoreConfig,

        /// Print only job ids instead of full status objects.
        #[arg(long)]
        jobid: bool,

        /// Show only jobs with pending parts.
        #[arg(long)]
        hide_completed: bool,
    },
    /// Print the pending part numbers of a job.
    Pending {
        jobid: String,

        #[arg(short, long, env = "ProgressTable", help = STORE_HELP)]
        database: StoreConfig,

        /// Output as a JSON array [Default: line-delimited]
        #[arg(long)]
        array: bool,
    },
    /// Create a job from a JSON array of part objects and send its map messages.
    Submit {
        /// JSON file holding an array of objects, one per part.
        parts: PathBuf,

        #[arg(short, long, env = "ProgressTable", help = STORE_HELP)]
        database: StoreConfig,

        /// Topic ARN for map and reduce messages.
        #[arg(short, long, env = "WorkTopic")]
        topic: String,

        /// Job id to use instead of a generated one.
        #[arg(long)]
        jobid: Option<String>,

        /// Number of workers sending map messages.
        #[arg(short, long, default_value_t = progress::DEFAULT_WORKERS)]
        workers: usize,

        /// Job metadata, as a JSON object.
        #[arg(short, long)]
        metadata: Option<String>,
    },
    /// Create a job of empty parts and complete them all concurrently.
    Bench {
        #[arg(short, long, env = "ProgressTable", help = STORE_HELP)]
        database: StoreConfig,

        /// Number of parts.
        #[arg(short, long, default_value_t = 100)]
        number: usize,

        /// Number of concurrent workers.
        #[arg(short, long, default_value_t = progress::DEFAULT_WORKERS)]
        workers: usize,

        /// Topic ARN. Messages stay in process when omitted.
        #[arg(short, long)]
        topic: Option<String>,
    },
}

/// Parse user command.
pub fn parse_args() -> Args {
    Args::parse()
}
