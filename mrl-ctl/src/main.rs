mod args;
use args::{parse_args, Commands};

mod core;

use progress::AwsConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    let aws = AwsConfig::from(args.aws);

    match args.command {
        Commands::Info { jobid, database } => core::info(&jobid, &database, &aws).await?,
        Commands::Ls {
            database,
            jobid,
            hide_completed,
        } => core::ls(&database, &aws, !jobid, hide_completed).await?,
        Commands::Pending {
            jobid,
            database,
            array,
        } => core::pending(&jobid, &database, &aws, array).await?,
        Commands::Submit {
            parts,
            database,
            topic,
            jobid,
            workers,
            metadata,
        } => {
            let request = core::Submit {
                parts: &parts,
                database,
                topic,
                jobid,
                workers,
                metadata: metadata.as_deref(),
            };
            core::submit(request, aws).await?
        }
        Commands::Bench {
            database,
            number,
            workers,
            topic,
        } => core::bench(database, aws, number, workers, topic).await?,
    }

    Ok(())
}
