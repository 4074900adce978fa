use anyhow::Result;
use clap::Parser;
use postrelay::config;
use postrelay::db;
use postrelay::dispatch::PublishDispatcher;
use postrelay::report::TriggerResponse;
use postrelay::scheduler::Scheduler;
use postrelay::store::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Dispatch one post immediately and print the JSON result",
    long_about = "Dispatch one post immediately and print the JSON result.\n\n\
        Exit status is 0 when dispatch ran, even if some platforms failed \
        (the JSON then carries success: false). Requests rejected before any \
        platform is contacted exit 1 with an HTTP-style status: 400 for an \
        unknown platform name, 404 for a missing post, 422 when the post has \
        no platforms to publish to, 500 for a store failure."
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Id of the post to dispatch
    #[arg(long)]
    post_id: i64,

    /// Restrict dispatch to these platforms (repeatable). Defaults to every
    /// platform with content on the post.
    #[arg(long = "platform")]
    platforms: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let scheduler = Scheduler::from_config(&cfg, Arc::new(SqliteStore::new(pool)))?;

    let response = match PublishDispatcher::parse_platforms(&args.platforms) {
        Ok(platforms) => {
            info!(post_id = args.post_id, ?platforms, "manual dispatch");
            match scheduler.dispatch_post(args.post_id, Some(&platforms)).await {
                Ok(outcome) => TriggerResponse::from_post(outcome),
                Err(err) => {
                    error!(post_id = args.post_id, error = %err, "manual dispatch rejected");
                    TriggerResponse::from_dispatch_error(&err)
                }
            }
        }
        Err(err) => TriggerResponse::from_dispatch_error(&err),
    };

    println!("{}", response.to_json()?);
    if response.http_status() != 200 {
        std::process::exit(1);
    }
    Ok(())
}
