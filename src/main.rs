use anyhow::Result;
use clap::Parser;
use postrelay::config;
use postrelay::db;
use postrelay::scheduler::Scheduler;
use postrelay::store::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single scheduler pass, print the JSON report and exit
    #[arg(long)]
    once: bool,
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

    let store = Arc::new(SqliteStore::new(pool));
    let scheduler = Scheduler::from_config(&cfg, store)?;
    let budget = cfg.run_budget();

    if args.once {
        let response = scheduler.trigger(budget).await;
        println!("{}", response.to_json()?);
        if response.http_status() >= 500 {
            std::process::exit(1);
        }
        return Ok(());
    }

    info!(poll_interval_ms = cfg.app.poll_interval_ms, "starting scheduler loop");
    scheduler
        .run_until(cfg.poll_interval(), budget, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        })
        .await;

    Ok(())
}
