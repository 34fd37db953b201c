use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use feed_notifier::config;
use feed_notifier::db::{self, SqliteStore};
use feed_notifier::dispatch::Dispatcher;
use feed_notifier::webhook::WebhookClient;
use tracing::info;

/// Send a connectivity test message to an owner's webhook.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    owner: i64,
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

    let dispatcher = Dispatcher::with_store(SqliteStore::new(pool), Arc::new(WebhookClient::new()?));
    dispatcher.send_test_notification(args.owner, &cfg.app.name).await?;
    info!(owner_id = args.owner, "test notification delivered");
    println!("test notification sent");
    Ok(())
}
