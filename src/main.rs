use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use feed_notifier::config;
use feed_notifier::db::{self, SqliteStore};
use feed_notifier::dispatch::Dispatcher;
use feed_notifier::model::ArticleEvent;
use feed_notifier::webhook::WebhookClient;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::{info, warn};

/// Read article events as JSON lines, notify about each and echo it back.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSONL file of article events (defaults to stdin)
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let webhook = WebhookClient::new()?;
    let dispatcher = Dispatcher::with_store(SqliteStore::new(pool), Arc::new(webhook));

    let processed = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            run(&dispatcher, file).await?
        }
        None => run(&dispatcher, tokio::io::stdin()).await?,
    };
    info!(processed, "input exhausted");
    Ok(())
}

async fn run<R>(dispatcher: &Dispatcher, input: R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut stdout = tokio::io::stdout();
    let mut processed = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let article: ArticleEvent = match serde_json::from_str(line) {
            Ok(article) => article,
            Err(err) => {
                warn!(%err, "skipping malformed article event");
                continue;
            }
        };

        let article = dispatcher.dispatch(article).await;
        let mut out = serde_json::to_vec(&article)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        processed += 1;
    }
    stdout.flush().await?;
    Ok(processed)
}
