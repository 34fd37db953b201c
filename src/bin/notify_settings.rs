use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use feed_notifier::config;
use feed_notifier::db;
use feed_notifier::settings::{self, PARENT_CATEGORY_MODE, PARENT_CATEGORY_NAME};

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Owner whose settings to manage
    #[arg(long)]
    owner: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stored settings and the effective values
    Show,
    /// Validate and store one or more key=value pairs
    Set {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Delete all stored settings
    Reset,
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

    match args.command {
        Command::Show => {
            let stored = db::load_settings(&pool, args.owner).await?;
            for key in settings::keys() {
                let value = stored.get(key).map(String::as_str).unwrap_or("");
                println!("{key} = {value}");
            }
            match settings::resolve(&stored) {
                Some(nc) => {
                    println!();
                    println!("effective:");
                    println!("  webhook_url: {}", nc.webhook_url);
                    println!("  timezone: {}", nc.timezone.name());
                    println!("  parent_category_mode: {}", nc.parent_category_mode.as_str());
                    println!(
                        "  parent_category_name: {}",
                        nc.parent_category_name.as_deref().unwrap_or("")
                    );
                    println!("  max_announce_age: {} days", nc.max_announce_age_days);
                }
                None => println!("\nnotifications disabled: webhook_url not configured"),
            }
        }
        Command::Set { pairs } => {
            let mut input = HashMap::new();
            for pair in &pairs {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected key=value, got '{pair}'"))?;
                input.insert(key.trim().to_string(), value.to_string());
            }
            // A mode change is checked against the stored parent name.
            if input.contains_key(PARENT_CATEGORY_MODE) && !input.contains_key(PARENT_CATEGORY_NAME) {
                let stored = db::load_settings(&pool, args.owner).await?;
                if let Some(name) = stored.get(PARENT_CATEGORY_NAME) {
                    input.insert(PARENT_CATEGORY_NAME.to_string(), name.clone());
                }
            }
            let roots = db::root_categories(&pool).await?;
            let accepted = settings::validate_update(&input, &roots)?;
            db::save_settings(&pool, args.owner, &accepted).await?;
            for (key, value) in &accepted {
                println!("saved {key} = {value}");
            }
        }
        Command::Reset => {
            let removed = db::reset_settings(&pool, args.owner).await?;
            println!("removed {removed} setting(s)");
        }
    }
    Ok(())
}
