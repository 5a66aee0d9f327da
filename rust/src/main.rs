//! Operator CLI and bot entrypoint.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use keybearer::config::{load_config, RuntimeConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use keybearer::discord::DiscordRestGateway;
use keybearer::engine::TransferEngine;
use keybearer::integrity::sha256_file;
use keybearer::platform::GuildGateway;
use keybearer::scheduler::RotationScheduler;
use keybearer::store::{CustodyStore, JsonFileStore, Ledger};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn print_usage() {
    eprintln!(
        "Commands:\n  run [config]\n  show [config]\n  history [config] [limit]\n  check-config [config]\n\n\
         The config path defaults to ${CONFIG_PATH_ENV} or {DEFAULT_CONFIG_PATH}."
    );
}

fn config_path(arg: Option<&String>) -> PathBuf {
    arg.map(PathBuf::from)
        .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn init_tracing(config: &RuntimeConfig) {
    let fallback = config.debug_level.clone().unwrap_or_else(|| "keybearer=info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");

    match command {
        "run" => run(config_path(args.get(2))).await,
        "show" => {
            let config = load_config(config_path(args.get(2)))?;
            let record = JsonFileStore::new(&config.database_path).load().await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "current_key_holder": record.current_holder,
                "key": record.key,
                "last_transfer": record.last_transfer_at,
                "transfers": record.history.len(),
            }))?);
            Ok(())
        }
        "history" => {
            let config = load_config(config_path(args.get(2)))?;
            let limit = match args.get(3) {
                Some(raw) => raw.parse::<usize>().with_context(|| format!("invalid limit {raw:?}"))?,
                None => keybearer::commands::DEFAULT_HISTORY_LIMIT,
            };
            let record = JsonFileStore::new(&config.database_path).load().await?;
            let events: Vec<_> = record.recent_history(limit).collect();
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
        "check-config" => {
            let path = config_path(args.get(2));
            let config = load_config(&path)?;
            println!("{}", serde_json::to_string_pretty(&config.summary())?);
            println!("sha256: {}", sha256_file(&path)?);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("unknown command {other:?}")
        }
    }
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    init_tracing(&config);
    info!(config = %path.display(), sha256 = %sha256_file(&path)?, "configuration loaded");

    let gateway = Arc::new(DiscordRestGateway::new(config.api_base_url.clone(), &config.token)?);
    let me = gateway.current_user().await.context("connecting to Discord")?;
    info!(bot = %me.name, id = %me.id, "bot is logged in");

    let ledger = Arc::new(Ledger::new(JsonFileStore::new(&config.database_path)));
    let engine = Arc::new(TransferEngine::new(ledger, gateway, config.custody_settings()));
    let scheduler = Arc::new(RotationScheduler::new(engine, config.transfer_interval));
    let handle = Arc::clone(&scheduler).start();

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");
    scheduler.stop();
    handle.await.context("scheduler task panicked")?;
    Ok(())
}
