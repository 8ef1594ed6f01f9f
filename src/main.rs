//! destroyer: Matrix bot that redacts room messages after a per-room delay.
//!
//! Startup: load config → open SQLite → build the Matrix client → start the
//! sync listener. Rooms with deletion turned on are resumed after the first
//! successful sync. Ctrl-C stops the listener and drains every room task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches, Parser};
use tokio_util::sync::CancellationToken;

use destroyer::bot::Listener;
use destroyer::config::Config;
use destroyer::registry::Destroyer;
use destroyer::store::RoomStore;
use destroyer::transport::matrix::MatrixClient;

#[derive(Parser)]
#[command(name = "destroyer", version, about = "Redacts Matrix room messages once they expire")]
struct Cli {
    /// Path to YAML config file (default: <data_dir>/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the database and config
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Homeserver base URL
    #[arg(long)]
    homeserver_url: Option<String>,

    /// Bot account, e.g. @destroyer:example.org
    #[arg(long)]
    user_id: Option<String>,

    /// Read the access token from the terminal instead of the config file
    #[arg(long)]
    prompt_token: bool,

    /// Command prefix
    #[arg(long)]
    command_prefix: Option<String>,

    /// Minimum power level allowed to run commands
    #[arg(long)]
    admin_power_level: Option<i64>,

    /// Seconds between history scans in idle rooms
    #[arg(long)]
    idle_poll_secs: Option<u64>,

    /// Generate a default config.yaml in data-dir and exit
    #[arg(long)]
    init_config: bool,
}

/// Build the final Config by merging: defaults -> YAML file -> CLI overrides.
fn build_config(cli: &Cli, matches: &clap::ArgMatches) -> anyhow::Result<Config> {
    use clap::parser::ValueSource;

    let data_dir = cli.data_dir.clone();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Config::config_file_path(&data_dir));

    let mut config = match Config::load_from_file(&config_path)? {
        Some(file_config) => {
            tracing::info!(path = %config_path.display(), "loaded config file");
            file_config
        }
        None => {
            tracing::debug!(path = %config_path.display(), "no config file found, using defaults");
            Config::default()
        }
    };

    // Only values the user explicitly passed override the file.
    if matches.value_source("data_dir") == Some(ValueSource::CommandLine) {
        config.data_dir = data_dir;
    }
    if let Some(url) = &cli.homeserver_url {
        config.homeserver_url = url.clone();
    }
    if let Some(user_id) = &cli.user_id {
        config.user_id = user_id.clone();
    }
    if let Some(prefix) = &cli.command_prefix {
        config.command_prefix = prefix.clone();
    }
    if let Some(level) = cli.admin_power_level {
        config.admin_power_level = level;
    }
    if let Some(secs) = cli.idle_poll_secs {
        config.idle_poll_secs = secs;
    }
    if cli.prompt_token {
        config.access_token = rpassword::prompt_password("Access token: ")
            .context("failed to read access token")?;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "destroyer=info".into()),
        )
        .init();

    let mut matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches_mut(&mut matches)?;

    if cli.init_config {
        std::fs::create_dir_all(&cli.data_dir)?;
        let config_path = Config::config_file_path(&cli.data_dir);
        Config::write_default_config(&config_path)?;
        println!("Config written to {}", config_path.display());
        return Ok(());
    }

    let config = build_config(&cli, &matches)?;
    std::fs::create_dir_all(&config.data_dir)?;

    tracing::info!(
        user_id = %config.user_id,
        homeserver = %config.homeserver_url,
        "destroyer starting"
    );

    let store = RoomStore::open(&config.db_path())
        .with_context(|| format!("failed to open database {}", config.db_path().display()))?;

    let client = Arc::new(MatrixClient::new(
        &config.homeserver_url,
        config.user_id.clone(),
        config.access_token.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )?);

    let destroyer = Arc::new(Destroyer::new(
        store,
        client.clone(),
        config.scheduler_settings(),
    ));

    let shutdown = CancellationToken::new();
    let listener = Listener::new(client, destroyer.clone(), config.listener_settings());
    let listener_task = tokio::spawn(listener.run(shutdown.clone()));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");

    shutdown.cancel();
    if let Err(e) = listener_task.await {
        tracing::warn!(error = %e, "listener ended abnormally");
    }
    destroyer.shutdown().await;

    Ok(())
}
