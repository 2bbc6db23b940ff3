//! CLI entry point for the objstore tool.

use std::io::{self, IsTerminal};

use anyhow::{Context, Result};
use clap::Parser;
use objstore_core::ObjectStoreClient;
use tracing::{debug, info};

mod app_config;
mod cli;
mod commands;
mod progress;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_config(args.config.as_deref())?;
    debug!(
        path = ?loaded.path,
        from_file = loaded.loaded_from_file,
        "configuration resolved"
    );

    let endpoint = args
        .endpoint
        .as_deref()
        .context("No endpoint given: pass --endpoint or set OBJSTORE_ENDPOINT")?;
    let client = ObjectStoreClient::connect(endpoint, loaded.config.clone())
        .with_context(|| format!("Failed to set up client for '{endpoint}'"))?;
    info!(endpoint, "objstore starting");

    match &args.command {
        Command::Put {
            file,
            key,
            storage_class,
        } => commands::run_put_command(&client, file, key, storage_class.as_deref()).await,
        Command::Get { key, output, range } => {
            let show_progress = !args.quiet && io::stderr().is_terminal();
            commands::run_get_command(&client, key, output, *range, show_progress).await
        }
        Command::Head { key, json } => commands::run_head_command(&client, key, *json).await,
        Command::Migrate {
            source_key,
            dest_key,
            source_endpoint,
            storage_class,
        } => {
            commands::run_migrate_command(
                &client,
                &loaded.config,
                source_endpoint,
                source_key,
                dest_key,
                storage_class.as_deref(),
            )
            .await
        }
        Command::Delete { key } => commands::run_delete_command(&client, key).await,
    }
}
