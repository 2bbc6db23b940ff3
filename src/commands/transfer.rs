//! Transfer command handlers: put, get and migrate.

use std::path::Path;

use anyhow::{Context, Result, bail};
use objstore_core::{ByteRange, ClientConfig, ObjectStoreClient};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::progress::transfer_bar;

pub async fn run_put_command(
    client: &ObjectStoreClient,
    file: &Path,
    key: &str,
    storage_class: Option<&str>,
) -> Result<()> {
    let outcome = client
        .put_file(key, file, storage_class)
        .await
        .with_context(|| format!("Upload of '{}' to '{key}' failed", file.display()))?;

    info!(
        key = %outcome.key,
        length = outcome.length,
        parts = outcome.parts,
        "upload complete"
    );
    println!(
        "{}  {} bytes  etag={}",
        outcome.key,
        outcome.length,
        outcome.etag.as_deref().unwrap_or("-")
    );
    Ok(())
}

pub async fn run_get_command(
    client: &ObjectStoreClient,
    key: &str,
    output: &Path,
    range: Option<ByteRange>,
    show_progress: bool,
) -> Result<()> {
    let Some(mut body) = client
        .get_object(key, range)
        .await
        .with_context(|| format!("GetObject failed for '{key}'"))?
    else {
        bail!("Object '{key}' not found");
    };
    debug!(chunked = body.is_chunked(), length = body.length(), "body opened");

    let file = File::create(output)
        .await
        .with_context(|| format!("Failed to create '{}'", output.display()))?;
    let mut writer = BufWriter::new(file);
    let bar = transfer_bar(show_progress, body.length(), key);
    let mut hasher = Sha256::new();
    let mut written = 0u64;

    while let Some(chunk) = body
        .next_chunk()
        .await
        .with_context(|| format!("Reading '{key}' failed"))?
    {
        hasher.update(&chunk);
        writer
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write '{}'", output.display()))?;
        written += chunk.len() as u64;
        bar.inc(chunk.len() as u64);
    }
    writer
        .flush()
        .await
        .with_context(|| format!("Failed to write '{}'", output.display()))?;
    bar.finish_and_clear();
    drop(body);
    client.wait_for_cleanup().await;

    info!(key, written, "download complete");
    println!("{:x}  {}", hasher.finalize(), output.display());
    Ok(())
}

pub async fn run_migrate_command(
    client: &ObjectStoreClient,
    config: &ClientConfig,
    source_endpoint: &str,
    source_key: &str,
    dest_key: &str,
    storage_class: Option<&str>,
) -> Result<()> {
    let source = ObjectStoreClient::connect(source_endpoint, config.clone())
        .with_context(|| format!("Invalid source endpoint '{source_endpoint}'"))?;

    let outcome = client
        .migrate_from(source.store(), source_key, dest_key, storage_class)
        .await
        .with_context(|| format!("Migration of '{source_key}' to '{dest_key}' failed"))?;

    info!(
        source = %outcome.source_key,
        destination = %outcome.destination_key,
        length = outcome.length,
        parts = outcome.parts,
        "migration verified"
    );
    println!(
        "{} -> {}  {} bytes  checksum={}",
        outcome.source_key,
        outcome.destination_key,
        outcome.length,
        outcome.checksum.as_deref().unwrap_or("-")
    );
    Ok(())
}
