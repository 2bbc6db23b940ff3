//! Metadata command handlers: head and delete.

use anyhow::{Context, Result};
use objstore_core::ObjectStoreClient;
use tracing::info;

pub async fn run_head_command(client: &ObjectStoreClient, key: &str, json: bool) -> Result<()> {
    let metadata = client
        .head_object(key)
        .await
        .with_context(|| format!("HeadObject failed for '{key}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    println!("key = {}", metadata.key);
    println!("length = {}", metadata.length);
    println!("etag = {}", metadata.etag.as_deref().unwrap_or("-"));
    println!("checksum = {}", metadata.checksum.as_deref().unwrap_or("-"));
    println!(
        "storage_class = {}",
        metadata.storage_class.as_deref().unwrap_or("-")
    );
    Ok(())
}

pub async fn run_delete_command(client: &ObjectStoreClient, key: &str) -> Result<()> {
    client
        .delete_object(key)
        .await
        .with_context(|| format!("DeleteObject failed for '{key}'"))?;
    info!(key, "deleted");
    Ok(())
}
