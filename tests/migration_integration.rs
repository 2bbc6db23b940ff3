//! Integration tests for cross-store migration.

use std::sync::Arc;

use objstore_core::storage::StoreClient;
use objstore_core::{ObjectStoreClient, TransferError};
use tempfile::TempDir;

mod support;
use support::memory_backend::{Fault, MemoryBackend, Target, checksum, pattern, test_config};

struct Stores {
    source: Arc<MemoryBackend>,
    source_store: StoreClient,
    destination: Arc<MemoryBackend>,
    client: ObjectStoreClient,
    _scratch: TempDir,
}

fn stores() -> Stores {
    let source = Arc::new(MemoryBackend::new());
    let destination = Arc::new(MemoryBackend::new());
    let scratch = TempDir::new().unwrap();
    let client =
        ObjectStoreClient::new(Arc::clone(&destination) as _, test_config(scratch.path())).unwrap();
    Stores {
        source_store: StoreClient::new(Arc::clone(&source) as _),
        source,
        destination,
        client,
        _scratch: scratch,
    }
}

#[tokio::test]
async fn test_migration_copies_and_verifies() {
    let st = stores();
    let content = pattern(5000);
    st.source.insert("src", content.clone());

    let outcome = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await
        .unwrap();

    assert_eq!(outcome.length, 5000);
    assert_eq!(outcome.parts, 5);
    assert_eq!(outcome.checksum, Some(checksum(&content)));
    assert_eq!(st.destination.object("dst").unwrap(), content);
    assert_eq!(st.destination.completed(), vec![vec![1, 2, 3, 4, 5]]);
    assert_eq!(st.source.count("GetObject"), 5);
}

#[tokio::test]
async fn test_zero_length_migration_is_single_put() {
    let st = stores();
    st.source.insert("src", bytes::Bytes::new());

    let outcome = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await
        .unwrap();

    assert_eq!(outcome.parts, 0);
    assert_eq!(st.destination.count("PutObject"), 1);
    assert_eq!(st.destination.count("InitiateMultipartUpload"), 0);
    assert!(st.destination.object("dst").unwrap().is_empty());
}

#[tokio::test]
async fn test_length_mismatch_deletes_destination() {
    let st = stores();
    st.source.insert("src", pattern(3000));
    st.destination.misreport_length("dst", 1);

    let result = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await;

    match result {
        Err(TransferError::Integrity { field, .. }) => assert_eq!(field, "length"),
        other => panic!("expected integrity error, got {other:?}"),
    }
    assert!(st.destination.object("dst").is_none());
    assert_eq!(st.destination.count("DeleteObject"), 1);
}

#[tokio::test]
async fn test_checksum_mismatch_deletes_destination() {
    let st = stores();
    st.source.insert("src", pattern(3000));
    st.destination.omit_checksum();

    let result = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await;

    match result {
        Err(TransferError::Integrity { field, actual, .. }) => {
            assert_eq!(field, "checksum");
            assert_eq!(actual, "<missing>");
        }
        other => panic!("expected integrity error, got {other:?}"),
    }
    assert!(st.destination.object("dst").is_none());
}

#[tokio::test]
async fn test_unverifiable_destination_is_deleted() {
    let st = stores();
    st.source.insert("src", pattern(3000));
    st.destination
        .fail(Target::Operation("HeadObject"), Fault::Status(500), 10);

    let result = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await;

    assert!(matches!(result, Err(TransferError::Backend { status: 500, .. })));
    assert_eq!(st.destination.count("HeadObject"), 3);
    assert_eq!(st.destination.count("DeleteObject"), 1);
    assert!(st.destination.object("dst").is_none());
}

#[tokio::test]
async fn test_failed_cleanup_delete_is_retried() {
    let st = stores();
    st.source.insert("src", pattern(3000));
    st.destination.misreport_length("dst", 1);
    st.destination
        .fail(Target::Operation("DeleteObject"), Fault::Status(503), 1);

    let result = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await;

    assert!(matches!(result, Err(TransferError::Integrity { .. })));
    assert_eq!(st.destination.count("DeleteObject"), 2);
    assert!(st.destination.object("dst").is_none());
}

#[tokio::test]
async fn test_source_without_checksum_checks_length_only() {
    let st = stores();
    st.source.insert("src", pattern(3000));
    st.source.omit_checksum();

    let outcome = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await
        .unwrap();

    assert!(outcome.checksum.is_none());
    assert_eq!(st.destination.object("dst").unwrap(), pattern(3000));
}

#[tokio::test]
async fn test_part_failure_aborts_destination_upload() {
    let st = stores();
    st.source.insert("src", pattern(5000));
    st.destination
        .fail(Target::Part(2), Fault::Status(403), 1);

    let result = st
        .client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await;

    assert!(matches!(result, Err(TransferError::Backend { status: 403, .. })));
    assert_eq!(st.destination.aborted().len(), 1);
    assert_eq!(st.destination.pending_uploads(), 0);
    assert!(st.destination.object("dst").is_none());
}

#[tokio::test]
async fn test_source_read_failure_is_retried_per_part() {
    let st = stores();
    let content = pattern(5000);
    st.source.insert("src", content.clone());
    st.source.fail(Target::RangeStart(2048), Fault::Transport, 1);

    st.client
        .migrate_from(&st.source_store, "src", "dst", None)
        .await
        .unwrap();

    assert_eq!(st.source.count("GetObject"), 6);
    assert_eq!(st.destination.object("dst").unwrap(), content);
}

#[tokio::test]
async fn test_missing_source_touches_nothing() {
    let st = stores();

    let result = st
        .client
        .migrate_from(&st.source_store, "absent", "dst", None)
        .await;

    assert!(result.unwrap_err().is_not_found());
    assert!(st.destination.calls().is_empty());
}
