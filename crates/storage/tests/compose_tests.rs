// Compose tests: chunk objects concatenated into a final object

mod common;

use bytes::{Bytes, BytesMut};
use common::{filesystem_backend, seeded_bytes};
use std::sync::Arc;
use tessera_core::UploadIdentity;
use tessera_storage::{ObjectStore, StorageError};

#[tokio::test]
async fn test_compose_concatenates_in_source_order() {
    let (_dir, backend) = filesystem_backend().await;
    let identity = UploadIdentity::new("user-1", "abc123").unwrap();

    // Upload out of order; composition must still follow index order
    for i in [2u32, 0, 1] {
        backend
            .put(&identity.chunk_key(i), Bytes::from(format!("part{i};")))
            .await
            .unwrap();
    }

    let dest = identity.final_object_key("out.txt");
    let meta = backend
        .compose(&identity.chunk_keys(3), &dest, Some("text/plain"))
        .await
        .unwrap();

    assert_eq!(meta.size, 18);
    assert_eq!(
        backend.get(&dest).await.unwrap(),
        Bytes::from_static(b"part0;part1;part2;")
    );
    // Sources are left in place
    assert_eq!(backend.list(&identity.chunk_prefix()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_compose_many_chunks_with_uneven_sizes() {
    let (_dir, backend) = filesystem_backend().await;
    let identity = UploadIdentity::new("user-1", "big").unwrap();

    let mut expected = BytesMut::new();
    for i in 0..25u32 {
        let data = seeded_bytes(u64::from(i), 1000 + i as usize * 37);
        expected.extend_from_slice(&data);
        backend.put(&identity.chunk_key(i), data).await.unwrap();
    }

    let dest = identity.final_object_key("big.bin");
    let meta = backend
        .compose(&identity.chunk_keys(25), &dest, None)
        .await
        .unwrap();
    assert_eq!(meta.size, expected.len() as u64);
    assert_eq!(backend.get(&dest).await.unwrap(), expected.freeze());
}

#[tokio::test]
async fn test_compose_replaces_existing_destination() {
    let (_dir, backend) = filesystem_backend().await;
    backend
        .put("files/u/report.pdf", Bytes::from_static(b"stale contents that are long"))
        .await
        .unwrap();
    backend.put("chunks/u/d/chunk_0", Bytes::from_static(b"new")).await.unwrap();

    let meta = backend
        .compose(&["chunks/u/d/chunk_0".to_string()], "files/u/report.pdf", None)
        .await
        .unwrap();

    assert_eq!(meta.size, 3);
    assert_eq!(meta.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(
        backend.get("files/u/report.pdf").await.unwrap(),
        Bytes::from_static(b"new")
    );
}

#[tokio::test]
async fn test_compose_empty_sources_is_error() {
    let (_dir, backend) = filesystem_backend().await;
    let err = backend.compose(&[], "files/u/x", None).await.unwrap_err();
    assert!(matches!(err, StorageError::Compose(_)));
    assert!(backend.head("files/u/x").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_readers_never_see_partial_compose() {
    let (_dir, backend) = filesystem_backend().await;
    let backend = Arc::new(backend);

    let mut sources = Vec::new();
    for i in 0..10u32 {
        let key = format!("chunks/u/d/chunk_{i}");
        backend.put(&key, seeded_bytes(u64::from(i), 64 * 1024)).await.unwrap();
        sources.push(key);
    }
    let old = Bytes::from_static(b"previous version");
    backend.put("files/u/f.bin", old.clone()).await.unwrap();

    let writer = {
        let backend = backend.clone();
        let sources = sources.clone();
        tokio::spawn(async move { backend.compose(&sources, "files/u/f.bin", None).await })
    };

    let reader = {
        let backend = backend.clone();
        let old = old.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let data = backend.get("files/u/f.bin").await.unwrap();
                assert!(data == old || data.len() == 10 * 64 * 1024);
                tokio::task::yield_now().await;
            }
        })
    };

    let (written, read) = tokio::join!(writer, reader);
    written.unwrap().unwrap();
    read.unwrap();
}
