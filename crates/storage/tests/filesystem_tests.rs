// Object store behaviour the upload engine relies on

mod common;

use bytes::Bytes;
use common::{filesystem_backend, seeded_bytes};
use futures::TryStreamExt;
use std::sync::Arc;
use tessera_storage::{ObjectStore, StorageError};

#[tokio::test]
async fn test_delete_missing_is_not_found() {
    let (_dir, backend) = filesystem_backend().await;
    let err = backend.delete("chunks/u/d/chunk_0").await.unwrap_err();
    assert!(err.is_not_found());

    backend.put("chunks/u/d/chunk_0", Bytes::from_static(b"x")).await.unwrap();
    backend.delete("chunks/u/d/chunk_0").await.unwrap();
    assert!(backend.head("chunks/u/d/chunk_0").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_list_is_scoped_to_prefix() {
    let (_dir, backend) = filesystem_backend().await;
    for key in [
        "chunks/u/abc/chunk_0",
        "chunks/u/abc/chunk_1",
        "chunks/u/abcd/chunk_0",
        "chunks/v/abc/chunk_0",
        "files/u/a.bin",
    ] {
        backend.put(key, Bytes::from_static(b"x")).await.unwrap();
    }

    let keys = backend.list("chunks/u/abc/").await.unwrap();
    assert_eq!(keys, vec!["chunks/u/abc/chunk_0", "chunks/u/abc/chunk_1"]);

    let streamed: Vec<String> = backend
        .list_stream("chunks/u/")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(streamed.len(), 3);

    assert!(backend.list("chunks/nobody/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_puts_to_same_key_leave_one_whole_value() {
    let (_dir, backend) = filesystem_backend().await;
    let backend = Arc::new(backend);
    let first = seeded_bytes(1, 256 * 1024);
    let second = seeded_bytes(2, 256 * 1024);

    let a = {
        let backend = backend.clone();
        let data = first.clone();
        tokio::spawn(async move { backend.put("chunks/u/d/chunk_3", data).await })
    };
    let b = {
        let backend = backend.clone();
        let data = second.clone();
        tokio::spawn(async move { backend.put("chunks/u/d/chunk_3", data).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let stored = backend.get("chunks/u/d/chunk_3").await.unwrap();
    assert!(stored == first || stored == second);
    assert_eq!(backend.list("chunks/u/d/").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_keys_rejected() {
    let (_dir, backend) = filesystem_backend().await;
    for key in ["", "/etc/passwd", "chunks/../../escape"] {
        let err = backend.put(key, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)), "key {key:?}: {err:?}");
    }
}

#[tokio::test]
async fn test_health_check() {
    let (_dir, backend) = filesystem_backend().await;
    backend.health_check().await.unwrap();
}
