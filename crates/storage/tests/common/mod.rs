use bytes::Bytes;
use tempfile::TempDir;
use tessera_storage::FilesystemBackend;

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Filesystem backend rooted in a fresh temp dir. Keep the dir alive for the test.
pub async fn filesystem_backend() -> (TempDir, FilesystemBackend) {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path().join("store"))
        .await
        .unwrap();
    (temp_dir, backend)
}
