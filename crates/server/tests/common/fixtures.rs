//! Test fixtures.

use sha2::{Digest, Sha256};
use tessera_core::{SessionParams, UploadIdentity};

/// Deterministic pseudo-random bytes.
#[allow(dead_code)]
pub fn seeded_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Hex SHA-256 of `data`.
#[allow(dead_code)]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Identity for `data` owned by `owner`.
#[allow(dead_code)]
pub fn identity_for(owner: &str, data: &[u8]) -> UploadIdentity {
    UploadIdentity::new(owner, sha256_hex(data)).expect("valid identity")
}

/// Split `data` into chunks of `chunk_size`.
#[allow(dead_code)]
pub fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    data.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

/// Session parameters matching `data` cut into `chunk_size` pieces.
#[allow(dead_code)]
pub fn params_for(file_name: &str, data: &[u8], chunk_size: usize) -> SessionParams {
    SessionParams {
        file_name: file_name.to_string(),
        file_size: data.len() as u64,
        chunk_count: data.len().div_ceil(chunk_size) as u32,
        chunk_size: Some(chunk_size as u64),
    }
}
