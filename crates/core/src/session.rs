//! Upload session metadata and progress accounting.

use crate::identity::{UploadIdentity, validate_file_name};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Largest accepted file or chunk size. Sizes are stored as signed 64-bit integers.
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Ephemeral metadata for one in-flight upload.
///
/// Everything except `expires_at` is immutable once the session exists.
/// `expires_at` slides forward on every mutating operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub identity: UploadIdentity,
    /// Original file name as supplied by the first init call.
    pub file_name: String,
    /// Declared total size in bytes.
    pub file_size: u64,
    /// Number of chunks the file was split into.
    pub chunk_count: u32,
    /// Nominal chunk size. Informational only; stored chunk sizes are authoritative.
    pub chunk_size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Parameters of a new upload session, prior to validation.
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_count: u32,
    pub chunk_size: Option<u64>,
}

impl UploadSession {
    /// Validate `params` and create a session expiring `ttl` from now.
    pub fn new(
        identity: UploadIdentity,
        params: SessionParams,
        max_chunk_count: u32,
        ttl: time::Duration,
    ) -> crate::Result<Self> {
        if params.file_size == 0 {
            return Err(crate::Error::InvalidSession(
                "file size must be greater than 0".to_string(),
            ));
        }
        if params.file_size > MAX_FILE_SIZE {
            return Err(crate::Error::InvalidSession(format!(
                "file size {} exceeds maximum {MAX_FILE_SIZE}",
                params.file_size
            )));
        }
        if params.chunk_count == 0 {
            return Err(crate::Error::InvalidSession(
                "chunk count must be greater than 0".to_string(),
            ));
        }
        if params.chunk_count > max_chunk_count {
            return Err(crate::Error::InvalidSession(format!(
                "chunk count {} exceeds maximum {max_chunk_count}",
                params.chunk_count
            )));
        }
        match params.chunk_size {
            Some(0) => {
                return Err(crate::Error::InvalidSession(
                    "chunk size must be greater than 0".to_string(),
                ));
            }
            Some(size) if size > MAX_FILE_SIZE => {
                return Err(crate::Error::InvalidSession(format!(
                    "chunk size {size} exceeds maximum {MAX_FILE_SIZE}"
                )));
            }
            _ => {}
        }
        validate_file_name(&params.file_name)?;

        let chunk_size = params
            .chunk_size
            .unwrap_or_else(|| params.file_size.div_ceil(u64::from(params.chunk_count)));
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            identity,
            file_name: params.file_name,
            file_size: params.file_size,
            chunk_count: params.chunk_count,
            chunk_size,
            created_at: now,
            expires_at: now + ttl,
        })
    }

    /// Check if the session has expired as of `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Whether `index` falls inside `[0, chunk_count)`.
    pub fn contains_index(&self, index: u32) -> bool {
        index < self.chunk_count
    }

    /// `index` as a chunk position, or `None` when it is negative or past the end.
    pub fn checked_index(&self, index: i64) -> Option<u32> {
        u32::try_from(index).ok().filter(|i| self.contains_index(*i))
    }

    /// Progress of this session given `uploaded` chunks.
    pub fn progress(&self, uploaded: u32) -> f64 {
        progress_percent(uploaded, self.chunk_count)
    }
}

/// `uploaded * 100 / total`, rounded to 2 decimals. Zero when `total` is 0.
pub fn progress_percent(uploaded: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = f64::from(uploaded) * 100.0 / f64::from(total);
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> UploadIdentity {
        UploadIdentity::new("owner", "digest").unwrap()
    }

    fn params(file_size: u64, chunk_count: u32) -> SessionParams {
        SessionParams {
            file_name: "data.bin".to_string(),
            file_size,
            chunk_count,
            chunk_size: None,
        }
    }

    #[test]
    fn test_progress_rounding() {
        assert_eq!(progress_percent(2, 5), 40.0);
        assert_eq!(progress_percent(1, 3), 33.33);
        assert_eq!(progress_percent(2, 3), 66.67);
        assert_eq!(progress_percent(8, 8), 100.0);
        assert_eq!(progress_percent(0, 0), 0.0);
    }

    #[test]
    fn test_new_session_validation() {
        let ttl = time::Duration::hours(24);
        assert!(UploadSession::new(identity(), params(0, 1), 100, ttl).is_err());
        assert!(UploadSession::new(identity(), params(10, 0), 100, ttl).is_err());
        assert!(UploadSession::new(identity(), params(10, 101), 100, ttl).is_err());

        let mut bad_name = params(10, 1);
        bad_name.file_name = "../escape".to_string();
        assert!(UploadSession::new(identity(), bad_name, 100, ttl).is_err());

        let mut zero_chunk = params(10, 1);
        zero_chunk.chunk_size = Some(0);
        assert!(UploadSession::new(identity(), zero_chunk, 100, ttl).is_err());

        assert!(UploadSession::new(identity(), params(MAX_FILE_SIZE, 1), 100, ttl).is_ok());
        let err = UploadSession::new(identity(), params(1 << 63, 1), 100, ttl).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidSession(_)));

        let mut huge_chunk = params(10, 1);
        huge_chunk.chunk_size = Some(u64::MAX);
        assert!(UploadSession::new(identity(), huge_chunk, 100, ttl).is_err());
    }

    #[test]
    fn test_chunk_size_defaults_from_file_size() {
        let session =
            UploadSession::new(identity(), params(10, 3), 100, time::Duration::hours(1)).unwrap();
        assert_eq!(session.chunk_size, 4);
        assert!(session.contains_index(2));
        assert!(!session.contains_index(3));
        assert_eq!(session.checked_index(2), Some(2));
        assert_eq!(session.checked_index(3), None);
        assert_eq!(session.checked_index(-1), None);
        assert_eq!(session.checked_index(i64::MAX), None);
    }

    #[test]
    fn test_expiry() {
        let session =
            UploadSession::new(identity(), params(10, 1), 100, time::Duration::seconds(60))
                .unwrap();
        assert!(!session.is_expired());
        assert!(session.is_expired_at(session.expires_at));
        assert!(session.is_expired_at(session.created_at + time::Duration::minutes(2)));
    }

    #[test]
    fn test_serialization_uses_rfc3339() {
        let session =
            UploadSession::new(identity(), params(10, 1), 100, time::Duration::hours(1)).unwrap();
        let json = serde_json::to_value(&session).unwrap();
        let created = json["created_at"].as_str().unwrap();
        assert!(created.contains('T'));
        let back: UploadSession = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
    }
}
