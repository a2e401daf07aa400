//! Upload identity and the deterministic object key layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of an owner id or content digest.
pub const MAX_IDENTITY_PART_LEN: usize = 128;

/// Maximum length of a stored file name, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Prefix under which chunk objects are stored.
pub const CHUNK_NAMESPACE: &str = "chunks";

/// Prefix under which merged objects are stored.
pub const FILE_NAMESPACE: &str = "files";

/// Names one upload attempt for one owner: `(owner id, content digest)`.
///
/// Both parts end up in object keys, so they are restricted to a
/// path-safe alphabet when the identity is constructed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadIdentity {
    owner_id: String,
    content_digest: String,
}

impl UploadIdentity {
    /// Create an identity, validating both parts.
    pub fn new(owner_id: impl Into<String>, content_digest: impl Into<String>) -> crate::Result<Self> {
        let owner_id = owner_id.into();
        let content_digest = content_digest.into();
        validate_part("owner id", &owner_id)?;
        validate_part("content digest", &content_digest)?;
        Ok(Self {
            owner_id,
            content_digest,
        })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn content_digest(&self) -> &str {
        &self.content_digest
    }

    /// Prefix containing every chunk object of this upload (trailing slash included).
    pub fn chunk_prefix(&self) -> String {
        format!(
            "{CHUNK_NAMESPACE}/{}/{}/",
            self.owner_id, self.content_digest
        )
    }

    /// Object key for the chunk at `index`.
    pub fn chunk_key(&self, index: u32) -> String {
        format!("{}chunk_{index}", self.chunk_prefix())
    }

    /// Object keys for chunks `0..chunk_count`, in ascending index order.
    pub fn chunk_keys(&self, chunk_count: u32) -> Vec<String> {
        (0..chunk_count).map(|i| self.chunk_key(i)).collect()
    }

    /// Object key of the merged file.
    ///
    /// The file name must already have passed [`validate_file_name`].
    pub fn final_object_key(&self, file_name: &str) -> String {
        format!("{FILE_NAMESPACE}/{}/{file_name}", self.owner_id)
    }
}

impl fmt::Debug for UploadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadIdentity({self})")
    }
}

impl fmt::Display for UploadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.content_digest)
    }
}

fn validate_part(what: &str, value: &str) -> crate::Result<()> {
    if value.is_empty() {
        return Err(crate::Error::InvalidIdentity(format!("{what} cannot be empty")));
    }
    if value.len() > MAX_IDENTITY_PART_LEN {
        return Err(crate::Error::InvalidIdentity(format!(
            "{what} must be at most {MAX_IDENTITY_PART_LEN} chars, got {}",
            value.len()
        )));
    }
    if value == "." || value == ".." {
        return Err(crate::Error::InvalidIdentity(format!(
            "{what} cannot be '{value}'"
        )));
    }
    for c in value.chars() {
        if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.') {
            return Err(crate::Error::InvalidIdentity(format!(
                "invalid character in {what}: {c:?}"
            )));
        }
    }
    Ok(())
}

/// Validate a client-supplied file name for use as the last key segment.
pub fn validate_file_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidFileName(
            "file name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(crate::Error::InvalidFileName(format!(
            "file name must be at most {MAX_FILE_NAME_LEN} bytes, got {}",
            name.len()
        )));
    }
    if name == "." || name == ".." {
        return Err(crate::Error::InvalidFileName(format!(
            "file name cannot be '{name}'"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| *c == '/' || *c == '\\' || c.is_control())
    {
        return Err(crate::Error::InvalidFileName(format!(
            "invalid character in file name: {c:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let id = UploadIdentity::new("user-42", "9e107d9d372bb6826bd81d3542a419d6").unwrap();
        assert_eq!(id.chunk_prefix(), "chunks/user-42/9e107d9d372bb6826bd81d3542a419d6/");
        assert_eq!(
            id.chunk_key(7),
            "chunks/user-42/9e107d9d372bb6826bd81d3542a419d6/chunk_7"
        );
        assert_eq!(id.final_object_key("report.pdf"), "files/user-42/report.pdf");
    }

    #[test]
    fn test_chunk_keys_are_ordered() {
        let id = UploadIdentity::new("u", "d").unwrap();
        let keys = id.chunk_keys(3);
        assert_eq!(
            keys,
            vec!["chunks/u/d/chunk_0", "chunks/u/d/chunk_1", "chunks/u/d/chunk_2"]
        );
    }

    #[test]
    fn test_rejects_path_traversal() {
        assert!(UploadIdentity::new("..", "abc").is_err());
        assert!(UploadIdentity::new("user", "a/b").is_err());
        assert!(UploadIdentity::new("", "abc").is_err());
        assert!(UploadIdentity::new("user", "x".repeat(129)).is_err());
        assert!(UploadIdentity::new("user", "x".repeat(128)).is_ok());
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("archive.tar.gz").is_ok());
        assert!(validate_file_name("quarterly report (final).pdf").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("dir\\file").is_err());
        assert!(validate_file_name("bad\nname").is_err());
    }

    #[test]
    fn test_display() {
        let id = UploadIdentity::new("alice", "cafebabe").unwrap();
        assert_eq!(id.to_string(), "alice:cafebabe");
        assert_eq!(format!("{id:?}"), "UploadIdentity(alice:cafebabe)");
    }
}
