//! Core domain types for the Tessera chunked-upload service.
//!
//! This crate defines the data model shared by every other crate:
//! - Upload identities and the object key layout
//! - Upload session metadata and progress accounting
//! - The chunk presence bitmap
//! - HTTP request/response payloads
//! - Application configuration

pub mod bitmap;
pub mod config;
pub mod error;
pub mod identity;
pub mod session;
pub mod upload;

pub use bitmap::ChunkBitmap;
pub use error::{Error, Result};
pub use identity::{UploadIdentity, validate_file_name};
pub use session::{SessionParams, UploadSession, progress_percent};
pub use upload::{IntegrityWarning, guess_content_type};

/// Default chunk size used by clients: 8 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default maximum accepted chunk body: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default maximum chunk count per session.
pub const MAX_CHUNK_COUNT: u32 = 100_000;
