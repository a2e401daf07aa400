//! Durable ledger of completed uploads.

use crate::error::MetadataResult;
use crate::models::{NewUploadRecord, UploadRecord};
use async_trait::async_trait;
use tessera_core::UploadIdentity;

#[async_trait]
pub trait UploadLedger: Send + Sync {
    /// Append a record for a merged upload.
    async fn record_upload(&self, record: &NewUploadRecord) -> MetadataResult<UploadRecord>;

    /// Latest non-deleted record for `identity`.
    async fn find_upload(&self, identity: &UploadIdentity)
    -> MetadataResult<Option<UploadRecord>>;
}
