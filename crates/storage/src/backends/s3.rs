//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{KeyStream, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum number of parts in one multipart upload.
const MAX_PARTS: i32 = 10_000;

/// Marker included in lazy-credentials initialization errors so we can map them
/// to actionable storage config errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "tessera-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "tessera-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root initialization)
/// in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Normalized endpoint, for logging.
    endpoint: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`) instead of
    ///   virtual-hosted style (`bucket.endpoint/key`). Required for MinIO.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "tessera-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        let normalized_endpoint = endpoint.as_deref().map(normalize_endpoint);
        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain-HTTP endpoints (local MinIO) get an HTTP-only client so
            // SDK initialization doesn't depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());
        let stored_endpoint =
            normalized_endpoint.unwrap_or_else(|| format!("s3.{resolved_region}.amazonaws.com"));

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            // Strip trailing slashes to avoid keys like "prefix//key"
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            endpoint: stored_endpoint,
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// `CopySource` value (`bucket/key`) with the key percent-encoded.
    fn copy_source(&self, key: &str) -> String {
        let encoded_key = utf8_percent_encode(&self.full_key(key), NON_ALPHANUMERIC).to_string();
        format!("{}/{}", self.bucket, encoded_key)
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
            && service_err.raw().status().as_u16() == 404
        {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    /// Server-side copy of one object, replacing its content type.
    async fn copy_object(
        &self,
        from: &str,
        to: &str,
        content_type: Option<&str>,
    ) -> StorageResult<()> {
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(self.full_key(to))
            .copy_source(self.copy_source(from));
        if let Some(ct) = content_type {
            request = request
                .content_type(ct)
                .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace);
        }
        request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, from))?;
        Ok(())
    }

    /// Feed every source into `upload`. Large sources are copied server-side;
    /// small ones are buffered until they add up to a valid part.
    async fn compose_parts(
        &self,
        upload: &mut MultipartCompose,
        sources: &[String],
    ) -> StorageResult<()> {
        for key in sources {
            let size = self.head(key).await?.size;
            if size >= MIN_PART_SIZE as u64 && upload.buffer.is_empty() {
                upload.copy_part(self.copy_source(key), key).await?;
            } else {
                let data = self.get(key).await?;
                upload.buffer.extend_from_slice(&data);
                if upload.buffer.len() >= MIN_PART_SIZE {
                    upload.flush_buffer().await?;
                }
            }
        }
        if !upload.buffer.is_empty() {
            upload.flush_buffer().await?;
        }
        Ok(())
    }
}

fn normalize_endpoint(endpoint_url: &str) -> String {
    // Bare host:port endpoints (e.g., "minio:9000") default to http://
    let endpoint_lower = endpoint_url.to_lowercase();
    if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
        endpoint_url.to_string()
    } else {
        format!("http://{}", endpoint_url)
    }
}

fn strip_configured_prefix(prefix: Option<&str>, full_key: &str) -> String {
    match prefix {
        Some(prefix) => full_key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(full_key)
            .to_string(),
        None => full_key.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(
                        key = %key,
                        timestamp = dt.secs(),
                        error = %e,
                        "Failed to convert S3 timestamp"
                    );
                })
                .ok()
        });

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
            content_type: output.content_type().map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys, so head first to report NotFound
        self.head(key).await?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        use futures::TryStreamExt;

        self.list_stream(prefix).await?.try_collect().await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        let full_prefix = self.full_key(prefix);
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let prefix_to_strip = self.prefix.clone();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;
            loop {
                let mut request = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&full_prefix);
                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let output = request
                    .send()
                    .await
                    .map_err(map_s3_operation_error)?;

                for obj in output.contents() {
                    if let Some(obj_key) = obj.key() {
                        yield strip_configured_prefix(prefix_to_strip.as_deref(), obj_key);
                    }
                }

                if output.is_truncated() == Some(true) {
                    continuation_token = output.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, sources), fields(backend = "s3", parts = sources.len()))]
    async fn compose(
        &self,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        match sources {
            [] => return Err(StorageError::Compose("no source objects".to_string())),
            [single] => {
                self.copy_object(single, dest, content_type).await?;
                return self.head(dest).await;
            }
            _ => {}
        }

        let dest_full = self.full_key(dest);
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&dest_full);
        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }
        let upload_id = request
            .send()
            .await
            .map_err(map_s3_operation_error)?
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        let mut upload = MultipartCompose {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: dest_full,
            upload_id,
            parts: Vec::new(),
            buffer: Vec::new(),
        };

        if let Err(e) = self.compose_parts(&mut upload, sources).await {
            upload.abort().await;
            return Err(e);
        }

        if upload.parts.is_empty() {
            // Every source was empty; multipart needs at least one non-empty part.
            upload.abort().await;
            let mut request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(self.full_key(dest))
                .body(Bytes::new().into());
            if let Some(ct) = content_type {
                request = request.content_type(ct);
            }
            request.send().await.map_err(map_s3_operation_error)?;
        } else {
            upload.complete().await?;
        }

        self.head(dest).await
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
        let marker_key = self.full_key(".tessera-health-check");

        let health_check_future = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            if let Err(e) = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
                && !matches!(
                    &e,
                    aws_sdk_s3::error::SdkError::ServiceError(se) if se.raw().status().as_u16() == 404
                )
            {
                return Err(map_s3_operation_error(e));
            }

            Ok(())
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, health_check_future)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

/// In-flight multipart upload assembling a composed object.
struct MultipartCompose {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    /// Bytes from small sources not yet uploaded as a part.
    buffer: Vec<u8>,
}

impl MultipartCompose {
    fn next_part_number(&self) -> StorageResult<i32> {
        let next = self.parts.len() as i32 + 1;
        if next > MAX_PARTS {
            return Err(StorageError::Compose(format!(
                "object would need more than {MAX_PARTS} parts"
            )));
        }
        Ok(next)
    }

    fn record_part(&mut self, part_number: i32, e_tag: Option<&str>) {
        self.parts.push(
            aws_sdk_s3::types::CompletedPart::builder()
                .e_tag(e_tag.unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
    }

    async fn copy_part(&mut self, copy_source: String, source_key: &str) -> StorageResult<()> {
        let part_number = self.next_part_number()?;
        let output = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .copy_source(copy_source)
            .send()
            .await
            .map_err(|e| S3Backend::map_sdk_error(e, source_key))?;
        let e_tag = output.copy_part_result().and_then(|r| r.e_tag());
        self.record_part(part_number, e_tag);
        Ok(())
    }

    async fn flush_buffer(&mut self) -> StorageResult<()> {
        let part_number = self.next_part_number()?;
        let data = Bytes::from(std::mem::take(&mut self.buffer));
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        self.record_part(part_number, output.e_tag());
        Ok(())
    }

    async fn complete(self) -> StorageResult<()> {
        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    /// Best-effort abort; orphaned parts are left to the bucket's lifecycle rules.
    async fn abort(&self) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                error = %e,
                "Failed to abort multipart compose, orphaned parts may remain"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(prefix: Option<String>) -> S3Backend {
        S3Backend::new(
            "test-bucket",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            prefix,
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn test_full_key_and_strip_prefix() {
        let backend = make_backend(Some("prefix/".to_string())).await;
        assert_eq!(backend.full_key("chunks/u/d/chunk_0"), "prefix/chunks/u/d/chunk_0");
        let prefix = backend.prefix.as_deref();
        assert_eq!(
            strip_configured_prefix(prefix, "prefix/chunks/u/d/chunk_0"),
            "chunks/u/d/chunk_0"
        );
        assert_eq!(strip_configured_prefix(prefix, "other/path"), "other/path");
        assert_eq!(strip_configured_prefix(prefix, "prefixed/path"), "prefixed/path");

        let backend = make_backend(None).await;
        assert_eq!(backend.full_key("files/u/a.bin"), "files/u/a.bin");
        assert_eq!(
            strip_configured_prefix(backend.prefix.as_deref(), "files/u/a.bin"),
            "files/u/a.bin"
        );
    }

    #[tokio::test]
    async fn test_copy_source_is_encoded() {
        let backend = make_backend(None).await;
        assert_eq!(
            backend.copy_source("files/u/my report.pdf"),
            "test-bucket/files%2Fu%2Fmy%20report%2Epdf"
        );
    }

    #[tokio::test]
    async fn test_s3_new_requires_complete_credentials() {
        let err = S3Backend::new(
            "bucket",
            None,
            Some("us-east-1".to_string()),
            None,
            Some("access".to_string()),
            None,
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_s3_new_normalizes_endpoint() {
        let backend = make_backend(None).await;
        assert_eq!(backend.endpoint, "http://s3.test");
        assert_eq!(normalize_endpoint("https://minio:9000"), "https://minio:9000");

        let backend = S3Backend::new("bucket", None, None, None, None, None, false)
            .await
            .unwrap();
        assert_eq!(backend.endpoint, "s3.us-east-1.amazonaws.com");
    }

    #[tokio::test]
    async fn test_compose_rejects_empty_sources() {
        let backend = make_backend(None).await;
        let err = backend.compose(&[], "files/u/x", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Compose(_)));
    }
}
