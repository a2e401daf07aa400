use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tessera_core::upload::{
    ChunkUploadResponse, ErrorResponse, InitUploadRequest, InitUploadResponse, MergeResponse,
    UploadRecordResponse, UploadStatusResponse,
};

/// Retries after the first attempt on 5xx or transport errors, and on a merge
/// that another request currently holds the lock for.
const MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    retry_base: Duration,
}

/// A non-success response from the server.
#[derive(Debug, thiserror::Error)]
#[error("API error ({status}) {code}: {message}")]
pub struct ApiFailure {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub missing_chunks: Option<Vec<u32>>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Override the first retry delay. Later retries double it.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base = delay;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base * (1 << (attempt - 1))
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("failed to build API URL")
    }

    fn upload_path(owner_id: &str, content_digest: &str) -> String {
        format!("/v1/uploads/{owner_id}/{content_digest}")
    }

    /// Send the request built by `make_request`, retrying 5xx responses and
    /// transport errors with exponential backoff. Other responses return as is.
    async fn send_with_retry<F>(&self, make_request: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match make_request().send().await {
                Ok(response) if response.status().is_server_error() => {
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        return Ok(response);
                    }
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        status = %response.status(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Server error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        return Err(e.into());
                    }
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Request error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_json<T, F>(&self, make_request: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let response = self.send_with_retry(make_request).await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(failure(status, &body).into());
        }
        serde_json::from_str(&body).context("failed to decode server response")
    }

    pub async fn init_upload(&self, req: &InitUploadRequest) -> Result<InitUploadResponse> {
        let url = self.url("/v1/uploads")?;
        self.send_json(|| self.http.post(url.clone()).json(req))
            .await
    }

    pub async fn upload_status(
        &self,
        owner_id: &str,
        content_digest: &str,
    ) -> Result<UploadStatusResponse> {
        let url = self.url(&Self::upload_path(owner_id, content_digest))?;
        self.send_json(|| self.http.get(url.clone())).await
    }

    pub async fn upload_chunk(
        &self,
        owner_id: &str,
        content_digest: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkUploadResponse> {
        let url = self.url(&format!(
            "{}/chunks/{chunk_index}",
            Self::upload_path(owner_id, content_digest)
        ))?;
        self.send_json(|| {
            self.http
                .put(url.clone())
                .header("content-type", "application/octet-stream")
                .body(data.clone())
        })
        .await
    }

    /// Merge the upload, waiting out a merge already running elsewhere.
    pub async fn merge(&self, owner_id: &str, content_digest: &str) -> Result<MergeResponse> {
        let url = self.url(&format!(
            "{}/merge",
            Self::upload_path(owner_id, content_digest)
        ))?;
        let mut attempt = 0;
        loop {
            let err = match self.send_json(|| self.http.post(url.clone())).await {
                Ok(merged) => return Ok(merged),
                Err(e) => e,
            };
            let in_progress = err
                .downcast_ref::<ApiFailure>()
                .is_some_and(|f| f.status == StatusCode::CONFLICT && f.code == "merge_in_progress");
            attempt += 1;
            if !in_progress || attempt > MAX_RETRIES {
                return Err(err);
            }
            let delay = self.backoff(attempt);
            tracing::warn!(
                retry_in_ms = delay.as_millis() as u64,
                "Merge already in progress, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Latest merged record, or `None` when the upload was never merged.
    pub async fn record(
        &self,
        owner_id: &str,
        content_digest: &str,
    ) -> Result<Option<UploadRecordResponse>> {
        let url = self.url(&format!("/v1/records/{owner_id}/{content_digest}"))?;
        match self.send_json(|| self.http.get(url.clone())).await {
            Ok(record) => Ok(Some(record)),
            Err(e) => match e.downcast_ref::<ApiFailure>() {
                Some(failure) if failure.status == StatusCode::NOT_FOUND => Ok(None),
                _ => Err(e),
            },
        }
    }
}

fn failure(status: StatusCode, body: &str) -> ApiFailure {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => ApiFailure {
            status,
            code: err.code,
            message: err.message,
            missing_chunks: err.missing_chunks,
        },
        Err(_) => ApiFailure {
            status,
            code: "http_error".to_string(),
            message: body.to_string(),
            missing_chunks: None,
        },
    }
}
