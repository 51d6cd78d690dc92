//! Fetches source images over HTTP under size, type and time limits.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use reqwest::{header, Client};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::models::result::DownloadMetadata;

/// 50 MB.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Covers the whole attempt: connect, headers and body.
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            max_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download timed out after {secs}s for URL: {url}")]
    Timeout { url: String, secs: u64 },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("image too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("invalid content type: '{content_type}'")]
    ContentType { content_type: String },

    #[error("download failed for {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

impl DownloadError {
    /// Short machine-readable reason, logged and used as the
    /// `pixelpipe_download_failures_total` label.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DownloadError::Timeout { .. } => "timeout",
            DownloadError::HttpStatus { .. } => "http_status",
            DownloadError::TooLarge { .. } => "too_large",
            DownloadError::ContentType { .. } => "content_type",
            DownloadError::Transport { .. } | DownloadError::Client(_) => "transport",
        }
    }
}

/// HTTP downloader shared by all in-flight jobs.
pub struct Downloader {
    http: Client,
    config: DownloaderConfig,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Result<Self, DownloadError> {
        let http = Client::builder()
            .connect_timeout(config.timeout)
            .user_agent(concat!("pixelpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: Client, config: DownloaderConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Download `url`, returning the body and what was learned about it.
    pub async fn fetch(&self, url: &str) -> Result<(Bytes, DownloadMetadata), DownloadError> {
        match tokio::time::timeout(self.config.timeout, self.fetch_within_limits(url)).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(url)),
        }
    }

    async fn fetch_within_limits(
        &self,
        url: &str,
    ) -> Result<(Bytes, DownloadMetadata), DownloadError> {
        let limit = self.config.max_bytes;

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(DownloadError::ContentType { content_type });
        }

        if let Some(declared) = response.content_length() {
            if declared > limit {
                return Err(DownloadError::TooLarge {
                    size: declared,
                    limit,
                });
            }
        }

        // Content-Length may be absent or lie, so the body is capped as it streams in.
        let capacity = response.content_length().unwrap_or(0).min(limit) as usize;
        let mut body = BytesMut::with_capacity(capacity);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.request_error(url, e))?
        {
            let received = (body.len() + chunk.len()) as u64;
            if received > limit {
                return Err(DownloadError::TooLarge {
                    size: received,
                    limit,
                });
            }
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();

        let metadata = DownloadMetadata {
            original_url: url.to_string(),
            content_type,
            content_length: body.len() as u64,
            http_status: status.as_u16(),
            content_hash: sha256_hex(&body),
            downloaded_at: Utc::now(),
        };

        debug!(
            url = %url,
            size = metadata.content_length,
            content_type = %metadata.content_type,
            "Downloaded source image"
        );

        Ok((body, metadata))
    }

    fn request_error(&self, url: &str, err: reqwest::Error) -> DownloadError {
        if err.is_timeout() {
            self.timeout_error(url)
        } else {
            DownloadError::Transport {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }

    fn timeout_error(&self, url: &str) -> DownloadError {
        DownloadError::Timeout {
            url: url.to_string(),
            secs: self.config.timeout.as_secs(),
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_reason_codes() {
        let err = DownloadError::TooLarge { size: 10, limit: 5 };
        assert_eq!(err.reason_code(), "too_large");
        assert_eq!(
            err.to_string(),
            "image too large: 10 bytes exceeds limit of 5 bytes"
        );

        let err = DownloadError::Timeout {
            url: "https://example.com/a.jpg".to_string(),
            secs: 30,
        };
        assert_eq!(err.reason_code(), "timeout");
        assert!(err.to_string().contains("timed out"));
    }
}
