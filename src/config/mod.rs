use serde::Deserialize;
use std::time::Duration;

use crate::services::consumer::ConsumerConfig;
use crate::services::downloader::DownloaderConfig;
use crate::services::pipeline::{PartialFailurePolicy, PipelineConfig};
use crate::services::transcoder::TranscoderConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// HTTP server bind address. Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the job status store
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Artifact bucket name
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    pub s3_access_key: String,

    pub s3_secret_key: String,

    /// Prefix of the Redis queue keys
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Names this worker's processing list; must be unique per worker
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,

    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: u8,

    /// JPEG quality for resized variants
    #[serde(default = "default_encode_quality")]
    pub encode_quality: u8,

    #[serde(default)]
    pub partial_failure_policy: PartialFailurePolicy,

    /// Number of most recently updated jobs `/stats` aggregates over
    #[serde(default = "default_stats_sample_limit")]
    pub stats_sample_limit: i64,

    /// Worker's Prometheus scrape listener
    #[serde(default = "default_metrics_bind_addr")]
    pub metrics_bind_addr: String,

    #[serde(default = "default_request_body_limit_bytes")]
    pub request_body_limit_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_queue_name() -> String {
    "pixelpipe".to_string()
}

fn default_consumer_name() -> String {
    "worker-0".to_string()
}

fn default_max_in_flight() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_max_download_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_stage_timeout_secs() -> u64 {
    120
}

fn default_thumbnail_size() -> u32 {
    150
}

fn default_thumbnail_quality() -> u8 {
    80
}

fn default_encode_quality() -> u8 {
    85
}

fn default_stats_sample_limit() -> i64 {
    1000
}

fn default_metrics_bind_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_request_body_limit_bytes() -> usize {
    1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            timeout: Duration::from_secs(self.download_timeout_secs),
            max_bytes: self.max_download_bytes,
        }
    }

    pub fn transcoder_config(&self) -> TranscoderConfig {
        TranscoderConfig {
            thumbnail_size: self.thumbnail_size,
            thumbnail_quality: self.thumbnail_quality,
            quality: self.encode_quality,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            partial_failure_policy: self.partial_failure_policy,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_in_flight: self.max_in_flight,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            max_delivery_attempts: self.max_delivery_attempts,
        }
    }
}
