use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use strum::{AsRefStr, Display};

use crate::error::ErrorKind;
use crate::models::job::{JobDescriptor, JobStatus};

/// Output key of the stored source image.
pub const ORIGINAL_OUTPUT: &str = "original";
/// Output key of the stored thumbnail.
pub const THUMBNAIL_OUTPUT: &str = "thumbnail";

/// Pipeline state machine positions, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStage {
    Received,
    Downloading,
    ExtractingMetadata,
    UploadingOriginal,
    Thumbnailing,
    Resizing,
    Completed,
    Failed,
}

/// A failure captured during one stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageError {
    pub stage: PipelineStage,
    pub kind: ErrorKind,
    pub message: String,
}

/// What the downloader learned about the source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadMetadata {
    pub original_url: String,
    pub content_type: String,
    pub content_length: u64,
    pub http_status: u16,
    /// Lowercase hex SHA-256 of the body.
    pub content_hash: String,
    pub downloaded_at: DateTime<Utc>,
}

/// Coarse dominant color of an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DominantColor {
    pub rgb: [u8; 3],
    pub hex: String,
}

impl DominantColor {
    pub fn from_rgb(rgb: [u8; 3]) -> Self {
        Self {
            rgb,
            hex: format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2]),
        }
    }
}

/// Decoded properties of the source image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageMetadata {
    pub format: String,
    pub color_mode: String,
    pub width: u32,
    pub height: u32,
    pub has_transparency: bool,
    #[serde(default)]
    pub exif: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_color: Option<DominantColor>,
}

/// Size facts about one stored derivative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenditionInfo {
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
    pub content_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageMetadata>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub renditions: BTreeMap<String, RenditionInfo>,
}

/// Outcome of running one job through the pipeline.
///
/// Owned by the task running the job: created at pipeline start, updated as
/// each stage completes, and finalized once when a terminal status is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingResult {
    pub job_id: String,
    pub image_id: String,
    pub original_url: String,
    pub status: JobStatus,
    /// Artifact kind (`original`, `thumbnail`, `{size}_{format}`) to storage locator.
    pub outputs: BTreeMap<String, String>,
    pub metadata: ResultMetadata,
    pub errors: Vec<StageError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<f64>,
}

impl ProcessingResult {
    pub fn start(job: &JobDescriptor) -> Self {
        Self::blank(&job.job_id, &job.image_id, &job.url)
    }

    /// Result for a job that never entered the pipeline because its payload was invalid.
    pub fn rejected(job_id: &str, image_id: &str, url: &str, message: impl Into<String>) -> Self {
        let mut result = Self::blank(job_id, image_id, url);
        result.record_error(PipelineStage::Received, ErrorKind::Validation, message);
        result.finalize(JobStatus::Failed, Duration::ZERO)
    }

    fn blank(job_id: &str, image_id: &str, url: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            image_id: image_id.to_string(),
            original_url: url.to_string(),
            status: JobStatus::Processing,
            outputs: BTreeMap::new(),
            metadata: ResultMetadata::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            processing_time_seconds: None,
        }
    }

    pub fn record_error(
        &mut self,
        stage: PipelineStage,
        kind: ErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(StageError {
            stage,
            kind,
            message: message.into(),
        });
    }

    pub fn add_output(&mut self, key: impl Into<String>, locator: impl Into<String>) {
        self.outputs.insert(key.into(), locator.into());
    }

    /// Number of derived artifacts (everything except the original) stored.
    pub fn derivative_count(&self) -> usize {
        self.outputs
            .keys()
            .filter(|key| *key != ORIGINAL_OUTPUT)
            .count()
    }

    /// Enter a terminal status. Consumes the in-progress result so it can only happen once.
    pub fn finalize(mut self, status: JobStatus, elapsed: Duration) -> Self {
        debug_assert!(status.is_terminal(), "finalize requires a terminal status");
        let now = Utc::now();
        self.status = status;
        match status {
            JobStatus::Completed => self.completed_at = Some(now),
            _ => self.failed_at = Some(now),
        }
        self.processing_time_seconds = Some(elapsed.as_secs_f64());
        self
    }
}
