use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{AsRefStr, Display, EnumString};

/// Value of the `job_type` delivery attribute for every pipeline job.
pub const JOB_TYPE: &str = "image_processing";

/// Scheduling hint carried with a job. Routing only; the pipeline itself
/// treats every priority the same.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, EnumString, Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Lifecycle status of an image processing job.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// What the pipeline should produce for a job.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ProcessingOptions {
    #[garde(skip)]
    pub create_thumbnail: bool,

    #[garde(skip)]
    pub extract_metadata: bool,

    /// Bounding boxes as `"WxH"` tokens, in request order.
    #[garde(length(max = 32))]
    pub resize_formats: Vec<String>,

    /// Codec names (`jpeg`, `webp`, `png`), in request order.
    #[garde(length(max = 16))]
    pub output_formats: Vec<String>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            create_thumbnail: true,
            extract_metadata: true,
            resize_formats: vec!["400x300".to_string()],
            output_formats: vec!["jpeg".to_string()],
        }
    }
}

impl ProcessingOptions {
    /// Whether any requested stage needs decoded pixels.
    pub fn requires_decode(&self) -> bool {
        let resizes = !self.resize_formats.is_empty() && !self.output_formats.is_empty();
        self.create_thumbnail || resizes
    }
}

/// A validated image processing job.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JobDescriptor {
    #[garde(length(min = 1, max = 128), custom(path_segment))]
    pub job_id: String,

    #[garde(length(min = 1, max = 128), custom(path_segment))]
    pub image_id: String,

    /// Absolute http(s) URL of the source image.
    #[garde(skip)]
    pub url: String,

    #[garde(skip)]
    pub priority: Priority,

    #[garde(length(max = 128))]
    pub category: String,

    #[garde(dive)]
    pub processing_options: ProcessingOptions,

    #[garde(skip)]
    pub retry_count: u32,

    #[garde(skip)]
    pub max_retries: u32,

    #[garde(skip)]
    pub status: JobStatus,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    /// Minimal job with default options, mostly useful for producers and tests.
    pub fn new(
        job_id: impl Into<String>,
        image_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            image_id: image_id.into(),
            url: url.into(),
            priority: Priority::default(),
            category: "unknown".to_string(),
            processing_options: ProcessingOptions::default(),
            retry_count: 0,
            max_retries: 3,
            status: JobStatus::Queued,
            batch_id: None,
            created_at: None,
        }
    }

    /// Routing attributes attached to the queue message carrying this job.
    pub fn delivery_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        attributes.insert("priority".to_string(), self.priority.to_string());
        attributes.insert("category".to_string(), self.category.clone());
        attributes.insert("job_type".to_string(), JOB_TYPE.to_string());
        if let Some(batch_id) = &self.batch_id {
            attributes.insert("batch_id".to_string(), batch_id.clone());
        }
        attributes
    }
}

/// Identifiers end up as storage path segments.
fn path_segment(value: &str, _ctx: &()) -> garde::Result {
    if value == "." || value == ".." {
        return Err(garde::Error::new("must not be a relative path component"));
    }
    if value.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(garde::Error::new(
            "must not contain path separators or control characters",
        ));
    }
    Ok(())
}
