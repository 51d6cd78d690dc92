//! Writes pipeline artifacts to object storage under deterministic paths.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::models::job::JobDescriptor;
use crate::services::storage::{ObjectStore, StorageError};

/// What is being stored. Decides the storage path and the `type` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Original,
    Thumbnail,
    /// A resized rendition, keyed `{WxH}_{format}`.
    Resized { variant: String },
}

impl ArtifactKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ArtifactKind::Original => "original",
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::Resized { .. } => "resized",
        }
    }
}

/// Storage path for an artifact. Only depends on the image and the artifact,
/// so reprocessing a job overwrites instead of duplicating.
pub fn artifact_path(image_id: &str, kind: &ArtifactKind) -> String {
    match kind {
        ArtifactKind::Original => format!("original/{image_id}/{image_id}_original"),
        ArtifactKind::Thumbnail => format!("thumbnails/{image_id}/{image_id}_thumb"),
        ArtifactKind::Resized { variant } => format!("resized/{image_id}/{image_id}_{variant}"),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("upload of {path} failed: {source}")]
pub struct UploadError {
    pub path: String,
    #[source]
    pub source: StorageError,
}

pub struct ArtifactPublisher {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Upload one artifact and return its locator.
    pub async fn publish(
        &self,
        job: &JobDescriptor,
        kind: ArtifactKind,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, UploadError> {
        let path = artifact_path(&job.image_id, &kind);
        let content_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();

        let mut attributes = BTreeMap::new();
        attributes.insert("job_id".to_string(), job.job_id.clone());
        attributes.insert("type".to_string(), kind.type_name().to_string());
        if let ArtifactKind::Resized { variant } = &kind {
            attributes.insert("variant".to_string(), variant.clone());
        }

        let size = data.len();
        let locator = self
            .store
            .put(&path, data, content_type, &attributes)
            .await
            .map_err(|source| UploadError {
                path: path.clone(),
                source,
            })?;

        debug!(
            job_id = %job.job_id,
            path = %path,
            size,
            "Artifact published"
        );
        metrics::counter!("pixelpipe_artifacts_uploaded_total", "type" => kind.type_name())
            .increment(1);

        Ok(locator)
    }
}
