//! Error taxonomy shared by the pipeline stages.
//!
//! Each service owns its own error type; [`PipelineError`] gathers them so the
//! orchestrator can decide, per failure, whether the job fails and whether the
//! queue should redeliver the message.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::models::result::PipelineStage;
use crate::services::decoder::ValidationError;
use crate::services::downloader::DownloadError;
use crate::services::metadata::DecodeError;
use crate::services::publisher::UploadError;
use crate::services::transcoder::EncodeError;

/// Stable error category recorded in results and logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Download,
    Decode,
    Encode,
    Upload,
    Timeout,
    Unexpected,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("{stage} stage timed out after {secs}s")]
    Timeout { stage: PipelineStage, secs: u64 },

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Download(DownloadError::Timeout { .. }) => ErrorKind::Timeout,
            PipelineError::Download(_) => ErrorKind::Download,
            PipelineError::Decode(_) => ErrorKind::Decode,
            PipelineError::Encode(_) => ErrorKind::Encode,
            PipelineError::Upload(_) => ErrorKind::Upload,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Whether redelivering the same message could succeed.
    ///
    /// Malformed jobs and undecodable images fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Validation(_) | PipelineError::Decode(_) | PipelineError::Encode(_)
        )
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Unexpected(format!("worker task failed: {err}"))
    }
}
