//! Runs one job through download, metadata, upload and derivative stages.
//!
//! Stage order: received → downloading → extracting_metadata →
//! uploading_original → thumbnailing → resizing → completed | failed.
//! Download, required decode and the original upload are mandatory; a failure
//! there ends the job as failed. Thumbnail and resize failures are recorded on
//! the result and the job still completes.

use bytes::Bytes;
use futures::future::join_all;
use image::DynamicImage;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{ErrorKind, PipelineError};
use crate::models::job::{JobDescriptor, JobStatus};
use crate::models::result::{ImageMetadata, PipelineStage, ProcessingResult, ORIGINAL_OUTPUT};
use crate::services::decoder::{DecodedJob, ValidationError};
use crate::services::downloader::{DownloadError, Downloader};
use crate::services::metadata::{ImageMetadataExtractor, MetadataExtractor};
use crate::services::publisher::{ArtifactKind, ArtifactPublisher};
use crate::services::status::JobStateTracker;
use crate::services::storage::ObjectStore;
use crate::services::transcoder::{Rendition, ResizeTargets, Transcoder};

pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// What happens to a job whose every requested derivative failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PartialFailurePolicy {
    /// The job is `completed` as long as the mandatory stages succeeded.
    #[default]
    Complete,
    /// The job is `failed`. The message is still acknowledged.
    Fail,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound for each non-download stage.
    pub stage_timeout: Duration,
    pub partial_failure_policy: PartialFailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            partial_failure_policy: PartialFailurePolicy::default(),
        }
    }
}

/// What the queue should do with the message that carried a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Redeliver,
}

#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub result: ProcessingResult,
    pub disposition: Disposition,
}

/// A mandatory stage failed; the job cannot continue.
struct Abort {
    stage: PipelineStage,
    error: PipelineError,
}

pub struct PipelineOrchestrator {
    downloader: Downloader,
    extractor: Arc<dyn MetadataExtractor>,
    transcoder: Arc<Transcoder>,
    publisher: ArtifactPublisher,
    status: Arc<dyn JobStateTracker>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        downloader: Downloader,
        extractor: Arc<dyn MetadataExtractor>,
        transcoder: Arc<Transcoder>,
        publisher: ArtifactPublisher,
        status: Arc<dyn JobStateTracker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            downloader,
            extractor,
            transcoder,
            publisher,
            status,
            config,
        }
    }

    /// Default collaborators configured from the environment.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn ObjectStore>,
        status: Arc<dyn JobStateTracker>,
    ) -> Result<Self, DownloadError> {
        Ok(Self::new(
            Downloader::new(config.downloader_config())?,
            Arc::new(ImageMetadataExtractor),
            Arc::new(Transcoder::new(config.transcoder_config())),
            ArtifactPublisher::new(store),
            status,
            config.pipeline_config(),
        ))
    }

    pub fn status_tracker(&self) -> &Arc<dyn JobStateTracker> {
        &self.status
    }

    /// Queue path: record `processing`, run the job, persist the terminal record.
    ///
    /// Stage failures are inside the returned result. `Err` means the terminal
    /// record could not be stored.
    pub async fn process(&self, decoded: &DecodedJob) -> Result<ProcessingOutcome, PipelineError> {
        let job = &decoded.job;
        if let Err(e) = self.status.mark_processing(job).await {
            warn!(job_id = %job.job_id, error = %e, "Failed to record processing status");
        }

        let outcome = self.execute(decoded).await;

        self.status
            .record_terminal(&outcome.result)
            .await
            .map_err(|e| {
                PipelineError::Unexpected(format!("failed to record terminal status: {e}"))
            })?;

        Ok(outcome)
    }

    /// Persist a failed record for a payload that did not validate.
    ///
    /// Returns the stored result, or `None` when the payload carried no job_id.
    pub async fn record_rejection(
        &self,
        rejection: &ValidationError,
    ) -> Result<Option<ProcessingResult>, PipelineError> {
        let Some(job_id) = rejection.job_id() else {
            return Ok(None);
        };

        let result = ProcessingResult::rejected(
            job_id,
            rejection.image_id().unwrap_or_default(),
            rejection.url().unwrap_or_default(),
            rejection.to_string(),
        );
        self.status
            .record_terminal(&result)
            .await
            .map_err(|e| {
                PipelineError::Unexpected(format!("failed to record rejection: {e}"))
            })?;
        metrics::counter!("pixelpipe_jobs_total", "status" => JobStatus::Failed.to_string())
            .increment(1);

        Ok(Some(result))
    }

    /// Run every stage for `decoded` without touching the status store.
    pub async fn execute(&self, decoded: &DecodedJob) -> ProcessingOutcome {
        let started = Instant::now();
        let job = &decoded.job;

        let mut result = ProcessingResult::start(job);
        result.warnings.extend(decoded.warnings.iter().cloned());

        info!(
            job_id = %job.job_id,
            image_id = %job.image_id,
            url = %job.url,
            priority = %job.priority,
            "Processing image job"
        );

        let (status, disposition) = match self.run_stages(job, &mut result).await {
            Ok(requested) => {
                let status = if self.config.partial_failure_policy == PartialFailurePolicy::Fail
                    && requested > 0
                    && result.derivative_count() == 0
                {
                    warn!(
                        job_id = %job.job_id,
                        requested,
                        "Every requested derivative failed"
                    );
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                (status, Disposition::Ack)
            }
            Err(Abort { stage, error }) => {
                error!(
                    job_id = %job.job_id,
                    image_id = %job.image_id,
                    stage = %stage,
                    error = %error,
                    "Mandatory stage failed"
                );
                result.record_error(stage, error.kind(), error.to_string());
                let disposition = if error.is_retryable() {
                    Disposition::Redeliver
                } else {
                    Disposition::Ack
                };
                (JobStatus::Failed, disposition)
            }
        };

        let elapsed = started.elapsed();
        let result = result.finalize(status, elapsed);

        metrics::counter!("pixelpipe_jobs_total", "status" => status.to_string()).increment(1);
        metrics::histogram!("pixelpipe_job_duration_seconds").record(elapsed.as_secs_f64());

        info!(
            job_id = %result.job_id,
            image_id = %result.image_id,
            status = %result.status,
            outputs = result.outputs.len(),
            errors = result.errors.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Image job finished"
        );

        ProcessingOutcome {
            result,
            disposition,
        }
    }

    /// Returns the number of derivatives requested.
    async fn run_stages(
        &self,
        job: &JobDescriptor,
        result: &mut ProcessingResult,
    ) -> Result<usize, Abort> {
        let options = &job.processing_options;

        // Downloading: bounded by the downloader's own timeout.
        self.enter(job, PipelineStage::Downloading);
        let (data, download) = self.downloader.fetch(&job.url).await.map_err(|e| {
            let reason = e.reason_code();
            warn!(job_id = %job.job_id, url = %job.url, reason, error = %e, "Download failed");
            metrics::counter!("pixelpipe_download_failures_total", "reason" => reason).increment(1);
            abort(PipelineStage::Downloading, e.into())
        })?;
        metrics::counter!("pixelpipe_download_bytes_total").increment(download.content_length);
        let content_type = download.content_type.clone();
        result.metadata.download = Some(download);

        // Extracting metadata: decoding is mandatory only when pixels are needed later.
        self.enter(job, PipelineStage::ExtractingMetadata);
        let image = if options.requires_decode() {
            let transcoder = self.transcoder.clone();
            let decoded = self
                .within(PipelineStage::ExtractingMetadata, async {
                    flatten(transcoder.decode_async(data.clone()).await)
                })
                .await
                .map_err(|e| abort(PipelineStage::ExtractingMetadata, e))?;
            Some(Arc::new(decoded))
        } else {
            None
        };

        if options.extract_metadata {
            match self.extract_metadata(data.clone()).await {
                Ok(metadata) => result.metadata.image = Some(metadata),
                Err(e) => {
                    self.record_soft_failure(job, result, PipelineStage::ExtractingMetadata, &e)
                }
            }
        }

        // Uploading original.
        self.enter(job, PipelineStage::UploadingOriginal);
        let locator = self
            .within(
                PipelineStage::UploadingOriginal,
                self.publisher
                    .publish(job, ArtifactKind::Original, data.to_vec(), &content_type),
            )
            .await
            .map_err(|e| abort(PipelineStage::UploadingOriginal, e))?;
        result.add_output(ORIGINAL_OUTPUT, locator);

        let targets = ResizeTargets::from_options(options);
        let requested = usize::from(options.create_thumbnail) + targets.target_count();
        for token in &targets.unsupported {
            warn!(job_id = %job.job_id, format = %token, "Skipping unsupported output format");
            result
                .warnings
                .push(format!("unsupported output format '{token}' skipped"));
        }

        let Some(image) = image else {
            return Ok(requested);
        };

        if options.create_thumbnail {
            self.enter(job, PipelineStage::Thumbnailing);
            self.thumbnail(job, result, image.clone()).await;
        }

        if !targets.is_empty() {
            self.enter(job, PipelineStage::Resizing);
            self.resize(job, result, image, &targets).await;
        }

        Ok(requested)
    }

    async fn extract_metadata(&self, data: Bytes) -> Result<ImageMetadata, PipelineError> {
        let extractor = self.extractor.clone();
        self.within(PipelineStage::ExtractingMetadata, async move {
            let extracted = tokio::task::spawn_blocking(move || extractor.extract(&data)).await;
            flatten(extracted)
        })
        .await
    }

    async fn thumbnail(
        &self,
        job: &JobDescriptor,
        result: &mut ProcessingResult,
        image: Arc<DynamicImage>,
    ) {
        let stage = PipelineStage::Thumbnailing;
        let transcoder = self.transcoder.clone();
        let rendition = self
            .within(stage, async move {
                flatten(transcoder.thumbnail_async(image).await)
            })
            .await;

        match rendition {
            Ok(rendition) => {
                self.publish_rendition(job, result, stage, ArtifactKind::Thumbnail, rendition)
                    .await
            }
            Err(e) => self.record_soft_failure(job, result, stage, &e),
        }
    }

    async fn resize(
        &self,
        job: &JobDescriptor,
        result: &mut ProcessingResult,
        image: Arc<DynamicImage>,
        targets: &ResizeTargets,
    ) {
        let stage = PipelineStage::Resizing;
        let transcoder = self.transcoder.clone();
        let outcomes = match self
            .within(stage, async move {
                Ok::<_, PipelineError>(transcoder.resize_all_async(image, targets).await)
            })
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.record_soft_failure(job, result, stage, &e);
                return;
            }
        };

        let mut renditions = Vec::new();
        for (size, outcome) in targets.sizes.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => {
                    for failure in outcome.failures {
                        warn!(
                            job_id = %job.job_id,
                            target = %failure.target,
                            error = %failure.error,
                            "Resize target failed"
                        );
                        result.record_error(stage, ErrorKind::Encode, failure.error.to_string());
                    }
                    renditions.extend(outcome.renditions);
                }
                Err(e) => {
                    let e = PipelineError::from(e);
                    warn!(job_id = %job.job_id, size = %size, error = %e, "Resize task failed");
                    result.record_error(stage, e.kind(), e.to_string());
                }
            }
        }

        let uploads = renditions.into_iter().map(|rendition| async move {
            let kind = ArtifactKind::Resized {
                variant: rendition.key.clone(),
            };
            let info = rendition.info();
            let key = rendition.key.clone();
            let uploaded = self
                .within(
                    stage,
                    self.publisher
                        .publish(job, kind, rendition.data, rendition.format.content_type()),
                )
                .await;
            (key, info, uploaded)
        });

        for (key, info, uploaded) in join_all(uploads).await {
            match uploaded {
                Ok(locator) => {
                    result.metadata.renditions.insert(key.clone(), info);
                    result.add_output(key, locator);
                }
                Err(e) => self.record_soft_failure(job, result, stage, &e),
            }
        }
    }

    async fn publish_rendition(
        &self,
        job: &JobDescriptor,
        result: &mut ProcessingResult,
        stage: PipelineStage,
        kind: ArtifactKind,
        rendition: Rendition,
    ) {
        let info = rendition.info();
        let content_type = rendition.format.content_type();
        let uploaded = self
            .within(
                stage,
                self.publisher.publish(job, kind, rendition.data, content_type),
            )
            .await;

        match uploaded {
            Ok(locator) => {
                result.metadata.renditions.insert(rendition.key.clone(), info);
                result.add_output(rendition.key, locator);
            }
            Err(e) => self.record_soft_failure(job, result, stage, &e),
        }
    }

    fn record_soft_failure(
        &self,
        job: &JobDescriptor,
        result: &mut ProcessingResult,
        stage: PipelineStage,
        error: &PipelineError,
    ) {
        warn!(
            job_id = %job.job_id,
            stage = %stage,
            error = %error,
            "Optional stage failed"
        );
        result.record_error(stage, error.kind(), error.to_string());
    }

    fn enter(&self, job: &JobDescriptor, stage: PipelineStage) {
        debug!(job_id = %job.job_id, image_id = %job.image_id, stage = %stage, "Entering stage");
    }

    /// Bound `fut` by the stage timeout.
    async fn within<T, E>(
        &self,
        stage: PipelineStage,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, PipelineError>
    where
        E: Into<PipelineError>,
    {
        match tokio::time::timeout(self.config.stage_timeout, fut).await {
            Ok(outcome) => outcome.map_err(Into::into),
            Err(_) => Err(PipelineError::Timeout {
                stage,
                secs: self.config.stage_timeout.as_secs(),
            }),
        }
    }
}

fn abort(stage: PipelineStage, error: PipelineError) -> Abort {
    Abort { stage, error }
}

/// Collapse a blocking task's join result into the pipeline error space.
fn flatten<T, E>(joined: Result<Result<T, E>, tokio::task::JoinError>) -> Result<T, PipelineError>
where
    E: Into<PipelineError>,
{
    joined?.map_err(Into::into)
}
