//! In-memory collaborators and image fixtures shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{
    DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pixelpipe::models::job::{JobDescriptor, JobStatus};
use pixelpipe::models::result::ProcessingResult;
use pixelpipe::services::downloader::{Downloader, DownloaderConfig};
use pixelpipe::services::metadata::ImageMetadataExtractor;
use pixelpipe::services::pipeline::{PipelineConfig, PipelineOrchestrator};
use pixelpipe::services::publisher::ArtifactPublisher;
use pixelpipe::services::queue::{envelope_for, Delivery, MessageQueue, QueueError};
use pixelpipe::services::status::{JobRecord, JobStateTracker, StatusCounts, StatusError};
use pixelpipe::services::storage::{ObjectStore, StorageError};
use pixelpipe::services::transcoder::{Transcoder, TranscoderConfig};

pub const TEST_BUCKET: &str = "test-bucket";

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    puts: Mutex<usize>,
    /// Keys containing this fragment fail to upload.
    fail_matching: Mutex<Option<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_keys_containing(&self, fragment: &str) {
        *self.fail_matching.lock().unwrap() = Some(fragment.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn put_count(&self) -> usize {
        *self.puts.lock().unwrap()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, StorageError> {
        if let Some(fragment) = self.fail_matching.lock().unwrap().as_deref() {
            if key.contains(fragment) {
                return Err(StorageError::Status(503));
            }
        }

        *self.puts.lock().unwrap() += 1;
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                attributes: attributes.clone(),
            },
        );
        Ok(self.locator(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.object(key)
            .map(|object| object.data)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn locator(&self, key: &str) -> String {
        format!("s3://{TEST_BUCKET}/{key}")
    }
}

// ---------------------------------------------------------------------------
// Status store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, JobRecord>>,
    /// Every status written, in order.
    transitions: Mutex<Vec<(String, JobStatus)>>,
    unavailable: AtomicBool,
    reject_terminal: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call fail, as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only terminal writes fail.
    pub fn reject_terminal_writes(&self) {
        self.reject_terminal.store(true, Ordering::SeqCst);
    }

    pub fn transitions(&self) -> Vec<(String, JobStatus)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.records.lock().unwrap().get(job_id).cloned()
    }

    /// Insert a record directly, for stats tests.
    pub fn seed(&self, job_id: &str, status: JobStatus) {
        let now = Utc::now();
        self.records.lock().unwrap().insert(
            job_id.to_string(),
            JobRecord {
                job_id: job_id.to_string(),
                image_id: format!("img-{job_id}"),
                batch_id: None,
                status,
                retry_count: 0,
                result: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    fn check(&self) -> Result<(), StatusError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StatusError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStateTracker for MemoryStatusStore {
    async fn mark_processing(&self, job: &JobDescriptor) -> Result<(), StatusError> {
        self.check()?;
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let record = records.entry(job.job_id.clone()).or_insert_with(|| JobRecord {
            job_id: job.job_id.clone(),
            image_id: job.image_id.clone(),
            batch_id: job.batch_id.clone(),
            status: JobStatus::Processing,
            retry_count: job.retry_count as i32,
            result: None,
            created_at: now,
            updated_at: now,
        });
        record.status = JobStatus::Processing;
        record.updated_at = now;
        self.transitions
            .lock()
            .unwrap()
            .push((job.job_id.clone(), JobStatus::Processing));
        Ok(())
    }

    async fn record_terminal(&self, result: &ProcessingResult) -> Result<(), StatusError> {
        self.check()?;
        if self.reject_terminal.load(Ordering::SeqCst) {
            return Err(StatusError::Unavailable("write rejected".to_string()));
        }
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let record = records.entry(result.job_id.clone()).or_insert_with(|| JobRecord {
            job_id: result.job_id.clone(),
            image_id: result.image_id.clone(),
            batch_id: None,
            status: result.status,
            retry_count: 0,
            result: None,
            created_at: now,
            updated_at: now,
        });
        record.status = result.status;
        record.result = Some(result.clone());
        record.updated_at = now;
        self.transitions
            .lock()
            .unwrap()
            .push((result.job_id.clone(), result.status));
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StatusError> {
        self.check()?;
        Ok(self.record(job_id))
    }

    async fn status_counts(&self, sample_limit: i64) -> Result<StatusCounts, StatusError> {
        self.check()?;
        let mut records: Vec<JobRecord> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut counts = StatusCounts::default();
        for record in records.into_iter().take(sample_limit.max(0) as usize) {
            counts.total_jobs += 1;
            match record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StatusError> {
        self.check()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<String>>,
    in_flight: Mutex<Vec<String>>,
    acked: Mutex<Vec<Delivery>>,
    nacked: Mutex<Vec<Delivery>>,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a raw stored payload (envelope or bare job JSON).
    pub fn push_raw(&self, raw: impl Into<String>) {
        self.pending.lock().unwrap().push_back(raw.into());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn acked(&self) -> Vec<Delivery> {
        self.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<Delivery> {
        self.nacked.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn remove_in_flight(&self, raw: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(pos) = in_flight.iter().position(|entry| entry == raw) {
            in_flight.remove(pos);
        }
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, job: &JobDescriptor) -> Result<String, QueueError> {
        self.check()?;
        let envelope = envelope_for(job)?;
        self.push_raw(serde_json::to_string(&envelope)?);
        Ok(envelope.message_id)
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        self.check()?;
        let raw = self.pending.lock().unwrap().pop_front();
        Ok(raw.map(|raw| {
            self.in_flight.lock().unwrap().push(raw.clone());
            Delivery::from_raw(raw)
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.remove_in_flight(&delivery.raw);
        self.acked.lock().unwrap().push(delivery.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.remove_in_flight(&delivery.raw);
        self.nacked.lock().unwrap().push(delivery.clone());
        self.push_raw(serde_json::to_string(&delivery.redelivery())?);
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check()
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Opaque RGB gradient, so resampling has real content to work on.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    }))
}

/// Half-transparent RGBA image.
pub fn translucent(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([20, 120, 220, 96]),
    ))
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Jpeg)
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Png)
}

/// Big-endian TIFF block holding a single Orientation (0x0112) tag.
pub fn exif_orientation(orientation: u16) -> Vec<u8> {
    let mut tiff = b"MM\x00\x2a\x00\x00\x00\x08".to_vec();
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0112u16.to_be_bytes());
    tiff.extend_from_slice(&3u16.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0, 0]);
    tiff.extend_from_slice(&0u32.to_be_bytes());
    tiff
}

/// JPEG of a `width`×`height` gradient as stored, tagged with an EXIF orientation.
pub fn oriented_jpeg(width: u32, height: u32, orientation: u16) -> Vec<u8> {
    let pixels = gradient(width, height).to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, 90);
    encoder
        .set_exif_metadata(exif_orientation(orientation))
        .unwrap();
    encoder
        .write_image(pixels.as_raw(), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    buf
}

pub fn dimensions(data: &[u8]) -> (u32, u32) {
    let image = image::load_from_memory(data).unwrap();
    (image.width(), image.height())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Serve `body` at `route` on `server` with the given content type.
pub async fn serve_image(server: &MockServer, route: &str, body: Vec<u8>, content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body, content_type),
        )
        .mount(server)
        .await;
}

pub struct Harness {
    pub store: Arc<MemoryObjectStore>,
    pub status: Arc<MemoryStatusStore>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

pub fn harness() -> Harness {
    harness_with(DownloaderConfig::default(), PipelineConfig::default())
}

pub fn harness_with(downloader: DownloaderConfig, pipeline: PipelineConfig) -> Harness {
    let store = MemoryObjectStore::new();
    let status = MemoryStatusStore::new();
    let orchestrator = PipelineOrchestrator::new(
        Downloader::new(downloader).unwrap(),
        Arc::new(ImageMetadataExtractor),
        Arc::new(Transcoder::new(TranscoderConfig::default())),
        ArtifactPublisher::new(store.clone()),
        status.clone(),
        pipeline,
    );
    Harness {
        store,
        status,
        orchestrator: Arc::new(orchestrator),
    }
}

pub fn short_timeout() -> DownloaderConfig {
    DownloaderConfig {
        timeout: Duration::from_millis(300),
        ..DownloaderConfig::default()
    }
}

/// Job against `url` with the given sizes and formats.
pub fn job(
    job_id: &str,
    image_id: &str,
    url: &str,
    sizes: &[&str],
    formats: &[&str],
) -> JobDescriptor {
    let mut job = JobDescriptor::new(job_id, image_id, url);
    job.processing_options.resize_formats = sizes.iter().map(|s| s.to_string()).collect();
    job.processing_options.output_formats = formats.iter().map(|s| s.to_string()).collect();
    job
}
