//! Thumbnail and resized-variant generation.
//!
//! Everything here is CPU bound. The async wrappers at the bottom move the
//! work onto tokio's blocking pool so decoding and encoding never stall the
//! I/O side of the pipeline.

use futures::future::join_all;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, Rgb, RgbImage};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::models::job::ProcessingOptions;
use crate::models::result::{RenditionInfo, THUMBNAIL_OUTPUT};
use crate::services::metadata::{decode_image, DecodeError};

/// Largest accepted side of a requested bounding box.
pub const MAX_TARGET_DIMENSION: u32 = 10_000;

/// Codecs the pipeline can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(ascii_case_insensitive)]
pub enum OutputFormat {
    #[strum(to_string = "jpeg", serialize = "jpg")]
    Jpeg,
    #[strum(to_string = "webp")]
    Webp,
    #[strum(to_string = "png")]
    Png,
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Png => "image/png",
        }
    }

    pub fn supports_alpha(self) -> bool {
        !matches!(self, OutputFormat::Jpeg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid size '{0}': expected WxH with positive integers")]
    InvalidSize(String),

    #[error("failed to encode {format}: {reason}")]
    Encode {
        format: OutputFormat,
        reason: String,
    },
}

/// A requested `WxH` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub width: u32,
    pub height: u32,
}

impl FromStr for BoundingBox {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EncodeError::InvalidSize(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        let in_range = |v: u32| (1..=MAX_TARGET_DIMENSION).contains(&v);
        if !in_range(width) || !in_range(height) {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Target dimensions for one resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub width: u32,
    pub height: u32,
}

/// Aspect-fit `src_w`×`src_h` into `bounds`.
///
/// The side whose ratio is tighter is clamped to its bound; the other is
/// scaled proportionally and floored. Integer arithmetic keeps exact ratios
/// exact (1600×1200 into 800×600 is 800×600, not 799×600).
pub fn plan_resize(src_w: u32, src_h: u32, bounds: BoundingBox) -> ResizePlan {
    let (sw, sh) = (u64::from(src_w.max(1)), u64::from(src_h.max(1)));
    let (bw, bh) = (u64::from(bounds.width), u64::from(bounds.height));

    if sw * bh > bw * sh {
        ResizePlan {
            width: bounds.width,
            height: ((bw * sh) / sw).max(1) as u32,
        }
    } else {
        ResizePlan {
            width: ((bh * sw) / sh).max(1) as u32,
            height: bounds.height,
        }
    }
}

/// Like [`plan_resize`] into a `side`×`side` square, but never upscales.
pub fn plan_thumbnail(src_w: u32, src_h: u32, side: u32) -> ResizePlan {
    if src_w <= side && src_h <= side {
        return ResizePlan {
            width: src_w,
            height: src_h,
        };
    }
    plan_resize(
        src_w,
        src_h,
        BoundingBox {
            width: side,
            height: side,
        },
    )
}

/// Composite any alpha channel over opaque white.
pub fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let a = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * a + 255 * (255 - a) + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Encode `image` as `format`. `quality` applies to lossy codecs only.
pub fn encode(
    image: &DynamicImage,
    format: OutputFormat,
    quality: u8,
) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    let written = match format {
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(flatten_onto_white(image))
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality)),
        OutputFormat::Png => match image.color() {
            ColorType::Rgb32F | ColorType::Rgba32F => DynamicImage::ImageRgba16(image.to_rgba16())
                .write_with_encoder(PngEncoder::new(&mut buf)),
            _ => image.write_with_encoder(PngEncoder::new(&mut buf)),
        },
        // The webp encoder is lossless and only takes 8-bit RGB(A).
        OutputFormat::Webp => {
            let image = if image.color().has_alpha() {
                DynamicImage::ImageRgba8(image.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(image.to_rgb8())
            };
            image.write_with_encoder(WebPEncoder::new_lossless(&mut buf))
        }
    };
    written.map_err(|e| EncodeError::Encode {
        format,
        reason: e.to_string(),
    })?;
    Ok(buf)
}

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Side of the square the thumbnail must fit in.
    pub thumbnail_size: u32,
    pub thumbnail_quality: u8,
    /// Quality for lossy resized variants.
    pub quality: u8,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 150,
            thumbnail_quality: 80,
            quality: 85,
        }
    }
}

/// One encoded derivative ready for upload.
#[derive(Debug, Clone)]
pub struct Rendition {
    /// Output key: `thumbnail` or `{WxH}_{format}`.
    pub key: String,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Rendition {
    pub fn info(&self) -> RenditionInfo {
        RenditionInfo {
            width: self.width,
            height: self.height,
            size_bytes: self.data.len(),
            content_type: self.format.content_type().to_string(),
        }
    }
}

/// A resize target that could not be produced.
#[derive(Debug)]
pub struct TargetFailure {
    pub target: String,
    pub error: EncodeError,
}

/// Everything produced for one requested size.
#[derive(Debug, Default)]
pub struct SizeOutcome {
    pub renditions: Vec<Rendition>,
    pub failures: Vec<TargetFailure>,
}

/// The resize work a job asks for, with duplicates and unknown codecs removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResizeTargets {
    pub sizes: Vec<String>,
    pub formats: Vec<OutputFormat>,
    /// Codec tokens that were requested but are not supported.
    pub unsupported: Vec<String>,
}

impl ResizeTargets {
    pub fn from_options(options: &ProcessingOptions) -> Self {
        let mut seen = HashSet::new();
        let sizes = options
            .resize_formats
            .iter()
            .filter(|size| {
                // Equal boxes spelled differently are one target.
                let key = match BoundingBox::from_str(size) {
                    Ok(bounds) => bounds.to_string(),
                    Err(_) => size.trim().to_ascii_lowercase(),
                };
                seen.insert(key)
            })
            .cloned()
            .collect();

        let mut formats = Vec::new();
        let mut unsupported = Vec::new();
        for token in &options.output_formats {
            match OutputFormat::from_str(token.trim()) {
                Ok(format) if !formats.contains(&format) => formats.push(format),
                Ok(_) => {}
                Err(_) => unsupported.push(token.clone()),
            }
        }

        Self {
            sizes,
            formats,
            unsupported,
        }
    }

    /// Number of (size, format) pairs that will be attempted.
    pub fn target_count(&self) -> usize {
        self.sizes.len() * self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target_count() == 0
    }
}

/// Produces thumbnails and resized variants.
pub struct Transcoder {
    config: TranscoderConfig,
}

impl Transcoder {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(TranscoderConfig::default())
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    /// Decode and auto-orient source bytes.
    pub fn decode(&self, data: &[u8]) -> Result<DynamicImage, DecodeError> {
        decode_image(data).map(|decoded| decoded.image)
    }

    /// Square-bounded JPEG thumbnail of an already oriented image.
    pub fn thumbnail(&self, image: &DynamicImage) -> Result<Rendition, EncodeError> {
        let plan = plan_thumbnail(image.width(), image.height(), self.config.thumbnail_size);
        let resized = self.resample(image, plan);
        let data = encode(&resized, OutputFormat::Jpeg, self.config.thumbnail_quality)?;

        debug!(
            width = plan.width,
            height = plan.height,
            size = data.len(),
            "Thumbnail generated"
        );

        Ok(Rendition {
            key: THUMBNAIL_OUTPUT.to_string(),
            format: OutputFormat::Jpeg,
            width: plan.width,
            height: plan.height,
            data,
        })
    }

    /// Resize once for `size` and encode the result in every format.
    ///
    /// Failures are per target; one bad codec does not lose the others.
    pub fn resize(
        &self,
        image: &DynamicImage,
        size: &str,
        formats: &[OutputFormat],
    ) -> SizeOutcome {
        let mut outcome = SizeOutcome::default();

        let bounds = match BoundingBox::from_str(size) {
            Ok(bounds) => bounds,
            Err(error) => {
                outcome.failures.push(TargetFailure {
                    target: size.to_string(),
                    error,
                });
                return outcome;
            }
        };

        let plan = plan_resize(image.width(), image.height(), bounds);
        let resized = self.resample(image, plan);

        for &format in formats {
            let key = format!("{bounds}_{format}");
            match encode(&resized, format, self.config.quality) {
                Ok(data) => outcome.renditions.push(Rendition {
                    key,
                    format,
                    width: plan.width,
                    height: plan.height,
                    data,
                }),
                Err(error) => outcome.failures.push(TargetFailure { target: key, error }),
            }
        }

        outcome
    }

    fn resample(&self, image: &DynamicImage, plan: ResizePlan) -> DynamicImage {
        if (image.width(), image.height()) == (plan.width, plan.height) {
            image.clone()
        } else {
            image.resize_exact(plan.width, plan.height, FilterType::Lanczos3)
        }
    }

    /// Decode on the blocking pool.
    pub async fn decode_async(
        self: Arc<Self>,
        data: bytes::Bytes,
    ) -> Result<Result<DynamicImage, DecodeError>, tokio::task::JoinError> {
        tokio::task::spawn_blocking(move || self.decode(&data)).await
    }

    /// Generate the thumbnail on the blocking pool.
    pub async fn thumbnail_async(
        self: Arc<Self>,
        image: Arc<DynamicImage>,
    ) -> Result<Result<Rendition, EncodeError>, tokio::task::JoinError> {
        tokio::task::spawn_blocking(move || self.thumbnail(&image)).await
    }

    /// Resize for every size in parallel, one blocking task per size.
    ///
    /// Results come back in the order of `targets.sizes`.
    pub async fn resize_all_async(
        self: Arc<Self>,
        image: Arc<DynamicImage>,
        targets: &ResizeTargets,
    ) -> Vec<Result<SizeOutcome, tokio::task::JoinError>> {
        let handles = targets.sizes.iter().map(|size| {
            let transcoder = self.clone();
            let image = image.clone();
            let size = size.clone();
            let formats = targets.formats.clone();
            tokio::task::spawn_blocking(move || transcoder.resize(&image, &size, &formats))
        });
        join_all(handles).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    fn bounds(width: u32, height: u32) -> BoundingBox {
        BoundingBox { width, height }
    }

    fn dims(width: u32, height: u32) -> ResizePlan {
        ResizePlan { width, height }
    }

    #[test]
    fn test_plan_resize_matching_ratio() {
        assert_eq!(plan_resize(1600, 1200, bounds(800, 600)), dims(800, 600));
        assert_eq!(plan_resize(1600, 1200, bounds(400, 300)), dims(400, 300));
    }

    #[test]
    fn test_plan_resize_wider_source_clamps_width() {
        let plan = plan_resize(1000, 333, bounds(400, 300));
        assert_eq!(plan, dims(400, 133));
    }

    #[test]
    fn test_plan_resize_taller_source_clamps_height() {
        let plan = plan_resize(1200, 1600, bounds(800, 600));
        assert_eq!(plan, dims(450, 600));
    }

    #[test]
    fn test_plan_resize_invariant() {
        let sources = [
            (1600, 1200),
            (1200, 1600),
            (1, 1),
            (4000, 3),
            (3, 4000),
            (333, 777),
            (1920, 1080),
        ];
        let boxes = [
            (800, 600),
            (400, 300),
            (200, 150),
            (150, 150),
            (1, 1),
            (1000, 10),
        ];

        for &(sw, sh) in &sources {
            for &(bw, bh) in &boxes {
                let plan = plan_resize(sw, sh, bounds(bw, bh));
                assert!(
                    plan.width <= bw && plan.height <= bh,
                    "{sw}x{sh} into {bw}x{bh}: {plan:?}"
                );
                assert!(plan.width >= 1 && plan.height >= 1);
                if plan.width == bw {
                    let expected = ((u64::from(bw) * u64::from(sh)) / u64::from(sw)).max(1) as u32;
                    assert_eq!(plan.height, expected);
                } else {
                    assert_eq!(plan.height, bh);
                    let expected = ((u64::from(bh) * u64::from(sw)) / u64::from(sh)).max(1) as u32;
                    assert_eq!(plan.width, expected);
                }
            }
        }
    }

    #[test]
    fn test_plan_thumbnail_never_upscales() {
        assert_eq!(plan_thumbnail(100, 50, 150), dims(100, 50));
        assert_eq!(plan_thumbnail(1000, 500, 150), dims(150, 75));
        assert_eq!(plan_thumbnail(500, 1000, 150), dims(75, 150));
        assert_eq!(plan_thumbnail(150, 150, 150), dims(150, 150));
    }

    #[test]
    fn test_bounding_box_parsing() {
        assert_eq!("800x600".parse::<BoundingBox>().unwrap(), bounds(800, 600));
        assert_eq!(
            " 800X600 ".parse::<BoundingBox>().unwrap(),
            bounds(800, 600)
        );
        assert_eq!(bounds(800, 600).to_string(), "800x600");

        let invalid = [
            "800", "0x600", "800x0", "axb", "800x600x2", "-1x5", "", "20000x10",
        ];
        for bad in invalid {
            assert!(
                bad.parse::<BoundingBox>().is_err(),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn test_output_format_tokens() {
        assert_eq!(OutputFormat::from_str("JPG").unwrap(), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::from_str("jpeg").unwrap(), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::from_str("WebP").unwrap(), OutputFormat::Webp);
        assert!(OutputFormat::from_str("tiff").is_err());
        assert_eq!(OutputFormat::Jpeg.to_string(), "jpeg");
    }

    #[test]
    fn test_resize_targets_dedupe_and_skip_unsupported() {
        let options = ProcessingOptions {
            create_thumbnail: false,
            extract_metadata: false,
            resize_formats: vec!["800x600".into(), "800X600".into(), "400x300".into()],
            output_formats: vec!["jpeg".into(), "bmp".into(), "JPG".into(), "png".into()],
        };

        let targets = ResizeTargets::from_options(&options);
        assert_eq!(targets.sizes, vec!["800x600", "400x300"]);
        assert_eq!(targets.formats, vec![OutputFormat::Jpeg, OutputFormat::Png]);
        assert_eq!(targets.unsupported, vec!["bmp"]);
        assert_eq!(targets.target_count(), 4);
    }

    #[test]
    fn test_resize_targets_dedupe_on_parsed_bounds() {
        let options = ProcessingOptions {
            create_thumbnail: false,
            extract_metadata: false,
            resize_formats: vec![
                "800x600".into(),
                "0800x600".into(),
                " 800 x 0600 ".into(),
                "huge".into(),
                "HUGE".into(),
                "0x600".into(),
            ],
            output_formats: vec!["png".into()],
        };

        let targets = ResizeTargets::from_options(&options);
        assert_eq!(targets.sizes, vec!["800x600", "huge", "0x600"]);
        assert_eq!(targets.target_count(), 3);
    }

    #[test]
    fn test_flatten_composites_on_white() {
        let mut rgba = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 255]));

        let flat = flatten_onto_white(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(flat.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(flat.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_thumbnail_fits_box_and_is_jpeg() {
        let pixels = RgbaImage::from_pixel(600, 300, Rgba([10, 200, 10, 128]));
        let source = DynamicImage::ImageRgba8(pixels);
        let thumb = Transcoder::with_defaults().thumbnail(&source).unwrap();

        assert_eq!(thumb.key, "thumbnail");
        assert_eq!((thumb.width, thumb.height), (150, 75));
        let decoded = image::load_from_memory(&thumb.data).unwrap();
        assert_eq!(decoded.dimensions(), (150, 75));
        assert!(!decoded.color().has_alpha());
    }

    #[test]
    fn test_resize_encodes_every_format() {
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(1600, 1200, Rgb([90, 60, 30])));
        let formats = [OutputFormat::Jpeg, OutputFormat::Webp, OutputFormat::Png];

        let outcome = Transcoder::with_defaults().resize(&source, "400x300", &formats);
        assert!(outcome.failures.is_empty());

        let keys: Vec<_> = outcome.renditions.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["400x300_jpeg", "400x300_webp", "400x300_png"]);
        for rendition in &outcome.renditions {
            let decoded = image::load_from_memory(&rendition.data).unwrap();
            assert_eq!(decoded.dimensions(), (400, 300), "{}", rendition.key);
        }
    }

    #[test]
    fn test_resize_invalid_size_is_a_target_failure() {
        let source = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let outcome = Transcoder::with_defaults().resize(&source, "big", &[OutputFormat::Jpeg]);

        assert!(outcome.renditions.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].target, "big");
    }
}
