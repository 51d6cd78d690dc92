//! Image decoding and metadata extraction.

use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{ColorType, DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use crate::models::result::{DominantColor, ImageMetadata};
use crate::services::transcoder::flatten_onto_white;

/// Side of the grid the image is sampled down to for color analysis.
const COLOR_SAMPLE_GRID: u32 = 50;

/// Bits dropped per channel when bucketing colors (16 levels per channel).
const COLOR_BUCKET_SHIFT: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unrecognized image format")]
    UnknownFormat,

    #[error("unsupported image: {0}")]
    Unsupported(String),

    #[error("corrupt image data: {0}")]
    Corrupt(String),
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => DecodeError::Unsupported(e.to_string()),
            image::ImageError::Limits(e) => DecodeError::Unsupported(e.to_string()),
            other => DecodeError::Corrupt(other.to_string()),
        }
    }
}

/// Pixels plus the container facts that decoding discards.
pub struct DecodedImage {
    /// Pixels with the EXIF orientation already applied.
    pub image: DynamicImage,
    pub format: ImageFormat,
    pub color_type: ColorType,
    /// Dimensions as stored, before orientation.
    pub width: u32,
    pub height: u32,
    pub exif: Option<Vec<u8>>,
}

/// Decode `data`, auto-orienting the pixels using embedded orientation data.
pub fn decode_image(data: &[u8]) -> Result<DecodedImage, DecodeError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    let format = reader.format().ok_or(DecodeError::UnknownFormat)?;

    let mut decoder = reader.into_decoder()?;
    let (width, height) = decoder.dimensions();
    let color_type = decoder.color_type();
    // Orientation and EXIF are best effort; a broken tag block never fails the decode.
    let exif = decoder.exif_metadata().ok().flatten();
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);

    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    Ok(DecodedImage {
        image,
        format,
        color_type,
        width,
        height,
        exif,
    })
}

/// Capability to derive [`ImageMetadata`] from encoded bytes.
///
/// CPU bound; callers run it on the blocking pool.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, data: &[u8]) -> Result<ImageMetadata, DecodeError>;
}

/// Default extractor backed by the `image` and `kamadak-exif` crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageMetadataExtractor;

impl MetadataExtractor for ImageMetadataExtractor {
    fn extract(&self, data: &[u8]) -> Result<ImageMetadata, DecodeError> {
        let decoded = decode_image(data)?;
        Ok(describe(&decoded))
    }
}

/// Build metadata for an already decoded image.
pub fn describe(decoded: &DecodedImage) -> ImageMetadata {
    ImageMetadata {
        format: format_name(decoded.format),
        color_mode: color_mode(decoded.color_type),
        width: decoded.width,
        height: decoded.height,
        has_transparency: decoded.color_type.has_alpha(),
        exif: decoded.exif.as_deref().map(exif_tags).unwrap_or_default(),
        dominant_color: dominant_color(&decoded.image),
    }
}

pub fn format_name(format: ImageFormat) -> String {
    format!("{format:?}").to_ascii_lowercase()
}

fn color_mode(color_type: ColorType) -> String {
    match color_type {
        ColorType::L8 => "L".to_string(),
        ColorType::La8 => "LA".to_string(),
        ColorType::Rgb8 => "RGB".to_string(),
        ColorType::Rgba8 => "RGBA".to_string(),
        ColorType::L16 => "L16".to_string(),
        ColorType::La16 => "LA16".to_string(),
        ColorType::Rgb16 => "RGB16".to_string(),
        ColorType::Rgba16 => "RGBA16".to_string(),
        ColorType::Rgb32F => "RGB32F".to_string(),
        ColorType::Rgba32F => "RGBA32F".to_string(),
        other => format!("{other:?}"),
    }
}

/// Primary-IFD EXIF tags rendered as display strings. Unparseable data yields an empty map.
pub fn exif_tags(raw: &[u8]) -> BTreeMap<String, String> {
    let tiff = raw.strip_prefix(b"Exif\0\0").unwrap_or(raw);
    let Ok(exif) = exif::Reader::new().read_raw(tiff.to_vec()) else {
        return BTreeMap::new();
    };

    exif.fields()
        .filter(|field| field.ifd_num == exif::In::PRIMARY)
        .map(|field| {
            (
                field.tag.to_string(),
                field.display_value().with_unit(&exif).to_string(),
            )
        })
        .collect()
}

/// Most frequent color bucket of a coarse downsample, reported as the mean
/// color of the pixels in that bucket.
pub fn dominant_color(image: &DynamicImage) -> Option<DominantColor> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }

    let sample = image.resize_exact(COLOR_SAMPLE_GRID, COLOR_SAMPLE_GRID, FilterType::Nearest);
    let sample = flatten_onto_white(&sample);

    let mut buckets: HashMap<[u8; 3], (u64, [u64; 3])> = HashMap::new();
    for pixel in sample.pixels() {
        let key = pixel.0.map(|c| c >> COLOR_BUCKET_SHIFT);
        let entry = buckets.entry(key).or_insert((0, [0; 3]));
        entry.0 += 1;
        for (sum, channel) in entry.1.iter_mut().zip(pixel.0) {
            *sum += u64::from(channel);
        }
    }

    // Ties go to the lowest bucket so the estimate is deterministic.
    let (_, (count, sums)) = buckets
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.0.cmp(&a.0)))?;

    Some(DominantColor::from_rgb(sums.map(|sum| (sum / count) as u8)))
}
