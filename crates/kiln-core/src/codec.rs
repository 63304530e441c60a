//! In-process raster conversion on top of the `image` crate.
//!
//! Decoding and encoding are CPU-bound, so they run inside
//! `tokio::task::spawn_blocking`. Formats the crate cannot write here (AVIF,
//! HEIF) are routed to the external tool adapter instead.

use std::collections::BTreeMap;
use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use crate::error::ConvertError;
use crate::format::{ConvertedFile, Format};

const MAX_DIMENSION: u32 = 16_384;
const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Options understood by the raster codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageOptions {
    pub quality: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ImageOptions {
    /// Parse `quality`, `width` and `height`. Unknown keys are rejected so
    /// typos do not silently produce a different cache entry.
    pub fn from_map(options: &BTreeMap<String, String>) -> Result<Self, ConvertError> {
        let mut parsed = ImageOptions::default();
        for (name, value) in options {
            match name.as_str() {
                "quality" => parsed.quality = Some(parse_in(name, value, 1, 100)? as u8),
                "width" => parsed.width = Some(parse_in(name, value, 1, MAX_DIMENSION)?),
                "height" => parsed.height = Some(parse_in(name, value, 1, MAX_DIMENSION)?),
                other => {
                    return Err(ConvertError::BadRequest(format!(
                        "unknown image option '{other}'; allowed: quality, width, height"
                    )));
                }
            }
        }
        Ok(parsed)
    }
}

fn parse_in(name: &str, value: &str, min: u32, max: u32) -> Result<u32, ConvertError> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|v| (min..=max).contains(v))
        .ok_or_else(|| {
            ConvertError::BadRequest(format!("option '{name}' must be an integer in {min}..={max}"))
        })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl ImageCodec {
    /// Formats this codec can both read and write.
    pub const FORMATS: &'static [&'static str] = &["png", "jpeg", "webp", "tiff", "gif", "bmp"];

    pub fn handles(format: &Format) -> bool {
        Self::FORMATS.contains(&format.as_str())
    }

    /// Whether a `from → to` pair stays in-process.
    pub fn supports(from: &Format, to: &Format) -> bool {
        Self::handles(from) && Self::handles(to)
    }

    pub async fn convert(
        &self,
        input: Bytes,
        to: Format,
        options: ImageOptions,
    ) -> Result<ConvertedFile, ConvertError> {
        tokio::task::spawn_blocking(move || transcode(&input, &to, options))
            .await
            .map_err(|_| ConvertError::ConversionFailed("image codec task panicked".into()))?
    }
}

fn image_format(format: &Format) -> Option<ImageFormat> {
    Some(match format.as_str() {
        "png" => ImageFormat::Png,
        "jpeg" => ImageFormat::Jpeg,
        "webp" => ImageFormat::WebP,
        "tiff" => ImageFormat::Tiff,
        "gif" => ImageFormat::Gif,
        "bmp" => ImageFormat::Bmp,
        _ => return None,
    })
}

fn transcode(input: &[u8], to: &Format, options: ImageOptions) -> Result<ConvertedFile, ConvertError> {
    let target = image_format(to)
        .ok_or_else(|| ConvertError::BadRequest(format!("image codec cannot write '{to}'")))?;
    let decoded = image::load_from_memory(input)
        .map_err(|e| ConvertError::ConversionFailed(format!("could not decode image: {e}")))?;
    let resized = resize(decoded, options);

    let mut out = Vec::new();
    let written = match target {
        ImageFormat::Jpeg => {
            let quality = options.quality.unwrap_or(DEFAULT_JPEG_QUALITY);
            JpegEncoder::new_with_quality(&mut out, quality).encode_image(&resized.to_rgb8())
        }
        // These encoders only accept 8-bit RGB(A).
        ImageFormat::WebP | ImageFormat::Gif | ImageFormat::Bmp => {
            DynamicImage::ImageRgba8(resized.to_rgba8()).write_to(&mut Cursor::new(&mut out), target)
        }
        _ => resized.write_to(&mut Cursor::new(&mut out), target),
    };
    written.map_err(|e| ConvertError::ConversionFailed(format!("could not encode {to}: {e}")))?;

    Ok(ConvertedFile::new(to, out))
}

fn resize(image: DynamicImage, options: ImageOptions) -> DynamicImage {
    let (w, h) = (image.width().max(1), image.height().max(1));
    let (nw, nh) = match (options.width, options.height) {
        (None, None) => return image,
        // Both given: fit inside the box.
        (Some(bw), Some(bh)) if u64::from(w) * u64::from(bh) <= u64::from(h) * u64::from(bw) => {
            (scale(w, bh, h), bh)
        }
        (Some(bw), Some(_)) => (bw, scale(h, bw, w)),
        (Some(nw), None) => (nw, scale(h, nw, w)),
        (None, Some(nh)) => (scale(w, nh, h), nh),
    };
    if (nw, nh) == (w, h) {
        return image;
    }
    image.resize_exact(nw, nh, FilterType::Lanczos3)
}

/// `side * num / den`, rounded, never zero.
fn scale(side: u32, num: u32, den: u32) -> u32 {
    let scaled = (u64::from(side) * u64::from(num) + u64::from(den) / 2) / u64::from(den);
    scaled.clamp(1, u64::from(MAX_DIMENSION)) as u32
}
