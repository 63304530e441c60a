//! Conversion categories, normalised format names and output metadata.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Which family of converters handles a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Category {
    Image,
    Document,
    Vector,
}

impl Category {
    /// Formats the category can read or write at all. Configuration may only
    /// narrow the allowed targets to a subset of these.
    pub fn known_formats(&self) -> &'static [&'static str] {
        match self {
            Category::Image => &["png", "jpeg", "webp", "avif", "tiff", "heif", "gif", "bmp"],
            Category::Document => &[
                "pdf", "docx", "doc", "odt", "rtf", "txt", "html", "md", "epub", "xlsx", "ods",
                "pptx", "odp",
            ],
            Category::Vector => &["svg", "pdf", "png", "eps", "ps"],
        }
    }

    /// Allowed target formats when nothing is configured.
    pub fn default_targets(&self) -> &'static [&'static str] {
        match self {
            Category::Image => &["png", "jpeg", "webp", "avif", "tiff", "heif"],
            Category::Document => &["pdf", "docx", "odt", "rtf", "txt", "html"],
            Category::Vector => &["svg", "pdf", "png", "eps"],
        }
    }

    pub fn knows(&self, format: &Format) -> bool {
        self.known_formats().contains(&format.as_str())
    }
}

/// A lower-case, alias-normalised format name (`jpg` → `jpeg`, `tif` → `tiff`).
///
/// Only ASCII alphanumerics survive parsing, so a `Format` is always safe to
/// splice into tool arguments and file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Format(String);

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned = raw.trim().trim_start_matches('.').to_ascii_lowercase();
        if cleaned.is_empty()
            || cleaned.len() > 8
            || !cleaned.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return None;
        }
        let canonical = match cleaned.as_str() {
            "jpg" | "jpe" => "jpeg",
            "tif" => "tiff",
            "heic" => "heif",
            "htm" => "html",
            "markdown" => "md",
            "text" => "txt",
            other => other,
        };
        Some(Self(canonical.to_owned()))
    }

    /// Infer a format from a file name's extension.
    pub fn from_filename(name: &str) -> Option<Self> {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File extension used for outputs of this format.
    pub fn extension(&self) -> &str {
        match self.0.as_str() {
            "jpeg" => "jpg",
            other => other,
        }
    }

    pub fn mime(&self) -> String {
        match self.0.as_str() {
            "avif" => "image/avif".to_owned(),
            "heif" => "image/heif".to_owned(),
            "md" => "text/markdown".to_owned(),
            "eps" => "application/postscript".to_owned(),
            ext => mime_guess::from_ext(ext).first_or_octet_stream().to_string(),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finished conversion: what clients download and what the cache stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedFile {
    pub mime: String,
    pub extension: String,
    pub bytes: Bytes,
}

impl ConvertedFile {
    pub fn new(target: &Format, bytes: impl Into<Bytes>) -> Self {
        Self {
            mime: target.mime(),
            extension: target.extension().to_owned(),
            bytes: bytes.into(),
        }
    }

    /// `report.docx` + pdf → `report.pdf`; nameless uploads become `output.<ext>`.
    pub fn output_filename(&self, original: &str) -> String {
        let stem = Path::new(original)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("output");
        format!("{stem}.{}", self.extension)
    }
}
