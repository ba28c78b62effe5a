//! The immutable description of one conversion job.

use crate::config::QualityProfile;
use crate::error::ConvertError;
use crate::format::Format;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to convert, where to, and how.
///
/// Fields are private: once built, a request cannot change while the
/// orchestrator works on it.
///
/// # Example
/// ```rust
/// use multiconvert::{ConversionRequest, Format, QualityProfile};
///
/// let req = ConversionRequest::into_dir("report.pdf", "out/", Format::Docx)
///     .unwrap()
///     .quality(QualityProfile::High);
/// assert_eq!(req.destination().to_str(), Some("out/report.docx"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    id: String,
    source: PathBuf,
    destination: PathBuf,
    source_format: Format,
    target_format: Format,
    quality: Option<QualityProfile>,
}

impl ConversionRequest {
    /// Convert `source` into `destination` as `target`.
    ///
    /// The source format is inferred from the source extension; override it
    /// with [`ConversionRequest::source_format`].
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        target: Format,
    ) -> Result<Self, ConvertError> {
        let source = source.into();
        let source_format = infer_format(&source)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            destination: destination.into(),
            source_format,
            target_format: target,
            quality: None,
        })
    }

    /// Convert `source` into `out_dir/{stem}.{target extension}`.
    pub fn into_dir(
        source: impl Into<PathBuf>,
        out_dir: impl AsRef<Path>,
        target: Format,
    ) -> Result<Self, ConvertError> {
        let source = source.into();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConvertError::InvalidDestination {
                path: source.clone(),
                reason: "source has no file name to derive the output name from".into(),
            })?;
        let destination = out_dir
            .as_ref()
            .join(format!("{stem}.{}", target.extension()));
        Self::new(source, destination, target)
    }

    /// Declare the source format explicitly instead of trusting the extension.
    pub fn source_format(mut self, format: Format) -> Self {
        self.source_format = format;
        self
    }

    pub fn quality(mut self, quality: QualityProfile) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Use a caller-supplied identifier (e.g. a job id from a queue).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn declared_source_format(&self) -> Format {
        self.source_format
    }

    pub fn target_format(&self) -> Format {
        self.target_format
    }

    /// Profile for this request, falling back to `default`.
    pub fn quality_or(&self, default: QualityProfile) -> QualityProfile {
        self.quality.unwrap_or(default)
    }
}

fn infer_format(source: &Path) -> Result<Format, ConvertError> {
    Format::from_path(source).ok_or_else(|| {
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        ConvertError::Security(crate::error::SecurityError::UnknownFormat {
            path: source.to_path_buf(),
            extension: ext,
        })
    })
}
