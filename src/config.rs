//! Configuration types for conversion orchestration.
//!
//! All engine behaviour is controlled through [`ConversionConfig`], built via
//! its [`ConversionConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across concurrent requests and to diff two runs
//! to understand why their outcomes differ.
//!
//! # Design choice: explicit over ambient
//! Nothing here is process-global. The router, progress callback and scratch
//! root are carried by the config and threaded through every call, so two
//! engines with different capability tables can coexist in one process (and
//! tests can inject scripted methods without touching global state).

use crate::error::ConvertError;
use crate::format::{Format, FormatCategory};
use crate::pipeline::router::Router;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for conversion requests.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use multiconvert::{ConversionConfig, QualityProfile};
/// use std::time::Duration;
///
/// let config = ConversionConfig::builder()
///     .method_timeout(Duration::from_secs(120))
///     .workers(8)
///     .default_quality(QualityProfile::High)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Largest input file the security gate accepts, in bytes. Default: 500 MiB.
    pub max_input_bytes: u64,

    /// Wall-clock bound for one method attempt. Default: 300 s.
    ///
    /// Office suites occasionally hang on malformed input without ever
    /// exiting. The bound is mandatory; a method may override it through
    /// [`crate::methods::MethodSpec::timeout`].
    pub method_timeout: Duration,

    /// Bound for the `ffprobe` call used to validate media durations. Default: 30 s.
    pub probe_timeout: Duration,

    /// Number of requests a batch runs concurrently. Default: 4.
    ///
    /// Each request still runs its own attempts one at a time; this only
    /// limits how many requests are in flight.
    pub workers: usize,

    /// Parent directory for per-attempt scratch directories and backups.
    /// Default: `$TMPDIR/multiconvert`.
    pub scratch_root: PathBuf,

    /// Quality profile applied when a request does not specify one.
    pub default_quality: QualityProfile,

    /// Extensions the security gate accepts, per declared category.
    /// Default: every known extension of each category.
    pub allowed_extensions: BTreeMap<FormatCategory, BTreeSet<String>>,

    /// Run format-specific structure checks on artifacts (page objects,
    /// archive directories, image dimensions, media durations). Default: true.
    pub deep_validation: bool,

    /// Explicit tool locations, keyed by tool name (`soffice`, `ffmpeg`, …).
    /// Consulted before `PATH` when discovering methods.
    pub tool_paths: BTreeMap<String, PathBuf>,

    /// Pre-built router. When `None`, one is discovered from installed tools.
    pub router: Option<Arc<Router>>,

    /// Optional progress callback receiving request and attempt events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 500 * 1024 * 1024,
            method_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(30),
            workers: 4,
            scratch_root: std::env::temp_dir().join("multiconvert"),
            default_quality: QualityProfile::default(),
            allowed_extensions: default_allowed_extensions(),
            deep_validation: true,
            tool_paths: BTreeMap::new(),
            router: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("max_input_bytes", &self.max_input_bytes)
            .field("method_timeout", &self.method_timeout)
            .field("probe_timeout", &self.probe_timeout)
            .field("workers", &self.workers)
            .field("scratch_root", &self.scratch_root)
            .field("default_quality", &self.default_quality)
            .field("allowed_extensions", &self.allowed_extensions)
            .field("deep_validation", &self.deep_validation)
            .field("tool_paths", &self.tool_paths)
            .field("router", &self.router.as_ref().map(|r| r.method_count()))
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Whether `extension` may be submitted as `category` input.
    pub fn extension_allowed(&self, category: FormatCategory, extension: &str) -> bool {
        self.allowed_extensions
            .get(&category)
            .is_some_and(|set| set.contains(&extension.to_ascii_lowercase()))
    }
}

fn default_allowed_extensions() -> BTreeMap<FormatCategory, BTreeSet<String>> {
    FormatCategory::ALL
        .iter()
        .map(|&c| {
            let exts = c.extensions().into_iter().map(str::to_string).collect();
            (c, exts)
        })
        .collect()
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn max_input_bytes(mut self, n: u64) -> Self {
        self.config.max_input_bytes = n.max(1);
        self
    }

    pub fn max_input_mb(self, mb: u64) -> Self {
        self.max_input_bytes(mb.saturating_mul(1024 * 1024))
    }

    pub fn method_timeout(mut self, d: Duration) -> Self {
        self.config.method_timeout = d.max(Duration::from_millis(10));
        self
    }

    pub fn probe_timeout(mut self, d: Duration) -> Self {
        self.config.probe_timeout = d.max(Duration::from_millis(10));
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn scratch_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = path.into();
        self
    }

    pub fn default_quality(mut self, q: QualityProfile) -> Self {
        self.config.default_quality = q;
        self
    }

    /// Replace the extension allow-list for one category.
    pub fn allowed_extensions<I, S>(mut self, category: FormatCategory, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = exts
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self.config.allowed_extensions.insert(category, set);
        self
    }

    pub fn deep_validation(mut self, v: bool) -> Self {
        self.config.deep_validation = v;
        self
    }

    pub fn tool_path(mut self, tool: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.config.tool_paths.insert(tool.into(), path.into());
        self
    }

    pub fn router(mut self, router: Arc<Router>) -> Self {
        self.config.router = Some(router);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.workers == 0 {
            return Err(ConvertError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        if c.max_input_bytes == 0 {
            return Err(ConvertError::InvalidConfig(
                "Maximum input size must be > 0".into(),
            ));
        }
        if c.method_timeout.is_zero() {
            return Err(ConvertError::InvalidConfig(
                "Method timeout must be > 0".into(),
            ));
        }
        if c.scratch_root.as_os_str().is_empty() {
            return Err(ConvertError::InvalidConfig(
                "Scratch root must not be empty".into(),
            ));
        }
        for (category, exts) in &c.allowed_extensions {
            if let Some(bad) = exts.iter().find(|e| {
                Format::from_extension(e).map(Format::category) != Some(*category)
            }) {
                return Err(ConvertError::InvalidConfig(format!(
                    "'{bad}' is not a known {category} extension"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Quality ──────────────────────────────────────────────────────────────

/// Output quality preset, mapped to concrete encoder settings.
///
/// | Profile | Video CRF | Audio bitrate | JPEG quality | PDF quality |
/// |---------|-----------|---------------|--------------|-------------|
/// | low     | 28        | 64k           | 60           | 30          |
/// | medium  | 23        | 128k          | 80           | 75          |
/// | high    | 18        | 192k          | 90           | 90          |
/// | maximum | 15        | 320k          | 95           | 100         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityProfile {
    Low,
    #[default]
    Medium,
    High,
    Maximum,
}

/// Concrete encoder settings derived from a [`QualityProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySettings {
    /// x264/x265 constant rate factor (lower is better).
    pub video_crf: u8,
    pub audio_bitrate_kbps: u32,
    /// JPEG/WebP encoder quality, 1–100.
    pub image_quality: u8,
    /// PDF export quality, 1–100.
    pub pdf_quality: u8,
}

impl QualityProfile {
    pub fn settings(self) -> QualitySettings {
        let (video_crf, audio_bitrate_kbps, image_quality, pdf_quality) = match self {
            QualityProfile::Low => (28, 64, 60, 30),
            QualityProfile::Medium => (23, 128, 80, 75),
            QualityProfile::High => (18, 192, 90, 90),
            QualityProfile::Maximum => (15, 320, 95, 100),
        };
        QualitySettings {
            video_crf,
            audio_bitrate_kbps,
            image_quality,
            pdf_quality,
        }
    }
}

impl FromStr for QualityProfile {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(QualityProfile::Low),
            "medium" => Ok(QualityProfile::Medium),
            "high" => Ok(QualityProfile::High),
            "maximum" | "max" => Ok(QualityProfile::Maximum),
            other => Err(ConvertError::InvalidConfig(format!(
                "Unknown quality profile '{other}' (expected low, medium, high or maximum)"
            ))),
        }
    }
}
