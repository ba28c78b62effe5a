//! # multiconvert
//!
//! Convert files between document, image, audio and video formats by trying
//! a prioritised chain of conversion methods until one produces output that
//! actually validates.
//!
//! ## Why this crate?
//!
//! Every converter fails somewhere. LibreOffice hangs on a malformed DOCX,
//! OnlyOffice cannot write legacy `.doc`, ffmpeg exits 0 with an empty
//! container. Instead of trusting one tool, this crate routes each format
//! pair to an ordered list of methods, runs them one at a time in throwaway
//! scratch directories with a hard time limit, checks every artifact itself,
//! and never leaves the destination half-written: either a validated file
//! lands there, or whatever was there before is put back.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Gate      size, extension allow-list, content signature
//!  ├─ 2. Route     (source, target) → [method, method, …] by priority
//!  ├─ 3. Backup    snapshot an existing destination
//!  ├─ 4. Execute   one method, own scratch dir, timeout, kill on drop
//!  ├─ 5. Validate  signature + structure of the artifact
//!  │      └─ fail? → next method (4)
//!  └─ 6. Commit    atomic rename into place, or restore the backup
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use multiconvert::{convert, ConversionConfig, ConversionRequest, Format};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Methods are discovered from the tools installed on PATH.
//!     let config = ConversionConfig::default();
//!     let request = ConversionRequest::new("slides.pptx", "slides.pdf", Format::Pdf)?;
//!     let result = convert(&request, &config).await?;
//!     eprintln!(
//!         "{} after {} attempt(s)",
//!         result.chosen_method.unwrap_or_default(),
//!         result.attempts.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `multiconvert` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! multiconvert = { version = "0.3", default-features = false }
//! ```
//!
//! ## External Tools
//!
//! | Tool | Used for |
//! |------|----------|
//! | OnlyOffice `docbuilder` | office documents (preferred) |
//! | LibreOffice `soffice` | office documents, PDF import, SVG |
//! | poppler `pdftotext` | PDF → text |
//! | `ffmpeg` / `ffprobe` | audio, video, images; media duration checks |
//!
//! None is required: raster images and simple text formats have built-in
//! methods, and routes whose tools are missing are simply not registered.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod format;
pub mod methods;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod request;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder, QualityProfile, QualitySettings};
pub use convert::{
    convert, convert_batch, convert_cancellable, convert_from_bytes, convert_sync, inspect,
    spawn, ConversionTask,
};
pub use error::{AttemptFailure, ConvertError, MethodError, SecurityError};
pub use format::{Format, FormatCategory};
pub use methods::{BuiltinMethod, CommandTemplate, MethodId, MethodJob, MethodSpec};
pub use orchestrator::FallbackOrchestrator;
pub use output::{
    AttemptOutcome, BatchSummary, ConversionAttempt, ConversionResult, InspectReport, Severity,
    ValidationIssue,
};
pub use pipeline::router::{Router, RouterBuilder};
pub use pipeline::signature::Signature;
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use request::ConversionRequest;
pub use stream::convert_stream;
pub use tokio_util::sync::CancellationToken;
