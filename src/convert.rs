//! Conversion entry points.
//!
//! ## Which one?
//!
//! | Function                | Use when                                             |
//! |-------------------------|------------------------------------------------------|
//! | [`convert`]             | one request, run to completion                       |
//! | [`convert_cancellable`] | one request, caller holds a cancellation token       |
//! | [`spawn`]               | one request in the background, cancel via the handle |
//! | [`convert_batch`]       | many requests, bounded by `workers`, summarised      |
//! | [`crate::stream::convert_stream`] | many requests, results as they finish      |
//! | [`convert_sync`]        | no async runtime at hand                             |
//! | [`convert_from_bytes`]  | the input is in memory                               |
//! | [`inspect`]             | what is this file and what can it become?            |
//!
//! Every entry point resolves the router the same way: the pre-built one on
//! the config if present, otherwise one discovered from installed tools.

use crate::config::ConversionConfig;
use crate::error::{ConvertError, SecurityError};
use crate::format::Format;
use crate::orchestrator::FallbackOrchestrator;
use crate::output::{BatchSummary, ConversionResult, InspectReport};
use crate::pipeline::router::Router;
use crate::pipeline::security::SecurityGate;
use crate::pipeline::signature::sniff_file;
use crate::request::ConversionRequest;
use futures::stream::{self, StreamExt};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Convert one file.
///
/// # Returns
/// `Ok(ConversionResult)` once a method's output passed validation and was
/// written to the destination.
///
/// # Errors
/// - [`ConvertError::Security`] / [`ConvertError::UnsupportedConversion`]:
///   rejected before any attempt, destination untouched.
/// - [`ConvertError::Exhausted`]: every method failed; the error carries
///   the attempt history and the destination has been restored.
/// - Infrastructure errors (backup, commit, restore, scratch).
///
/// # Example
/// ```rust,no_run
/// use multiconvert::{convert, ConversionConfig, ConversionRequest, Format};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let request = ConversionRequest::new("report.docx", "report.pdf", Format::Pdf)?;
/// let result = convert(&request, &ConversionConfig::default()).await?;
/// println!("converted with {:?}", result.chosen_method);
/// # Ok(())
/// # }
/// ```
pub async fn convert(
    request: &ConversionRequest,
    config: &ConversionConfig,
) -> Result<ConversionResult, ConvertError> {
    convert_cancellable(request, config, &CancellationToken::new()).await
}

/// Convert one file, stopping when `cancel` fires.
///
/// Cancellation kills the running method, removes its scratch directory,
/// restores the destination and returns [`ConvertError::Cancelled`].
pub async fn convert_cancellable(
    request: &ConversionRequest,
    config: &ConversionConfig,
    cancel: &CancellationToken,
) -> Result<ConversionResult, ConvertError> {
    let router = resolve_router(config)?;
    FallbackOrchestrator::new(config, router)
        .run(request, cancel)
        .await
}

/// A request running on the tokio runtime.
#[derive(Debug)]
pub struct ConversionTask {
    handle: JoinHandle<Result<ConversionResult, ConvertError>>,
    cancel: CancellationToken,
}

impl ConversionTask {
    /// Ask the request to stop. [`ConversionTask::join`] still has to be
    /// awaited for the destination to be restored.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the request's outcome.
    pub async fn join(self) -> Result<ConversionResult, ConvertError> {
        self.handle
            .await
            .map_err(|e| ConvertError::Internal(format!("conversion task failed: {e}")))?
    }
}

/// Run a request in the background.
pub fn spawn(request: ConversionRequest, config: ConversionConfig) -> ConversionTask {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle =
        tokio::spawn(async move { convert_cancellable(&request, &config, &token).await });
    ConversionTask { handle, cancel }
}

/// Convert many files, at most `config.workers` at a time.
///
/// Outcomes are returned in request order. Each request gets a child of
/// `cancel`, so cancelling it stops the whole batch.
pub async fn convert_batch(
    requests: Vec<ConversionRequest>,
    config: &ConversionConfig,
    cancel: &CancellationToken,
) -> Result<(Vec<Result<ConversionResult, ConvertError>>, BatchSummary), ConvertError> {
    let router = resolve_router(config)?;
    let orchestrator = FallbackOrchestrator::new(config, router);
    let total = requests.len();
    info!("Starting batch of {} request(s), {} worker(s)", total, config.workers);

    let mut outcomes: Vec<(usize, Result<ConversionResult, ConvertError>)> =
        stream::iter(requests.into_iter().enumerate().map(|(idx, request)| {
            let orchestrator = &orchestrator;
            let token = cancel.child_token();
            async move { (idx, orchestrator.run(&request, &token).await) }
        }))
        .buffer_unordered(config.workers)
        .collect()
        .await;
    outcomes.sort_by_key(|(idx, _)| *idx);

    let outcomes: Vec<_> = outcomes.into_iter().map(|(_, o)| o).collect();
    let summary = BatchSummary::from_outcomes(&outcomes);
    info!(
        "Batch complete: {}/{} succeeded, {} failed, {} rejected, {} cancelled",
        summary.succeeded, summary.total, summary.failed, summary.rejected, summary.cancelled
    );
    Ok((outcomes, summary))
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    request: &ConversionRequest,
    config: &ConversionConfig,
) -> Result<ConversionResult, ConvertError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ConvertError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(request, config))
}

/// Convert in-memory input to `destination`.
///
/// The bytes are written to a managed temp file carrying the source format's
/// extension, so the security gate sees them exactly as it would a file on
/// disk. The temp file is removed on return.
pub async fn convert_from_bytes(
    bytes: &[u8],
    source_format: Format,
    destination: impl Into<PathBuf>,
    target: Format,
    config: &ConversionConfig,
) -> Result<ConversionResult, ConvertError> {
    let mut tmp = tempfile::Builder::new()
        .prefix("input-")
        .suffix(&format!(".{}", source_format.extension()))
        .tempfile()
        .map_err(|e| ConvertError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| ConvertError::Internal(format!("tempfile write: {e}")))?;
    tmp.flush()
        .map_err(|e| ConvertError::Internal(format!("tempfile write: {e}")))?;

    let request = ConversionRequest::new(tmp.path(), destination, target)?.source_format(source_format);
    // `tmp` is dropped (and the file deleted) when `convert` returns
    convert(&request, config).await
}

/// Describe a file without converting it.
///
/// Reports its size, the format its extension declares, the signature of its
/// leading bytes, whether the security gate would accept it, and which
/// targets the router can reach from it.
pub async fn inspect(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<InspectReport, ConvertError> {
    let path = path.as_ref();
    let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SecurityError::NotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => SecurityError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => SecurityError::Unreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })?;

    let owned = path.to_path_buf();
    let declared_format = Format::from_path(path);
    let gate = SecurityGate::from_config(config);
    let (signature, verdict) = tokio::task::spawn_blocking(move || {
        let signature = sniff_file(&owned)?;
        let verdict = declared_format.map(|format| gate.check(&owned, format));
        Ok::<_, std::io::Error>((signature, verdict))
    })
    .await
    .map_err(|e| ConvertError::Internal(format!("sniff task failed: {e}")))?
    .map_err(|e| SecurityError::Unreadable {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let (accepted, rejection, targets) = match (declared_format, verdict) {
        (Some(format), Some(Ok(_))) => {
            let router = resolve_router(config)?;
            (true, None, router.targets_for(format))
        }
        (_, Some(Err(e))) => (false, Some(e.to_string()), Vec::new()),
        _ => (false, Some("unknown file extension".to_string()), Vec::new()),
    };
    debug!(
        "Inspected {}: {} bytes, signature {}, accepted {}",
        path.display(),
        meta.len(),
        signature,
        accepted
    );

    Ok(InspectReport {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        declared_format,
        signature,
        accepted,
        rejection,
        targets,
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// The router for `config`: the pre-built one if set, else discovered.
pub fn resolve_router(config: &ConversionConfig) -> Result<Arc<Router>, ConvertError> {
    if let Some(ref router) = config.router {
        return Ok(Arc::clone(router));
    }
    Router::discover(config).map(Arc::new)
}
