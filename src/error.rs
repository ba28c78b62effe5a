//! Error types for the multiconvert library.
//!
//! Two distinct error families reflect two distinct failure modes:
//!
//! * [`ConvertError`]: **Fatal**: the request cannot produce a converted
//!   file (rejected input, unsupported format pair, every method failed,
//!   infrastructure I/O). Returned as `Err(ConvertError)` from the top-level
//!   `convert*` functions.
//!
//! * [`AttemptFailure`]: **Non-fatal**: one conversion method failed (crash,
//!   timeout, invalid output) but the next candidate may still succeed.
//!   Recorded inside [`crate::output::ConversionAttempt`] and never thrown on
//!   its own.
//!
//! The separation lets the orchestrator keep going after a bad method while
//! still giving callers the full history when the whole request fails:
//! [`ConvertError::Exhausted`] and [`ConvertError::Cancelled`] carry the
//! [`ConversionResult`] with every attempt.

use crate::format::{Format, FormatCategory};
use crate::output::ConversionResult;
use crate::pipeline::signature::Signature;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the multiconvert library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Pre-flight errors ─────────────────────────────────────────────────
    /// The security gate rejected the input file.
    #[error("Input rejected: {0}")]
    Security(#[from] SecurityError),

    /// No method is registered for this format pair.
    #[error(
        "Cannot convert {from} to {to}: {reason}\nRun `multiconvert --list-methods` to see supported routes."
    )]
    UnsupportedConversion {
        from: Format,
        to: Format,
        reason: String,
    },

    /// The destination cannot be written as a file (e.g. it is a directory).
    #[error("Invalid destination '{path}': {reason}")]
    InvalidDestination { path: PathBuf, reason: String },

    // ── Conversion outcome errors ─────────────────────────────────────────
    /// Every candidate method failed. The destination has been restored.
    #[error("{}", exhausted_message(.result))]
    Exhausted { result: Box<ConversionResult> },

    /// The request was cancelled. The destination has been restored.
    #[error(
        "Conversion of '{}' was cancelled after {} attempt(s)",
        .result.source.display(),
        .result.attempts.len()
    )]
    Cancelled { result: Box<ConversionResult> },

    // ── Infrastructure errors ─────────────────────────────────────────────
    /// Restoring the destination from its backup failed.
    ///
    /// Distinct from a conversion failure: the destination may now be in an
    /// unknown state and needs operator attention. `after` is the error that
    /// triggered the restore, with its attempt history intact, and the
    /// previous content stays at `snapshot`.
    #[error(
        "Failed to restore '{path}' from backup: {source}\nThe previous content was kept at '{snapshot}'.\nRestore was needed because: {after}"
    )]
    RestoreFailed {
        path: PathBuf,
        snapshot: PathBuf,
        #[source]
        source: std::io::Error,
        after: Box<ConvertError>,
    },

    /// Copying a validated artifact to the destination failed.
    #[error("Failed to write output file '{path}': {source}")]
    CommitFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        result: Box<ConversionResult>,
    },

    /// Snapshotting the existing destination failed.
    #[error("Failed to back up existing file '{path}': {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The scratch root could not be created or used.
    #[error("Scratch directory '{path}' is unavailable: {source}\nSet --scratch-dir to a writable location.")]
    ScratchUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// The attempt history, for errors raised after attempts started.
    pub fn result(&self) -> Option<&ConversionResult> {
        match self {
            ConvertError::Exhausted { result }
            | ConvertError::Cancelled { result }
            | ConvertError::CommitFailed { result, .. } => Some(result),
            ConvertError::RestoreFailed { after, .. } => after.result(),
            _ => None,
        }
    }

    /// Consume the error and return its attempt history, if any.
    pub fn into_result(self) -> Option<ConversionResult> {
        match self {
            ConvertError::Exhausted { result }
            | ConvertError::Cancelled { result }
            | ConvertError::CommitFailed { result, .. } => Some(*result),
            ConvertError::RestoreFailed { after, .. } => after.into_result(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConvertError::Cancelled { .. })
    }

    /// Rejected before any method ran (security gate or routing).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ConvertError::Security(_)
                | ConvertError::UnsupportedConversion { .. }
                | ConvertError::InvalidDestination { .. }
        )
    }
}

fn exhausted_message(result: &ConversionResult) -> String {
    let mut msg = format!(
        "All {} conversion method(s) failed for '{}' ({} → {})",
        result.attempts.len(),
        result.source.display(),
        result.source_format,
        result.target_format
    );
    for attempt in &result.attempts {
        if let Some(ref failure) = attempt.failure {
            msg.push_str(&format!("\n  • {failure}"));
        }
    }
    msg
}

/// Why the security gate refused an input file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    NotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// Path exists but is a directory, socket, device, etc.
    #[error("'{path}' is not a regular file")]
    NotAFile { path: PathBuf },

    /// Reading the file failed for another reason.
    #[error("Failed to read '{path}': {detail}")]
    Unreadable { path: PathBuf, detail: String },

    #[error("'{path}' is empty")]
    Empty { path: PathBuf },

    #[error("'{path}' is {size} bytes, above the {limit}-byte limit\nRaise it with --max-size-mb.")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    /// The extension names no supported format, so there is no category to
    /// check it against.
    #[error("'{path}' has an unknown format (extension '{extension}')\nPass the source format explicitly or run `multiconvert --list-methods`.")]
    UnknownFormat { path: PathBuf, extension: String },

    /// The extension is not on the allow-list for the declared category.
    #[error("Extension '{extension}' of '{path}' is not allowed for {category} input")]
    ExtensionNotAllowed {
        path: PathBuf,
        extension: String,
        category: FormatCategory,
    },

    /// Content bytes disagree with the declared format.
    #[error("'{path}' was declared as {declared} but its content looks like {detected}")]
    SignatureMismatch {
        path: PathBuf,
        declared: Format,
        detected: Signature,
    },

    /// Content is a native executable or script.
    #[error("'{path}' contains executable content and will not be processed")]
    ExecutableContent { path: PathBuf },

    /// Binary content with no recognised signature.
    #[error("'{path}' has unrecognised content\nFirst bytes: {magic:?}")]
    UnrecognisedContent { path: PathBuf, magic: [u8; 4] },
}

/// A non-fatal failure of a single conversion attempt.
///
/// Stored inside [`crate::output::ConversionAttempt`]. The orchestrator moves
/// on to the next candidate method unless none remain.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// The method crashed, exited non-zero, or produced nothing.
    #[error("{method}: method failed: {detail}")]
    MethodFailed { method: String, detail: String },

    /// The method exceeded its wall-clock bound and was killed.
    #[error("{method}: timed out after {after_ms}ms")]
    Timeout { method: String, after_ms: u64 },

    /// The method reported success but its output failed validation.
    #[error("{method}: output failed validation ({})", .codes.join(", "))]
    Validation { method: String, codes: Vec<String> },

    /// The request was cancelled while this method was running.
    #[error("{method}: cancelled")]
    Cancelled { method: String },
}

impl AttemptFailure {
    pub fn method(&self) -> &str {
        match self {
            AttemptFailure::MethodFailed { method, .. }
            | AttemptFailure::Timeout { method, .. }
            | AttemptFailure::Validation { method, .. }
            | AttemptFailure::Cancelled { method } => method,
        }
    }
}

/// Error returned by a single method invocation.
///
/// Converted into [`AttemptFailure::MethodFailed`] by the executor.
#[derive(Debug, Error)]
pub enum MethodError {
    /// The external program could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program exited unsuccessfully.
    #[error("'{program}' exited with {status}")]
    ExitStatus { program: String, status: String },

    /// The method finished but left no artifact where expected.
    #[error("no output produced (looked for '{expected}')")]
    NoArtifact { expected: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other method-specific failure.
    #[error("{0}")]
    Failed(String),
}
