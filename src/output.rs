//! Result types returned by the conversion entry points.
//!
//! Everything here is `Serialize` so the CLI can print it as JSON and callers
//! can persist it. A [`ConversionResult`] is the only thing a presentation
//! layer needs: success flag, the chosen method, every attempt in order and
//! the validation findings for the final artifact.

use crate::error::AttemptFailure;
use crate::error::ConvertError;
use crate::format::Format;
use crate::pipeline::signature::Signature;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How serious a validation finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Advisory only; the artifact is still accepted.
    Warning,
    /// The artifact is rejected and the attempt fails.
    Error,
}

/// One structured finding about a produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Machine-readable code, e.g. `empty_artifact`.
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Terminal state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

/// Record of running one conversion method for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionAttempt {
    /// Identifier of the method that ran.
    pub method: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    /// Why the attempt failed. `None` on success.
    pub failure: Option<AttemptFailure>,
    /// Exit status and stderr tail of the method, when it produced any.
    pub diagnostics: Option<String>,
    /// Validator findings for this attempt's artifact.
    pub issues: Vec<ValidationIssue>,
}

impl ConversionAttempt {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Final outcome of one conversion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub request_id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub source_format: Format,
    pub target_format: Format,
    /// True iff some attempt produced an artifact with no validator errors.
    pub success: bool,
    /// Method whose artifact was committed to the destination.
    pub chosen_method: Option<String>,
    /// Every attempt, in the order they ran.
    pub attempts: Vec<ConversionAttempt>,
    /// Issues from the winning attempt, or from the last attempt on failure.
    pub validation_issues: Vec<ValidationIssue>,
    pub total_duration_ms: u64,
}

impl ConversionResult {
    /// Validation warnings attached to the final artifact.
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.validation_issues.iter().filter(|i| !i.is_error())
    }

    /// The attempt that produced the committed artifact.
    pub fn winning_attempt(&self) -> Option<&ConversionAttempt> {
        self.attempts.iter().rev().find(|a| a.is_success())
    }
}

/// Totals for a batch of requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Every method failed.
    pub failed: usize,
    pub cancelled: usize,
    /// Refused before any attempt (security gate, unsupported pair).
    pub rejected: usize,
    /// Infrastructure errors (backup, commit, restore, scratch).
    pub errored: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &Result<ConversionResult, ConvertError>) {
        self.total += 1;
        match outcome {
            Ok(r) if r.success => self.succeeded += 1,
            Ok(_) => self.failed += 1,
            Err(ConvertError::Exhausted { .. }) => self.failed += 1,
            Err(ConvertError::Cancelled { .. }) => self.cancelled += 1,
            Err(e) if e.is_rejection() => self.rejected += 1,
            Err(_) => self.errored += 1,
        }
    }

    pub fn from_outcomes<'a, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = &'a Result<ConversionResult, ConvertError>>,
    {
        let mut summary = Self::default();
        for o in outcomes {
            summary.record(o);
        }
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

/// What the engine knows about a file without converting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReport {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Format inferred from the extension.
    pub declared_format: Option<Format>,
    /// Signature of the leading bytes.
    pub signature: Signature,
    /// Whether the security gate would accept the file.
    pub accepted: bool,
    /// Gate rejection message when `accepted` is false.
    pub rejection: Option<String>,
    /// Targets the router has at least one method for.
    pub targets: Vec<Format>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn result(success: bool) -> ConversionResult {
        ConversionResult {
            request_id: "r".into(),
            source: PathBuf::from("a.txt"),
            destination: PathBuf::from("a.html"),
            source_format: Format::Txt,
            target_format: Format::Html,
            success,
            chosen_method: None,
            attempts: Vec::new(),
            validation_issues: vec![
                ValidationIssue::warning("non_utf8_text", "lossy"),
                ValidationIssue::error("empty_artifact", "zero bytes"),
            ],
            total_duration_ms: 1,
        }
    }

    #[test]
    fn warnings_filter_errors_out() {
        let r = result(true);
        let codes: Vec<_> = r.warnings().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["non_utf8_text"]);
    }

    #[test]
    fn batch_summary_buckets() {
        let outcomes: Vec<Result<ConversionResult, ConvertError>> = vec![
            Ok(result(true)),
            Err(ConvertError::Exhausted {
                result: Box::new(result(false)),
            }),
            Err(ConvertError::Cancelled {
                result: Box::new(result(false)),
            }),
            Err(ConvertError::UnsupportedConversion {
                from: Format::Svg,
                to: Format::Mp3,
                reason: "none".into(),
            }),
            Err(ConvertError::Internal("boom".into())),
        ];
        let s = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(
            s,
            BatchSummary {
                total: 5,
                succeeded: 1,
                failed: 1,
                cancelled: 1,
                rejected: 1,
                errored: 1,
            }
        );
        assert!(!s.all_succeeded());
    }

    #[test]
    fn severity_serialises_lowercase() {
        let json = serde_json::to_string(&ValidationIssue::error("no_pages", "x")).unwrap();
        assert!(json.contains("\"severity\":\"error\""), "got: {json}");
    }
}
