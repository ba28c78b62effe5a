//! The fallback state machine.
//!
//! ```text
//!  Idle ──▶ Routing ──▶ Attempting ──▶ Validating ──▶ Succeeded
//!                 │          ▲  │            │
//!                 │          │  ▼            ▼
//!                 │         Retrying ◀───────┘
//!                 │             │
//!                 ▼             ▼
//!             Cancelled     Exhausted
//! ```
//!
//! One orchestrator drives one request at a time: the gate, then the router,
//! then a destination snapshot, then each candidate method in priority order
//! until one produces an artifact the validator accepts. The first accepted
//! artifact is committed and the loop stops. If every method fails, or the
//! request is cancelled, the destination is put back exactly as it was.
//!
//! Attempts within a request never overlap, and no method runs twice.

use crate::config::ConversionConfig;
use crate::error::{AttemptFailure, ConvertError};
use crate::methods::{MethodJob, MethodSpec};
use crate::output::{AttemptOutcome, ConversionAttempt, ConversionResult, ValidationIssue};
use crate::pipeline::backup::{replace_atomically, Backup, BackupManager};
use crate::pipeline::executor::{ExecutionOutcome, MethodExecutor, ScratchDir};
use crate::pipeline::router::Router;
use crate::pipeline::security::SecurityGate;
use crate::pipeline::validate::OutputValidator;
use crate::progress::{ConversionProgressCallback, NoopProgressCallback};
use crate::request::ConversionRequest;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Routing,
    Attempting,
    Validating,
    Retrying,
    Succeeded,
    Exhausted,
    Cancelled,
}

impl State {
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Idle, Routing)
                | (Routing, Attempting)
                | (Routing, Cancelled)
                | (Attempting, Validating)
                | (Attempting, Retrying)
                | (Attempting, Cancelled)
                | (Validating, Succeeded)
                | (Validating, Retrying)
                | (Retrying, Attempting)
                | (Retrying, Exhausted)
                | (Retrying, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Exhausted | State::Cancelled)
    }
}

struct Machine {
    state: State,
}

impl Machine {
    fn new() -> Self {
        Self { state: State::Idle }
    }

    fn advance(&mut self, next: State) -> Result<(), ConvertError> {
        if !self.state.can_transition_to(next) {
            return Err(ConvertError::Internal(format!(
                "invalid state transition {:?} → {:?}",
                self.state, next
            )));
        }
        debug!("State {:?} → {:?}", self.state, next);
        self.state = next;
        Ok(())
    }
}

enum ChainEnd {
    Succeeded { method: String },
    Exhausted,
    Cancelled,
    /// A validated artifact could not be moved onto the destination.
    CommitFailed { source: std::io::Error },
}

/// Drives requests through gate, router, backup and the fallback loop.
pub struct FallbackOrchestrator {
    config: ConversionConfig,
    router: Arc<Router>,
    gate: SecurityGate,
    validator: OutputValidator,
    backups: BackupManager,
    executor: MethodExecutor,
}

impl FallbackOrchestrator {
    pub fn new(config: &ConversionConfig, router: Arc<Router>) -> Self {
        Self {
            gate: SecurityGate::from_config(config),
            validator: OutputValidator::from_config(config),
            backups: BackupManager::new(&config.scratch_root),
            executor: MethodExecutor::new(),
            router,
            config: config.clone(),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Process one request to its single outcome.
    ///
    /// # Errors
    /// Rejections ([`ConvertError::Security`],
    /// [`ConvertError::UnsupportedConversion`],
    /// [`ConvertError::InvalidDestination`]) happen before any attempt.
    /// [`ConvertError::Exhausted`], [`ConvertError::Cancelled`] and
    /// [`ConvertError::CommitFailed`] carry the attempt history; the
    /// destination has been restored in all three cases. If that restore
    /// fails, [`ConvertError::RestoreFailed`] wraps the original error.
    pub async fn run(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, ConvertError> {
        let span = info_span!("convert", request = %request.id());
        async {
            let outcome = self.drive(request, cancel).await;
            let (success, attempts) = match &outcome {
                Ok(r) => (r.success, r.attempts.len()),
                Err(e) => (false, e.result().map_or(0, |r| r.attempts.len())),
            };
            self.callback()
                .on_request_complete(request.id(), success, attempts);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, ConvertError> {
        let started = Instant::now();
        let mut machine = Machine::new();
        let source_format = request.declared_source_format();
        let target_format = request.target_format();
        info!(
            "Converting {} ({} → {})",
            request.source().display(),
            source_format,
            target_format
        );

        // ── Step 1: Security gate ────────────────────────────────────────
        let gate = self.gate.clone();
        let source = request.source().to_path_buf();
        tokio::task::spawn_blocking(move || gate.check(&source, source_format))
            .await
            .map_err(|e| ConvertError::Internal(format!("security check failed: {e}")))??;
        machine.advance(State::Routing)?;

        // ── Step 2: Route ────────────────────────────────────────────────
        let chain = self.router.route(source_format, target_format)?;

        // ── Step 3: Destination sanity ───────────────────────────────────
        check_destination(request.source(), request.destination()).await?;

        // ── Step 4: Scratch root ─────────────────────────────────────────
        tokio::fs::create_dir_all(&self.config.scratch_root)
            .await
            .map_err(|e| ConvertError::ScratchUnavailable {
                path: self.config.scratch_root.clone(),
                source: e,
            })?;

        // ── Step 5: Snapshot the destination ─────────────────────────────
        let backup = self.backups.snapshot(request.destination()).await?;

        self.callback()
            .on_request_start(request.id(), request.source(), chain.len());

        // ── Step 6: Fallback loop ────────────────────────────────────────
        let mut attempts = Vec::with_capacity(chain.len());
        let mut final_issues = Vec::new();
        let end = self
            .attempt_chain(
                request,
                &chain,
                cancel,
                &mut machine,
                &mut attempts,
                &mut final_issues,
            )
            .await;

        // ── Step 7: Settle the destination ───────────────────────────────
        let chosen_method = match &end {
            Ok(ChainEnd::Succeeded { method }) => Some(method.clone()),
            _ => None,
        };
        let result = Box::new(ConversionResult {
            request_id: request.id().to_string(),
            source: request.source().to_path_buf(),
            destination: request.destination().to_path_buf(),
            source_format,
            target_format,
            success: chosen_method.is_some(),
            chosen_method,
            attempts,
            validation_issues: final_issues,
            total_duration_ms: started.elapsed().as_millis() as u64,
        });

        let failure = match end {
            Ok(ChainEnd::Succeeded { method }) => {
                if let Some(b) = backup {
                    self.backups.discard(b);
                }
                info!(
                    "Converted with {} after {} attempt(s) in {}ms",
                    method,
                    result.attempts.len(),
                    result.total_duration_ms
                );
                return Ok(*result);
            }
            Ok(ChainEnd::Exhausted) => {
                warn!("All {} method(s) failed", result.attempts.len());
                ConvertError::Exhausted { result }
            }
            Ok(ChainEnd::Cancelled) => {
                info!("Cancelled after {} attempt(s)", result.attempts.len());
                ConvertError::Cancelled { result }
            }
            Ok(ChainEnd::CommitFailed { source }) => {
                warn!(
                    "Could not write {}: {}",
                    request.destination().display(),
                    source
                );
                ConvertError::CommitFailed {
                    path: request.destination().to_path_buf(),
                    source,
                    result,
                }
            }
            Err(e) => e,
        };
        Err(self.restore_after(backup, failure).await)
    }

    async fn attempt_chain(
        &self,
        request: &ConversionRequest,
        chain: &[Arc<MethodSpec>],
        cancel: &CancellationToken,
        machine: &mut Machine,
        attempts: &mut Vec<ConversionAttempt>,
        final_issues: &mut Vec<ValidationIssue>,
    ) -> Result<ChainEnd, ConvertError> {
        let total = chain.len();
        let quality = request.quality_or(self.config.default_quality).settings();
        let cb = self.callback();

        for (i, spec) in chain.iter().enumerate() {
            if cancel.is_cancelled() {
                machine.advance(State::Cancelled)?;
                return Ok(ChainEnd::Cancelled);
            }
            machine.advance(State::Attempting)?;

            let method = spec.id.to_string();
            cb.on_attempt_start(request.id(), &method, i + 1, total);
            debug!("Attempt {}/{}: {}", i + 1, total, method);

            let scratch = ScratchDir::create(&self.config.scratch_root, request.id(), &method)
                .map_err(|e| ConvertError::ScratchUnavailable {
                    path: self.config.scratch_root.clone(),
                    source: e,
                })?;
            let job = job_for(request, &scratch, quality);
            let timeout = spec.timeout.unwrap_or(self.config.method_timeout);

            let started_at = Utc::now();
            let clock = Instant::now();
            let execution = self.executor.run(spec, &job, timeout, cancel).await;

            let ((outcome, failure), diagnostics, issues) = match execution {
                ExecutionOutcome::Produced {
                    artifact,
                    diagnostics,
                } => {
                    machine.advance(State::Validating)?;
                    let issues = self
                        .validator
                        .validate(&artifact, request.target_format())
                        .await;
                    let codes: Vec<String> = issues
                        .iter()
                        .filter(|i| i.is_error())
                        .map(|i| i.code.clone())
                        .collect();

                    if codes.is_empty() {
                        if let Err(e) = commit(&artifact, request.destination()).await {
                            let attempt = record(
                                &method,
                                started_at,
                                clock,
                                AttemptOutcome::Failure,
                                Some(AttemptFailure::MethodFailed {
                                    method: method.clone(),
                                    detail: format!("could not write destination: {e}"),
                                }),
                                diagnostics,
                                issues,
                            );
                            cb.on_attempt_complete(request.id(), &attempt);
                            attempts.push(attempt);
                            return Ok(ChainEnd::CommitFailed { source: e });
                        }
                        machine.advance(State::Succeeded)?;
                        let attempt = record(
                            &method,
                            started_at,
                            clock,
                            AttemptOutcome::Success,
                            None,
                            diagnostics,
                            issues.clone(),
                        );
                        cb.on_attempt_complete(request.id(), &attempt);
                        attempts.push(attempt);
                        *final_issues = issues;
                        return Ok(ChainEnd::Succeeded { method });
                    }

                    (
                        (AttemptOutcome::Failure, AttemptFailure::Validation {
                            method: method.clone(),
                            codes,
                        }),
                        diagnostics,
                        issues,
                    )
                }
                ExecutionOutcome::Failed { diagnostics } => {
                    let detail = diagnostics
                        .lines()
                        .next()
                        .unwrap_or("method failed")
                        .to_string();
                    (
                        (AttemptOutcome::Failure, AttemptFailure::MethodFailed {
                            method: method.clone(),
                            detail,
                        }),
                        Some(diagnostics),
                        Vec::new(),
                    )
                }
                ExecutionOutcome::TimedOut { after } => (
                    (AttemptOutcome::Timeout, AttemptFailure::Timeout {
                        method: method.clone(),
                        after_ms: after.as_millis() as u64,
                    }),
                    None,
                    Vec::new(),
                ),
                ExecutionOutcome::Cancelled => {
                    let attempt = record(
                        &method,
                        started_at,
                        clock,
                        AttemptOutcome::Cancelled,
                        Some(AttemptFailure::Cancelled {
                            method: method.clone(),
                        }),
                        None,
                        Vec::new(),
                    );
                    cb.on_attempt_complete(request.id(), &attempt);
                    attempts.push(attempt);
                    machine.advance(State::Cancelled)?;
                    return Ok(ChainEnd::Cancelled);
                }
            };

            warn!("{}", failure);
            let attempt = record(
                &method,
                started_at,
                clock,
                outcome,
                Some(failure),
                diagnostics,
                issues.clone(),
            );
            cb.on_attempt_complete(request.id(), &attempt);
            attempts.push(attempt);
            *final_issues = issues;

            // Scratch goes before the next candidate starts.
            drop(scratch);
            machine.advance(State::Retrying)?;
        }

        machine.advance(State::Exhausted)?;
        Ok(ChainEnd::Exhausted)
    }

    /// Put the destination back after `failure`, returning the error to
    /// report. A failed restore wraps `failure` rather than replacing it.
    async fn restore_after(&self, backup: Option<Backup>, failure: ConvertError) -> ConvertError {
        let Some(mut backup) = backup else {
            return failure;
        };
        match self.backups.restore(&mut backup).await {
            Ok(()) => failure,
            Err(source) => {
                let path = backup.original.clone();
                let snapshot = backup.keep();
                error!(
                    "Could not restore {} ({}); previous content kept at {}",
                    path.display(),
                    source,
                    snapshot.display()
                );
                ConvertError::RestoreFailed {
                    path,
                    snapshot,
                    source,
                    after: Box::new(failure),
                }
            }
        }
    }

    fn callback(&self) -> &dyn ConversionProgressCallback {
        match &self.config.progress_callback {
            Some(cb) => cb.as_ref(),
            None => &NoopProgressCallback,
        }
    }
}

fn job_for(
    request: &ConversionRequest,
    scratch: &ScratchDir,
    quality: crate::config::QualitySettings,
) -> MethodJob {
    let mut job = MethodJob {
        request_id: request.id().to_string(),
        source: request.source().to_path_buf(),
        output: PathBuf::new(),
        scratch: scratch.path().to_path_buf(),
        source_format: request.declared_source_format(),
        target_format: request.target_format(),
        quality,
    };
    job.output = job
        .out_dir()
        .join(format!("{}.{}", job.stem(), job.target_format.extension()));
    job
}

fn record(
    method: &str,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
    outcome: AttemptOutcome,
    failure: Option<AttemptFailure>,
    diagnostics: Option<String>,
    issues: Vec<ValidationIssue>,
) -> ConversionAttempt {
    ConversionAttempt {
        method: method.to_string(),
        started_at,
        finished_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
        outcome,
        failure,
        diagnostics,
        issues,
    }
}

/// Reject destinations that cannot be replaced by a file.
async fn check_destination(source: &Path, destination: &Path) -> Result<(), ConvertError> {
    if let Ok(meta) = tokio::fs::metadata(destination).await {
        if meta.is_dir() {
            return Err(ConvertError::InvalidDestination {
                path: destination.to_path_buf(),
                reason: "destination is a directory".into(),
            });
        }
        let same = match (
            tokio::fs::canonicalize(source).await,
            tokio::fs::canonicalize(destination).await,
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same {
            return Err(ConvertError::InvalidDestination {
                path: destination.to_path_buf(),
                reason: "destination is the source file".into(),
            });
        }
    }
    Ok(())
}

/// Move a validated artifact into place: sibling temp file, then rename.
async fn commit(artifact: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    replace_atomically(artifact, destination).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut m = Machine::new();
        for s in [
            State::Routing,
            State::Attempting,
            State::Validating,
            State::Retrying,
            State::Attempting,
            State::Validating,
            State::Succeeded,
        ] {
            m.advance(s).unwrap();
        }
        assert!(m.state.is_terminal());
    }

    #[test]
    fn exhaustion_only_from_retrying() {
        assert!(State::Retrying.can_transition_to(State::Exhausted));
        assert!(!State::Attempting.can_transition_to(State::Exhausted));
        assert!(!State::Routing.can_transition_to(State::Succeeded));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [State::Succeeded, State::Exhausted, State::Cancelled] {
            for next in [
                State::Idle,
                State::Routing,
                State::Attempting,
                State::Validating,
                State::Retrying,
                State::Succeeded,
                State::Exhausted,
                State::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} → {next:?}");
            }
        }
    }

    #[test]
    fn invalid_transition_is_internal_error() {
        let mut m = Machine::new();
        let err = m.advance(State::Validating).unwrap_err();
        assert!(matches!(err, ConvertError::Internal(_)));
    }
}
