//! Fallback-chain integration tests.
//!
//! Every method here is a scripted in-process stand-in, so these tests need
//! no external tools and run on every `cargo test`.

use async_trait::async_trait;
use multiconvert::{
    convert, convert_batch, convert_cancellable, convert_stream, AttemptFailure, AttemptOutcome,
    BuiltinMethod, CancellationToken, ConversionAttempt, ConversionConfig,
    ConversionProgressCallback, ConversionRequest, ConvertError, Format, MethodError, MethodJob,
    MethodSpec, Router, SecurityError,
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Fixtures ─────────────────────────────────────────────────────────────────

const PDF: &[u8] = b"%PDF-1.4\n1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n\
2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n\
3 0 obj << /Type /Page /Parent 2 0 R >> endobj\ntrailer << /Root 1 0 R >>\n%%EOF\n";

/// Smallest package the validator accepts as a `.docx`.
fn docx_bytes() -> Vec<u8> {
    use std::io::Write;

    let mut w = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in [
        ("[Content_Types].xml", "<Types/>"),
        ("word/document.xml", "<w:document/>"),
    ] {
        w.start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        w.write_all(body.as_bytes()).unwrap();
    }
    w.finish().unwrap().into_inner()
}

const HTML: &[u8] = b"<!DOCTYPE html>\n<html><body><p>ok</p></body></html>\n";

// ── Scripted methods ─────────────────────────────────────────────────────────

#[derive(Clone)]
enum Script {
    /// Report a method error.
    Fail,
    /// Write a zero-byte artifact and report success.
    Empty,
    /// Write these bytes and report success.
    Write(Vec<u8>),
    /// Sleep, then write these bytes.
    Slow(Duration, Vec<u8>),
}

#[derive(Clone)]
struct Scripted {
    script: Script,
    calls: Arc<AtomicUsize>,
    log: Option<Arc<Mutex<Vec<String>>>>,
    name: String,
}

impl Scripted {
    fn new(name: &str, script: Script) -> Self {
        Self {
            script,
            calls: Arc::new(AtomicUsize::new(0)),
            log: None,
            name: name.to_string(),
        }
    }

    fn logging_to(mut self, log: &Arc<Mutex<Vec<String>>>) -> Self {
        self.log = Some(Arc::clone(log));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuiltinMethod for Scripted {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref log) = self.log {
            log.lock().unwrap().push(self.name.clone());
        }
        let bytes = match &self.script {
            Script::Fail => return Err(MethodError::Failed(format!("{} crashed", self.name))),
            Script::Empty => Vec::new(),
            Script::Write(b) => b.clone(),
            Script::Slow(d, b) => {
                tokio::time::sleep(*d).await;
                b.clone()
            }
        };
        tokio::fs::write(&job.output, bytes).await?;
        Ok(job.output.clone())
    }
}

/// Tracks the peak number of concurrently running invocations.
#[derive(Clone, Default)]
struct ConcurrencyGauge {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl BuiltinMethod for ConcurrencyGauge {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        tokio::fs::write(&job.output, HTML).await?;
        Ok(job.output.clone())
    }
}

#[derive(Default)]
struct EventCounter {
    request_start: AtomicUsize,
    attempt_start: AtomicUsize,
    attempt_complete: AtomicUsize,
    attempt_failed: AtomicUsize,
    request_complete: AtomicUsize,
    last_success: Mutex<Option<bool>>,
}

impl ConversionProgressCallback for EventCounter {
    fn on_request_start(&self, _id: &str, _source: &Path, _candidates: usize) {
        self.request_start.fetch_add(1, Ordering::SeqCst);
    }
    fn on_attempt_start(&self, _id: &str, _method: &str, _index: usize, _total: usize) {
        self.attempt_start.fetch_add(1, Ordering::SeqCst);
    }
    fn on_attempt_complete(&self, _id: &str, attempt: &ConversionAttempt) {
        self.attempt_complete.fetch_add(1, Ordering::SeqCst);
        if !attempt.is_success() {
            self.attempt_failed.fetch_add(1, Ordering::SeqCst);
        }
    }
    fn on_request_complete(&self, _id: &str, success: bool, _attempts: usize) {
        self.request_complete.fetch_add(1, Ordering::SeqCst);
        *self.last_success.lock().unwrap() = Some(success);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn config_with(router: Router, scratch: &Path) -> ConversionConfig {
    ConversionConfig::builder()
        .router(Arc::new(router))
        .scratch_root(scratch)
        .build()
        .unwrap()
}

fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, bytes).unwrap();
    p
}

fn methods_of(attempts: &[ConversionAttempt]) -> Vec<&str> {
    attempts.iter().map(|a| a.method.as_str()).collect()
}

fn scratch_is_empty(scratch: &Path) -> bool {
    match std::fs::read_dir(scratch) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn falls_through_crash_and_empty_output_to_third_method() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "paper.pdf", PDF);
    let dest = dir.path().join("paper.docx");

    let docx = docx_bytes();
    let a = Scripted::new("a", Script::Fail);
    let b = Scripted::new("b", Script::Empty);
    let c = Scripted::new("c", Script::Write(docx.clone()));
    let router = Router::builder()
        .method(MethodSpec::builtin("a", a.clone()))
        .method(MethodSpec::builtin("b", b.clone()))
        .method(MethodSpec::builtin("c", c.clone()))
        .chain(Format::Pdf, Format::Docx, &["a", "b", "c"])
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let request = ConversionRequest::new(&src, &dest, Format::Docx).unwrap();
    let result = convert(&request, &config).await.unwrap();

    assert!(result.success);
    assert_eq!(result.chosen_method.as_deref(), Some("c"));
    assert_eq!(methods_of(&result.attempts), vec!["a", "b", "c"]);

    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Failure);
    assert!(matches!(
        result.attempts[0].failure,
        Some(AttemptFailure::MethodFailed { .. })
    ));
    match &result.attempts[1].failure {
        Some(AttemptFailure::Validation { codes, .. }) => {
            assert_eq!(codes, &vec!["empty_artifact".to_string()])
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert_eq!(result.attempts[2].outcome, AttemptOutcome::Success);

    assert_eq!(std::fs::read(&dest).unwrap(), docx);
    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));
    assert!(scratch_is_empty(&dir.path().join("scratch")));
}

#[tokio::test]
async fn unregistered_pair_is_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(
        dir.path(),
        "logo.svg",
        b"<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>",
    );
    let dest = write(dir.path(), "logo.mp3", b"previous");
    let scratch = dir.path().join("scratch");

    let router = Router::builder()
        .method(MethodSpec::builtin("x", Scripted::new("x", Script::Fail)))
        .route(Format::Svg, Format::Png, "x")
        .build()
        .unwrap();
    let config = config_with(router, &scratch);

    let request = ConversionRequest::new(&src, &dest, Format::Mp3).unwrap();
    let err = convert(&request, &config).await.unwrap_err();

    assert!(matches!(
        err,
        ConvertError::UnsupportedConversion {
            from: Format::Svg,
            to: Format::Mp3,
            ..
        }
    ));
    assert!(err.result().is_none(), "no attempts recorded");
    assert!(!scratch.exists(), "no scratch or backup created");
    assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
}

#[tokio::test]
async fn executable_disguised_as_pdf_is_stopped_at_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let mut exe = b"MZ\x90\x00\x03\x00\x00\x00".to_vec();
    exe.extend_from_slice(&[0u8; 120]);
    let src = write(dir.path(), "report.pdf", &exe);
    let dest = dir.path().join("report.docx");
    let scratch = dir.path().join("scratch");

    let never = Scripted::new("never", Script::Write(docx_bytes()));
    let router = Router::builder()
        .method(MethodSpec::builtin("never", never.clone()))
        .route(Format::Pdf, Format::Docx, "never")
        .build()
        .unwrap();
    let events = Arc::new(EventCounter::default());
    let config = ConversionConfig::builder()
        .router(Arc::new(router))
        .scratch_root(&scratch)
        .progress_callback(events.clone())
        .build()
        .unwrap();

    let request = ConversionRequest::new(&src, &dest, Format::Docx).unwrap();
    let err = convert(&request, &config).await.unwrap_err();

    assert!(matches!(
        err,
        ConvertError::Security(SecurityError::ExecutableContent { .. })
    ));
    assert!(err.is_rejection());
    assert_eq!(never.calls(), 0);
    assert!(!dest.exists());
    assert!(!scratch.exists());
    assert_eq!(events.request_start.load(Ordering::SeqCst), 0);
    assert_eq!(events.request_complete.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhaustion_restores_existing_destination_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "paper.pdf", PDF);
    let original: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let dest = write(dir.path(), "paper.docx", &original);
    let scratch = dir.path().join("scratch");

    let router = Router::builder()
        .method(MethodSpec::builtin("crash", Scripted::new("crash", Script::Fail)))
        .method(MethodSpec::builtin("empty", Scripted::new("empty", Script::Empty)))
        // Reports success but writes an HTML error page.
        .method(MethodSpec::builtin(
            "liar",
            Scripted::new("liar", Script::Write(HTML.to_vec())),
        ))
        .chain(Format::Pdf, Format::Docx, &["crash", "empty", "liar"])
        .build()
        .unwrap();
    let config = config_with(router, &scratch);

    let request = ConversionRequest::new(&src, &dest, Format::Docx).unwrap();
    let err = convert(&request, &config).await.unwrap_err();

    let result = match &err {
        ConvertError::Exhausted { result } => result,
        other => panic!("expected Exhausted, got {other:?}"),
    };
    assert!(!result.success);
    assert!(result.chosen_method.is_none());
    assert_eq!(methods_of(&result.attempts), vec!["crash", "empty", "liar"]);
    assert!(result
        .validation_issues
        .iter()
        .any(|i| i.code == "signature_mismatch"));
    assert!(err.to_string().contains("All 3 conversion method(s) failed"));

    assert_eq!(std::fs::read(&dest).unwrap(), original);
    assert!(scratch_is_empty(&scratch));
}

// ── Fallback semantics ───────────────────────────────────────────────────────

#[tokio::test]
async fn first_validated_success_stops_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let dest = dir.path().join("notes.html");

    let first = Scripted::new("first", Script::Write(HTML.to_vec()));
    let second = Scripted::new("second", Script::Write(HTML.to_vec()));
    let router = Router::builder()
        .method(MethodSpec::builtin("first", first.clone()).priority(50))
        .method(MethodSpec::builtin("second", second.clone()).priority(10))
        .route(Format::Txt, Format::Html, "second")
        .route(Format::Txt, Format::Html, "first")
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let result = convert(&request, &config).await.unwrap();

    assert_eq!(result.chosen_method.as_deref(), Some("first"));
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0, "no method runs after a validated success");
}

#[tokio::test]
async fn timed_out_method_is_killed_and_next_one_runs() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let dest = dir.path().join("notes.html");

    let router = Router::builder()
        .method(
            MethodSpec::builtin(
                "hang",
                Scripted::new("hang", Script::Slow(Duration::from_secs(30), HTML.to_vec())),
            )
            .timeout(Duration::from_millis(100)),
        )
        .method(MethodSpec::builtin(
            "quick",
            Scripted::new("quick", Script::Write(HTML.to_vec())),
        ))
        .chain(Format::Txt, Format::Html, &["hang", "quick"])
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let started = std::time::Instant::now();
    let result = convert(&request, &config).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Timeout);
    assert!(matches!(
        result.attempts[0].failure,
        Some(AttemptFailure::Timeout { after_ms: 100, .. })
    ));
    assert_eq!(result.chosen_method.as_deref(), Some("quick"));
}

#[tokio::test]
async fn equal_priorities_keep_registration_order_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let log = Arc::new(Mutex::new(Vec::new()));

    let router = Router::builder()
        .method(MethodSpec::builtin("m1", Scripted::new("m1", Script::Fail).logging_to(&log)))
        .method(MethodSpec::builtin("m2", Scripted::new("m2", Script::Empty).logging_to(&log)))
        .method(MethodSpec::builtin("m3", Scripted::new("m3", Script::Fail).logging_to(&log)))
        .route_with_priority(Format::Txt, Format::Html, "m1", 5)
        .route_with_priority(Format::Txt, Format::Html, "m2", 5)
        .route_with_priority(Format::Txt, Format::Html, "m3", 5)
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let mut histories = Vec::new();
    for run in 0..3 {
        let dest = dir.path().join(format!("out-{run}.html"));
        let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
        let err = convert(&request, &config).await.unwrap_err();
        let result = err.into_result().unwrap();
        histories.push(
            result
                .attempts
                .iter()
                .map(|a| (a.method.clone(), a.outcome))
                .collect::<Vec<_>>(),
        );
        assert!(!dest.exists(), "failed request leaves no destination");
    }

    assert!(histories.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(
        histories[0].iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m2", "m3"]
    );
    assert_eq!(log.lock().unwrap().len(), 9, "each method runs once per request");
}

#[tokio::test]
async fn progress_events_match_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "paper.pdf", PDF);
    let dest = dir.path().join("paper.docx");

    let router = Router::builder()
        .method(MethodSpec::builtin("a", Scripted::new("a", Script::Fail)))
        .method(MethodSpec::builtin("b", Scripted::new("b", Script::Empty)))
        .method(MethodSpec::builtin("c", Scripted::new("c", Script::Write(docx_bytes()))))
        .chain(Format::Pdf, Format::Docx, &["a", "b", "c"])
        .build()
        .unwrap();
    let events = Arc::new(EventCounter::default());
    let config = ConversionConfig::builder()
        .router(Arc::new(router))
        .scratch_root(dir.path().join("scratch"))
        .progress_callback(events.clone())
        .build()
        .unwrap();

    let request = ConversionRequest::new(&src, &dest, Format::Docx).unwrap();
    convert(&request, &config).await.unwrap();

    assert_eq!(events.request_start.load(Ordering::SeqCst), 1);
    assert_eq!(events.attempt_start.load(Ordering::SeqCst), 3);
    assert_eq!(events.attempt_complete.load(Ordering::SeqCst), 3);
    assert_eq!(events.attempt_failed.load(Ordering::SeqCst), 2);
    assert_eq!(events.request_complete.load(Ordering::SeqCst), 1);
    assert_eq!(*events.last_success.lock().unwrap(), Some(true));
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_stops_the_chain_and_restores_destination() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let dest = write(dir.path(), "notes.html", b"<p>keep me</p>");
    let scratch = dir.path().join("scratch");

    let after = Scripted::new("after", Script::Write(HTML.to_vec()));
    let router = Router::builder()
        .method(MethodSpec::builtin(
            "slow",
            Scripted::new("slow", Script::Slow(Duration::from_secs(30), HTML.to_vec())),
        ))
        .method(MethodSpec::builtin("after", after.clone()))
        .chain(Format::Txt, Format::Html, &["slow", "after"])
        .build()
        .unwrap();
    let config = config_with(router, &scratch);

    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let err = convert_cancellable(&request, &config, &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    let result = err.result().unwrap();
    assert_eq!(methods_of(&result.attempts), vec!["slow"]);
    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Cancelled);
    assert_eq!(after.calls(), 0);
    assert_eq!(std::fs::read(&dest).unwrap(), b"<p>keep me</p>");
    assert!(scratch_is_empty(&scratch), "scratch and backup removed");
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let dest = dir.path().join("notes.html");

    let only = Scripted::new("only", Script::Write(HTML.to_vec()));
    let router = Router::builder()
        .method(MethodSpec::builtin("only", only.clone()))
        .route(Format::Txt, Format::Html, "only")
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let err = convert_cancellable(&request, &config, &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(err.result().unwrap().attempts.is_empty());
    assert_eq!(only.calls(), 0);
    assert!(!dest.exists());
}

// ── Batches ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_respects_worker_bound_and_summarises() {
    let dir = tempfile::tempdir().unwrap();
    let gauge = ConcurrencyGauge::default();
    let router = Router::builder()
        .method(MethodSpec::builtin("gauge", gauge.clone()))
        .route(Format::Txt, Format::Html, "gauge")
        .build()
        .unwrap();
    let config = ConversionConfig::builder()
        .router(Arc::new(router))
        .scratch_root(dir.path().join("scratch"))
        .workers(2)
        .build()
        .unwrap();

    let out = dir.path().join("out");
    let mut requests = Vec::new();
    for i in 0..6 {
        let src = write(dir.path(), &format!("n{i}.txt"), b"line\n");
        requests.push(ConversionRequest::into_dir(&src, &out, Format::Html).unwrap());
    }
    // Missing input: rejected by the gate.
    requests.push(
        ConversionRequest::into_dir(dir.path().join("missing.txt"), &out, Format::Html).unwrap(),
    );

    let (outcomes, summary) = convert_batch(requests, &config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 7);
    assert!(outcomes[..6].iter().all(|o| o.is_ok()));
    assert!(outcomes[6].as_ref().unwrap_err().is_rejection());
    assert_eq!(summary.total, 7);
    assert_eq!(summary.succeeded, 6);
    assert_eq!(summary.rejected, 1);
    assert!(!summary.all_succeeded());

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency {peak} exceeds worker bound");
    for i in 0..6 {
        assert!(out.join(format!("n{i}.html")).exists());
    }
}

#[tokio::test]
async fn stream_yields_every_request_once() {
    let dir = tempfile::tempdir().unwrap();
    let router = Router::builder()
        .method(MethodSpec::builtin(
            "ok",
            Scripted::new("ok", Script::Write(HTML.to_vec())),
        ))
        .route(Format::Txt, Format::Html, "ok")
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let mut ids = Vec::new();
    let mut requests = Vec::new();
    for i in 0..4 {
        let src = write(dir.path(), &format!("s{i}.txt"), b"x\n");
        let r = ConversionRequest::into_dir(&src, dir.path().join("out"), Format::Html)
            .unwrap()
            .with_id(format!("req-{i}"));
        ids.push(r.id().to_string());
        requests.push(r);
    }

    let mut seen: Vec<String> = convert_stream(requests, &config, CancellationToken::new())
        .unwrap()
        .map(|(id, outcome)| {
            assert!(outcome.unwrap().success);
            id
        })
        .collect()
        .await;
    seen.sort();
    assert_eq!(seen, ids);
}

// ── External commands ────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn failing_command_falls_back_to_copying_command() {
    use multiconvert::CommandTemplate;

    let (Ok(false_bin), Ok(cp_bin)) = (which::which("false"), which::which("cp")) else {
        println!("SKIP — coreutils not on PATH");
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "rows.csv", b"a,b\n1,2\n");
    let dest = dir.path().join("rows.txt");

    let router = Router::builder()
        .method(MethodSpec::command("broken", CommandTemplate::new(false_bin)))
        .method(MethodSpec::command(
            "copy",
            CommandTemplate::new(cp_bin).args(["{input}", "{output}"]),
        ))
        .chain(Format::Csv, Format::Txt, &["broken", "copy"])
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let request = ConversionRequest::new(&src, &dest, Format::Txt).unwrap();
    let result = convert(&request, &config).await.unwrap();

    assert_eq!(methods_of(&result.attempts), vec!["broken", "copy"]);
    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Failure);
    assert_eq!(std::fs::read(&dest).unwrap(), b"a,b\n1,2\n");
}

#[cfg(unix)]
#[tokio::test]
async fn plain_text_copied_under_an_html_name_fails_validation() {
    use multiconvert::CommandTemplate;

    let Ok(cp_bin) = which::which("cp") else {
        println!("SKIP — coreutils not on PATH");
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"plain text\n");
    let dest = dir.path().join("notes.html");

    let router = Router::builder()
        .method(MethodSpec::command(
            "copy",
            CommandTemplate::new(cp_bin).args(["{input}", "{output}"]),
        ))
        .route(Format::Txt, Format::Html, "copy")
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let err = convert(&request, &config).await.unwrap_err();

    let result = err.result().unwrap();
    match &result.attempts[0].failure {
        Some(AttemptFailure::Validation { codes, .. }) => {
            assert_eq!(codes, &vec!["signature_mismatch".to_string()])
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert!(!dest.exists());
}

// ── Commit and restore failures ──────────────────────────────────────────────

/// Writes a valid artifact, but first puts a non-empty directory where the
/// destination file should go, so the final rename cannot succeed.
struct OccupyDestination {
    destination: PathBuf,
}

#[async_trait]
impl BuiltinMethod for OccupyDestination {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        let _ = tokio::fs::remove_file(&self.destination).await;
        tokio::fs::create_dir_all(self.destination.join("occupied")).await?;
        tokio::fs::write(&job.output, HTML).await?;
        Ok(job.output.clone())
    }
}

/// Deletes every destination snapshot under the scratch root, then fails.
struct LoseBackups {
    scratch_root: PathBuf,
}

#[async_trait]
impl BuiltinMethod for LoseBackups {
    async fn run(&self, _job: &MethodJob) -> Result<PathBuf, MethodError> {
        let mut entries = tokio::fs::read_dir(&self.scratch_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with("backup-") {
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Err(MethodError::Failed("gave up".into()))
    }
}

#[tokio::test]
async fn commit_failure_reports_the_attempt_history() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let dest = dir.path().join("notes.html");
    let scratch = dir.path().join("scratch");

    let router = Router::builder()
        .method(MethodSpec::builtin(
            "occupy",
            OccupyDestination {
                destination: dest.clone(),
            },
        ))
        .route(Format::Txt, Format::Html, "occupy")
        .build()
        .unwrap();
    let events = Arc::new(EventCounter::default());
    let config = ConversionConfig::builder()
        .router(Arc::new(router))
        .scratch_root(&scratch)
        .progress_callback(events.clone())
        .build()
        .unwrap();

    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let err = convert(&request, &config).await.unwrap_err();

    let ConvertError::CommitFailed { ref path, ref result, .. } = err else {
        panic!("expected CommitFailed, got {err:?}");
    };
    assert_eq!(path, &dest);
    assert!(!err.is_rejection());
    assert_eq!(methods_of(&result.attempts), vec!["occupy"]);
    match &result.attempts[0].failure {
        Some(AttemptFailure::MethodFailed { detail, .. }) => {
            assert!(detail.contains("could not write destination"), "got {detail}")
        }
        other => panic!("expected MethodFailed, got {other:?}"),
    }
    assert_eq!(events.attempt_complete.load(Ordering::SeqCst), 1);
    assert_eq!(*events.last_success.lock().unwrap(), Some(false));
    assert!(scratch_is_empty(&scratch));
}

#[tokio::test]
async fn failed_restore_after_commit_failure_keeps_both_errors() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let dest = write(dir.path(), "notes.html", b"<p>version one</p>");

    let router = Router::builder()
        .method(MethodSpec::builtin(
            "occupy",
            OccupyDestination {
                destination: dest.clone(),
            },
        ))
        .route(Format::Txt, Format::Html, "occupy")
        .build()
        .unwrap();
    let config = config_with(router, &dir.path().join("scratch"));

    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let err = convert(&request, &config).await.unwrap_err();

    let ConvertError::RestoreFailed {
        ref snapshot,
        ref after,
        ..
    } = err
    else {
        panic!("expected RestoreFailed, got {err:?}");
    };
    assert!(matches!(**after, ConvertError::CommitFailed { .. }), "got {after:?}");
    assert_eq!(err.result().map(|r| r.attempts.len()), Some(1));
    // The previous content survives for manual recovery.
    assert_eq!(std::fs::read(snapshot).unwrap(), b"<p>version one</p>");
    let msg = err.to_string();
    assert!(msg.contains("Failed to write output file"), "got: {msg}");
}

#[tokio::test]
async fn failed_restore_after_exhaustion_keeps_the_history() {
    let dir = tempfile::tempdir().unwrap();
    let src = write(dir.path(), "notes.txt", b"hello\n");
    let dest = write(dir.path(), "notes.html", b"<p>untouched</p>");
    let scratch = dir.path().join("scratch");

    let router = Router::builder()
        .method(MethodSpec::builtin(
            "lose",
            LoseBackups {
                scratch_root: scratch.clone(),
            },
        ))
        .route(Format::Txt, Format::Html, "lose")
        .build()
        .unwrap();
    let config = config_with(router, &scratch);

    let request = ConversionRequest::new(&src, &dest, Format::Html).unwrap();
    let err = convert(&request, &config).await.unwrap_err();

    let ConvertError::RestoreFailed { ref after, .. } = err else {
        panic!("expected RestoreFailed, got {err:?}");
    };
    assert!(matches!(**after, ConvertError::Exhausted { .. }), "got {after:?}");
    assert_eq!(methods_of(&err.result().unwrap().attempts), vec!["lose"]);
    assert!(err.to_string().contains("All 1 conversion method(s) failed"));
    assert_eq!(std::fs::read(&dest).unwrap(), b"<p>untouched</p>");

    let outcome: Result<multiconvert::ConversionResult, ConvertError> = Err(err);
    let summary = multiconvert::BatchSummary::from_outcomes([&outcome]);
    assert_eq!(summary.errored, 1);
}

// ── Built-in methods under a time bound ──────────────────────────────────────

#[test]
fn timed_out_image_transcode_leaves_no_scratch_behind() {
    use multiconvert::methods::builtin::ImageTranscode;

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("big.png");
    image::RgbImage::from_pixel(3000, 3000, image::Rgb([200, 120, 40]))
        .save(&src)
        .unwrap();
    let dest = dir.path().join("big.jpg");
    let scratch = dir.path().join("scratch");

    let router = Router::builder()
        .method(
            MethodSpec::builtin("image", ImageTranscode).timeout(Duration::from_millis(20)),
        )
        .route(Format::Png, Format::Jpeg, "image")
        .build()
        .unwrap();
    let config = config_with(router, &scratch);
    let request = ConversionRequest::new(&src, &dest, Format::Jpeg).unwrap();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let err = rt.block_on(convert(&request, &config)).unwrap_err();
    // Dropping the runtime waits for the abandoned decode/encode to finish.
    drop(rt);

    let result = err.result().unwrap();
    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Timeout);
    assert!(
        scratch_is_empty(&scratch),
        "blocking work wrote into scratch after the attempt ended"
    );
    assert!(!dest.exists());
}
