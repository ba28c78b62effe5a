//! CLI binary for multiconvert.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig` and `ConversionRequest`s and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use multiconvert::methods::defaults::{default_router, ToolSet};
use multiconvert::{
    convert_batch, inspect, CancellationToken, ConversionAttempt, ConversionConfig,
    ConversionProgressCallback, ConversionRequest, ConvertError, Format, ProgressCallback,
    QualityProfile, Router,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch, one log line per
/// failed attempt and per finished file. Requests finish out of order when
/// `--jobs` > 1, so lines are keyed by request id.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Request id → display name of its source file.
    names: Mutex<HashMap<String, String>>,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            names: Mutex::new(HashMap::new()),
        })
    }

    fn name(&self, request_id: &str) -> String {
        self.names
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .unwrap_or_else(|| request_id.to_string())
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_request_start(&self, request_id: &str, source: &Path, _candidates: usize) {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        self.names
            .lock()
            .unwrap()
            .insert(request_id.to_string(), name);
    }

    fn on_attempt_start(&self, request_id: &str, method: &str, index: usize, total: usize) {
        self.bar.set_message(format!(
            "{}  {} {}",
            self.name(request_id),
            method,
            dim(&format!("({index}/{total})"))
        ));
    }

    fn on_attempt_complete(&self, request_id: &str, attempt: &ConversionAttempt) {
        if attempt.is_success() {
            return;
        }
        let reason = attempt
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default();
        let reason = if reason.chars().count() > 90 {
            format!("{}\u{2026}", reason.chars().take(89).collect::<String>())
        } else {
            reason
        };
        self.bar.println(format!(
            "  {} {}  {}  {}",
            cyan("↻"),
            self.name(request_id),
            red(&reason),
            dim(&format!("{:.1}s", attempt.duration_ms as f64 / 1000.0)),
        ));
    }

    fn on_request_complete(&self, request_id: &str, success: bool, attempts: usize) {
        let name = self
            .names
            .lock()
            .unwrap()
            .remove(request_id)
            .unwrap_or_else(|| request_id.to_string());
        if success {
            self.bar.println(format!(
                "  {} {}  {}",
                green("✓"),
                name,
                dim(&format!("{attempts} attempt(s)"))
            ));
        } else {
            self.bar.println(format!("  {} {}", red("✗"), name));
        }
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Single file, destination next to the source (report.pdf)
  multiconvert report.docx --to pdf

  # Explicit destination file
  multiconvert slides.pptx --to pdf -o handout.pdf

  # Many files into a directory, 8 at a time
  multiconvert *.wav --to mp3 --quality high -o music/ --jobs 8

  # Treat a mislabelled file as a different format
  multiconvert scan.dat --from pdf --to txt

  # What can this file become?
  multiconvert --inspect-only photo.heic.png

  # Installed tools and the fallback chain for every route
  multiconvert --list-methods

  # JSON results (attempt history included)
  multiconvert --json clip.mkv --to mp4 > result.json

FALLBACK ORDER:
  Each format pair has an ordered list of methods. They are tried one at a
  time; the first whose output passes validation wins. If all fail, an
  existing destination file is restored byte for byte.

  Documents   onlyoffice → libreoffice → built-ins
  PDF → DOCX  onlyoffice → libreoffice (PDF import)
  PDF → TXT   pdftotext
  Images      image crate → ffmpeg
  Audio/video ffmpeg

ENVIRONMENT VARIABLES:
  MULTICONVERT_TO           Default target format
  MULTICONVERT_QUALITY      low, medium, high, maximum
  MULTICONVERT_TIMEOUT      Per-method timeout in seconds
  MULTICONVERT_JOBS         Concurrent files
  MULTICONVERT_SCRATCH_DIR  Scratch directory root
  RUST_LOG                  Log filter, e.g. multiconvert=debug
"#;

/// Convert documents, images, audio and video with validated fallback chains.
#[derive(Parser, Debug)]
#[command(
    name = "multiconvert",
    version,
    about = "Convert documents, images, audio and video with validated fallback chains",
    long_about = "Convert files between formats by trying several conversion methods \
(OnlyOffice, LibreOffice, poppler, ffmpeg and built-ins) in priority order. Every output \
is validated before it replaces the destination; on total failure the destination is \
left exactly as it was.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input files.
    #[arg(required_unless_present = "list_methods")]
    files: Vec<PathBuf>,

    /// Target format (pdf, docx, png, mp3, …).
    #[arg(
        short,
        long,
        env = "MULTICONVERT_TO",
        required_unless_present_any = ["list_methods", "inspect_only"]
    )]
    to: Option<Format>,

    /// Declare the source format instead of inferring it from the extension.
    #[arg(long)]
    from: Option<Format>,

    /// Destination file (single input) or directory.
    #[arg(short, long, env = "MULTICONVERT_OUTPUT")]
    output: Option<PathBuf>,

    /// Quality preset.
    #[arg(long, env = "MULTICONVERT_QUALITY", value_enum, default_value = "medium")]
    quality: QualityArg,

    /// Per-method timeout in seconds.
    #[arg(long, env = "MULTICONVERT_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Number of files converted concurrently.
    #[arg(short, long, env = "MULTICONVERT_JOBS", default_value_t = 4)]
    jobs: usize,

    /// Largest accepted input, in MiB.
    #[arg(long, env = "MULTICONVERT_MAX_SIZE_MB", default_value_t = 500)]
    max_size_mb: u64,

    /// Root directory for scratch space and backups.
    #[arg(long, env = "MULTICONVERT_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Explicit tool location, e.g. --tool soffice=/opt/libreoffice/program/soffice.
    #[arg(long = "tool", value_name = "NAME=PATH", value_parser = parse_tool)]
    tools: Vec<(String, PathBuf)>,

    /// Only run the cheap artifact checks (existence, size, signature).
    #[arg(long, env = "MULTICONVERT_NO_DEEP_VALIDATION")]
    no_deep_validation: bool,

    /// Output structured JSON (ConversionResult per file).
    #[arg(long, env = "MULTICONVERT_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "MULTICONVERT_NO_PROGRESS")]
    no_progress: bool,

    /// Print detected tools and every route's fallback chain, then exit.
    #[arg(long)]
    list_methods: bool,

    /// Describe the input files without converting them.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MULTICONVERT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MULTICONVERT_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    Low,
    Medium,
    High,
    Maximum,
}

impl From<QualityArg> for QualityProfile {
    fn from(v: QualityArg) -> Self {
        match v {
            QualityArg::Low => QualityProfile::Low,
            QualityArg::Medium => QualityProfile::Medium,
            QualityArg::High => QualityProfile::High,
            QualityArg::Maximum => QualityProfile::Maximum,
        }
    }
}

fn parse_tool(s: &str) -> std::result::Result<(String, PathBuf), String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{s}'"))?;
    if name.trim().is_empty() || path.trim().is_empty() {
        return Err(format!("expected NAME=PATH, got '{s}'"));
    }
    Ok((name.trim().to_string(), PathBuf::from(path.trim())))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.inspect_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Discover tools, build the router once ────────────────────────────
    let tool_overrides: BTreeMap<String, PathBuf> = cli.tools.iter().cloned().collect();
    let tools = ToolSet::discover(&tool_overrides);
    let router = Arc::new(default_router(&tools).context("Failed to build method table")?);

    // ── List-methods mode ────────────────────────────────────────────────
    if cli.list_methods {
        print_methods(&tools, &router, cli.json)?;
        return Ok(());
    }

    let cli_cb = show_progress.then(|| CliProgressCallback::new(cli.files.len()));
    let progress_cb: Option<ProgressCallback> = cli_cb
        .clone()
        .map(|cb| cb as Arc<dyn ConversionProgressCallback>);

    let config = build_config(&cli, Arc::clone(&router), progress_cb)?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let mut reports = Vec::new();
        for file in &cli.files {
            let report = inspect(file, &config)
                .await
                .with_context(|| format!("Failed to inspect {}", file.display()))?;
            reports.push(report);
        }
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&reports).context("Failed to serialize reports")?
            );
        } else {
            for r in &reports {
                println!("File:         {}", r.path.display());
                println!("Size:         {} bytes", r.size_bytes);
                println!(
                    "Declared:     {}",
                    r.declared_format
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "unknown".into())
                );
                println!("Signature:    {}", r.signature);
                match &r.rejection {
                    None => println!("Accepted:     {}", green("yes")),
                    Some(why) => println!("Accepted:     {}  {}", red("no"), dim(why)),
                }
                let targets: Vec<String> = r.targets.iter().map(|f| f.to_string()).collect();
                println!("Targets:      {}", targets.join(", "));
                println!();
            }
        }
        return Ok(());
    }

    // ── Build requests ───────────────────────────────────────────────────
    let target = cli
        .to
        .context("--to is required unless --list-methods or --inspect-only is given")?;
    let mut requests = Vec::with_capacity(cli.files.len());
    let mut invalid = 0usize;
    for file in &cli.files {
        match build_request(&cli, file, target) {
            Ok(r) => requests.push(r),
            Err(e) => {
                invalid += 1;
                eprintln!("{} {}: {}", red("✗"), file.display(), e);
            }
        }
    }

    // ── Ctrl-C cancels the batch ─────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} cancelling…", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    // ── Run conversions ──────────────────────────────────────────────────
    let (outcomes, summary) = convert_batch(requests, &config, &cancel)
        .await
        .context("Conversion failed")?;
    if let Some(cb) = &cli_cb {
        cb.bar.finish_and_clear();
    }

    if cli.json {
        let items: Vec<serde_json::Value> = outcomes.iter().map(outcome_json).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "results": items,
                "summary": summary,
            }))
            .context("Failed to serialise output")?
        );
    } else if !cli.quiet {
        for outcome in &outcomes {
            match outcome {
                Ok(r) => eprintln!(
                    "{}  {}  →  {}  {}",
                    green("✔"),
                    r.source.display(),
                    bold(&r.destination.display().to_string()),
                    dim(&format!(
                        "{} · {}ms",
                        r.chosen_method.as_deref().unwrap_or("-"),
                        r.total_duration_ms
                    )),
                ),
                Err(e) => eprintln!("{}  {}", red("✘"), e),
            }
        }
        eprintln!(
            "{} {}/{} converted  ({} failed, {} rejected, {} cancelled)",
            if summary.all_succeeded() && invalid == 0 {
                green("◆")
            } else {
                red("◆")
            },
            bold(&summary.succeeded.to_string()),
            summary.total + invalid,
            summary.failed + summary.errored,
            summary.rejected + invalid,
            summary.cancelled,
        );
    }

    if !summary.all_succeeded() || invalid > 0 {
        anyhow::bail!(
            "{} of {} file(s) were not converted",
            summary.total - summary.succeeded + invalid,
            summary.total + invalid
        );
    }
    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(
    cli: &Cli,
    router: Arc<Router>,
    progress: Option<ProgressCallback>,
) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .method_timeout(Duration::from_secs(cli.timeout))
        .workers(cli.jobs)
        .max_input_mb(cli.max_size_mb)
        .default_quality(cli.quality.into())
        .deep_validation(!cli.no_deep_validation)
        .router(router);

    if let Some(ref dir) = cli.scratch_dir {
        builder = builder.scratch_root(dir);
    }
    for (name, path) in &cli.tools {
        builder = builder.tool_path(name, path);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Destination rules: `-o` names a file for a single input unless it is an
/// existing directory or ends with a separator; with several inputs it is
/// always a directory. Without `-o`, output lands next to the source.
fn build_request(cli: &Cli, file: &Path, target: Format) -> Result<ConversionRequest, ConvertError> {
    let request = match &cli.output {
        Some(out) if cli.files.len() == 1 && !is_dir_like(out) => {
            ConversionRequest::new(file, out, target)?
        }
        Some(out) => ConversionRequest::into_dir(file, out, target)?,
        None => {
            let dir = file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            ConversionRequest::into_dir(file, dir, target)?
        }
    };
    let request = match cli.from {
        Some(f) => request.source_format(f),
        None => request,
    };
    Ok(request.quality(cli.quality.into()))
}

fn is_dir_like(p: &Path) -> bool {
    p.is_dir() || p.as_os_str().to_string_lossy().ends_with(std::path::MAIN_SEPARATOR)
}

fn outcome_json(outcome: &std::result::Result<multiconvert::ConversionResult, ConvertError>) -> serde_json::Value {
    match outcome {
        Ok(r) => serde_json::json!({ "ok": true, "result": r }),
        Err(e) => serde_json::json!({
            "ok": false,
            "error": e.to_string(),
            "result": e.result(),
        }),
    }
}

fn print_methods(tools: &ToolSet, router: &Router, json: bool) -> Result<()> {
    if json {
        let methods: Vec<serde_json::Value> = router
            .methods()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "kind": m.kind(),
                    "priority": m.priority,
                    "description": m.description,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "tools": tools.report(),
                "methods": methods,
                "routes": router.describe(),
            }))
            .context("Failed to serialise method table")?
        );
        return Ok(());
    }

    println!("{}", bold("TOOLS"));
    for t in tools.report() {
        match t.path {
            Some(p) => println!("  {} {:<12} {}", green("✓"), t.name, dim(&p.display().to_string())),
            None => println!("  {} {:<12} {}", red("✗"), t.name, dim("not found")),
        }
    }

    println!("\n{}", bold("METHODS"));
    let mut methods: Vec<_> = router.methods().collect();
    methods.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    for m in methods {
        println!(
            "  {:<24} {:>4}  {:<8} {}",
            m.id.as_str(),
            m.priority,
            m.kind(),
            dim(&m.description)
        );
    }

    println!("\n{}", bold("ROUTES"));
    for route in router.describe() {
        let chain: Vec<&str> = route.methods.iter().map(|m| m.as_str()).collect();
        println!(
            "  {:>5} → {:<5} {}",
            route.from.to_string(),
            route.to.to_string(),
            chain.join(" → ")
        );
    }
    Ok(())
}
