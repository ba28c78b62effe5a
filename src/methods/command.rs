//! External-program methods.
//!
//! A [`CommandTemplate`] is a program plus an argument list with
//! placeholders. Before each attempt the placeholders are expanded against
//! the attempt's [`MethodJob`]:
//!
//! | Placeholder       | Value                                              |
//! |-------------------|----------------------------------------------------|
//! | `{input}`         | source file                                        |
//! | `{output}`        | expected artifact, `{outdir}/{stem}.{ext}`         |
//! | `{outdir}`        | `{scratch}/out`                                    |
//! | `{scratch}`       | the attempt's scratch directory                    |
//! | `{ext}`           | canonical target extension                         |
//! | `{stem}`          | source file stem                                   |
//! | `{crf}`           | video CRF from the quality profile                 |
//! | `{audio_bitrate}` | audio bitrate, e.g. `192k`                         |
//! | `{image_quality}` | JPEG quality 1–100                                 |
//! | `{pdf_quality}`   | PDF export quality 1–100                           |
//! | `{script}`        | path of the template's script file, when it has one|
//! | `{office_module}` | office module for the source: writer/calc/impress/draw |
//!
//! An argument that is exactly `{target_args}` is replaced by the argument
//! list registered for the request's target format (or removed if there is
//! none), so one template can carry per-target codec or filter options.
//! Arguments that expand to an empty string are dropped.
//!
//! The child runs with the scratch directory as its working directory and is
//! killed if the future driving it is dropped (timeout or cancellation).

use super::MethodJob;
use crate::error::MethodError;
use crate::format::{Format, FormatCategory};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Bytes of stderr kept for diagnostics.
pub const STDERR_TAIL_BYTES: usize = 2048;

/// A script written into the scratch directory before the program runs.
#[derive(Debug, Clone)]
pub struct ScriptFile {
    /// File name inside the scratch directory.
    pub name: String,
    /// Body, with the same placeholders as the arguments.
    pub body: String,
}

/// Description of an external program invocation.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Spliced in place of a `{target_args}` argument, keyed by target format.
    pub target_args: BTreeMap<Format, Vec<String>>,
    pub script: Option<ScriptFile>,
    /// Extra environment variables (values are placeholder-expanded).
    pub env: Vec<(String, String)>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            target_args: BTreeMap::new(),
            script: None,
            env: Vec::new(),
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, s: impl Into<String>) -> Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Arguments used for `target` in place of `{target_args}`.
    pub fn target_args(
        mut self,
        target: Format,
        iter: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.target_args
            .insert(target, iter.into_iter().map(Into::into).collect());
        self
    }

    pub fn script(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.script = Some(ScriptFile {
            name: name.into(),
            body: body.into(),
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program name for messages (`soffice`, not `/usr/bin/soffice`).
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Expanded argument list for `job`.
    pub fn render_args(&self, job: &MethodJob) -> Vec<String> {
        let vars = Placeholders::for_job(job, self.script_path(job).as_deref());
        self.expand_args(job, &vars)
    }

    fn expand_args(&self, job: &MethodJob, vars: &Placeholders) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if arg == "{target_args}" {
                if let Some(extra) = self.target_args.get(&job.target_format) {
                    out.extend(extra.iter().map(|a| vars.expand(a)));
                }
            } else {
                out.push(vars.expand(arg));
            }
        }
        out.retain(|a| !a.is_empty());
        out
    }

    fn script_path(&self, job: &MethodJob) -> Option<PathBuf> {
        self.script.as_ref().map(|s| job.scratch.join(&s.name))
    }
}

/// What a finished external program left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// Last [`STDERR_TAIL_BYTES`] of stderr (lossy UTF-8).
    pub stderr_tail: String,
}

impl CommandOutput {
    /// Exit status plus the stderr tail, for attempt records.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr_tail.trim();
        if stderr.is_empty() {
            format!("{}", self.status)
        } else {
            format!("{}\n{}", self.status, stderr)
        }
    }
}

/// Run `template` for `job` to completion.
///
/// Not bounded in time by itself: the executor wraps this future in its
/// timeout, and dropping the future kills the child.
pub async fn execute(template: &CommandTemplate, job: &MethodJob) -> Result<CommandOutput, MethodError> {
    let script_path = template.script_path(job);
    let vars = Placeholders::for_job(job, script_path.as_deref());

    if let (Some(script), Some(path)) = (&template.script, &script_path) {
        tokio::fs::write(path, vars.expand(&script.body)).await?;
    }

    let args = template.expand_args(job, &vars);
    let program = template.program_name();
    debug!("Running {} {:?}", program, args);

    let mut cmd = Command::new(&template.program);
    cmd.args(&args)
        .current_dir(&job.scratch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in &template.env {
        cmd.env(k, vars.expand(v));
    }

    let child = cmd.spawn().map_err(|e| MethodError::Spawn {
        program: program.clone(),
        source: e,
    })?;

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        status: output.status,
        stderr_tail: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES),
    })
}

/// Find the artifact a command produced.
///
/// Tools that honour `{output}` leave it there; tools that pick their own
/// name (LibreOffice writes `{outdir}/{stem}.{ext}`) are matched by
/// extension inside `{outdir}`, then inside the scratch directory itself.
pub async fn locate_artifact(job: &MethodJob) -> Result<PathBuf, MethodError> {
    if tokio::fs::try_exists(&job.output).await.unwrap_or(false) {
        return Ok(job.output.clone());
    }

    for dir in [job.out_dir(), job.scratch.clone()] {
        if let Some(found) = find_by_extension(&dir, job.target_format).await? {
            return Ok(found);
        }
    }
    Err(MethodError::NoArtifact {
        expected: job.output.clone(),
    })
}

async fn find_by_extension(dir: &Path, target: Format) -> Result<Option<PathBuf>, MethodError> {
    let aliases = target.aliases();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Ok(None);
    };
    let mut found: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| aliases.contains(&e.to_ascii_lowercase().as_str()));
        if matches && entry.file_type().await?.is_file() {
            found.push(path);
        }
    }
    // read_dir order is unspecified
    found.sort();
    Ok(found.into_iter().next())
}

/// Keep the last `max` bytes of `s`, cut on a char boundary.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

/// LibreOffice module that opens `format`.
fn office_module(format: Format) -> &'static str {
    match format {
        Format::Xlsx | Format::Xls | Format::Ods | Format::Csv => "calc",
        Format::Pptx | Format::Ppt | Format::Odp => "impress",
        f if f.category() == FormatCategory::Image => "draw",
        _ => "writer",
    }
}

struct Placeholders {
    pairs: Vec<(&'static str, String)>,
}

impl Placeholders {
    fn for_job(job: &MethodJob, script: Option<&Path>) -> Self {
        let q = &job.quality;
        let mut pairs = vec![
            ("{input}", job.source.display().to_string()),
            ("{output}", job.output.display().to_string()),
            ("{outdir}", job.out_dir().display().to_string()),
            ("{scratch}", job.scratch.display().to_string()),
            ("{ext}", job.target_format.extension().to_string()),
            ("{stem}", job.stem()),
            ("{crf}", q.video_crf.to_string()),
            ("{audio_bitrate}", format!("{}k", q.audio_bitrate_kbps)),
            ("{image_quality}", q.image_quality.to_string()),
            ("{pdf_quality}", q.pdf_quality.to_string()),
            ("{office_module}", office_module(job.source_format).to_string()),
        ];
        if let Some(p) = script {
            pairs.push(("{script}", p.display().to_string()));
        }
        Self { pairs }
    }

    fn expand(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (key, value) in &self.pairs {
            if out.contains(key) {
                out = out.replace(key, value);
            }
        }
        out
    }
}
