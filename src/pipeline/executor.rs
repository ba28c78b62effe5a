//! Run one conversion method in isolation.
//!
//! Every attempt gets its own [`ScratchDir`] under the scratch root. The
//! method reads the source, writes into the scratch directory, and nothing
//! else. When the attempt ends, whatever happened, the directory is removed
//! by `Drop`; outputs of failed or timed-out attempts vanish with it.
//!
//! The executor owns the time bound. External programs are spawned with
//! `kill_on_drop`, so when the timeout or the cancellation token wins the
//! `select!`, dropping the method future kills the child.

use crate::error::MethodError;
use crate::methods::command::{execute, locate_artifact};
use crate::methods::{Invocation, MethodJob, MethodSpec};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exclusive, self-deleting working directory for one attempt.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Create `<root>/<request>-<method>-XXXXXX`.
    pub fn create(root: &Path, request_id: &str, method: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{request_id}-{method}-"))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// What a single method run amounted to, before validation.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The method reported success and left an artifact.
    Produced {
        artifact: PathBuf,
        diagnostics: Option<String>,
    },
    /// The method crashed, exited non-zero or produced nothing usable.
    Failed { diagnostics: String },
    /// The wall-clock bound expired; the method was killed.
    TimedOut { after: Duration },
    /// The cancellation token fired; the method was killed.
    Cancelled,
}

/// Runs methods with a time bound and a cancellation token.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodExecutor;

impl MethodExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run `spec` for `job`, giving up after `timeout` or when `cancel` fires.
    ///
    /// `job.scratch` must be the attempt's [`ScratchDir`].
    pub async fn run(
        &self,
        spec: &MethodSpec,
        job: &MethodJob,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        if let Err(e) = tokio::fs::create_dir_all(job.out_dir()).await {
            return ExecutionOutcome::Failed {
                diagnostics: format!("cannot prepare scratch directory: {e}"),
            };
        }

        debug!(
            "Running method {} ({}) with a {}ms bound",
            spec.id,
            spec.kind(),
            timeout.as_millis()
        );

        let invocation = invoke(spec, job);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecutionOutcome::Cancelled,
            r = tokio::time::timeout(timeout, invocation) => r,
        };

        let (artifact, diagnostics) = match result {
            Err(_) => {
                warn!("Method {} timed out after {}ms", spec.id, timeout.as_millis());
                return ExecutionOutcome::TimedOut { after: timeout };
            }
            Ok(Err(e)) => {
                return ExecutionOutcome::Failed {
                    diagnostics: e.to_string(),
                }
            }
            Ok(Ok(produced)) => produced,
        };

        if !is_inside(&artifact, &job.scratch) {
            return ExecutionOutcome::Failed {
                diagnostics: format!(
                    "artifact '{}' is outside the scratch directory",
                    artifact.display()
                ),
            };
        }

        ExecutionOutcome::Produced {
            artifact,
            diagnostics,
        }
    }
}

async fn invoke(
    spec: &MethodSpec,
    job: &MethodJob,
) -> Result<(PathBuf, Option<String>), MethodError> {
    match &spec.invocation {
        Invocation::Command(template) => {
            let out = execute(template, job).await?;
            if !out.status.success() {
                return Err(MethodError::Failed(out.diagnostics()));
            }
            let artifact = locate_artifact(job).await?;
            let stderr = out.stderr_tail.trim();
            let diagnostics = (!stderr.is_empty()).then(|| stderr.to_string());
            Ok((artifact, diagnostics))
        }
        Invocation::Builtin(method) => {
            let artifact = method.run(job).await?;
            Ok((artifact, None))
        }
    }
}

/// Whether `path` lies inside `dir`, resolving symlinks when both exist.
fn is_inside(path: &Path, dir: &Path) -> bool {
    match (path.canonicalize(), dir.canonicalize()) {
        (Ok(p), Ok(d)) => p.starts_with(d),
        _ => path.starts_with(dir) && !path.components().any(|c| c.as_os_str() == ".."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityProfile;
    use crate::format::Format;
    use crate::methods::BuiltinMethod;
    use async_trait::async_trait;

    struct Write(&'static [u8]);

    #[async_trait]
    impl BuiltinMethod for Write {
        async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
            tokio::fs::write(&job.output, self.0).await?;
            Ok(job.output.clone())
        }
    }

    struct Sleep;

    #[async_trait]
    impl BuiltinMethod for Sleep {
        async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(job.output.clone())
        }
    }

    struct Escape;

    #[async_trait]
    impl BuiltinMethod for Escape {
        async fn run(&self, _job: &MethodJob) -> Result<PathBuf, MethodError> {
            Ok(PathBuf::from("/etc/passwd"))
        }
    }

    fn job(scratch: &ScratchDir) -> MethodJob {
        let out = scratch.path().join("out");
        MethodJob {
            request_id: "req".into(),
            source: PathBuf::from("/in/a.txt"),
            output: out.join("a.html"),
            scratch: scratch.path().to_path_buf(),
            source_format: Format::Txt,
            target_format: Format::Html,
            quality: QualityProfile::Medium.settings(),
        }
    }

    #[tokio::test]
    async fn scratch_dir_is_named_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path(), "req1", "ffmpeg").unwrap();
        let path = scratch.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("req1-ffmpeg-"), "{name}");
        drop(scratch);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn produced_artifact() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path(), "r", "w").unwrap();
        let j = job(&scratch);
        let spec = MethodSpec::builtin("w", Write(b"<p>hi</p>"));
        let outcome = MethodExecutor::new()
            .run(&spec, &j, Duration::from_secs(5), &CancellationToken::new())
            .await;
        match outcome {
            ExecutionOutcome::Produced { artifact, .. } => assert_eq!(artifact, j.output),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path(), "r", "slow").unwrap();
        let spec = MethodSpec::builtin("slow", Sleep);
        let outcome = MethodExecutor::new()
            .run(
                &spec,
                &job(&scratch),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path(), "r", "slow").unwrap();
        let spec = MethodSpec::builtin("slow", Sleep);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = MethodExecutor::new()
            .run(&spec, &job(&scratch), Duration::from_secs(10), &token)
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    }

    #[tokio::test]
    async fn artifact_outside_scratch_fails() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path(), "r", "esc").unwrap();
        let spec = MethodSpec::builtin("esc", Escape);
        let outcome = MethodExecutor::new()
            .run(
                &spec,
                &job(&scratch),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        match outcome {
            ExecutionOutcome::Failed { diagnostics } => {
                assert!(diagnostics.contains("outside"), "{diagnostics}")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_failure_with_stderr() {
        use crate::methods::CommandTemplate;

        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path(), "r", "sh").unwrap();
        let spec = MethodSpec::command(
            "sh",
            CommandTemplate::new("sh").args(["-c", "echo 'bad input' >&2; exit 2"]),
        );
        let outcome = MethodExecutor::new()
            .run(
                &spec,
                &job(&scratch),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        match outcome {
            ExecutionOutcome::Failed { diagnostics } => {
                assert!(diagnostics.contains("bad input"), "{diagnostics}")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_child_is_killed() {
        use crate::methods::CommandTemplate;

        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path(), "r", "sleep").unwrap();
        let spec = MethodSpec::command("sleep", CommandTemplate::new("sleep").arg("30"));
        let started = std::time::Instant::now();
        let outcome = MethodExecutor::new()
            .run(
                &spec,
                &job(&scratch),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
