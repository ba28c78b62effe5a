//! Conversion methods: what can be run for a format pair.
//!
//! A method is an opaque black box that turns one input file into one output
//! file inside a scratch directory. Two kinds exist:
//!
//! * [`Invocation::Command`]: an external program (LibreOffice, ffmpeg, …)
//!   described by a [`CommandTemplate`] whose arguments carry placeholders.
//! * [`Invocation::Builtin`]: an in-process implementation of
//!   [`BuiltinMethod`] (raster transcoding, markup conversions).
//!
//! Methods never decide whether they succeeded on their own: the executor
//! enforces the time bound and the output validator has the final word.
//!
//! ```text
//! methods/
//!  ├─ command.rs   external program runner (placeholder expansion, stderr tail)
//!  ├─ builtin.rs   in-process methods
//!  └─ defaults.rs  tool discovery and the default capability table
//! ```

pub mod builtin;
pub mod command;
pub mod defaults;

use crate::config::QualitySettings;
use crate::error::MethodError;
use crate::format::Format;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use command::CommandTemplate;

/// Stable identifier of a method, e.g. `libreoffice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(String);

impl MethodId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MethodId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MethodId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Everything a method needs to know about one attempt.
#[derive(Debug, Clone)]
pub struct MethodJob {
    pub request_id: String,
    /// Input file (read-only; never modified by a method).
    pub source: PathBuf,
    /// Where the artifact is expected: `{scratch}/out/{stem}.{ext}`.
    pub output: PathBuf,
    /// The attempt's exclusive scratch directory.
    pub scratch: PathBuf,
    pub source_format: Format,
    pub target_format: Format,
    pub quality: QualitySettings,
}

impl MethodJob {
    /// Directory the artifact is written into.
    pub fn out_dir(&self) -> PathBuf {
        self.scratch.join("out")
    }

    /// File stem of the source, used to name outputs.
    pub fn stem(&self) -> String {
        self.source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string())
    }
}

/// An in-process conversion method.
///
/// Implementations write their artifact somewhere inside `job.scratch`
/// (normally `job.output`) and return its path. A path outside the scratch
/// directory is treated as a failure by the executor.
#[async_trait]
pub trait BuiltinMethod: Send + Sync {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError>;
}

/// How a method is executed.
#[derive(Clone)]
pub enum Invocation {
    Command(CommandTemplate),
    Builtin(Arc<dyn BuiltinMethod>),
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Command(t) => f.debug_tuple("Command").field(t).finish(),
            Invocation::Builtin(_) => f.write_str("Builtin(<dyn BuiltinMethod>)"),
        }
    }
}

/// A registered conversion method.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub id: MethodId,
    /// One-line human description for `--list-methods`.
    pub description: String,
    /// Default priority for routes that don't set one. Higher runs first.
    pub priority: i32,
    pub invocation: Invocation,
    /// Overrides [`crate::ConversionConfig::method_timeout`] for this method.
    pub timeout: Option<Duration>,
}

impl MethodSpec {
    pub fn command(id: impl Into<MethodId>, template: CommandTemplate) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            priority: 0,
            invocation: Invocation::Command(template),
            timeout: None,
        }
    }

    pub fn builtin(id: impl Into<MethodId>, method: impl BuiltinMethod + 'static) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            priority: 0,
            invocation: Invocation::Builtin(Arc::new(method)),
            timeout: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn kind(&self) -> &'static str {
        match self.invocation {
            Invocation::Command(_) => "command",
            Invocation::Builtin(_) => "builtin",
        }
    }
}
