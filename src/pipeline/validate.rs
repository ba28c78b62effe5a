//! Artifact validation.
//!
//! A method exiting 0 proves very little: LibreOffice happily writes a
//! zero-byte PDF when a filter crashes, ffmpeg can emit a container with no
//! frames, and some tools write an HTML error page under whatever name they
//! were given. The validator inspects what is actually on disk and has the
//! final word on whether an attempt succeeded.
//!
//! | Code                 | Severity | Check                                       |
//! |----------------------|----------|---------------------------------------------|
//! | `missing_artifact`   | error    | artifact exists                             |
//! | `empty_artifact`     | error    | size > 0                                    |
//! | `signature_mismatch` | error    | leading bytes match the target format       |
//! | `unreadable_pdf`     | error    | PDF parses (xref, object streams)           |
//! | `no_pages`           | error    | PDF page tree has at least one page         |
//! | `missing_trailer`    | warning  | PDF ends with `%%EOF`                        |
//! | `truncated_archive`  | error    | ZIP central directory opens                 |
//! | `missing_manifest`   | error    | `[Content_Types].xml` (OOXML) or `mimetype` (ODF) entry |
//! | `undecodable_image`  | error    | raster decodes to non-zero dimensions       |
//! | `zero_duration`      | error    | audio/video has a positive duration         |
//! | `duration_unchecked` | warning  | no prober available for this media          |
//! | `non_utf8_text`      | warning  | text output is valid UTF-8                  |
//!
//! Everything after the signature check only runs with `deep_validation`.

use super::signature::{read_head, sniff};
use crate::config::ConversionConfig;
use crate::format::Format;
use crate::output::ValidationIssue;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Bytes scanned from the end of a PDF for `%%EOF`.
const PDF_TRAILER_WINDOW: usize = 1024;

#[derive(Debug, Clone)]
pub struct OutputValidator {
    deep: bool,
    ffprobe: Option<PathBuf>,
    probe_timeout: Duration,
}

impl OutputValidator {
    pub fn new(deep: bool, ffprobe: Option<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            deep,
            ffprobe,
            probe_timeout,
        }
    }

    /// Validator for `config`, locating `ffprobe` like the tool discovery does.
    pub fn from_config(config: &ConversionConfig) -> Self {
        let ffprobe = config
            .tool_paths
            .get("ffprobe")
            .filter(|p| p.exists())
            .cloned()
            .or_else(|| which::which("ffprobe").ok());
        Self::new(config.deep_validation, ffprobe, config.probe_timeout)
    }

    /// Inspect `artifact` as a `target` file. An empty list means a clean pass.
    pub async fn validate(&self, artifact: &Path, target: Format) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        // ── Step 1: presence and size ────────────────────────────────────
        let meta = match tokio::fs::metadata(artifact).await {
            Ok(m) if m.is_file() => m,
            _ => {
                issues.push(ValidationIssue::error(
                    "missing_artifact",
                    format!("no output file at '{}'", artifact.display()),
                ));
                return issues;
            }
        };
        if meta.len() == 0 {
            issues.push(ValidationIssue::error(
                "empty_artifact",
                "output file is empty",
            ));
            return issues;
        }

        // ── Step 2: signature ────────────────────────────────────────────
        let path = artifact.to_path_buf();
        let head = tokio::task::spawn_blocking(move || read_head(&path))
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let signature = sniff(&head);
        if !signature.matches_format(target) {
            issues.push(ValidationIssue::error(
                "signature_mismatch",
                format!("expected {target} content, found {signature}"),
            ));
            return issues;
        }

        if !self.deep {
            return issues;
        }

        // ── Step 3: format-specific structure ────────────────────────────
        if target == Format::Pdf {
            check_pdf(artifact, &mut issues).await;
        } else if target.is_zip_container() {
            check_zip(artifact, target, &mut issues).await;
        } else if target.is_raster_image() {
            check_image(artifact, &mut issues).await;
        } else if target.is_timed_media() {
            self.check_duration(artifact, target, &mut issues).await;
        } else if target.is_text() {
            check_utf8(artifact, &mut issues).await;
        }

        if !issues.is_empty() {
            debug!(
                "Validation of {} found {} issue(s)",
                artifact.display(),
                issues.len()
            );
        }
        issues
    }

    async fn check_duration(
        &self,
        artifact: &Path,
        target: Format,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let duration = if target == Format::Wav {
            tokio::fs::read(artifact)
                .await
                .ok()
                .and_then(|b| wav_duration(&b))
        } else if let Some(ffprobe) = &self.ffprobe {
            probe_duration(ffprobe, artifact, self.probe_timeout).await
        } else {
            issues.push(ValidationIssue::warning(
                "duration_unchecked",
                "ffprobe is not available; media duration was not checked",
            ));
            return;
        };

        match duration {
            Some(d) if d > 0.0 => {}
            Some(_) => issues.push(ValidationIssue::error(
                "zero_duration",
                "media has zero duration",
            )),
            None => issues.push(ValidationIssue::error(
                "zero_duration",
                "media duration could not be determined",
            )),
        }
    }
}

/// Parse the PDF and count pages through the page tree, so pages stored in
/// compressed object streams are found too.
async fn check_pdf(artifact: &Path, issues: &mut Vec<ValidationIssue>) {
    let bytes = match tokio::fs::read(artifact).await {
        Ok(b) => b,
        Err(e) => {
            issues.push(ValidationIssue::error(
                "missing_artifact",
                format!("cannot read output: {e}"),
            ));
            return;
        }
    };

    let from = bytes.len().saturating_sub(PDF_TRAILER_WINDOW);
    let has_trailer = contains(&bytes[from..], b"%%EOF");

    let pages = tokio::task::spawn_blocking(move || {
        lopdf::Document::load_mem(&bytes).map(|doc| doc.get_pages().len())
    })
    .await;
    match pages {
        Ok(Ok(0)) => issues.push(ValidationIssue::error("no_pages", "PDF has no pages")),
        Ok(Ok(n)) => debug!("PDF has {} page(s)", n),
        Ok(Err(e)) => issues.push(ValidationIssue::error(
            "unreadable_pdf",
            format!("PDF cannot be parsed: {e}"),
        )),
        Err(e) => issues.push(ValidationIssue::error(
            "unreadable_pdf",
            format!("PDF check panicked: {e}"),
        )),
    }

    if !has_trailer {
        issues.push(ValidationIssue::warning(
            "missing_trailer",
            "PDF has no %%EOF trailer",
        ));
    }
}

/// The entry every container of `target`'s family must carry.
fn manifest_entry(target: Format) -> &'static str {
    match target {
        Format::Odt | Format::Ods | Format::Odp => "mimetype",
        _ => "[Content_Types].xml",
    }
}

/// Open the archive's central directory and look for its manifest entry.
async fn check_zip(artifact: &Path, target: Format, issues: &mut Vec<ValidationIssue>) {
    let path = artifact.to_path_buf();
    let manifest = manifest_entry(target);
    let opened = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let archive = zip::ZipArchive::new(BufReader::new(file))?;
        let found = archive.file_names().any(|n| n == manifest);
        Ok::<_, zip::result::ZipError>(found)
    })
    .await;

    match opened {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => issues.push(ValidationIssue::error(
            "missing_manifest",
            format!("archive has no '{manifest}' entry for {target}"),
        )),
        Ok(Err(e)) => issues.push(ValidationIssue::error(
            "truncated_archive",
            format!("archive cannot be opened: {e}"),
        )),
        Err(e) => issues.push(ValidationIssue::error(
            "truncated_archive",
            format!("archive check panicked: {e}"),
        )),
    }
}

async fn check_image(artifact: &Path, issues: &mut Vec<ValidationIssue>) {
    let path = artifact.to_path_buf();
    let dims = tokio::task::spawn_blocking(move || image::image_dimensions(&path)).await;
    match dims {
        Ok(Ok((w, h))) if w > 0 && h > 0 => {}
        Ok(Ok((w, h))) => issues.push(ValidationIssue::error(
            "undecodable_image",
            format!("image has degenerate dimensions {w}x{h}"),
        )),
        Ok(Err(e)) => issues.push(ValidationIssue::error(
            "undecodable_image",
            format!("image cannot be decoded: {e}"),
        )),
        Err(e) => issues.push(ValidationIssue::error(
            "undecodable_image",
            format!("image check panicked: {e}"),
        )),
    }
}

async fn check_utf8(artifact: &Path, issues: &mut Vec<ValidationIssue>) {
    if let Ok(bytes) = tokio::fs::read(artifact).await {
        if std::str::from_utf8(&bytes).is_err() {
            issues.push(ValidationIssue::warning(
                "non_utf8_text",
                "text output is not valid UTF-8",
            ));
        }
    }
}

/// Duration in seconds from a RIFF/WAVE header: `data` size over byte rate.
pub(crate) fn wav_duration(bytes: &[u8]) -> Option<f64> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    let mut byte_rate: Option<u32> = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().ok()?) as usize;
        let body = pos + 8;
        match id {
            b"fmt " if body + 12 <= bytes.len() => {
                byte_rate = Some(u32::from_le_bytes(
                    bytes[body + 8..body + 12].try_into().ok()?,
                ));
            }
            b"data" => {
                let rate = byte_rate.filter(|r| *r > 0)?;
                // Streamed WAVs may leave the size unset; trust the file length.
                let available = bytes.len().saturating_sub(body);
                let data_len = if len == 0 || len > available { available } else { len };
                return Some(data_len as f64 / rate as f64);
            }
            _ => {}
        }
        // Chunks are word-aligned.
        pos = body + len + (len & 1);
    }
    None
}

async fn probe_duration(ffprobe: &Path, artifact: &Path, bound: Duration) -> Option<f64> {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=nw=1:nk=1",
    ])
    .arg(artifact)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = tokio::time::timeout(bound, child.wait_with_output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
