//! In-process conversion methods.
//!
//! These need no external tools, so they are always registered. They sit
//! at the bottom of their fallback chains, below the office suites and
//! ffmpeg, except raster-to-raster image conversion where the `image` crate
//! is the preferred method.
//!
//! CPU-heavy work (image decoding/encoding) runs on the blocking pool via
//! `spawn_blocking` so it never stalls the async executor. A blocking task
//! cannot be aborted, so it only ever works in memory: every file write
//! happens on the async side and is dropped with the attempt's future.

use super::{BuiltinMethod, MethodJob};
use crate::error::MethodError;
use crate::format::Format;
use crate::pipeline::signature::decode_text;
use async_trait::async_trait;
use encoding_rs::WINDOWS_1252;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use std::path::{Path, PathBuf};

// ── Image ────────────────────────────────────────────────────────────────

/// Raster-to-raster transcoding with the `image` crate.
///
/// JPEG output honours the quality profile's `image_quality`.
pub struct ImageTranscode;

#[async_trait]
impl BuiltinMethod for ImageTranscode {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        let target = encoder_format(job.target_format).ok_or_else(|| {
            MethodError::Failed(format!("no raster encoder for {}", job.target_format))
        })?;
        let quality = job.quality.image_quality;
        let bytes = tokio::fs::read(&job.source).await?;

        let encoded = tokio::task::spawn_blocking(move || transcode_image(&bytes, target, quality))
            .await
            .map_err(|e| MethodError::Failed(format!("image task failed: {e}")))??;

        write_output(job, &encoded).await
    }
}

fn encoder_format(format: Format) -> Option<ImageFormat> {
    match format {
        Format::Png => Some(ImageFormat::Png),
        Format::Jpeg => Some(ImageFormat::Jpeg),
        Format::Gif => Some(ImageFormat::Gif),
        Format::Bmp => Some(ImageFormat::Bmp),
        Format::Tiff => Some(ImageFormat::Tiff),
        Format::Webp => Some(ImageFormat::WebP),
        _ => None,
    }
}

/// Decode `source` and re-encode it as `target`, entirely in memory.
fn transcode_image(source: &[u8], target: ImageFormat, quality: u8) -> Result<Vec<u8>, MethodError> {
    let img = image::load_from_memory(source)
        .map_err(|e| MethodError::Failed(format!("cannot decode source image: {e}")))?;

    let mut w = Cursor::new(Vec::new());
    let written = match target {
        // JPEG has no alpha channel.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut w, quality.clamp(1, 100))),
        // These encoders only take 8-bit RGB(A).
        ImageFormat::Gif | ImageFormat::WebP | ImageFormat::Bmp => {
            DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut w, target)
        }
        other => img.write_to(&mut w, other),
    };
    written.map_err(|e| MethodError::Failed(format!("cannot encode {target:?}: {e}")))?;
    Ok(w.into_inner())
}

// ── Text → HTML ──────────────────────────────────────────────────────────

/// Plain text to a minimal HTML document, one `<p>` per paragraph.
pub struct TextToHtml;

#[async_trait]
impl BuiltinMethod for TextToHtml {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        let text = read_text(&job.source).await?;
        let mut body = String::new();
        for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let lines: Vec<_> = para.lines().map(html_escape::encode_text).collect();
            body.push_str(&format!("<p>{}</p>\n", lines.join("<br>\n")));
        }
        let html = html_document(&job.stem(), &body);
        write_output(job, html.as_bytes()).await
    }
}

// ── CSV → HTML ───────────────────────────────────────────────────────────

/// CSV to an HTML table; the first row becomes the header.
pub struct CsvToHtml;

#[async_trait]
impl BuiltinMethod for CsvToHtml {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        let text = read_text(&job.source).await?;
        let rows = parse_csv(&text);
        let mut body = String::from("<table>\n");
        let mut rows = rows.into_iter();
        if let Some(header) = rows.next() {
            body.push_str("<thead><tr>");
            for cell in &header {
                body.push_str(&format!("<th>{}</th>", html_escape::encode_text(cell)));
            }
            body.push_str("</tr></thead>\n<tbody>\n");
        }
        for row in rows {
            body.push_str("<tr>");
            for cell in &row {
                body.push_str(&format!("<td>{}</td>", html_escape::encode_text(cell)));
            }
            body.push_str("</tr>\n");
        }
        body.push_str("</tbody>\n</table>\n");
        let html = html_document(&job.stem(), &body);
        write_output(job, html.as_bytes()).await
    }
}

/// RFC 4180-style parsing: quoted fields, doubled quotes, CRLF or LF rows.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

// ── HTML → Text ──────────────────────────────────────────────────────────

static RE_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").unwrap());
static RE_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").unwrap());
static RE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static RE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static RE_BLOCK_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</(p|div|h[1-6]|li|tr|table|ul|ol|pre|blockquote|section|article|header|footer)\s*>")
        .unwrap()
});
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// HTML to plain text: drops scripts, styles and tags, keeps block breaks.
pub struct HtmlToText;

#[async_trait]
impl BuiltinMethod for HtmlToText {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        let html = read_text(&job.source).await?;
        let text = html_to_text(&html);
        write_output(job, text.as_bytes()).await
    }
}

fn html_to_text(html: &str) -> String {
    let s = RE_SCRIPT.replace_all(html, "");
    let s = RE_STYLE.replace_all(&s, "");
    let s = RE_COMMENT.replace_all(&s, "");
    let s = RE_BREAK.replace_all(&s, "\n");
    let s = RE_BLOCK_END.replace_all(&s, "\n\n");
    let s = RE_TAG.replace_all(&s, "");
    let s = html_escape::decode_html_entities(&s);

    let lines: Vec<String> = s
        .lines()
        .map(|l| RE_SPACES.replace_all(l, " ").trim().to_string())
        .collect();
    let joined = lines.join("\n");
    let mut out = RE_BLANK_LINES.replace_all(joined.trim(), "\n\n").into_owned();
    out.push('\n');
    out
}

// ── RTF → Text ───────────────────────────────────────────────────────────

/// RTF to plain text by walking control words and groups.
pub struct RtfToText;

#[async_trait]
impl BuiltinMethod for RtfToText {
    async fn run(&self, job: &MethodJob) -> Result<PathBuf, MethodError> {
        let bytes = tokio::fs::read(&job.source).await?;
        // RTF is 7-bit; anything else arrives through \'hh escapes.
        let rtf = String::from_utf8_lossy(&bytes);
        let text = rtf_to_text(&rtf);
        write_output(job, text.as_bytes()).await
    }
}

/// Destinations whose content is never document text.
const RTF_SKIP_DESTINATIONS: &[&str] = &[
    "fonttbl",
    "colortbl",
    "stylesheet",
    "info",
    "pict",
    "object",
    "header",
    "footer",
    "headerl",
    "headerr",
    "footerl",
    "footerr",
    "themedata",
    "colorschememapping",
    "datastore",
    "latentstyles",
    "listtable",
    "listoverridetable",
    "rsidtbl",
    "generator",
    "xmlnstbl",
    "filetbl",
    "revtbl",
];

#[derive(Clone, Copy)]
struct RtfGroup {
    ignorable: bool,
    uc: usize,
}

fn rtf_to_text(rtf: &str) -> String {
    let mut out = String::new();
    let mut stack: Vec<RtfGroup> = Vec::new();
    let mut state = RtfGroup {
        ignorable: false,
        uc: 1,
    };
    // Fallback characters still to drop after a \uN.
    let mut skip = 0usize;
    let chars: Vec<char> = rtf.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' => {
                stack.push(state);
                i += 1;
            }
            '}' => {
                state = stack.pop().unwrap_or(state);
                i += 1;
            }
            '\\' => {
                i += 1;
                let Some(&next) = chars.get(i) else { break };
                match next {
                    '\\' | '{' | '}' => {
                        emit(&mut out, next, &state, &mut skip);
                        i += 1;
                    }
                    '\'' => {
                        let hex: String = chars.iter().skip(i + 1).take(2).collect();
                        if let Ok(b) = u8::from_str_radix(&hex, 16) {
                            emit(&mut out, cp1252(b), &state, &mut skip);
                        }
                        i += 3;
                    }
                    '*' => {
                        state.ignorable = true;
                        i += 1;
                    }
                    '~' => {
                        emit(&mut out, ' ', &state, &mut skip);
                        i += 1;
                    }
                    '_' => {
                        emit(&mut out, '-', &state, &mut skip);
                        i += 1;
                    }
                    '\n' | '\r' => {
                        emit(&mut out, '\n', &state, &mut skip);
                        i += 1;
                    }
                    c if c.is_ascii_alphabetic() => {
                        let start = i;
                        while i < chars.len() && chars[i].is_ascii_alphabetic() {
                            i += 1;
                        }
                        let word: String = chars[start..i].iter().collect();
                        let pstart = i;
                        if i < chars.len() && chars[i] == '-' {
                            i += 1;
                        }
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                        let param: Option<i32> = if i > pstart {
                            chars[pstart..i].iter().collect::<String>().parse().ok()
                        } else {
                            None
                        };
                        if i < chars.len() && chars[i] == ' ' {
                            i += 1;
                        }

                        if RTF_SKIP_DESTINATIONS.contains(&word.as_str()) {
                            state.ignorable = true;
                            continue;
                        }
                        match word.as_str() {
                            "par" | "line" | "sect" | "row" | "page" => {
                                emit(&mut out, '\n', &state, &mut skip)
                            }
                            "tab" | "cell" => emit(&mut out, '\t', &state, &mut skip),
                            "emdash" => emit(&mut out, '—', &state, &mut skip),
                            "endash" => emit(&mut out, '–', &state, &mut skip),
                            "bullet" => emit(&mut out, '•', &state, &mut skip),
                            "lquote" => emit(&mut out, '‘', &state, &mut skip),
                            "rquote" => emit(&mut out, '’', &state, &mut skip),
                            "ldblquote" => emit(&mut out, '“', &state, &mut skip),
                            "rdblquote" => emit(&mut out, '”', &state, &mut skip),
                            "uc" => state.uc = param.unwrap_or(1).max(0) as usize,
                            "u" => {
                                if let Some(mut n) = param {
                                    if n < 0 {
                                        n += 65536;
                                    }
                                    if let Some(ch) = char::from_u32(n as u32) {
                                        emit(&mut out, ch, &state, &mut skip);
                                    }
                                    skip = state.uc;
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {
                        i += 1;
                    }
                }
            }
            // Raw line breaks are not content in RTF.
            '\r' | '\n' => i += 1,
            _ => {
                emit(&mut out, c, &state, &mut skip);
                i += 1;
            }
        }
    }

    let mut text = out.trim_end().to_string();
    text.push('\n');
    text
}

fn emit(out: &mut String, c: char, state: &RtfGroup, skip: &mut usize) {
    if *skip > 0 {
        *skip -= 1;
    } else if !state.ignorable {
        out.push(c);
    }
}

/// Windows-1252 byte to char (the code page RTF writers use by default).
fn cp1252(b: u8) -> char {
    WINDOWS_1252
        .decode_without_bom_handling(&[b])
        .0
        .chars()
        .next()
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Read a text source in whatever encoding the security gate accepted.
async fn read_text(path: &Path) -> Result<String, MethodError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(decode_text(&bytes).replace("\r\n", "\n"))
}

/// `job.out_dir()` is created by the executor before the method starts.
async fn write_output(job: &MethodJob, bytes: &[u8]) -> Result<PathBuf, MethodError> {
    tokio::fs::write(&job.output, bytes).await?;
    Ok(job.output.clone())
}

fn html_document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}</body>\n</html>\n",
        html_escape::encode_text(title),
        body
    )
}
