//! Content-signature sniffing: classify a file by its leading bytes.
//!
//! Both ends of a conversion rely on this. The security gate refuses input
//! whose bytes disagree with the declared format (a renamed executable is
//! still an executable), and the output validator refuses artifacts whose
//! bytes disagree with the target format (a tool that "succeeded" by writing
//! an error page into `out.pdf` did not produce a PDF).
//!
//! Only the first [`SNIFF_LEN`] bytes are ever read.

use crate::format::{Format, FormatCategory};
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;

/// Number of leading bytes inspected.
pub const SNIFF_LEN: usize = 4096;

/// What the leading bytes of a file look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signature {
    Pdf,
    /// ZIP container whose first entry is the OOXML `[Content_Types].xml`.
    Ooxml,
    /// ZIP container whose first entry is an OpenDocument `mimetype`.
    OpenDocument,
    /// ZIP container of undetermined flavour.
    Zip,
    /// OLE2 compound file (legacy `.doc` / `.xls` / `.ppt`).
    Ole2,
    Rtf,
    Png,
    Jpeg,
    Gif,
    Bmp,
    Tiff,
    Webp,
    Svg,
    Mp3,
    Wav,
    Flac,
    Aac,
    Ogg,
    Mp4,
    M4a,
    QuickTime,
    Matroska,
    Webm,
    Avi,
    Html,
    Text,
    /// Native executable or script (PE, ELF, Mach-O, shebang).
    Executable,
    Unknown,
}

impl Signature {
    /// Formats whose files legitimately carry this signature.
    pub fn formats(self) -> &'static [Format] {
        use Format as F;
        match self {
            Signature::Pdf => &[F::Pdf],
            Signature::Ooxml => &[F::Docx, F::Xlsx, F::Pptx],
            Signature::OpenDocument => &[F::Odt, F::Ods, F::Odp],
            Signature::Zip => &[F::Docx, F::Xlsx, F::Pptx, F::Odt, F::Ods, F::Odp],
            Signature::Ole2 => &[F::Doc, F::Xls, F::Ppt],
            Signature::Rtf => &[F::Rtf],
            Signature::Png => &[F::Png],
            Signature::Jpeg => &[F::Jpeg],
            Signature::Gif => &[F::Gif],
            Signature::Bmp => &[F::Bmp],
            Signature::Tiff => &[F::Tiff],
            Signature::Webp => &[F::Webp],
            Signature::Svg => &[F::Svg],
            Signature::Mp3 => &[F::Mp3],
            Signature::Wav => &[F::Wav],
            Signature::Flac => &[F::Flac],
            Signature::Aac => &[F::Aac],
            Signature::Ogg => &[F::Ogg, F::Opus],
            Signature::Mp4 => &[F::Mp4, F::Mov, F::M4a],
            Signature::M4a => &[F::M4a],
            Signature::QuickTime => &[F::Mov, F::Mp4],
            Signature::Matroska => &[F::Mkv, F::Webm],
            Signature::Webm => &[F::Webm, F::Mkv],
            Signature::Avi => &[F::Avi],
            Signature::Html => &[F::Html],
            Signature::Text => &[F::Txt, F::Csv],
            Signature::Executable | Signature::Unknown => &[],
        }
    }

    /// Whether content with this signature may be declared as `format`.
    pub fn matches_format(self, format: Format) -> bool {
        self.formats().contains(&format)
    }

    /// Whether content with this signature belongs to `category` at all.
    pub fn matches_category(self, category: FormatCategory) -> bool {
        self.formats().iter().any(|f| f.category() == category)
    }

    pub fn is_executable(self) -> bool {
        self == Signature::Executable
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde's snake_case names double as the display form
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&name)
    }
}

/// Read at most [`SNIFF_LEN`] leading bytes of a file.
pub fn read_head(path: &Path) -> io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(head)
}

/// Sniff the signature of a file on disk.
pub fn sniff_file(path: &Path) -> io::Result<Signature> {
    read_head(path).map(|head| sniff(&head))
}

/// Classify a byte prefix.
pub fn sniff(head: &[u8]) -> Signature {
    if head.is_empty() {
        return Signature::Unknown;
    }

    if is_executable(head) {
        return Signature::Executable;
    }

    // UTF-16 little-endian starts with FF FE, which would otherwise pass
    // for an MPEG frame sync below.
    if unicode_bom(head).is_some() {
        return sniff_text(head);
    }

    if head.starts_with(b"%PDF") {
        return Signature::Pdf;
    }

    if head.starts_with(b"PK\x03\x04") {
        return sniff_zip(head);
    }
    // Empty archive: only the end-of-central-directory record.
    if head.starts_with(b"PK\x05\x06") {
        return Signature::Zip;
    }

    if head.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return Signature::Ole2;
    }
    if head.starts_with(b"{\\rtf") {
        return Signature::Rtf;
    }

    // ── Images ───────────────────────────────────────────────────────────
    if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Signature::Png;
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Signature::Jpeg;
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Signature::Gif;
    }
    if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        return Signature::Tiff;
    }
    if head.len() >= 14 && head.starts_with(b"BM") {
        return Signature::Bmp;
    }

    // ── RIFF family ──────────────────────────────────────────────────────
    if head.len() >= 12 && head.starts_with(b"RIFF") {
        return match &head[8..12] {
            b"WEBP" => Signature::Webp,
            b"WAVE" => Signature::Wav,
            b"AVI " => Signature::Avi,
            _ => Signature::Unknown,
        };
    }

    // ── Audio ────────────────────────────────────────────────────────────
    if head.starts_with(b"fLaC") {
        return Signature::Flac;
    }
    if head.starts_with(b"OggS") {
        return Signature::Ogg;
    }
    if head.starts_with(b"ID3") {
        return Signature::Mp3;
    }

    // ── ISO base media (mp4 / m4a / mov) ─────────────────────────────────
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"M4A " | b"M4B " => Signature::M4a,
            b"qt  " => Signature::QuickTime,
            _ => Signature::Mp4,
        };
    }

    // ── EBML (mkv / webm) ────────────────────────────────────────────────
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return if contains(head, b"webm") {
            Signature::Webm
        } else {
            Signature::Matroska
        };
    }

    // MPEG audio frame sync. Layer bits 00 mean ADTS AAC.
    if head.len() >= 2 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0 {
        return if head[1] & 0x06 == 0 {
            Signature::Aac
        } else {
            Signature::Mp3
        };
    }

    sniff_text(head)
}

fn is_executable(head: &[u8]) -> bool {
    const MAGICS: &[&[u8]] = &[
        b"MZ",
        b"\x7fELF",
        b"#!",
        &[0xFE, 0xED, 0xFA, 0xCE],
        &[0xFE, 0xED, 0xFA, 0xCF],
        &[0xCE, 0xFA, 0xED, 0xFE],
        &[0xCF, 0xFA, 0xED, 0xFE],
        &[0xCA, 0xFE, 0xBA, 0xBE],
    ];
    MAGICS.iter().any(|m| head.starts_with(m))
}

/// Classify a ZIP by the name of its first local entry.
///
/// OpenDocument requires an uncompressed `mimetype` entry first, and the
/// Office Open XML writers put `[Content_Types].xml` first. Anything else
/// stays a plain [`Signature::Zip`] until the validator opens the archive.
fn sniff_zip(head: &[u8]) -> Signature {
    const LOCAL_HEADER_LEN: usize = 30;
    let Some(len) = head.get(26..28).map(|b| u16::from_le_bytes([b[0], b[1]]) as usize) else {
        return Signature::Zip;
    };
    match head.get(LOCAL_HEADER_LEN..LOCAL_HEADER_LEN + len) {
        Some(b"mimetype") => Signature::OpenDocument,
        Some(b"[Content_Types].xml") => Signature::Ooxml,
        _ => Signature::Zip,
    }
}

fn sniff_text(head: &[u8]) -> Signature {
    let text = if unicode_bom(head).is_some() {
        decode_text(head)
    } else if head.contains(&0) {
        return Signature::Unknown;
    } else {
        match std::str::from_utf8(head) {
            // A multi-byte character cut off by the sniff window is still text.
            Err(e) if e.error_len().is_none() => decode_text(&head[..e.valid_up_to()]),
            _ => decode_text(head),
        }
    };

    // Undefined Windows-1252 bytes decode to C1 controls and land here too.
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0C'))
    {
        return Signature::Unknown;
    }

    let lower = text.trim_start().to_ascii_lowercase();
    if lower.contains("<svg") {
        Signature::Svg
    } else if lower.starts_with("<!doctype html") || lower.contains("<html") {
        Signature::Html
    } else {
        Signature::Text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bom {
    Utf8,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
}

impl Bom {
    fn len(self) -> usize {
        match self {
            Bom::Utf8 => 3,
            Bom::Utf16Le | Bom::Utf16Be => 2,
            Bom::Utf32Le | Bom::Utf32Be => 4,
        }
    }
}

fn unicode_bom(bytes: &[u8]) -> Option<Bom> {
    // UTF-32LE shares its first two bytes with UTF-16LE.
    if bytes.starts_with(&[0xFF, 0xFE, 0x00, 0x00]) {
        return Some(Bom::Utf32Le);
    }
    if bytes.starts_with(&[0x00, 0x00, 0xFE, 0xFF]) {
        return Some(Bom::Utf32Be);
    }
    match Encoding::for_bom(bytes) {
        Some((enc, _)) if enc == UTF_16LE => Some(Bom::Utf16Le),
        Some((enc, _)) if enc == UTF_16BE => Some(Bom::Utf16Be),
        Some(_) => Some(Bom::Utf8),
        None => None,
    }
}

/// Decode text bytes to a string.
///
/// A byte-order mark picks the encoding (UTF-8, UTF-16 or UTF-32). Without
/// one, valid UTF-8 is taken as is and anything else is read as
/// Windows-1252, the code page of most legacy CSV and TXT exports.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    match unicode_bom(bytes) {
        Some(bom @ (Bom::Utf32Le | Bom::Utf32Be)) => {
            let text = bytes[bom.len()..]
                .chunks_exact(4)
                .map(|c| {
                    let unit = [c[0], c[1], c[2], c[3]];
                    let n = if bom == Bom::Utf32Le {
                        u32::from_le_bytes(unit)
                    } else {
                        u32::from_be_bytes(unit)
                    };
                    char::from_u32(n).unwrap_or(char::REPLACEMENT_CHARACTER)
                })
                .collect();
            Cow::Owned(text)
        }
        Some(bom) => {
            let encoding = match bom {
                Bom::Utf16Le => UTF_16LE,
                Bom::Utf16Be => UTF_16BE,
                _ => encoding_rs::UTF_8,
            };
            encoding.decode_without_bom_handling(&bytes[bom.len()..]).0
        }
        None => match std::str::from_utf8(bytes) {
            Ok(s) => Cow::Borrowed(s),
            Err(_) => WINDOWS_1252.decode_without_bom_handling(bytes).0,
        },
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
