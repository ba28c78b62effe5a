//! The closed set of formats the engine knows how to reason about.
//!
//! Every request names a source and a target [`Format`]. The format decides
//! three things downstream: which extensions the security gate accepts, which
//! content signature the gate and the validator expect, and which capability
//! table row the router looks up. Keeping the set closed (an enum, not free
//! strings) means an unknown extension is rejected once, at the edge, instead
//! of leaking into routing as a key nothing matches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Broad family a format belongs to. The security gate's extension
/// allow-lists and signature checks are keyed by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatCategory {
    Document,
    Image,
    Audio,
    Video,
}

impl FormatCategory {
    pub const ALL: [FormatCategory; 4] = [
        FormatCategory::Document,
        FormatCategory::Image,
        FormatCategory::Audio,
        FormatCategory::Video,
    ];

    /// Every extension (including aliases such as `jpg`/`jpeg`) of every
    /// format in this category.
    pub fn extensions(self) -> Vec<&'static str> {
        Format::ALL
            .iter()
            .filter(|f| f.category() == self)
            .flat_map(|f| f.aliases().iter().copied())
            .collect()
    }
}

impl fmt::Display for FormatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FormatCategory::Document => "document",
            FormatCategory::Image => "image",
            FormatCategory::Audio => "audio",
            FormatCategory::Video => "video",
        };
        f.write_str(s)
    }
}

/// A concrete file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    // ── Documents ────────────────────────────────────────────────────────
    Pdf,
    Docx,
    Doc,
    Odt,
    Rtf,
    Txt,
    Html,
    Xlsx,
    Xls,
    Ods,
    Csv,
    Pptx,
    Ppt,
    Odp,
    // ── Images ───────────────────────────────────────────────────────────
    Png,
    Jpeg,
    Gif,
    Bmp,
    Tiff,
    Webp,
    Svg,
    // ── Audio ────────────────────────────────────────────────────────────
    Mp3,
    Wav,
    Flac,
    Aac,
    Ogg,
    M4a,
    Opus,
    // ── Video ────────────────────────────────────────────────────────────
    Mp4,
    Mkv,
    Avi,
    Mov,
    Webm,
}

/// Returned when a string names no known format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown format '{0}'")]
pub struct UnknownFormat(pub String);

impl Format {
    pub const ALL: [Format; 33] = [
        Format::Pdf,
        Format::Docx,
        Format::Doc,
        Format::Odt,
        Format::Rtf,
        Format::Txt,
        Format::Html,
        Format::Xlsx,
        Format::Xls,
        Format::Ods,
        Format::Csv,
        Format::Pptx,
        Format::Ppt,
        Format::Odp,
        Format::Png,
        Format::Jpeg,
        Format::Gif,
        Format::Bmp,
        Format::Tiff,
        Format::Webp,
        Format::Svg,
        Format::Mp3,
        Format::Wav,
        Format::Flac,
        Format::Aac,
        Format::Ogg,
        Format::M4a,
        Format::Opus,
        Format::Mp4,
        Format::Mkv,
        Format::Avi,
        Format::Mov,
        Format::Webm,
    ];

    /// Canonical extension, used when naming outputs.
    pub fn extension(self) -> &'static str {
        self.aliases()[0]
    }

    /// All extensions that identify this format. The first entry is canonical.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Format::Pdf => &["pdf"],
            Format::Docx => &["docx"],
            Format::Doc => &["doc"],
            Format::Odt => &["odt"],
            Format::Rtf => &["rtf"],
            Format::Txt => &["txt", "text"],
            Format::Html => &["html", "htm"],
            Format::Xlsx => &["xlsx"],
            Format::Xls => &["xls"],
            Format::Ods => &["ods"],
            Format::Csv => &["csv"],
            Format::Pptx => &["pptx"],
            Format::Ppt => &["ppt"],
            Format::Odp => &["odp"],
            Format::Png => &["png"],
            Format::Jpeg => &["jpg", "jpeg"],
            Format::Gif => &["gif"],
            Format::Bmp => &["bmp"],
            Format::Tiff => &["tiff", "tif"],
            Format::Webp => &["webp"],
            Format::Svg => &["svg"],
            Format::Mp3 => &["mp3"],
            Format::Wav => &["wav"],
            Format::Flac => &["flac"],
            Format::Aac => &["aac"],
            Format::Ogg => &["ogg", "oga"],
            Format::M4a => &["m4a"],
            Format::Opus => &["opus"],
            Format::Mp4 => &["mp4", "m4v"],
            Format::Mkv => &["mkv"],
            Format::Avi => &["avi"],
            Format::Mov => &["mov"],
            Format::Webm => &["webm"],
        }
    }

    pub fn category(self) -> FormatCategory {
        use Format::*;
        match self {
            Pdf | Docx | Doc | Odt | Rtf | Txt | Html | Xlsx | Xls | Ods | Csv | Pptx | Ppt
            | Odp => FormatCategory::Document,
            Png | Jpeg | Gif | Bmp | Tiff | Webp | Svg => FormatCategory::Image,
            Mp3 | Wav | Flac | Aac | Ogg | M4a | Opus => FormatCategory::Audio,
            Mp4 | Mkv | Avi | Mov | Webm => FormatCategory::Video,
        }
    }

    /// Plain-text based formats (validated as UTF-8 rather than by structure).
    pub fn is_text(self) -> bool {
        matches!(self, Format::Txt | Format::Html | Format::Csv | Format::Svg)
    }

    /// Raster images the `image` crate can decode.
    pub fn is_raster_image(self) -> bool {
        matches!(
            self,
            Format::Png | Format::Jpeg | Format::Gif | Format::Bmp | Format::Tiff | Format::Webp
        )
    }

    /// Office formats stored as ZIP containers (OOXML and OpenDocument).
    pub fn is_zip_container(self) -> bool {
        matches!(
            self,
            Format::Docx | Format::Xlsx | Format::Pptx | Format::Odt | Format::Ods | Format::Odp
        )
    }

    /// Audio or video, i.e. something with a duration.
    pub fn is_timed_media(self) -> bool {
        matches!(self.category(), FormatCategory::Audio | FormatCategory::Video)
    }

    /// Look up a format by file extension (case-insensitive, leading dot optional).
    pub fn from_extension(ext: &str) -> Option<Format> {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        Format::ALL
            .iter()
            .copied()
            .find(|f| f.aliases().contains(&ext.as_str()))
    }

    /// Infer a format from a path's extension.
    pub fn from_path(path: &Path) -> Option<Format> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Format::from_extension)
    }
}

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::from_extension(s).ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
