//! Tool discovery and the default capability table.
//!
//! Priorities (higher runs first):
//!
//! | Method                   | Priority | Covers                                   |
//! |--------------------------|----------|------------------------------------------|
//! | `image`                  | 100      | raster ↔ raster                          |
//! | `onlyoffice`             | 100      | office documents, spreadsheets, slides   |
//! | `pdftotext`              | 90       | pdf → txt                                |
//! | `libreoffice`            | 80       | office documents, spreadsheets, slides, svg |
//! | `libreoffice-pdf-import` | 70       | pdf → docx / odt                         |
//! | `ffmpeg`                 | 50       | audio, video, raster images              |
//! | `text-html` & co.        | 20       | last-resort text conversions             |
//!
//! External methods are only registered when their tool was found.

use super::builtin::{CsvToHtml, HtmlToText, ImageTranscode, RtfToText, TextToHtml};
use super::{CommandTemplate, MethodSpec};
use crate::error::ConvertError;
use crate::format::Format;
use crate::pipeline::router::{Router, RouterBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Known tools and the executable names each may be installed under.
const KNOWN_TOOLS: &[(&str, &[&str])] = &[
    (
        "docbuilder",
        &["docbuilder", "documentbuilder", "onlyoffice-documentbuilder"],
    ),
    ("soffice", &["soffice", "libreoffice"]),
    ("pdftotext", &["pdftotext"]),
    ("ffmpeg", &["ffmpeg"]),
    ("ffprobe", &["ffprobe"]),
];

const WRITER_IN: &[Format] = &[
    Format::Docx,
    Format::Doc,
    Format::Odt,
    Format::Rtf,
    Format::Txt,
    Format::Html,
];
const WRITER_OUT: &[Format] = &[
    Format::Pdf,
    Format::Docx,
    Format::Doc,
    Format::Odt,
    Format::Rtf,
    Format::Txt,
    Format::Html,
];
const CALC_IN: &[Format] = &[Format::Xlsx, Format::Xls, Format::Ods, Format::Csv];
const CALC_OUT: &[Format] = &[
    Format::Pdf,
    Format::Xlsx,
    Format::Xls,
    Format::Ods,
    Format::Csv,
    Format::Html,
];
const IMPRESS_IN: &[Format] = &[Format::Pptx, Format::Ppt, Format::Odp];
const IMPRESS_OUT: &[Format] = &[Format::Pdf, Format::Pptx, Format::Ppt, Format::Odp];
const RASTER: &[Format] = &[
    Format::Png,
    Format::Jpeg,
    Format::Gif,
    Format::Bmp,
    Format::Tiff,
    Format::Webp,
];
const AUDIO: &[Format] = &[
    Format::Mp3,
    Format::Wav,
    Format::Flac,
    Format::Aac,
    Format::Ogg,
    Format::M4a,
    Format::Opus,
];
const VIDEO: &[Format] = &[Format::Mp4, Format::Mkv, Format::Avi, Format::Mov, Format::Webm];

/// Formats OnlyOffice's document builder cannot write.
const ONLYOFFICE_NO_SAVE: &[Format] = &[Format::Doc, Format::Xls, Format::Ppt, Format::Html];

/// Availability of one external tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    pub path: Option<PathBuf>,
}

/// Resolved locations of the external tools found on this machine.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, PathBuf>,
}

impl ToolSet {
    /// Look up every known tool.
    ///
    /// An override path that exists wins; otherwise each of the tool's
    /// executable names is tried on `PATH` with [`which::which`]. Missing
    /// tools are omitted.
    pub fn discover(overrides: &BTreeMap<String, PathBuf>) -> Self {
        let mut tools = BTreeMap::new();
        for &(name, executables) in KNOWN_TOOLS {
            let resolved = overrides
                .get(name)
                .filter(|p| p.exists())
                .cloned()
                .or_else(|| executables.iter().find_map(|exe| which::which(exe).ok()));
            match resolved {
                Some(path) => {
                    debug!("Found {} at {}", name, path.display());
                    tools.insert(name.to_string(), path);
                }
                None => debug!("{} not found", name),
            }
        }
        Self { tools }
    }

    /// Add or replace a tool location.
    pub fn with(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.tools.insert(name.into(), path.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.tools.get(name).map(PathBuf::as_path)
    }

    /// One entry per known tool, found or not.
    pub fn report(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&(name, _)| ToolInfo {
                name: name.to_string(),
                available: self.tools.contains_key(name),
                path: self.tools.get(name).cloned(),
            })
            .collect()
    }
}

/// Build the default router for the tools in `tools`.
pub fn default_router(tools: &ToolSet) -> Result<Router, ConvertError> {
    let mut b = Router::builder();

    // ── Built-ins (always available) ────────────────────────────────────
    b = b
        .method(
            MethodSpec::builtin("image", ImageTranscode)
                .priority(100)
                .description("Raster image transcoding (image crate)"),
        )
        .method(
            MethodSpec::builtin("text-html", TextToHtml)
                .priority(20)
                .description("Plain text to HTML paragraphs"),
        )
        .method(
            MethodSpec::builtin("html-text", HtmlToText)
                .priority(20)
                .description("HTML to plain text"),
        )
        .method(
            MethodSpec::builtin("csv-html", CsvToHtml)
                .priority(20)
                .description("CSV to an HTML table"),
        )
        .method(
            MethodSpec::builtin("rtf-text", RtfToText)
                .priority(20)
                .description("RTF to plain text"),
        );

    b = pairwise(b, RASTER, RASTER, "image");
    b = b
        .route(Format::Txt, Format::Html, "text-html")
        .route(Format::Html, Format::Txt, "html-text")
        .route(Format::Csv, Format::Html, "csv-html")
        .route(Format::Rtf, Format::Txt, "rtf-text");

    // ── OnlyOffice document builder ─────────────────────────────────────
    if let Some(path) = tools.get("docbuilder") {
        b = b.method(onlyoffice(path));
        let save = |out: &'static [Format]| -> Vec<Format> {
            out.iter()
                .copied()
                .filter(|f| !ONLYOFFICE_NO_SAVE.contains(f))
                .collect()
        };
        b = pairwise(b, WRITER_IN, &save(WRITER_OUT), "onlyoffice");
        b = pairwise(b, CALC_IN, &save(CALC_OUT), "onlyoffice");
        b = pairwise(b, IMPRESS_IN, &save(IMPRESS_OUT), "onlyoffice");
        b = b.route(Format::Pdf, Format::Docx, "onlyoffice");
    }

    // ── LibreOffice ─────────────────────────────────────────────────────
    if let Some(path) = tools.get("soffice") {
        b = b.method(libreoffice(path)).method(libreoffice_pdf_import(path));
        b = pairwise(b, WRITER_IN, WRITER_OUT, "libreoffice");
        b = pairwise(b, CALC_IN, CALC_OUT, "libreoffice");
        b = pairwise(b, IMPRESS_IN, IMPRESS_OUT, "libreoffice");
        b = pairwise(b, &[Format::Svg], &[Format::Pdf, Format::Png], "libreoffice");
        b = pairwise(b, &[Format::Pdf], &[Format::Docx, Format::Odt], "libreoffice-pdf-import");
    }

    // ── Poppler ─────────────────────────────────────────────────────────
    if let Some(path) = tools.get("pdftotext") {
        b = b
            .method(
                MethodSpec::command(
                    "pdftotext",
                    CommandTemplate::new(path).args([
                        "-layout", "-enc", "UTF-8", "{input}", "{output}",
                    ]),
                )
                .priority(90)
                .description("PDF text extraction (poppler)"),
            )
            .route(Format::Pdf, Format::Txt, "pdftotext");
    }

    // ── ffmpeg ──────────────────────────────────────────────────────────
    if let Some(path) = tools.get("ffmpeg") {
        b = b.method(ffmpeg(path));
        b = pairwise(b, AUDIO, AUDIO, "ffmpeg");
        b = pairwise(b, VIDEO, VIDEO, "ffmpeg");
        b = pairwise(b, VIDEO, AUDIO, "ffmpeg");
        b = pairwise(b, RASTER, RASTER, "ffmpeg");
    }

    b.build()
}

/// Route every `from × to` pair except same-format ones through `method`.
fn pairwise(mut b: RouterBuilder, from: &[Format], to: &[Format], method: &str) -> RouterBuilder {
    for &f in from {
        for &t in to {
            if f != t {
                b = b.route(f, t, method);
            }
        }
    }
    b
}

fn onlyoffice(program: &Path) -> MethodSpec {
    let script = "builder.OpenFile(\"{input}\");\n\
                  builder.SaveFile(\"{ext}\", \"{output}\");\n\
                  builder.CloseFile();\n";
    MethodSpec::command(
        "onlyoffice",
        CommandTemplate::new(program)
            .arg("{script}")
            .script("convert.docbuilder", script),
    )
    .priority(100)
    .description("OnlyOffice document builder")
}

fn libreoffice_base(program: &Path) -> CommandTemplate {
    // A private profile per attempt lets concurrent instances coexist.
    CommandTemplate::new(program).args([
        "--headless",
        "--norestore",
        "--nolockcheck",
        "--nodefault",
        "-env:UserInstallation=file://{scratch}/lo-profile",
    ])
}

fn libreoffice(program: &Path) -> MethodSpec {
    let mut t = libreoffice_base(program).args([
        "--convert-to",
        "{target_args}",
        "--outdir",
        "{outdir}",
        "{input}",
    ]);
    for f in [WRITER_OUT, CALC_OUT, IMPRESS_OUT, &[Format::Png]].concat() {
        let spec = match f {
            Format::Pdf => {
                r#"pdf:{office_module}_pdf_Export:{"Quality":{"type":"long","value":"{pdf_quality}"},"SelectPdfVersion":{"type":"long","value":"1"}}"#.to_string()
            }
            Format::Txt => "txt:Text (encoded):UTF8".to_string(),
            Format::Csv => "csv:Text - txt - csv (StarCalc):44,34,76".to_string(),
            other => other.extension().to_string(),
        };
        t = t.target_args(f, [spec]);
    }
    MethodSpec::command("libreoffice", t)
        .priority(80)
        .description("LibreOffice headless --convert-to")
}

fn libreoffice_pdf_import(program: &Path) -> MethodSpec {
    MethodSpec::command(
        "libreoffice-pdf-import",
        libreoffice_base(program).args([
            "--infilter=writer_pdf_import",
            "--convert-to",
            "{ext}",
            "--outdir",
            "{outdir}",
            "{input}",
        ]),
    )
    .priority(70)
    .description("LibreOffice PDF import into Writer")
}

fn ffmpeg(program: &Path) -> MethodSpec {
    let mut t = CommandTemplate::new(program).args([
        "-hide_banner",
        "-nostdin",
        "-loglevel",
        "error",
        "-y",
        "-i",
        "{input}",
        "{target_args}",
        "{output}",
    ]);

    let h264 = [
        "-c:v", "libx264", "-preset", "medium", "-crf", "{crf}", "-c:a", "aac", "-b:a",
        "{audio_bitrate}",
    ];
    t = t
        .target_args(Format::Mp4, [&h264[..], &["-movflags", "+faststart"]].concat())
        .target_args(Format::Mov, [&h264[..], &["-movflags", "+faststart"]].concat())
        .target_args(Format::Mkv, h264)
        .target_args(
            Format::Webm,
            [
                "-c:v", "libvpx-vp9", "-crf", "{crf}", "-b:v", "0", "-c:a", "libopus", "-b:a",
                "{audio_bitrate}",
            ],
        )
        .target_args(
            Format::Avi,
            ["-c:v", "mpeg4", "-q:v", "5", "-c:a", "libmp3lame", "-b:a", "{audio_bitrate}"],
        )
        .target_args(Format::Mp3, ["-vn", "-c:a", "libmp3lame", "-b:a", "{audio_bitrate}"])
        .target_args(Format::Wav, ["-vn", "-c:a", "pcm_s16le"])
        .target_args(Format::Flac, ["-vn", "-c:a", "flac"])
        .target_args(Format::Aac, ["-vn", "-c:a", "aac", "-b:a", "{audio_bitrate}"])
        .target_args(Format::M4a, ["-vn", "-c:a", "aac", "-b:a", "{audio_bitrate}"])
        .target_args(Format::Ogg, ["-vn", "-c:a", "libvorbis", "-b:a", "{audio_bitrate}"])
        .target_args(Format::Opus, ["-vn", "-c:a", "libopus", "-b:a", "{audio_bitrate}"])
        .target_args(Format::Jpeg, ["-frames:v", "1", "-q:v", "2"]);
    for &f in &[Format::Png, Format::Gif, Format::Bmp, Format::Tiff, Format::Webp] {
        t = t.target_args(f, ["-frames:v", "1"]);
    }

    MethodSpec::command("ffmpeg", t)
        .priority(50)
        .description("ffmpeg transcoding")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(router: &Router, from: Format, to: Format) -> Vec<String> {
        router
            .route(from, to)
            .map(|c| c.iter().map(|m| m.id.to_string()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn builtins_only_without_tools() {
        let router = default_router(&ToolSet::default()).unwrap();
        assert_eq!(chain(&router, Format::Png, Format::Jpeg), vec!["image"]);
        assert_eq!(chain(&router, Format::Txt, Format::Html), vec!["text-html"]);
        assert!(router.route(Format::Pdf, Format::Docx).is_err());
        assert!(router.route(Format::Svg, Format::Mp3).is_err());
    }

    #[test]
    fn full_toolset_orders_office_methods() {
        let tools = ToolSet::default()
            .with("docbuilder", "/opt/onlyoffice/docbuilder")
            .with("soffice", "/usr/bin/soffice")
            .with("pdftotext", "/usr/bin/pdftotext")
            .with("ffmpeg", "/usr/bin/ffmpeg");
        let router = default_router(&tools).unwrap();

        assert_eq!(
            chain(&router, Format::Pdf, Format::Docx),
            vec!["onlyoffice", "libreoffice-pdf-import"]
        );
        assert_eq!(
            chain(&router, Format::Docx, Format::Pdf),
            vec!["onlyoffice", "libreoffice"]
        );
        assert_eq!(
            chain(&router, Format::Txt, Format::Html),
            vec!["libreoffice", "text-html"]
        );
        assert_eq!(chain(&router, Format::Docx, Format::Doc), vec!["libreoffice"]);
        assert_eq!(chain(&router, Format::Pdf, Format::Txt), vec!["pdftotext"]);
        assert_eq!(chain(&router, Format::Png, Format::Webp), vec!["image", "ffmpeg"]);
        assert_eq!(chain(&router, Format::Mkv, Format::Mp3), vec!["ffmpeg"]);
        assert!(router.route(Format::Mp3, Format::Mp4).is_err());
    }

    #[test]
    fn ffmpeg_args_follow_quality() {
        use crate::config::QualityProfile;
        use crate::methods::{Invocation, MethodJob};

        let spec = ffmpeg(Path::new("ffmpeg"));
        let Invocation::Command(t) = &spec.invocation else {
            panic!("ffmpeg must be a command method");
        };
        let job = MethodJob {
            request_id: "r".into(),
            source: PathBuf::from("/in/clip.mkv"),
            output: PathBuf::from("/s/out/clip.mp4"),
            scratch: PathBuf::from("/s"),
            source_format: Format::Mkv,
            target_format: Format::Mp4,
            quality: QualityProfile::Low.settings(),
        };
        let args = t.render_args(&job);
        let crf = args.iter().position(|a| a == "-crf").unwrap();
        assert_eq!(args[crf + 1], "28");
        assert!(args.contains(&"64k".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/s/out/clip.mp4"));
    }

    #[test]
    fn report_lists_every_known_tool() {
        let report = ToolSet::default().with("ffmpeg", "/usr/bin/ffmpeg").report();
        assert_eq!(report.len(), KNOWN_TOOLS.len());
        assert!(report.iter().any(|t| t.name == "ffmpeg" && t.available));
        assert!(report.iter().any(|t| t.name == "soffice" && !t.available));
    }
}
