//! Pre-flight validation of input files.
//!
//! ## Why check before routing?
//!
//! Every external converter is a large parser exposed to whatever bytes the
//! caller hands it. The gate makes sure those bytes are at least what they
//! claim to be before any tool sees them: a regular readable file, within the
//! size limit, with an allowed extension, and with leading bytes that belong
//! to the declared category. A renamed executable never reaches a converter,
//! and a rejection leaves no trace (no backup, no scratch directory).
//!
//! The gate is stateless apart from its limits and is shared freely between
//! concurrent requests.

use super::signature::{read_head, sniff, Signature};
use crate::config::ConversionConfig;
use crate::error::SecurityError;
use crate::format::{Format, FormatCategory};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SecurityGate {
    max_input_bytes: u64,
    allowed: BTreeMap<FormatCategory, BTreeSet<String>>,
}

impl SecurityGate {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            max_input_bytes: config.max_input_bytes,
            allowed: config.allowed_extensions.clone(),
        }
    }

    /// Validate `path` as input declared to be `declared`.
    ///
    /// Returns the sniffed signature on acceptance.
    pub fn check(&self, path: &Path, declared: Format) -> Result<Signature, SecurityError> {
        let category = declared.category();

        // ── Step 1: existence and file type ──────────────────────────────
        let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SecurityError::NotFound {
                path: path.to_path_buf(),
            },
            ErrorKind::PermissionDenied => SecurityError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => SecurityError::Unreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
        })?;
        if !meta.is_file() {
            return Err(SecurityError::NotAFile {
                path: path.to_path_buf(),
            });
        }

        // ── Step 2: size ─────────────────────────────────────────────────
        let size = meta.len();
        if size == 0 {
            return Err(SecurityError::Empty {
                path: path.to_path_buf(),
            });
        }
        if size > self.max_input_bytes {
            return Err(SecurityError::TooLarge {
                path: path.to_path_buf(),
                size,
                limit: self.max_input_bytes,
            });
        }

        // ── Step 3: extension allow-list ─────────────────────────────────
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let allowed = self
            .allowed
            .get(&category)
            .is_some_and(|set| set.contains(&extension));
        if !allowed {
            return Err(SecurityError::ExtensionNotAllowed {
                path: path.to_path_buf(),
                extension,
                category,
            });
        }

        // ── Step 4: content signature ────────────────────────────────────
        let head = read_head(path).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => SecurityError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => SecurityError::Unreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
        })?;
        let signature = sniff(&head);

        match signature {
            Signature::Executable => {
                return Err(SecurityError::ExecutableContent {
                    path: path.to_path_buf(),
                })
            }
            Signature::Unknown => {
                let mut magic = [0u8; 4];
                let n = head.len().min(4);
                magic[..n].copy_from_slice(&head[..n]);
                return Err(SecurityError::UnrecognisedContent {
                    path: path.to_path_buf(),
                    magic,
                });
            }
            s if !s.matches_category(category) => {
                return Err(SecurityError::SignatureMismatch {
                    path: path.to_path_buf(),
                    declared,
                    detected: s,
                })
            }
            _ => {}
        }

        debug!(
            "Accepted {} ({} bytes, declared {}, detected {})",
            path.display(),
            size,
            declared,
            signature
        );
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const PDF: &[u8] = b"%PDF-1.4\n1 0 obj << /Type /Page >> endobj\n%%EOF\n";

    fn gate() -> SecurityGate {
        SecurityGate::from_config(&ConversionConfig::default())
    }

    fn write(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, bytes).unwrap();
        p
    }

    #[test]
    fn accepts_matching_pdf() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "report.pdf", PDF);
        assert_eq!(gate().check(&p, Format::Pdf).unwrap(), Signature::Pdf);
    }

    #[test]
    fn rejects_missing_file() {
        let err = gate()
            .check(Path::new("/definitely/not/here.pdf"), Format::Pdf)
            .unwrap_err();
        assert!(matches!(err, SecurityError::NotFound { .. }));
    }

    #[test]
    fn rejects_directory() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("folder.pdf");
        std::fs::create_dir(&sub).unwrap();
        let err = gate().check(&sub, Format::Pdf).unwrap_err();
        assert!(matches!(err, SecurityError::NotAFile { .. }));
    }

    #[test]
    fn rejects_empty_and_oversized() {
        let dir = TempDir::new().unwrap();
        let empty = write(&dir, "empty.pdf", b"");
        assert!(matches!(
            gate().check(&empty, Format::Pdf).unwrap_err(),
            SecurityError::Empty { .. }
        ));

        let config = ConversionConfig::builder()
            .max_input_bytes(16)
            .build()
            .unwrap();
        let big = write(&dir, "big.pdf", PDF);
        let err = SecurityGate::from_config(&config)
            .check(&big, Format::Pdf)
            .unwrap_err();
        assert!(matches!(err, SecurityError::TooLarge { limit: 16, .. }));
    }

    #[test]
    fn rejects_disallowed_extension() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "report.exe", PDF);
        let err = gate().check(&p, Format::Pdf).unwrap_err();
        assert!(matches!(
            err,
            SecurityError::ExtensionNotAllowed { ref extension, category: FormatCategory::Document, .. }
                if extension == "exe"
        ));
    }

    #[test]
    fn allow_list_is_configurable() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "report.pdf", PDF);
        let config = ConversionConfig::builder()
            .allowed_extensions(FormatCategory::Document, ["docx"])
            .build()
            .unwrap();
        let err = SecurityGate::from_config(&config)
            .check(&p, Format::Pdf)
            .unwrap_err();
        assert!(matches!(err, SecurityError::ExtensionNotAllowed { .. }));
    }

    #[test]
    fn rejects_executable_named_pdf() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "report.pdf", b"MZ\x90\x00\x03\x00\x00\x00");
        let err = gate().check(&p, Format::Pdf).unwrap_err();
        assert!(matches!(err, SecurityError::ExecutableContent { .. }));
    }

    #[test]
    fn rejects_category_mismatch() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "song.mp3", PDF);
        let err = gate().check(&p, Format::Mp3).unwrap_err();
        assert!(matches!(
            err,
            SecurityError::SignatureMismatch {
                declared: Format::Mp3,
                detected: Signature::Pdf,
                ..
            }
        ));
    }

    #[test]
    fn accepts_windows_1252_csv() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "clientes.csv", b"nome,cidade\nJos\xe9,S\xe3o Paulo\n");
        assert_eq!(gate().check(&p, Format::Csv).unwrap(), Signature::Text);
    }

    #[test]
    fn accepts_utf16_text_with_bom() {
        let dir = TempDir::new().unwrap();
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend("hello\r\nnotes\r\n".encode_utf16().flat_map(u16::to_le_bytes));
        let p = write(&dir, "notes.txt", &bytes);
        assert_eq!(gate().check(&p, Format::Txt).unwrap(), Signature::Text);
    }

    #[test]
    fn html_input_declared_as_text_is_still_a_document() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "page.txt", b"<html><body>saved page</body></html>");
        assert_eq!(gate().check(&p, Format::Txt).unwrap(), Signature::Html);
    }

    #[test]
    fn rejects_unrecognised_binary() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "photo.png", &[0x00, 0x01, 0xfe, 0xff, 0x00, 0x00, 0x13]);
        let err = gate().check(&p, Format::Png).unwrap_err();
        assert!(matches!(
            err,
            SecurityError::UnrecognisedContent {
                magic: [0x00, 0x01, 0xfe, 0xff],
                ..
            }
        ));
    }
}
