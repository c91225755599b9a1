//! Transcript normalization: raw interview files in, canonical UTF-8 `.txt` out.

use anyhow::{Context, Result};
use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex_lite::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::report::{write_atomic, FailureManifest, ItemFailure, RunStatus, Stage};

pub const INGEST_MANIFEST_NAME: &str = "ingest.failures.json";

/// Input format, chosen once per file from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptFormat {
    Plain,
    Markdown,
    /// Word document; text comes from `word/document.xml`
    Docx,
    Other,
}

impl TranscriptFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "text" => TranscriptFormat::Plain,
            "md" | "markdown" => TranscriptFormat::Markdown,
            "docx" => TranscriptFormat::Docx,
            _ => TranscriptFormat::Other,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("unreadable: {0}")]
    Read(String),
    #[error("undecodable: {0}")]
    Undecodable(String),
    #[error("unreadable document: {0}")]
    Document(String),
    #[error("empty")]
    Empty,
    #[error("output name collision with {0}")]
    OutputCollision(String),
    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Source file name → normalized output path
    pub normalized: Vec<(String, PathBuf)>,
    pub failures: Vec<ItemFailure>,
    pub ignored: usize,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
}

/// Bytes → text. A BOM decides the encoding when present; otherwise UTF-8,
/// falling back to a detected legacy encoding (cp1251, KOI8-R, ...).
pub fn decode_text(bytes: &[u8]) -> Result<String, IngestError> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        return decode_with(encoding, &bytes[bom_len..]);
    }
    if bytes.contains(&0) {
        return Err(IngestError::Undecodable(
            "binary content (NUL bytes)".to_string(),
        ));
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.to_string());
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, false);
    tracing::debug!("Not UTF-8, decoding as {}", encoding.name());
    decode_with(encoding, bytes)
}

fn decode_with(encoding: &'static Encoding, bytes: &[u8]) -> Result<String, IngestError> {
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        return Err(IngestError::Undecodable(format!("invalid {}", encoding.name())));
    }
    Ok(text.into_owned())
}

/// Paragraph text of a `.docx` archive, one paragraph per line
pub fn docx_text(bytes: &[u8]) -> Result<String, IngestError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| IngestError::Document(e.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| IngestError::Document(format!("word/document.xml: {}", e)))?
        .read_to_string(&mut xml)
        .map_err(|e| IngestError::Document(format!("word/document.xml: {}", e)))?;
    document_xml_text(&xml)
}

fn document_xml_text(xml: &str) -> Result<String, IngestError> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text_run = true,
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text_run = false,
                b"w:p" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => text.push('\t'),
                b"w:br" | b"w:cr" | b"w:p" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text_run => {
                let chunk = t
                    .unescape()
                    .map_err(|e| IngestError::Document(e.to_string()))?;
                text.push_str(&chunk);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(IngestError::Document(format!(
                    "word/document.xml at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }
    Ok(text)
}

struct MarkdownRules {
    fences: Regex,
    inline_code: Regex,
    headings: Regex,
    images: Regex,
    links: Regex,
    bold: Regex,
    italic: Regex,
}

impl MarkdownRules {
    fn new() -> Result<Self> {
        Ok(Self {
            fences: Regex::new(r"```[\s\S]*?```")?,
            inline_code: Regex::new(r"`([^`]*)`")?,
            headings: Regex::new(r"(?m)^[ \t]*#+[ \t]*")?,
            images: Regex::new(r"!\[[^\]]*\]\([^)]*\)")?,
            links: Regex::new(r"\[([^\]]*)\]\([^)]*\)")?,
            bold: Regex::new(r"\*\*([^*]+)\*\*")?,
            italic: Regex::new(r"\*([^*]+)\*")?,
        })
    }

    fn strip(&self, md: &str) -> String {
        let text = self.fences.replace_all(md, "");
        let text = self.inline_code.replace_all(&text, "$1");
        let text = self.headings.replace_all(&text, "");
        let text = self.images.replace_all(&text, "");
        let text = self.links.replace_all(&text, "$1");
        let text = self.bold.replace_all(&text, "$1");
        self.italic.replace_all(&text, "$1").into_owned()
    }
}

/// `\n` line endings, no trailing whitespace, exactly one final newline.
/// Returns an empty string when nothing but whitespace remains.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    let body = lines.join("\n");
    let body = body.trim_matches('\n');
    if body.trim().is_empty() {
        String::new()
    } else {
        format!("{}\n", body)
    }
}

struct Ingestor {
    markdown: MarkdownRules,
}

impl Ingestor {
    fn convert(&self, path: &Path) -> Result<String, IngestError> {
        let bytes = fs::read(path).map_err(|e| IngestError::Read(e.to_string()))?;
        let text = match TranscriptFormat::from_path(path) {
            TranscriptFormat::Plain | TranscriptFormat::Other => decode_text(&bytes)?,
            TranscriptFormat::Markdown => self.markdown.strip(&decode_text(&bytes)?),
            TranscriptFormat::Docx => docx_text(&bytes)?,
        };
        let normalized = normalize_text(&text);
        if normalized.is_empty() {
            return Err(IngestError::Empty);
        }
        Ok(normalized)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Normalize every readable file of `in_dir` into `out_dir/<stem>.txt`.
/// A bad file is recorded and skipped; only a missing input directory or an
/// unusable output directory is fatal.
pub fn ingest_directory(in_dir: &Path, out_dir: &Path) -> Result<IngestReport> {
    let entries = fs::read_dir(in_dir)
        .with_context(|| format!("Failed to read input directory {:?}", in_dir))?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory {:?}", out_dir))?;

    let mut files = Vec::new();
    let mut ignored = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {:?}", in_dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file || is_hidden(&name) {
            ignored += 1;
            continue;
        }
        files.push((name, entry.path()));
    }
    files.sort();

    let ingestor = Ingestor {
        markdown: MarkdownRules::new().context("Failed to compile markdown rules")?,
    };
    let mut claimed: HashMap<String, String> = HashMap::new();
    let mut normalized = Vec::new();
    let mut failures = Vec::new();

    for (name, path) in files {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());

        let result = match claimed.get(&stem) {
            Some(winner) => Err(IngestError::OutputCollision(winner.clone())),
            None => ingestor.convert(&path).and_then(|text| {
                let out_path = out_dir.join(format!("{}.txt", stem));
                write_atomic(&out_path, text.as_bytes())
                    .map(|_| out_path)
                    .map_err(|e| IngestError::Write(format!("{:#}", e)))
            }),
        };

        match result {
            Ok(out_path) => {
                tracing::debug!("Normalized {} -> {:?}", name, out_path);
                claimed.insert(stem, name.clone());
                normalized.push((name, out_path));
            }
            Err(e) => {
                tracing::warn!("Skipping transcript {}: {}", name, e);
                failures.push(ItemFailure::new(name, e));
            }
        }
    }

    let manifest =
        FailureManifest::write_or_clear(Stage::Ingest, &failures, &out_dir.join(INGEST_MANIFEST_NAME))?;

    let status = RunStatus::from_counts(normalized.len(), failures.len());
    tracing::info!(
        "Ingest finished: {} normalized, {} failed, {} ignored ({:?})",
        normalized.len(),
        failures.len(),
        ignored,
        status
    );

    Ok(IngestReport {
        normalized,
        failures,
        ignored,
        status,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_zip;

    #[test]
    fn markdown_markup_is_stripped() {
        let rules = MarkdownRules::new().unwrap();
        let md = "# Interview\n\nShe said **very** *clearly*: see [notes](http://x).\n![img](a.png)\n```\ncode\n```\nuse `ls`";
        let text = normalize_text(&rules.strip(md));
        assert_eq!(
            text,
            "Interview\n\nShe said very clearly: see notes.\n\n\nuse ls\n"
        );
    }

    #[test]
    fn decoding_handles_boms_and_rejects_binary() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFhello").unwrap(), "hello");

        let mut le = vec![0xFF, 0xFE];
        for unit in "Привет".encode_utf16() {
            le.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&le).unwrap(), "Привет");

        let mut be = vec![0xFE, 0xFF];
        for unit in "hi".encode_utf16() {
            be.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_text(&be).unwrap(), "hi");

        assert!(matches!(
            decode_text(b"PK\x03\x04\x00\x00"),
            Err(IngestError::Undecodable(_))
        ));
        assert!(matches!(
            decode_text(&[0xFF, 0xFE, 0x41]),
            Err(IngestError::Undecodable(_))
        ));
    }

    #[test]
    fn legacy_cyrillic_encoding_is_detected() {
        let original = "Интервьюер: Расскажите, пожалуйста, о себе.\n\
            Анна: Меня зовут Анна, мне тридцать четыре года. Я работаю дизайнером \
            интерьеров в Казани и очень люблю свою работу, хотя иногда устаю от клиентов.\n";
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode(original);
        assert!(std::str::from_utf8(&bytes).is_err());
        assert_eq!(decode_text(&bytes).unwrap(), original);
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        fs::create_dir(&input).unwrap();
        write_zip(
            &input.join("interview.docx"),
            &[(
                "word/document.xml",
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:r><w:t>Интервьюер: Как дела?</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Анна: </w:t></w:r><w:r><w:t>Хорошо &amp; спокойно.</w:t></w:r></w:p>
<w:p/>
<w:p><w:r><w:t>Конец</w:t></w:r></w:p>
</w:body></w:document>"#,
            )],
        );

        let report = ingest_directory(&input, &output).unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(
            fs::read_to_string(output.join("interview.txt")).unwrap(),
            "Интервьюер: Как дела?\nАнна: Хорошо & спокойно.\n\nКонец\n"
        );
    }

    #[test]
    fn docx_without_document_part_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.docx");
        write_zip(&path, &[("word/styles.xml", "<w:styles/>")]);
        assert!(matches!(
            docx_text(&fs::read(&path).unwrap()),
            Err(IngestError::Document(_))
        ));
    }

    #[test]
    fn clean_rerun_removes_previous_manifest() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        fs::write(input.path().join("a.txt"), "").unwrap();
        let first = ingest_directory(input.path(), output.path()).unwrap();
        assert!(first.manifest.is_some());

        fs::write(input.path().join("a.txt"), "now with content").unwrap();
        let second = ingest_directory(input.path(), output.path()).unwrap();
        assert_eq!(second.status, RunStatus::Success);
        assert!(second.manifest.is_none());
        assert!(!output.path().join(INGEST_MANIFEST_NAME).exists());
    }

    #[test]
    fn normalization_is_canonical() {
        assert_eq!(normalize_text("a  \r\nb\t\r\n\r\n\n"), "a\nb\n");
        assert_eq!(normalize_text("\n\nx"), "x\n");
        assert_eq!(normalize_text(" \n\t\n"), "");
    }

    #[test]
    fn partial_failures_are_contained() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        fs::write(input.path().join("a.txt"), "first interview\r\n").unwrap();
        fs::write(input.path().join("b.md"), "## Second\n**bold** answer").unwrap();
        fs::write(input.path().join("c.rtf"), "plain enough").unwrap();
        fs::write(input.path().join("d.docx"), b"PK\x03\x04\x00binary").unwrap();
        fs::write(input.path().join("e.txt"), "   \n").unwrap();
        fs::write(input.path().join(".hidden.txt"), "skip me").unwrap();
        fs::create_dir(input.path().join("nested")).unwrap();

        let report = ingest_directory(input.path(), output.path()).expect("ingest");
        assert_eq!(report.normalized.len(), 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.ignored, 2);
        assert_eq!(report.status, RunStatus::SuccessWithWarnings);

        assert_eq!(
            fs::read_to_string(output.path().join("a.txt")).unwrap(),
            "first interview\n"
        );
        assert_eq!(
            fs::read_to_string(output.path().join("b.txt")).unwrap(),
            "Second\nbold answer\n"
        );
        assert!(output.path().join("c.txt").exists());
        assert!(!output.path().join("d.txt").exists());

        let manifest = FailureManifest::read(&output.path().join(INGEST_MANIFEST_NAME)).unwrap();
        assert_eq!(manifest.items(), vec!["d.docx".to_string(), "e.txt".to_string()]);
        assert_eq!(manifest.failures[1].reason, "empty");
    }

    #[test]
    fn colliding_stems_keep_first_in_sorted_order() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        fs::write(input.path().join("a.md"), "# from markdown").unwrap();
        fs::write(input.path().join("a.txt"), "from text").unwrap();

        let report = ingest_directory(input.path(), output.path()).unwrap();
        assert_eq!(report.normalized.len(), 1);
        assert_eq!(
            fs::read_to_string(output.path().join("a.txt")).unwrap(),
            "from markdown\n"
        );
        assert_eq!(report.failures[0].item, "a.txt");
        assert!(report.failures[0].reason.contains("collision"));
    }

    #[test]
    fn all_bad_inputs_fail_the_run() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        fs::write(input.path().join("x.txt"), "").unwrap();
        let report = ingest_directory(input.path(), output.path()).unwrap();
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[test]
    fn missing_input_directory_is_fatal() {
        let output = tempfile::tempdir().unwrap();
        assert!(ingest_directory(&output.path().join("missing"), output.path()).is_err());
    }
}
