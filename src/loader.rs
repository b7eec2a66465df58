//! File and folder loading.
//!
//! Turns paths into [`Document`]s ready for ingestion. Plain text and
//! markdown are read as UTF-8; PDF and DOCX are extracted to text.
//!
//! Document ids are derived from the canonical file path, so loading the
//! same file again replaces its previous nodes instead of duplicating them.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use private_rag_core::models::Document;

use crate::config::IngestionConfig;

/// Upper bound on decompressed bytes read from one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Why a file could not be turned into text.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("file is not valid UTF-8 text")]
    NotUtf8,
}

/// Result of loading a path.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    /// `(relative path, reason)` for every file that was passed over.
    pub skipped: Vec<(String, String)>,
}

/// Load a single file or every matching file under a folder.
pub fn load_path(path: &Path, config: &IngestionConfig) -> Result<LoadReport> {
    if !path.exists() {
        bail!("Path does not exist: {}", path.display());
    }
    if path.is_file() {
        let doc = load_file(path)?;
        return Ok(LoadReport {
            documents: vec![doc],
            skipped: Vec::new(),
        });
    }
    load_folder(path, config)
}

fn load_folder(root: &Path, config: &IngestionConfig) -> Result<LoadReport> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut report = LoadReport::default();

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > config.max_file_bytes {
            warn!(path = %rel_str, size, "skipping oversized file");
            report
                .skipped
                .push((rel_str, format!("larger than {} bytes", config.max_file_bytes)));
            continue;
        }

        match load_file(path) {
            Ok(doc) => report.documents.push(doc),
            Err(e) => {
                warn!(path = %rel_str, error = %e, "skipping unreadable file");
                report.skipped.push((rel_str, format!("{:#}", e)));
            }
        }
    }

    // Deterministic ordering regardless of directory iteration order.
    report.documents.sort_by(|a, b| {
        a.metadata
            .get("source_path")
            .cmp(&b.metadata.get("source_path"))
    });
    debug!(
        documents = report.documents.len(),
        skipped = report.skipped.len(),
        "loaded folder"
    );
    Ok(report)
}

/// Read one file into a [`Document`].
pub fn load_file(path: &Path) -> Result<Document> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve path: {}", path.display()))?;
    let bytes = std::fs::read(&canonical)
        .with_context(|| format!("Failed to read file: {}", canonical.display()))?;

    let content_type = content_type_for(&canonical);
    let text = extract_text(&bytes, content_type)
        .with_context(|| format!("Failed to extract text from {}", canonical.display()))?;

    let file_name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let source_path = canonical.to_string_lossy().to_string();

    Ok(Document::new(document_id_for(&source_path), text)
        .with_metadata("file_name", file_name)
        .with_metadata("source_path", source_path)
        .with_metadata("content_type", content_type)
        .with_metadata("ingested_at", chrono::Utc::now().to_rfc3339()))
}

/// Stable id for a source path.
pub fn document_id_for(source_path: &str) -> String {
    let digest = Sha256::digest(source_path.as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("file-{}", hex)
}

pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "md" | "markdown" => "text/markdown",
        _ => "text/plain",
    }
}

/// Plain UTF-8 text for `bytes` of the given content type.
pub fn extract_text(bytes: &[u8], content_type: &str) -> std::result::Result<String, ExtractError> {
    match content_type {
        "application/pdf" => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            extract_docx(bytes)
        }
        ct if ct.starts_with("text/") => {
            String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::NotUtf8)
        }
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&xml)
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn docx_paragraphs(xml: &[u8]) -> std::result::Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
