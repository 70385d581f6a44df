// Document Loader
// Text extraction from PDF, DOCX and plain-text sources (local files or URLs)

use docx_rs::{
    DocumentChild, InsertChild, Paragraph, ParagraphChild, Run, RunChild, Table, TableCellContent,
    TableChild, TableRowChild,
};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{ExtractedText, ExtractionMetadata};
use crate::services::structure::{count_pages, detect_section_offsets};
use crate::services::text_processor::normalize_text;

const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("download returned HTTP {0}")]
    HttpStatus(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Docx,
    Text,
}

impl SourceKind {
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => SourceKind::Pdf,
            "docx" => SourceKind::Docx,
            _ => SourceKind::Text,
        }
    }
}

pub struct DocumentLoader {
    client: Client,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentLoader {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn extract_from_file(&self, path: &Path) -> Result<ExtractedText, LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path.to_string_lossy().to_string();
        extract_from_bytes(&name, &bytes)
    }

    /// Download and extract. The format comes from the URL path, then the content type.
    pub async fn extract_from_url(&self, url: &str) -> Result<ExtractedText, LoaderError> {
        info!("[LOADER] downloading {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let bytes = response.bytes().await?;

        let path_part = url.split(['?', '#']).next().unwrap_or(url);
        let name = match SourceKind::from_name(path_part) {
            SourceKind::Text if content_type.contains("pdf") => format!("{}.pdf", path_part),
            SourceKind::Text if content_type.contains("wordprocessingml") => {
                format!("{}.docx", path_part)
            }
            _ => path_part.to_string(),
        };

        let mut extracted = extract_from_bytes(&name, &bytes)?;
        extracted.metadata.source = url.to_string();
        Ok(extracted)
    }
}

/// Extract and normalize text from in-memory file content.
pub fn extract_from_bytes(file_name: &str, bytes: &[u8]) -> Result<ExtractedText, LoaderError> {
    let kind = SourceKind::from_name(file_name);
    let (raw, pdf_pages) = match kind {
        SourceKind::Pdf => {
            let (text, pages) = extract_pdf(bytes)?;
            (text, Some(pages))
        }
        SourceKind::Docx => (extract_docx(bytes)?, None),
        SourceKind::Text => (String::from_utf8_lossy(bytes).into_owned(), None),
    };

    let text = normalize_text(&raw);
    let page_count = pdf_pages.or_else(|| text.contains('\x0C').then(|| count_pages(&text)));
    let sections = detect_section_offsets(&text);
    let char_count = text.chars().count();

    info!(
        "[LOADER] extracted source={} kind={:?} chars={} pages={:?} sections={}",
        file_name,
        kind,
        char_count,
        page_count,
        sections.len()
    );

    Ok(ExtractedText {
        text,
        metadata: ExtractionMetadata {
            source: file_name.to_string(),
            page_count,
            char_count,
            detected_sections: if sections.is_empty() { None } else { Some(sections) },
        },
    })
}

/// PDF text with a `--- Page N ---` marker before each page.
fn extract_pdf(bytes: &[u8]) -> Result<(String, usize), LoaderError> {
    // pdf-extract panics on some malformed files.
    let raw = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| LoaderError::Pdf("parser panicked".to_string()))?
        .map_err(|e| LoaderError::Pdf(e.to_string()))?;

    let pages: Vec<&str> = raw
        .split('\x0C')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if pages.is_empty() {
        warn!("[LOADER] PDF produced no text (scanned or image-only?)");
        return Ok((String::new(), 0));
    }

    let text = pages
        .iter()
        .enumerate()
        .map(|(i, page)| format!("--- Page {} ---\n{}", i + 1, page))
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok((text, pages.len()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, LoaderError> {
    let docx = docx_rs::read_docx(bytes).map_err(|e| LoaderError::Docx(e.to_string()))?;
    let mut lines: Vec<String> = Vec::new();
    for child in &docx.document.children {
        match child {
            DocumentChild::Paragraph(p) => lines.push(paragraph_line(p)),
            DocumentChild::Table(t) => push_table_rows(t, &mut lines),
            _ => {}
        }
    }
    Ok(lines.join("\n"))
}

/// One line per paragraph. Heading styles become markdown headings so they
/// surface as section hints.
fn paragraph_line(paragraph: &Paragraph) -> String {
    let mut line = String::new();
    for child in &paragraph.children {
        push_paragraph_child(child, &mut line);
    }

    let level = paragraph
        .property
        .style
        .as_ref()
        .and_then(|style| heading_level(&style.val));
    match level {
        Some(level) if !line.trim().is_empty() => {
            format!("{} {}", "#".repeat(level.clamp(1, 3)), line.trim())
        }
        _ => line,
    }
}

fn push_paragraph_child(child: &ParagraphChild, out: &mut String) {
    match child {
        ParagraphChild::Run(run) => push_run(run, out),
        ParagraphChild::Hyperlink(link) => {
            for c in &link.children {
                push_paragraph_child(c, out);
            }
        }
        ParagraphChild::Insert(insert) => {
            for c in &insert.children {
                if let InsertChild::Run(run) = c {
                    push_run(run, out);
                }
            }
        }
        _ => {}
    }
}

fn push_run(run: &Run, out: &mut String) {
    for child in &run.children {
        match child {
            RunChild::Text(t) => out.push_str(&t.text),
            RunChild::Tab(_) => out.push('\t'),
            RunChild::Break(_) => out.push('\n'),
            _ => {}
        }
    }
}

/// Table rows as `| a | b |` lines; nested tables are flattened in place.
#[allow(irrefutable_let_patterns)]
fn push_table_rows(table: &Table, lines: &mut Vec<String>) {
    for row in &table.rows {
        let TableChild::TableRow(row) = row else { continue };
        let mut cells: Vec<String> = Vec::new();
        for cell in &row.cells {
            let TableRowChild::TableCell(cell) = cell else { continue };
            let mut parts: Vec<String> = Vec::new();
            for content in &cell.children {
                match content {
                    TableCellContent::Paragraph(p) => parts.push(paragraph_line(p).trim().to_string()),
                    TableCellContent::Table(inner) => push_table_rows(inner, lines),
                    _ => {}
                }
            }
            cells.push(parts.join(" "));
        }
        if cells.iter().any(|c| !c.is_empty()) {
            lines.push(format!("| {} |", cells.join(" | ")));
        }
    }
}

/// `Heading1`, `heading 2`, `Heading3Char` style ids -> 1, 2, 3.
fn heading_level(style_id: &str) -> Option<usize> {
    let lower = style_id.to_lowercase();
    let rest = lower.strip_prefix("heading")?.trim_start();
    rest.chars().next()?.to_digit(10).map(|d| d as usize)
}
