// RLM Reader Data Models
// Shared types for segmentation, per-chunk findings and synthesis

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============ Document ============

/// Immutable document text with optional section-boundary hints.
///
/// All offsets exposed by this type (and by [`ChunkSpec`]) are character
/// offsets, not UTF-8 byte offsets.
#[derive(Debug, Clone)]
pub struct Document {
    text: String,
    /// Byte offset of every char boundary, plus `text.len()` as the final entry.
    boundaries: Vec<usize>,
    section_hints: Option<Vec<usize>>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        boundaries.push(text.len());
        Self {
            text,
            boundaries,
            section_hints: None,
        }
    }

    /// Attach section-start offsets. Out-of-range and zero offsets are dropped.
    pub fn with_section_hints(mut self, mut hints: Vec<usize>) -> Self {
        let len = self.char_len();
        hints.retain(|&h| h > 0 && h < len);
        hints.sort_unstable();
        hints.dedup();
        self.section_hints = Some(hints);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.boundaries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn section_hints(&self) -> Option<&[usize]> {
        self.section_hints.as_deref()
    }

    /// Slice by character range. Bounds are clamped to the document.
    pub fn slice(&self, start: usize, end: usize) -> &str {
        let len = self.char_len();
        let end = end.min(len);
        let start = start.min(end);
        &self.text[self.boundaries[start]..self.boundaries[end]]
    }

    pub fn chunk_text(&self, chunk: &ChunkSpec) -> &str {
        self.slice(chunk.start, chunk.end)
    }
}

// ============ Chunk Planning ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharRange {
    pub start: usize,
    pub end: usize,
}

impl CharRange {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for CharRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSpec {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub overlap_with_prev: usize,
}

impl ChunkSpec {
    pub fn range(&self) -> CharRange {
        CharRange {
            start: self.start,
            end: self.end,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

// ============ Findings ============

pub const META_TOPIC: &str = "topic";
pub const META_FAILURE_CAUSE: &str = "failure_cause";
pub const META_SUB_CHUNKS: &str = "sub_chunks";

/// Result of analyzing exactly one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub chunk_index: usize,
    pub range: CharRange,
    pub extracted_content: String,
    /// Scalar fields only (strings, numbers, booleans).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub degraded: bool,
}

impl Finding {
    /// Placeholder for a chunk whose analysis failed after all retries.
    pub fn degraded(chunk: &ChunkSpec, cause: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            META_FAILURE_CAUSE.to_string(),
            serde_json::Value::String(cause.into()),
        );
        Self {
            chunk_index: chunk.index,
            range: chunk.range(),
            extracted_content: String::new(),
            metadata,
            degraded: true,
        }
    }

    pub fn failure_cause(&self) -> Option<&str> {
        self.metadata.get(META_FAILURE_CAUSE).and_then(|v| v.as_str())
    }

    pub fn topic(&self) -> Option<&str> {
        self.metadata
            .get(META_TOPIC)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

// ============ Synthesis ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisSection {
    pub name: String,
    pub content: String,
    pub source_chunks: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedRange {
    pub chunk_index: usize,
    pub range: CharRange,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub chunks: usize,
    pub analysis_calls: usize,
    pub retries: usize,
    pub timeouts: usize,
    pub degraded_chunks: usize,
    pub sub_chunk_calls: usize,
    pub answer_calls: usize,
    pub response_chars: usize,
    pub elapsed_ms: u128,
}

impl RunStats {
    pub fn total_calls(&self) -> usize {
        self.analysis_calls + self.sub_chunk_calls + self.answer_calls
    }

    /// Add another tally's call counters (chunks and elapsed time are run-level).
    pub fn merge_calls(&mut self, other: &RunStats) {
        self.analysis_calls += other.analysis_calls;
        self.sub_chunk_calls += other.sub_chunk_calls;
        self.answer_calls += other.answer_calls;
        self.retries += other.retries;
        self.timeouts += other.timeouts;
        self.response_chars += other.response_chars;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub sections: Vec<SynthesisSection>,
    pub coverage_note: String,
    #[serde(default)]
    pub degraded_ranges: Vec<DegradedRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub stats: RunStats,
}

// ============ Extraction & Structure ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionMetadata {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    pub char_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_sections: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedText {
    pub text: String,
    pub metadata: ExtractionMetadata,
}

impl ExtractedText {
    /// Build a [`Document`], carrying section hints when extraction found any.
    pub fn into_document(self) -> Document {
        let doc = Document::new(self.text);
        match self.metadata.detected_sections {
            Some(hints) => doc.with_section_hints(hints),
            None => doc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureInfo {
    pub total_pages: usize,
    pub total_words: usize,
    pub total_chars: usize,
    pub sections_detected: usize,
    pub tables_detected: usize,
    pub code_blocks_detected: usize,
    pub avg_words_per_page: usize,
    pub recommended_chunking: String,
}

// ============ Options ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingOptions {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap_size: usize,
    #[serde(default = "default_true")]
    pub structure_hints_enabled: bool,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap_size: default_overlap(),
            structure_hints_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationOptions {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_chunk: usize,
    #[serde(default = "default_timeout_secs")]
    pub per_chunk_timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_recursion_depth")]
    pub max_recursion_depth: usize,
    #[serde(default = "default_true")]
    pub compose_answer: bool,
}

impl Default for OrchestrationOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries_per_chunk: default_max_retries(),
            per_chunk_timeout_secs: default_timeout_secs(),
            retry_backoff_ms: default_backoff_ms(),
            max_recursion_depth: default_recursion_depth(),
            compose_answer: true,
        }
    }
}

// ============ Default Value Functions ============

fn default_true() -> bool { true }
fn default_chunk_size() -> usize { 28_000 }
fn default_overlap() -> usize { 2_000 }
fn default_concurrency() -> usize { 1 }
fn default_max_retries() -> usize { 2 }
fn default_timeout_secs() -> u64 { 120 }
fn default_backoff_ms() -> u64 { 400 }
fn default_recursion_depth() -> usize { 1 }
