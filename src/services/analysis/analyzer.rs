// Segment Analyzer
// Adapts the external analysis capability to the Finding contract:
// builds the request, maps the raw reply, classifies failures. No retries here.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::models::{ChunkSpec, Finding, SynthesisSection, META_TOPIC};
use crate::services::providers::ProviderError;
use crate::services::text_processor::estimate_tokens;

use super::backend::{AnalysisBackend, AnalysisRequest, PositionalContext};
use super::errors::{AnalysisFailure, FailureCause};

const CHUNK_SYSTEM_PROMPT: &str = r#"You are one worker in a map-reduce document analysis. You see a single chunk of a larger document and must report only what this chunk contains that is relevant to the task.

Return JSON with these fields:
- summary: 2-5 sentences answering the task from this chunk only
- key_points: array of short, self-contained factual statements relevant to the task
- topic: a short (1-4 word) label for the main subject of this chunk

If the chunk has nothing relevant, return an empty key_points array and say so in summary.
Return only the JSON object, no other text."#;

const ANSWER_SYSTEM_PROMPT: &str = r#"You combine partial findings from several chunks of one document into a single final answer.
Findings are ordered as they appear in the document. Some ranges may be marked as not analyzed; do not invent content for them.
Answer the task directly in plain prose or Markdown. Do not return JSON."#;

/// Reply shape requested from the backend for one chunk.
#[derive(Debug, Deserialize, Default)]
struct ChunkReport {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "keyPoints", alias = "findings")]
    key_points: Vec<String>,
    #[serde(default)]
    topic: Option<String>,
}

pub struct SegmentAnalyzer {
    backend: Arc<dyn AnalysisBackend>,
}

impl SegmentAnalyzer {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_label(&self) -> String {
        self.backend.describe()
    }

    /// Analyze one segment; one call, no retry.
    pub async fn analyze(
        &self,
        segment_text: &str,
        task_description: &str,
        chunk: &ChunkSpec,
        context: PositionalContext,
    ) -> Result<Finding, AnalysisFailure> {
        let request = AnalysisRequest {
            system_prompt: CHUNK_SYSTEM_PROMPT.to_string(),
            instructions: format!("Task: {}", task_description.trim()),
            text_span: segment_text.to_string(),
            positional_context: Some(context),
            expect_json: true,
        };

        debug!(
            chunk_index = chunk.index,
            est_tokens = estimate_tokens(segment_text),
            "analyzer.request"
        );

        let raw = self
            .backend
            .perform_analysis(&request)
            .await
            .map_err(|e| AnalysisFailure {
                chunk_index: chunk.index,
                cause: classify_provider_error(e),
            })?;

        parse_finding(&raw, chunk).map_err(|cause| AnalysisFailure {
            chunk_index: chunk.index,
            cause,
        })
    }

    /// Ask the backend for one final answer over the synthesized sections.
    pub async fn compose_answer(
        &self,
        sections: &[SynthesisSection],
        coverage_note: &str,
        task_description: &str,
    ) -> Result<String, FailureCause> {
        let mut body = String::new();
        for section in sections {
            body.push_str(&format!("## {}\n{}\n\n", section.name, section.content));
        }
        body.push_str(&format!("Coverage: {}", coverage_note));

        let request = AnalysisRequest {
            system_prompt: ANSWER_SYSTEM_PROMPT.to_string(),
            instructions: format!("Task: {}\n\nOrdered findings:", task_description.trim()),
            text_span: body,
            positional_context: None,
            expect_json: false,
        };

        let raw = self
            .backend
            .perform_analysis(&request)
            .await
            .map_err(classify_provider_error)?;
        let answer = raw.trim();
        if answer.is_empty() {
            return Err(FailureCause::EmptyResponse);
        }
        Ok(answer.to_string())
    }
}

pub fn classify_provider_error(e: ProviderError) -> FailureCause {
    match e {
        ProviderError::ContextOverflow(msg) => FailureCause::Overflow(msg),
        ProviderError::MissingContent => FailureCause::EmptyResponse,
        ProviderError::JsonError(msg) => FailureCause::Malformed(msg),
        other => FailureCause::Backend(other.to_string()),
    }
}

/// Map a raw reply to a Finding.
///
/// JSON replies must carry a summary or key points; a reply with no JSON at
/// all is accepted verbatim as plain text.
fn parse_finding(raw: &str, chunk: &ChunkSpec) -> Result<Finding, FailureCause> {
    let content = strip_code_fence(raw.trim());
    if content.is_empty() {
        return Err(FailureCause::EmptyResponse);
    }

    let looks_like_json = content.starts_with('{');
    let parsed = extract_json(content)
        .and_then(|json| serde_json::from_str::<ChunkReport>(json).map_err(|e| e.to_string()));

    let mut metadata: BTreeMap<String, Value> = BTreeMap::new();
    metadata.insert("response_chars".to_string(), Value::from(raw.chars().count()));

    let extracted_content = match parsed {
        Ok(report) => {
            let summary = report.summary.unwrap_or_default().trim().to_string();
            let points: Vec<String> = report
                .key_points
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if summary.is_empty() && points.is_empty() {
                return Err(FailureCause::Malformed(
                    "reply has neither summary nor key_points".to_string(),
                ));
            }
            if let Some(topic) = report.topic.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
                metadata.insert(META_TOPIC.to_string(), Value::String(topic));
            }
            metadata.insert("key_point_count".to_string(), Value::from(points.len()));
            metadata.insert("parse_mode".to_string(), Value::from("json"));

            let mut text = summary;
            for point in points {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str("- ");
                text.push_str(&point);
            }
            text
        }
        Err(e) if looks_like_json => return Err(FailureCause::Malformed(e)),
        Err(_) => {
            metadata.insert("parse_mode".to_string(), Value::from("text"));
            content.to_string()
        }
    };

    Ok(Finding {
        chunk_index: chunk.index,
        range: chunk.range(),
        extracted_content,
        metadata,
        degraded: false,
    })
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Extract JSON from response content
fn extract_json(content: &str) -> Result<&str, String> {
    if content.starts_with('{') {
        Ok(content)
    } else if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if start < end {
            Ok(&content[start..=end])
        } else {
            Err("Invalid JSON response".to_string())
        }
    } else {
        Err("No JSON in response".to_string())
    }
}
