// Synthesizer
// Combines ordered findings into named sections plus a coverage note
//
// Adjacent findings whose chunks overlap are compared fragment by fragment
// (sentence or list item). A later fragment is dropped when its longest common
// substring with a fragment already kept for the previous chunk covers at least
// DEDUP_MIN_RATIO of the shorter one; the earlier chunk keeps the copy.

use std::collections::HashMap;
use tracing::debug;

use crate::models::{CharRange, DegradedRange, Finding, SynthesisResult, SynthesisSection};
use crate::services::text_processor::{
    longest_common_substring_len, normalize_fragment, split_sentences, strip_bullet,
};

pub const DEDUP_MIN_RATIO: f64 = 0.8;
/// Normalized fragments shorter than this are never treated as duplicates.
pub const DEDUP_MIN_FRAGMENT_CHARS: usize = 12;
const DEDUP_MAX_COMPARE_CHARS: usize = 600;

#[derive(Debug, Clone)]
struct Fragment {
    text: String,
    norm: String,
    line: usize,
    bullet: bool,
}

struct Prepared<'a> {
    finding: &'a Finding,
    kept: Vec<Fragment>,
}

struct SectionBuilder {
    name: String,
    parts: Vec<String>,
    source_chunks: Vec<usize>,
}

/// Combine findings (already in chunk order) into one result. Never fails.
///
/// `run_id`, `answer` and `stats` are left for the caller to fill in.
pub fn combine(ordered_findings: &[Finding], task_description: &str) -> SynthesisResult {
    let mut prepared: Vec<Prepared> = Vec::with_capacity(ordered_findings.len());
    let mut merged = 0usize;

    for finding in ordered_findings {
        if finding.degraded {
            prepared.push(Prepared { finding, kept: Vec::new() });
            continue;
        }

        let mut fragments = fragments_of(&finding.extracted_content);
        if let Some(prev) = prepared.last().filter(|p| shares_overlap(p.finding, finding)) {
            let before = fragments.len();
            fragments.retain(|f| !prev.kept.iter().any(|p| is_near_duplicate(&p.norm, &f.norm)));
            merged += before - fragments.len();
        }
        prepared.push(Prepared { finding, kept: fragments });
    }

    let sections = build_sections(&prepared);
    let degraded_ranges: Vec<DegradedRange> = ordered_findings
        .iter()
        .filter(|f| f.degraded)
        .map(|f| DegradedRange {
            chunk_index: f.chunk_index,
            range: f.range,
            cause: f.failure_cause().unwrap_or("unknown failure").to_string(),
        })
        .collect();
    let coverage_note = coverage_note(ordered_findings, &degraded_ranges, merged);

    debug!(
        task_chars = task_description.chars().count(),
        findings = ordered_findings.len(),
        sections = sections.len(),
        merged_fragments = merged,
        degraded = degraded_ranges.len(),
        "synthesizer.combine"
    );

    SynthesisResult {
        run_id: None,
        sections,
        coverage_note,
        degraded_ranges,
        answer: None,
        stats: Default::default(),
    }
}

/// Near-duplicate test on two normalized fragments.
pub fn is_near_duplicate(a: &str, b: &str) -> bool {
    let a: String = a.chars().take(DEDUP_MAX_COMPARE_CHARS).collect();
    let b: String = b.chars().take(DEDUP_MAX_COMPARE_CHARS).collect();
    let shorter = a.chars().count().min(b.chars().count());
    if shorter < DEDUP_MIN_FRAGMENT_CHARS {
        return false;
    }
    let lcs = longest_common_substring_len(&a, &b);
    lcs as f64 >= shorter as f64 * DEDUP_MIN_RATIO
}

/// Short label for a chunk, e.g. "Chunk 2 [28000, 58000)".
pub fn chunk_label(chunk_index: usize, range: CharRange) -> String {
    format!("Chunk {} {}", chunk_index + 1, range)
}

fn shares_overlap(prev: &Finding, current: &Finding) -> bool {
    !prev.degraded
        && prev.chunk_index + 1 == current.chunk_index
        && prev.range.end > current.range.start
}

fn fragments_of(content: &str) -> Vec<Fragment> {
    let mut out = Vec::new();
    for (line, raw) in content.lines().enumerate() {
        let (bullet, rest) = strip_bullet(raw);
        if rest.is_empty() {
            continue;
        }
        for sentence in split_sentences(rest) {
            let norm = normalize_fragment(&sentence);
            out.push(Fragment { text: sentence, norm, line, bullet });
        }
    }
    out
}

/// Re-assemble kept fragments, one output line per source line.
fn render(fragments: &[Fragment]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current_line: Option<usize> = None;
    for fragment in fragments {
        if current_line == Some(fragment.line) {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(&fragment.text);
            }
            continue;
        }
        current_line = Some(fragment.line);
        let prefix = if fragment.bullet { "- " } else { "" };
        lines.push(format!("{}{}", prefix, fragment.text));
    }
    lines.join("\n")
}

fn build_sections(prepared: &[Prepared]) -> Vec<SynthesisSection> {
    let clustered = prepared
        .iter()
        .any(|p| !p.kept.is_empty() && p.finding.topic().is_some());

    let mut builders: Vec<SectionBuilder> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for p in prepared {
        if p.kept.is_empty() {
            continue;
        }
        let label = chunk_label(p.finding.chunk_index, p.finding.range);
        let (key, name) = match p.finding.topic().filter(|_| clustered) {
            Some(topic) => (format!("topic:{}", topic.to_lowercase()), topic.to_string()),
            None => (format!("chunk:{}", p.finding.chunk_index), label),
        };

        let slot = *by_key.entry(key).or_insert_with(|| {
            builders.push(SectionBuilder {
                name,
                parts: Vec::new(),
                source_chunks: Vec::new(),
            });
            builders.len() - 1
        });
        let builder = &mut builders[slot];
        builder.parts.push(render(&p.kept));
        builder.source_chunks.push(p.finding.chunk_index);
    }

    builders
        .into_iter()
        .map(|b| SynthesisSection {
            name: b.name,
            content: b.parts.join("\n"),
            source_chunks: b.source_chunks,
        })
        .collect()
}

/// Characters of degraded ranges not also inside some analyzed chunk.
fn unanalyzed_chars(findings: &[Finding]) -> usize {
    let analyzed: Vec<CharRange> = findings.iter().filter(|f| !f.degraded).map(|f| f.range).collect();
    let mut total = 0;
    for degraded in findings.iter().filter(|f| f.degraded) {
        // Walk the degraded range, skipping stretches covered by analyzed chunks.
        let mut cursor = degraded.range.start;
        while cursor < degraded.range.end {
            match analyzed.iter().find(|r| r.start <= cursor && cursor < r.end) {
                Some(r) => cursor = r.end,
                None => {
                    let next_start = analyzed
                        .iter()
                        .map(|r| r.start)
                        .filter(|&s| s > cursor)
                        .min()
                        .unwrap_or(degraded.range.end)
                        .min(degraded.range.end);
                    total += next_start - cursor;
                    cursor = next_start;
                }
            }
        }
    }
    total
}

fn coverage_note(findings: &[Finding], degraded: &[DegradedRange], merged: usize) -> String {
    if findings.is_empty() {
        return "Zero content: the document is empty, so no chunks were analyzed.".to_string();
    }

    let total = findings.len();
    let listed = degraded
        .iter()
        .map(|d| format!("chunk {} {} ({})", d.chunk_index + 1, d.range, d.cause))
        .collect::<Vec<_>>()
        .join("; ");

    let mut note = if degraded.len() == total {
        format!(
            "Full degradation: all {} chunks failed analysis and no part of the document was analyzed. Unanalyzed ranges: {}.",
            total, listed
        )
    } else if degraded.is_empty() {
        let end = findings.iter().map(|f| f.range.end).max().unwrap_or(0);
        format!("Full coverage: all {} chunks analyzed over characters [0, {}).", total, end)
    } else {
        format!(
            "Partial coverage: {} of {} chunks analyzed. Not analyzed: {}. {} characters fall outside every analyzed chunk.",
            total - degraded.len(),
            total,
            listed,
            unanalyzed_chars(findings)
        )
    };

    if merged > 0 {
        note.push_str(&format!(
            " {} overlapping fragment(s) merged into the earlier chunk.",
            merged
        ));
    }
    note
}
