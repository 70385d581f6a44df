// Document Structure Analysis
// Page/section/table/code statistics and section-start hints for chunk planning

use regex::Regex;
use std::sync::OnceLock;

use crate::models::StructureInfo;
use crate::services::text_processor::count_words;

/// More markdown headings than this and section-based chunking is recommended.
const SECTION_CHUNKING_THRESHOLD: usize = 5;

fn markdown_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#{1,3}[ \t]+\S").expect("heading regex"))
}

fn caps_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[A-Z][A-Z ]{5,}$").expect("caps heading regex"))
}

fn numbered_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\d{1,3}\.[ \t]+\S[^\n]{0,80}$").expect("numbered heading regex"))
}

fn roman_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[IVX]+\.[ \t]+\S").expect("roman heading regex"))
}

fn page_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^--- Page \d+ ---$").expect("page marker regex"))
}

fn table_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\|.+\|").expect("table regex"))
}

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("code fence regex"))
}

/// Count pages: explicit page markers win, otherwise form-feed separated pages.
pub fn count_pages(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let markers = page_marker_re().find_iter(text).count();
    if markers > 0 {
        markers
    } else {
        text.split('\x0C').count()
    }
}

pub fn analyze_structure(text: &str) -> StructureInfo {
    let total_pages = count_pages(text);
    let total_words = count_words(text);
    let sections_detected = markdown_heading_re().find_iter(text).count();

    StructureInfo {
        total_pages,
        total_words,
        total_chars: text.chars().count(),
        sections_detected,
        tables_detected: table_row_re().find_iter(text).count(),
        code_blocks_detected: code_fence_re().find_iter(text).count(),
        avg_words_per_page: total_words / total_pages.max(1),
        recommended_chunking: if sections_detected > SECTION_CHUNKING_THRESHOLD {
            "section".to_string()
        } else {
            "size".to_string()
        },
    }
}

/// Character offsets where a section (or page) starts, sorted, without 0.
pub fn detect_section_offsets(text: &str) -> Vec<usize> {
    let mut byte_offsets: Vec<usize> = Vec::new();
    for re in [
        markdown_heading_re(),
        caps_heading_re(),
        numbered_heading_re(),
        roman_heading_re(),
        page_marker_re(),
    ] {
        byte_offsets.extend(re.find_iter(text).map(|m| m.start()));
    }
    byte_offsets.extend(text.match_indices('\x0C').map(|(i, _)| i));
    byte_offsets.sort_unstable();
    byte_offsets.dedup();

    // Single pass from byte to char offsets; inputs are sorted.
    let mut offsets = Vec::with_capacity(byte_offsets.len());
    let mut targets = byte_offsets.into_iter().peekable();
    for (char_idx, (byte_idx, _)) in text.char_indices().enumerate() {
        while let Some(&target) = targets.peek() {
            if target > byte_idx {
                break;
            }
            if target == byte_idx && char_idx > 0 {
                offsets.push(char_idx);
            }
            targets.next();
        }
    }
    offsets
}

/// Markdown report in the shape printed by `rlm_read --structure`.
pub fn format_structure_report(title: &str, info: &StructureInfo, preview: &str) -> String {
    format!(
        "# Document Structure Analysis\n\n\
         ## Document: {title}\n\n\
         ### Basic Statistics\n\
         - Total pages: {pages}\n\
         - Total words: {words}\n\
         - Total characters: {chars}\n\n\
         ### Content Detection\n\
         - Sections detected: {sections}\n\
         - Tables detected: {tables}\n\
         - Code blocks detected: {code}\n\n\
         ### Processing Recommendations\n\
         - Average words per page: {avg}\n\
         - Recommended chunking method: {method}\n\n\
         ### Content Preview\n\
         {preview}\n",
        title = title,
        pages = info.total_pages,
        words = info.total_words,
        chars = info.total_chars,
        sections = info.sections_detected,
        tables = info.tables_detected,
        code = info.code_blocks_detected,
        avg = info.avg_words_per_page,
        method = info.recommended_chunking,
        preview = preview,
    )
}
