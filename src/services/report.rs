// Run Report
// Markdown rendering of a synthesis result for terminal output

use crate::models::SynthesisResult;

pub fn format_run_report(result: &SynthesisResult, task_description: &str) -> String {
    let mut out = String::from("# Analysis Result\n\n");
    out.push_str(&format!("**Task:** {}\n\n", task_description.trim()));

    if let Some(answer) = &result.answer {
        out.push_str("## Answer\n\n");
        out.push_str(answer.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Findings\n\n");
    if result.sections.is_empty() {
        out.push_str("_No findings._\n\n");
    }
    for section in &result.sections {
        let chunks = section
            .source_chunks
            .iter()
            .map(|i| (i + 1).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("### {}\n\n{}\n\n_Source chunks: {}_\n\n", section.name, section.content, chunks));
    }

    out.push_str("---\n## Coverage\n\n");
    out.push_str(&result.coverage_note);
    out.push_str("\n\n");

    let stats = &result.stats;
    out.push_str("## Statistics\n");
    out.push_str(&format!("- Chunks: {}\n", stats.chunks));
    out.push_str(&format!("- Degraded chunks: {}\n", stats.degraded_chunks));
    out.push_str(&format!("- Chunk calls: {}\n", stats.analysis_calls));
    out.push_str(&format!("- Sub-chunk calls: {}\n", stats.sub_chunk_calls));
    out.push_str(&format!("- Answer calls: {}\n", stats.answer_calls));
    out.push_str(&format!("- Total calls: {}\n", stats.total_calls()));
    out.push_str(&format!("- Retries: {}\n", stats.retries));
    out.push_str(&format!("- Timeouts: {}\n", stats.timeouts));
    out.push_str(&format!("- Response characters: {}\n", stats.response_chars));
    out.push_str(&format!("- Elapsed: {} ms\n", stats.elapsed_ms));
    if let Some(run_id) = result.run_id {
        out.push_str(&format!("- Run id: {}\n", run_id));
    }
    out
}
