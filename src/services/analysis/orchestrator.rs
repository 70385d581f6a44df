// Orchestrator
// Plans chunks, drives the analyzer per chunk (sequential or bounded-parallel),
// contains per-chunk failures, and hands ordered findings to the synthesizer.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{ChunkSpec, Document, Finding, RunStats, SynthesisResult, META_SUB_CHUNKS, META_TOPIC};
use crate::services::config_store::RunConfig;

use super::analyzer::SegmentAnalyzer;
use super::backend::PositionalContext;
use super::errors::{CancelledError, FailureCause, FatalOrchestrationError, RunError};
use super::segmenter::{plan, plan_document};
use super::synthesizer::combine;

/// Where a chunk sits, plus the sizes used to re-split it on overflow.
#[derive(Debug, Clone, Copy)]
struct Layout {
    total_chunks: usize,
    document_chars: usize,
    depth: usize,
    chunk_size: usize,
    overlap_size: usize,
}

struct ChunkOutcome {
    finding: Finding,
    tally: RunStats,
}

type OutcomeFuture<'a> = Pin<Box<dyn Future<Output = Option<ChunkOutcome>> + Send + 'a>>;

/// Linear backoff; saturates instead of overflowing on huge settings.
fn retry_backoff(base: Duration, attempt: usize) -> Duration {
    base.saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX))
}

#[derive(Clone)]
pub struct Orchestrator {
    analyzer: Arc<SegmentAnalyzer>,
    config: RunConfig,
}

impl Orchestrator {
    pub fn new(analyzer: Arc<SegmentAnalyzer>, config: RunConfig) -> Self {
        Self { analyzer, config }
    }

    /// Run one document through plan -> analyze -> combine.
    ///
    /// Returns a result whenever at least one chunk was analyzed; chunk failures
    /// are reported through `coverage_note` and `degraded_ranges`.
    pub async fn run(
        &self,
        document: &Document,
        task_description: &str,
        cancel: &CancellationToken,
    ) -> Result<SynthesisResult, RunError> {
        let started = Instant::now();
        self.config.validate()?;

        let chunks = plan_document(
            document,
            self.config.chunk_size,
            self.config.overlap_size,
            self.config.structure_hints_enabled,
        )?;
        let total = chunks.len();
        let run_id = Uuid::new_v4();

        info!(
            "[ORCHESTRATOR] start run_id={} chunks={} chars={} concurrency={} backend={}",
            run_id,
            total,
            document.char_len(),
            self.config.concurrency,
            self.analyzer.backend_label()
        );

        if cancel.is_cancelled() {
            return Err(CancelledError { completed: 0, total }.into());
        }

        let layout = Layout {
            total_chunks: total,
            document_chars: document.char_len(),
            depth: 0,
            chunk_size: self.config.chunk_size,
            overlap_size: self.config.overlap_size,
        };

        let outcomes = if self.config.concurrency == 1 {
            self.run_sequential(document, &chunks, layout, task_description, cancel).await?
        } else {
            self.run_parallel(document, &chunks, layout, task_description, cancel).await?
        };

        let mut stats = RunStats { chunks: total, ..Default::default() };
        let findings: Vec<Finding> = outcomes
            .into_iter()
            .map(|o| {
                stats.merge_calls(&o.tally);
                o.finding
            })
            .collect();
        stats.degraded_chunks = findings.iter().filter(|f| f.degraded).count();

        if total > 0 && stats.degraded_chunks == total {
            error!(
                "[ORCHESTRATOR] all chunks degraded run_id={} chunks={} calls={}",
                run_id,
                total,
                stats.total_calls()
            );
            return Err(FatalOrchestrationError::AllChunksDegraded { chunks: total }.into());
        }

        let mut result = combine(&findings, task_description);

        if self.config.compose_answer && !result.sections.is_empty() {
            if cancel.is_cancelled() {
                return Err(CancelledError { completed: total, total }.into());
            }
            stats.answer_calls += 1;
            let call = tokio::time::timeout(
                self.config.per_chunk_timeout,
                self.analyzer
                    .compose_answer(&result.sections, &result.coverage_note, task_description),
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = call => Some(r),
            };
            match outcome {
                None => return Err(CancelledError { completed: total, total }.into()),
                Some(Ok(Ok(answer))) => {
                    stats.response_chars += answer.chars().count();
                    result.answer = Some(answer);
                }
                Some(Ok(Err(cause))) => {
                    warn!("[ORCHESTRATOR] final answer failed run_id={} : {}", run_id, cause);
                }
                Some(Err(_)) => {
                    stats.timeouts += 1;
                    warn!(
                        "[ORCHESTRATOR] final answer timeout run_id={} ({:?})",
                        run_id, self.config.per_chunk_timeout
                    );
                }
            }
        }

        stats.elapsed_ms = started.elapsed().as_millis();
        info!(
            "[ORCHESTRATOR] done run_id={} sections={} degraded={} calls={} retries={} elapsed_ms={}",
            run_id,
            result.sections.len(),
            stats.degraded_chunks,
            stats.total_calls(),
            stats.retries,
            stats.elapsed_ms
        );

        result.run_id = Some(run_id);
        result.stats = stats;
        Ok(result)
    }

    async fn run_sequential(
        &self,
        document: &Document,
        chunks: &[ChunkSpec],
        layout: Layout,
        task_description: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkOutcome>, CancelledError> {
        let semaphore = Semaphore::new(1);
        let total = chunks.len();
        let mut outcomes = Vec::with_capacity(total);

        for chunk in chunks {
            if cancel.is_cancelled() {
                return Err(CancelledError { completed: outcomes.len(), total });
            }
            let text = document.chunk_text(chunk);
            match self
                .analyze_chunk(text, *chunk, layout, task_description, &semaphore, cancel)
                .await
            {
                Some(outcome) => outcomes.push(outcome),
                None => return Err(CancelledError { completed: outcomes.len(), total }),
            }
        }
        Ok(outcomes)
    }

    async fn run_parallel(
        &self,
        document: &Document,
        chunks: &[ChunkSpec],
        layout: Layout,
        task_description: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkOutcome>, CancelledError> {
        let started = Instant::now();
        let total = chunks.len();
        let permits = self.config.concurrency.min(total.max(1));
        let semaphore = Arc::new(Semaphore::new(permits));
        let task: Arc<str> = Arc::from(task_description);
        let mut join_set: JoinSet<Option<ChunkOutcome>> = JoinSet::new();

        for chunk in chunks {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let task = task.clone();
            let text = document.chunk_text(chunk).to_string();
            let chunk = *chunk;
            join_set.spawn(async move {
                this.analyze_chunk(&text, chunk, layout, &task, &semaphore, &cancel)
                    .await
            });
        }

        let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(total);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = join_set.join_next() => Some(next),
            };
            let next = match next {
                Some(next) => next,
                None => {
                    join_set.abort_all();
                    return Err(CancelledError { completed: outcomes.len(), total });
                }
            };

            match next {
                Some(Ok(Some(outcome))) => {
                    outcomes.push(outcome);
                    let done = outcomes.len();
                    if done == total || done % 5 == 0 {
                        info!(
                            "[ORCHESTRATOR] progress: {}/{} (elapsed_ms={})",
                            done,
                            total,
                            started.elapsed().as_millis()
                        );
                    }
                }
                Some(Ok(None)) => {
                    join_set.abort_all();
                    return Err(CancelledError { completed: outcomes.len(), total });
                }
                Some(Err(e)) => warn!("[ORCHESTRATOR] chunk task failed: {}", e),
                None => break,
            }
        }

        // A task that died without reporting still owes its chunk a finding.
        let mut reported = vec![false; total];
        for o in &outcomes {
            if let Some(slot) = reported.get_mut(o.finding.chunk_index) {
                *slot = true;
            }
        }
        for chunk in chunks {
            if !reported.get(chunk.index).copied().unwrap_or(false) {
                outcomes.push(ChunkOutcome {
                    finding: Finding::degraded(chunk, "analysis task failed"),
                    tally: RunStats::default(),
                });
            }
        }

        outcomes.sort_by_key(|o| o.finding.chunk_index);
        Ok(outcomes)
    }

    /// Analyze one chunk with retry, timeout and bounded re-splitting.
    ///
    /// `None` means the run was cancelled. The semaphore permit is held only
    /// for the call itself, not across backoff.
    fn analyze_chunk<'a>(
        &'a self,
        text: &'a str,
        chunk: ChunkSpec,
        layout: Layout,
        task_description: &'a str,
        semaphore: &'a Semaphore,
        cancel: &'a CancellationToken,
    ) -> OutcomeFuture<'a> {
        Box::pin(async move {
            let mut tally = RunStats::default();
            let attempts = self.config.max_retries_per_chunk + 1;
            let mut last_cause = FailureCause::EmptyResponse;

            for attempt in 1..=attempts {
                if cancel.is_cancelled() {
                    return None;
                }

                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire() => permit.ok()?,
                };

                if layout.depth == 0 {
                    tally.analysis_calls += 1;
                } else {
                    tally.sub_chunk_calls += 1;
                }
                if attempt > 1 {
                    tally.retries += 1;
                }

                let context = PositionalContext {
                    chunk_index: chunk.index,
                    total_chunks: layout.total_chunks,
                    start: chunk.start,
                    end: chunk.end,
                    document_chars: layout.document_chars,
                    overlap_with_prev: chunk.overlap_with_prev,
                    depth: layout.depth,
                };
                let call = tokio::time::timeout(
                    self.config.per_chunk_timeout,
                    self.analyzer.analyze(text, task_description, &chunk, context),
                );
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    r = call => r,
                };
                drop(permit);

                match result {
                    Ok(Ok(finding)) => {
                        tally.response_chars += finding
                            .metadata
                            .get("response_chars")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as usize;
                        info!(
                            "[ORCHESTRATOR] chunk ok index={} depth={} range={} attempt={}",
                            chunk.index,
                            layout.depth,
                            chunk.range(),
                            attempt
                        );
                        return Some(ChunkOutcome { finding, tally });
                    }
                    Ok(Err(failure)) => {
                        warn!(
                            "[ORCHESTRATOR] chunk error index={} depth={} attempt={} : {}",
                            chunk.index, layout.depth, attempt, failure.cause
                        );
                        last_cause = failure.cause;
                    }
                    Err(_) => {
                        tally.timeouts += 1;
                        warn!(
                            "[ORCHESTRATOR] chunk timeout index={} depth={} attempt={} ({:?})",
                            chunk.index, layout.depth, attempt, self.config.per_chunk_timeout
                        );
                        last_cause = FailureCause::Timeout(self.config.per_chunk_timeout);
                    }
                }

                // Same-size retries cannot fix an overflow.
                if matches!(last_cause, FailureCause::Overflow(_)) {
                    if layout.depth < self.config.max_recursion_depth {
                        return self
                            .split_and_analyze(text, chunk, layout, task_description, semaphore, cancel, tally)
                            .await;
                    }
                    break;
                }

                if attempt < attempts {
                    let backoff = retry_backoff(self.config.retry_backoff, attempt);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }

            warn!(
                "[ORCHESTRATOR] chunk degraded index={} depth={} range={} : {}",
                chunk.index,
                layout.depth,
                chunk.range(),
                last_cause
            );
            Some(ChunkOutcome {
                finding: Finding::degraded(&chunk, last_cause.to_string()),
                tally,
            })
        })
    }

    /// Re-plan an overflowing chunk at half size and analyze the parts in order.
    #[allow(clippy::too_many_arguments)]
    async fn split_and_analyze(
        &self,
        text: &str,
        chunk: ChunkSpec,
        layout: Layout,
        task_description: &str,
        semaphore: &Semaphore,
        cancel: &CancellationToken,
        mut tally: RunStats,
    ) -> Option<ChunkOutcome> {
        let sub_document = Document::new(text);
        let text_len = sub_document.char_len();
        let sub_size = layout.chunk_size.min(text_len) / 2;
        if sub_size < 2 {
            return Some(ChunkOutcome {
                finding: Finding::degraded(&chunk, "segment exceeds backend context and cannot be split"),
                tally,
            });
        }
        let sub_overlap = (layout.overlap_size / 2).clamp(1, sub_size - 1);

        let sub_chunks = match plan(text_len, sub_size, sub_overlap, None) {
            Ok(sub_chunks) => sub_chunks,
            Err(e) => {
                return Some(ChunkOutcome {
                    finding: Finding::degraded(&chunk, e.to_string()),
                    tally,
                })
            }
        };

        info!(
            "[ORCHESTRATOR] splitting chunk index={} depth={} into {} parts (size={} overlap={})",
            chunk.index,
            layout.depth,
            sub_chunks.len(),
            sub_size,
            sub_overlap
        );

        let sub_layout = Layout {
            total_chunks: sub_chunks.len(),
            document_chars: layout.document_chars,
            depth: layout.depth + 1,
            chunk_size: sub_size,
            overlap_size: sub_overlap,
        };

        let mut sub_findings = Vec::with_capacity(sub_chunks.len());
        for sub in &sub_chunks {
            let absolute = ChunkSpec {
                index: sub.index,
                start: chunk.start + sub.start,
                end: chunk.start + sub.end,
                overlap_with_prev: sub.overlap_with_prev,
            };
            let outcome = self
                .analyze_chunk(
                    sub_document.chunk_text(sub),
                    absolute,
                    sub_layout,
                    task_description,
                    semaphore,
                    cancel,
                )
                .await?;
            tally.merge_calls(&outcome.tally);
            sub_findings.push(outcome.finding);
        }

        Some(ChunkOutcome {
            finding: merge_sub_findings(&chunk, &sub_findings, task_description),
            tally,
        })
    }
}

/// Fold the findings of a re-split chunk back into one finding for that chunk.
fn merge_sub_findings(chunk: &ChunkSpec, sub_findings: &[Finding], task_description: &str) -> Finding {
    let parts = sub_findings.len();
    let degraded_parts = sub_findings.iter().filter(|f| f.degraded).count();

    if degraded_parts == parts {
        let cause = sub_findings
            .iter()
            .find_map(|f| f.failure_cause())
            .unwrap_or("unknown failure");
        let mut finding = Finding::degraded(
            chunk,
            format!("all {} parts of a split chunk failed: {}", parts, cause),
        );
        finding.metadata.insert(META_SUB_CHUNKS.to_string(), Value::from(parts));
        return finding;
    }

    let combined = combine(sub_findings, task_description);
    let content = combined
        .sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut finding = Finding {
        chunk_index: chunk.index,
        range: chunk.range(),
        extracted_content: content,
        metadata: Default::default(),
        degraded: false,
    };
    finding.metadata.insert(META_SUB_CHUNKS.to_string(), Value::from(parts));
    if let Some(topic) = sub_findings.iter().find_map(|f| f.topic()) {
        finding.metadata.insert(META_TOPIC.to_string(), Value::from(topic));
    }
    if degraded_parts > 0 {
        finding
            .metadata
            .insert("degraded_sub_chunks".to_string(), Value::from(degraded_parts));
        finding
            .metadata
            .insert("sub_coverage_note".to_string(), Value::from(combined.coverage_note));
    }
    finding
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CharRange;
    use crate::services::analysis::errors::{ConfigurationError, MAX_CONCURRENCY};
    use crate::services::analysis::mock_backend::{ScriptedBackend, Step};
    use crate::services::providers::ProviderError;
    use std::time::Duration;

    fn config(concurrency: usize) -> RunConfig {
        RunConfig {
            chunk_size: 300,
            overlap_size: 50,
            structure_hints_enabled: true,
            concurrency,
            max_retries_per_chunk: 2,
            per_chunk_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(1),
            max_recursion_depth: 1,
            compose_answer: false,
        }
    }

    /// 1000 chars -> chunks [0,300) [250,550) [500,800) [750,1000).
    fn document() -> Document {
        let text: String = (0..1000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        Document::new(text)
    }

    fn orchestrator(backend: &Arc<ScriptedBackend>, config: RunConfig) -> Orchestrator {
        let analyzer = Arc::new(SegmentAnalyzer::new(backend.clone()));
        Orchestrator::new(analyzer, config)
    }

    fn server_error() -> Step {
        Step::fail(ProviderError::ApiError { status: 500, message: "upstream".into() })
    }

    fn source_order(result: &SynthesisResult) -> Vec<usize> {
        result.sections.iter().flat_map(|s| s.source_chunks.clone()).collect()
    }

    #[tokio::test]
    async fn test_sequential_run_keeps_chunk_order() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = orchestrator(&backend, config(1))
            .run(&document(), "summarize", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source_order(&result), vec![0, 1, 2, 3]);
        assert_eq!(result.sections[0].name, "Chunk 1 [0, 300)");
        assert_eq!(result.sections[3].content, "Chunk 3 ok.");
        assert!(result.run_id.is_some());
        assert_eq!(result.stats.chunks, 4);
        assert_eq!(result.stats.analysis_calls, 4);
        assert_eq!(result.stats.retries, 0);
        assert_eq!(backend.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_parallel_run_resorts_by_index() {
        let backend = Arc::new(ScriptedBackend::new());
        // Earlier chunks finish last.
        for (index, ms) in [(0, 60), (1, 45), (2, 30), (3, 15)] {
            backend.script(
                index,
                vec![Step::reply(format!("{{\"summary\": \"Chunk {} ok.\"}}", index))
                    .after(Duration::from_millis(ms))],
            );
        }
        let result = orchestrator(&backend, config(3))
            .run(&document(), "summarize", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source_order(&result), vec![0, 1, 2, 3]);
        assert!(backend.peak_in_flight() <= 3);
        assert!(backend.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(1, vec![server_error(), Step::reply("Recovered on retry.")]);
        let result = orchestrator(&backend, config(1))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.degraded_ranges.is_empty());
        assert_eq!(backend.calls_for(1), 2);
        assert_eq!(result.stats.retries, 1);
        assert_eq!(result.stats.analysis_calls, 5);
    }

    #[tokio::test]
    async fn test_single_chunk_failure_is_contained() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(2, vec![server_error()]);
        let result = orchestrator(&backend, config(2))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.calls_for(2), 3);
        assert_eq!(result.stats.degraded_chunks, 1);
        assert_eq!(result.degraded_ranges.len(), 1);
        assert_eq!(result.degraded_ranges[0].chunk_index, 2);
        assert_eq!(result.degraded_ranges[0].range, CharRange { start: 500, end: 800 });
        assert!(result.coverage_note.contains("chunk 3 [500, 800)"));
        assert_eq!(source_order(&result), vec![0, 1, 3]);
    }

    #[tokio::test]
    async fn test_all_chunks_failing_is_fatal() {
        let backend = Arc::new(ScriptedBackend::new());
        for index in 0..4 {
            backend.script(index, vec![server_error()]);
        }
        let err = orchestrator(&backend, config(1))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RunError::Fatal(FatalOrchestrationError::AllChunksDegraded { chunks: 4 })
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            0,
            vec![
                Step::reply("Too late.").after(Duration::from_millis(500)),
                Step::reply("In time."),
            ],
        );
        let mut cfg = config(1);
        cfg.per_chunk_timeout = Duration::from_millis(50);
        let result = orchestrator(&backend, cfg)
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.stats.timeouts, 1);
        assert_eq!(result.stats.retries, 1);
        assert_eq!(result.sections[0].content, "In time.");
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let backend = Arc::new(ScriptedBackend::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orchestrator(&backend, config(1))
            .run(&document(), "t", &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, RunError::Cancelled(CancelledError { completed: 0, total: 4 }));
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_stops_dispatch() {
        let backend = Arc::new(ScriptedBackend::new());
        let cancel = CancellationToken::new();
        backend.cancel_on_call(2, cancel.clone());
        let err = orchestrator(&backend, config(1))
            .run(&document(), "t", &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, RunError::Cancelled(CancelledError { completed: 1, total: 4 }));
        assert_eq!(backend.total_calls(), 2);
        assert_eq!(backend.calls_for(2), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_parallel_run() {
        let backend = Arc::new(ScriptedBackend::new());
        for index in 0..4 {
            backend.script(index, vec![Step::reply("Slow reply.").after(Duration::from_millis(100))]);
        }
        let cancel = CancellationToken::new();
        backend.cancel_on_call(2, cancel.clone());
        let err = orchestrator(&backend, config(2))
            .run(&document(), "t", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Cancelled(CancelledError { total: 4, .. })));
        assert!(backend.total_calls() <= 2);
    }

    #[tokio::test]
    async fn test_overflow_splits_chunk_once() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(1, vec![Step::fail(ProviderError::ContextOverflow("too long".into()))]);
        let result = orchestrator(&backend, config(1))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        // 300 chars at half size (150, overlap 25): [0,150) [125,275) [250,300)
        assert_eq!(backend.calls_for(1), 1);
        assert_eq!(result.stats.sub_chunk_calls, 3);
        assert!(result.degraded_ranges.is_empty());
        assert_eq!(result.sections[1].content, "Part 0 ok.\nPart 1 ok.\nPart 2 ok.");

        let sub_starts: Vec<usize> = backend
            .requests()
            .iter()
            .filter_map(|r| r.positional_context.clone())
            .filter(|ctx| ctx.depth == 1)
            .map(|ctx| ctx.start)
            .collect();
        assert_eq!(sub_starts, vec![250, 375, 500]);
    }

    #[tokio::test]
    async fn test_overflow_beyond_depth_degrades() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(1, vec![Step::fail(ProviderError::ContextOverflow("too long".into()))]);
        let mut cfg = config(1);
        cfg.max_recursion_depth = 0;
        let result = orchestrator(&backend, cfg)
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.calls_for(1), 1);
        assert_eq!(result.degraded_ranges.len(), 1);
        assert!(result.degraded_ranges[0].cause.contains("exceeds backend context"));
    }

    #[tokio::test]
    async fn test_empty_document() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = orchestrator(&backend, config(1))
            .run(&Document::new(""), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.sections.is_empty());
        assert!(result.coverage_note.starts_with("Zero content"));
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_fatal() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut cfg = config(1);
        cfg.overlap_size = cfg.chunk_size;
        let err = orchestrator(&backend, cfg)
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunError::Fatal(FatalOrchestrationError::Configuration(
                ConfigurationError::OverlapNotSmallerThanChunk { .. }
            ))
        ));
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_final_answer_is_composed() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut cfg = config(1);
        cfg.compose_answer = true;
        let result = orchestrator(&backend, cfg)
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.answer.as_deref(), Some("Final answer."));
        assert_eq!(result.stats.answer_calls, 1);
        assert_eq!(result.stats.total_calls(), 5);
    }

    #[tokio::test]
    async fn test_final_answer_failure_keeps_result() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script_answer(vec![server_error()]);
        let mut cfg = config(1);
        cfg.compose_answer = true;
        let result = orchestrator(&backend, cfg)
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.answer, None);
        assert_eq!(result.sections.len(), 4);
    }

    #[tokio::test]
    async fn test_hundred_thousand_char_document() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut cfg = config(4);
        cfg.chunk_size = 30_000;
        cfg.overlap_size = 2_000;
        let doc = Document::new("x".repeat(100_000));
        let result = orchestrator(&backend, cfg)
            .run(&doc, "t", &CancellationToken::new())
            .await
            .unwrap();

        let mut spans: Vec<(usize, usize)> = backend
            .requests()
            .iter()
            .filter_map(|r| r.positional_context.as_ref().map(|c| (c.start, c.end)))
            .collect();
        spans.sort_unstable();
        assert_eq!(
            spans,
            vec![(0, 30_000), (28_000, 58_000), (56_000, 86_000), (84_000, 100_000)]
        );
        assert_eq!(source_order(&result), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_retry_backoff_is_linear_and_saturates() {
        assert_eq!(retry_backoff(Duration::from_millis(400), 1), Duration::from_millis(400));
        assert_eq!(retry_backoff(Duration::from_millis(400), 3), Duration::from_millis(1_200));
        assert_eq!(retry_backoff(Duration::MAX, 3), Duration::MAX);
        assert_eq!(retry_backoff(Duration::from_secs(u64::MAX / 2), usize::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_concurrency_above_limit_is_rejected() {
        let backend = Arc::new(ScriptedBackend::new());
        let err = orchestrator(&backend, config(usize::MAX))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RunError::from(ConfigurationError::ConcurrencyTooHigh(usize::MAX))
        );
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_above_chunk_count() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = orchestrator(&backend, config(MAX_CONCURRENCY))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source_order(&result), vec![0, 1, 2, 3]);
        assert!(backend.peak_in_flight() <= 4);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(0, vec![server_error()]);
        let mut cfg = config(1);
        cfg.retry_backoff = Duration::MAX;
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }

        let orch = orchestrator(&backend, cfg);
        let doc = document();
        let run = orch.run(&doc, "t", &cancel);
        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancellation should interrupt the backoff sleep")
            .unwrap_err();

        assert_eq!(err, RunError::Cancelled(CancelledError { completed: 0, total: 4 }));
        assert_eq!(backend.calls_for(0), 1);
        assert_eq!(backend.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_overflow_recursion_stops_at_depth_cap() {
        let backend = Arc::new(ScriptedBackend::new());
        let overflow = || Step::fail(ProviderError::ContextOverflow("too long".into()));
        backend.script(1, vec![overflow()]);
        backend.script_at(1, 0, vec![overflow()]);
        backend.script_at(2, 0, vec![overflow()]);
        let mut cfg = config(1);
        cfg.max_recursion_depth = 2;
        let result = orchestrator(&backend, cfg)
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        // Part [250, 400) splits again at size 75, overlap 12: [0,75) [63,138) [126,150).
        let deepest: Vec<usize> = backend
            .requests()
            .iter()
            .filter_map(|r| r.positional_context.clone())
            .filter(|ctx| ctx.depth == 2)
            .map(|ctx| ctx.start)
            .collect();
        assert_eq!(deepest, vec![250, 313, 376]);
        assert!(backend
            .requests()
            .iter()
            .filter_map(|r| r.positional_context.as_ref())
            .all(|ctx| ctx.depth <= 2));
        assert_eq!(backend.calls_at(2, 0), 1);
        assert_eq!(result.stats.sub_chunk_calls, 6);
        assert!(result.degraded_ranges.is_empty());
    }

    #[tokio::test]
    async fn test_split_chunk_with_failed_part() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(1, vec![Step::fail(ProviderError::ContextOverflow("too long".into()))]);
        backend.script_at(1, 1, vec![server_error()]);
        let result = orchestrator(&backend, config(1))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.calls_at(1, 1), 3);
        assert_eq!(result.stats.sub_chunk_calls, 5);
        assert_eq!(result.stats.retries, 2);
        assert!(result.degraded_ranges.is_empty());
        assert_eq!(result.sections[1].content, "Part 0 ok.\nPart 2 ok.");
    }

    #[test]
    fn test_merge_sub_findings_records_failed_parts() {
        let chunk = ChunkSpec { index: 1, start: 250, end: 550, overlap_with_prev: 50 };
        let part = |index: usize, start: usize, end: usize| ChunkSpec {
            index,
            start,
            end,
            overlap_with_prev: if index == 0 { 0 } else { 25 },
        };
        let ok = |spec: ChunkSpec, text: &str| Finding {
            chunk_index: spec.index,
            range: spec.range(),
            extracted_content: text.to_string(),
            metadata: Default::default(),
            degraded: false,
        };
        let sub_findings = vec![
            ok(part(0, 250, 400), "Part 0 ok."),
            Finding::degraded(&part(1, 375, 525), "backend error: upstream"),
            ok(part(2, 500, 550), "Part 2 ok."),
        ];

        let merged = merge_sub_findings(&chunk, &sub_findings, "t");
        assert!(!merged.degraded);
        assert_eq!(merged.chunk_index, 1);
        assert_eq!(merged.range, CharRange { start: 250, end: 550 });
        assert_eq!(merged.metadata.get(META_SUB_CHUNKS), Some(&Value::from(3)));
        assert_eq!(merged.metadata.get("degraded_sub_chunks"), Some(&Value::from(1)));
        let note = merged.metadata["sub_coverage_note"].as_str().unwrap();
        assert!(note.starts_with("Partial coverage: 2 of 3 chunks analyzed."));
        assert!(note.contains("chunk 2 [375, 525) (backend error: upstream)"));

        let all_failed: Vec<Finding> = sub_findings.iter().filter(|f| f.degraded).cloned().collect();
        let merged = merge_sub_findings(&chunk, &all_failed, "t");
        assert!(merged.degraded);
        assert!(merged.failure_cause().unwrap().starts_with("all 1 parts of a split chunk failed"));
    }

    #[tokio::test]
    async fn test_lost_parallel_task_degrades_its_chunk() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(2, vec![Step::panic()]);
        let result = orchestrator(&backend, config(2))
            .run(&document(), "t", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.degraded_ranges.len(), 1);
        assert_eq!(result.degraded_ranges[0].chunk_index, 2);
        assert_eq!(result.degraded_ranges[0].cause, "analysis task failed");
        assert_eq!(source_order(&result), vec![0, 1, 3]);
    }
}
