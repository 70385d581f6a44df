// Analysis Module
// Map-reduce reading of long documents, organized into submodules:
// - segmenter: plans overlapping character windows
// - backend: the external analysis capability and its HTTP implementation
// - analyzer: per-chunk request building and reply mapping
// - orchestrator: retries, timeouts, concurrency, cancellation
// - synthesizer: overlap dedup, sections, coverage note

pub mod analyzer;
pub mod backend;
pub mod errors;
pub mod orchestrator;
pub mod segmenter;
pub mod synthesizer;

#[cfg(test)]
pub(crate) mod mock_backend;

pub use analyzer::SegmentAnalyzer;
pub use backend::{AnalysisBackend, AnalysisRequest, PositionalContext, ProviderBackend};
pub use errors::{
    AnalysisFailure, CancelledError, ConfigurationError, FailureCause, FatalOrchestrationError,
    RunError,
};
pub use orchestrator::Orchestrator;
pub use segmenter::{plan, plan_document, validate_chunking};
pub use synthesizer::{chunk_label, combine};
