// Analysis Errors
// Failure taxonomy for planning, per-chunk analysis and whole runs

use std::time::Duration;
use thiserror::Error;

/// Upper bound on in-flight analysis calls per run.
pub const MAX_CONCURRENCY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("chunk_size must be positive")]
    ZeroChunkSize,
    #[error("overlap_size must be positive")]
    ZeroOverlap,
    #[error("chunk_size ({chunk_size}) must be greater than overlap_size ({overlap_size})")]
    OverlapNotSmallerThanChunk {
        chunk_size: usize,
        overlap_size: usize,
    },
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("concurrency {0} exceeds the limit of {max}", max = MAX_CONCURRENCY)]
    ConcurrencyTooHigh(usize),
    #[error("per-chunk timeout must be non-zero")]
    ZeroTimeout,
}

/// Why a single analysis attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("empty response")]
    EmptyResponse,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("segment exceeds backend context: {0}")]
    Overflow(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("analysis of chunk {chunk_index} failed: {cause}")]
pub struct AnalysisFailure {
    pub chunk_index: usize,
    pub cause: FailureCause,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalOrchestrationError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("all {chunks} chunks degraded; nothing to synthesize")]
    AllChunksDegraded { chunks: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("run cancelled after {completed}/{total} chunks")]
pub struct CancelledError {
    pub completed: usize,
    pub total: usize,
}

/// Terminal outcome of a run that produced no [`crate::models::SynthesisResult`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error(transparent)]
    Fatal(#[from] FatalOrchestrationError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
}

impl From<ConfigurationError> for RunError {
    fn from(e: ConfigurationError) -> Self {
        RunError::Fatal(FatalOrchestrationError::Configuration(e))
    }
}
