pub mod logging;
pub mod models;
pub mod services;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use models::{Document, SynthesisResult};
use services::{AnalysisBackend, Orchestrator, RunConfig, RunError, SegmentAnalyzer};

pub use logging::init_logging;

/// Analyze `document` for `task_description` with the given backend and settings.
pub async fn read_document(
    backend: Arc<dyn AnalysisBackend>,
    config: RunConfig,
    document: &Document,
    task_description: &str,
    cancel: &CancellationToken,
) -> Result<SynthesisResult, RunError> {
    let analyzer = Arc::new(SegmentAnalyzer::new(backend));
    Orchestrator::new(analyzer, config)
        .run(document, task_description, cancel)
        .await
}
