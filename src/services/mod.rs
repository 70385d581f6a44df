// RLM Reader Core Services

pub mod analysis;
pub mod config_store;
pub mod document_loader;
pub mod providers;
pub mod report;
pub mod structure;
pub mod text_processor;

pub use analysis::{
    combine, plan, plan_document, AnalysisBackend, AnalysisFailure, AnalysisRequest, CancelledError,
    ConfigurationError, FailureCause, FatalOrchestrationError, Orchestrator, PositionalContext,
    ProviderBackend, RunError, SegmentAnalyzer,
};
pub use config_store::{AppConfig, ConfigError, ConfigStore, RunConfig};
pub use document_loader::{extract_from_bytes, DocumentLoader, LoaderError};
pub use providers::{ProviderClient, ProviderError};
pub use report::format_run_report;
pub use structure::{analyze_structure, detect_section_offsets};
