// Analysis Backend
// The external analysis capability, behind a trait so runs can swap transports

use async_trait::async_trait;
use serde::Serialize;

use crate::services::providers::{resolve_provider, ProviderClient, ProviderError, ResolvedProvider};

const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Where a span sits in the document being analyzed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionalContext {
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub start: usize,
    pub end: usize,
    pub document_chars: usize,
    pub overlap_with_prev: usize,
    /// Recursion depth; 0 for top-level chunks.
    pub depth: usize,
}

impl PositionalContext {
    pub fn describe(&self) -> String {
        let mut s = format!(
            "chunk {} of {} (characters {}..{} of {})",
            self.chunk_index + 1,
            self.total_chunks,
            self.start,
            self.end,
            self.document_chars
        );
        if self.overlap_with_prev > 0 {
            s.push_str(&format!(
                "; the first {} characters repeat the end of the previous chunk",
                self.overlap_with_prev
            ));
        }
        if self.depth > 0 {
            s.push_str(&format!("; sub-chunk at depth {}", self.depth));
        }
        s
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub system_prompt: String,
    pub instructions: String,
    pub text_span: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positional_context: Option<PositionalContext>,
    /// Ask the provider for a JSON object reply where it supports that mode.
    pub expect_json: bool,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Perform one analysis call and return the raw response text.
    async fn perform_analysis(&self, request: &AnalysisRequest) -> Result<String, ProviderError>;

    /// Label used in logs and reports.
    fn describe(&self) -> String;
}

/// HTTP chat-completion backend.
pub struct ProviderBackend {
    client: ProviderClient,
    provider: ResolvedProvider,
    max_tokens: u32,
}

impl ProviderBackend {
    pub fn new(client: ProviderClient, provider: ResolvedProvider) -> Self {
        Self {
            client,
            provider,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Resolve `name[:model]` (or the first configured provider) and build a client.
    pub fn from_spec(spec: Option<&str>, proxy: Option<&str>) -> Result<Self, ProviderError> {
        let provider = resolve_provider(spec)?;
        let client = match proxy {
            Some(p) => ProviderClient::with_proxy(p)?,
            None => ProviderClient::new(),
        };
        Ok(Self::new(client, provider))
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl AnalysisBackend for ProviderBackend {
    async fn perform_analysis(&self, request: &AnalysisRequest) -> Result<String, ProviderError> {
        let user = match &request.positional_context {
            Some(ctx) => format!(
                "{}\n\nPosition: {}\n\n<document_span>\n{}\n</document_span>",
                request.instructions,
                ctx.describe(),
                request.text_span
            ),
            None => format!("{}\n\n{}", request.instructions, request.text_span),
        };

        let result = self
            .client
            .chat(
                &self.provider.name,
                &self.provider.model,
                &self.provider.api_key,
                &request.system_prompt,
                &user,
                self.max_tokens,
                request.expect_json,
            )
            .await?;
        Ok(result.content)
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.provider.name, self.provider.model)
    }
}
