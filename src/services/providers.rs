// AI Provider Service
// Chat-completion calls to OpenAI-compatible and Anthropic endpoints

use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use super::config_store::ConfigStore;

const DEEPSEEK_DEFAULT_URL: &str = "https://api.deepseek.com/chat/completions";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";
const GLM_DEFAULT_URL: &str = "https://open.bigmodel.cn/api/paas/v4/chat/completions";
const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Transport ceiling; per-call deadlines are enforced by the orchestrator.
const HTTP_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_PROVIDER_ORDER: [&str; 4] = ["anthropic", "openai", "deepseek", "glm"];

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("request exceeds model context: {0}")]
    ContextOverflow(String),
    #[error("Missing content in response")]
    MissingContent,
    #[error("JSON parse error: {0}")]
    JsonError(String),
    #[error("API key not configured for provider '{0}'")]
    MissingApiKey(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub model: String,
}

pub fn parse_provider(spec: &str) -> ProviderSpec {
    match spec.split_once(':') {
        Some((name, model)) => ProviderSpec {
            name: name.trim().to_string(),
            model: model.trim().to_string(),
        },
        None => ProviderSpec {
            name: spec.trim().to_string(),
            model: String::new(),
        },
    }
}

pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" | "claude" => "claude-sonnet-4-5",
        "openai" => "gpt-4o-mini",
        "deepseek" => "deepseek-chat",
        "glm" => "glm-4-flash",
        _ => "",
    }
}

/// Provider name, model and key, ready for calls.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub name: String,
    pub model: String,
    pub api_key: String,
}

/// Resolve an explicit `name[:model]` spec, or the first provider with a key.
pub fn resolve_provider(spec: Option<&str>) -> Result<ResolvedProvider, ProviderError> {
    if let Some(spec) = spec {
        let spec = parse_provider(spec);
        let model = if spec.model.is_empty() {
            default_model(&spec.name).to_string()
        } else {
            spec.model
        };
        if model.is_empty() {
            return Err(ProviderError::UnknownProvider(spec.name));
        }
        let api_key =
            get_api_key(&spec.name).ok_or_else(|| ProviderError::MissingApiKey(spec.name.clone()))?;
        return Ok(ResolvedProvider {
            name: spec.name,
            model,
            api_key,
        });
    }

    DEFAULT_PROVIDER_ORDER
        .iter()
        .find_map(|name| {
            get_api_key(name).map(|api_key| ResolvedProvider {
                name: name.to_string(),
                model: default_model(name).to_string(),
                api_key,
            })
        })
        .ok_or_else(|| ProviderError::MissingApiKey("any".to_string()))
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: String,
}

impl ChatRequest {
    fn new(model: &str, system: &str, user: &str, max_tokens: u32, use_json_format: bool) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature: 0.0,
            response_format: use_json_format.then(|| ResponseFormat {
                r#type: "json_object".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

pub struct ProviderClient {
    client: Client,
    deepseek_url: String,
    openai_url: String,
    glm_url: String,
    anthropic_url: String,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            deepseek_url: resolve_url("deepseek", "DEEPSEEK_API_URL", DEEPSEEK_DEFAULT_URL),
            openai_url: resolve_url("openai", "OPENAI_API_URL", OPENAI_DEFAULT_URL),
            glm_url: resolve_url("glm", "GLM_API_URL", GLM_DEFAULT_URL),
            anthropic_url: resolve_url("anthropic", "ANTHROPIC_API_URL", ANTHROPIC_DEFAULT_URL),
        }
    }

    pub fn with_proxy(proxy_url: &str) -> Result<Self, ProviderError> {
        let proxy = reqwest::Proxy::all(proxy_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .proxy(proxy)
            .build()?;
        Ok(Self {
            client,
            ..Self::new()
        })
    }

    /// Dispatch a system + user exchange to the named provider.
    pub async fn chat(
        &self,
        provider: &str,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        json_mode: bool,
    ) -> Result<ChatResult, ProviderError> {
        match provider {
            "anthropic" | "claude" => {
                self.call_anthropic_api(&self.anthropic_url, model, api_key, system, user, max_tokens)
                    .await
            }
            // Both accept json_object when the prompt mentions JSON.
            "deepseek" => {
                self.call_chat_api(&self.deepseek_url, model, api_key, system, user, max_tokens, json_mode)
                    .await
            }
            "glm" => {
                self.call_chat_api(&self.glm_url, model, api_key, system, user, max_tokens, json_mode)
                    .await
            }
            "openai" => {
                self.call_chat_api(&self.openai_url, model, api_key, system, user, max_tokens, false)
                    .await
            }
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }

    async fn call_anthropic_api(
        &self,
        url: &str,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<ChatResult, ProviderError> {
        #[derive(Serialize)]
        struct AnthropicRequest {
            model: String,
            max_tokens: u32,
            #[serde(skip_serializing_if = "String::is_empty")]
            system: String,
            messages: Vec<ChatMessage>,
        }

        #[derive(Deserialize)]
        struct AnthropicResponse {
            content: Option<Vec<AnthropicContent>>,
        }

        #[derive(Deserialize)]
        struct AnthropicContent {
            text: Option<String>,
        }

        let request = AnthropicRequest {
            model: model.to_string(),
            max_tokens,
            system: system.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: user.to_string(),
            }],
        };

        let start = Instant::now();

        let response = self
            .client
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status, body));
        }

        let data: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .content
            .into_iter()
            .flatten()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(ProviderError::MissingContent);
        }

        debug!(latency_ms, chars = content.len(), "anthropic.response");
        Ok(ChatResult {
            content,
            latency_ms,
            reasoning: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_chat_api(
        &self,
        url: &str,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        use_json_format: bool,
    ) -> Result<ChatResult, ProviderError> {
        let request = ChatRequest::new(model, system, user, max_tokens, use_json_format);

        let start = Instant::now();

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status, body));
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let message = data
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message);

        let reasoning = message.as_ref().and_then(|m| m.reasoning_content.clone());
        let mut content = message
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty());

        // Reasoning models sometimes put the JSON only in the reasoning trace.
        if content.is_none() {
            if let Some(ref r) = reasoning {
                content = json_block_re().find(r).map(|m| m.as_str().to_string());
            }
        }

        let content = content.ok_or(ProviderError::MissingContent)?;

        debug!(latency_ms, chars = content.len(), "chat.response");
        Ok(ChatResult {
            content,
            latency_ms,
            reasoning,
        })
    }
}

fn json_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("json block regex"))
}

/// Map a non-success response, singling out context-window overflows.
pub fn classify_api_error(status: StatusCode, body: String) -> ProviderError {
    let lower = body.to_ascii_lowercase();
    let overflow = status == StatusCode::PAYLOAD_TOO_LARGE
        || ((status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY)
            && (lower.contains("context length")
                || lower.contains("context_length")
                || lower.contains("maximum context")
                || lower.contains("prompt is too long")
                || lower.contains("too many tokens")));
    if overflow {
        ProviderError::ContextOverflow(body)
    } else {
        ProviderError::ApiError {
            status: status.as_u16(),
            message: body,
        }
    }
}

fn resolve_url(provider: &str, env_key: &str, default: &str) -> String {
    if let Ok(url) = env::var(env_key) {
        if !url.trim().is_empty() {
            return url.trim().to_string();
        }
    }
    ConfigStore::default_config_dir()
        .map(ConfigStore::new)
        .and_then(|store| store.get_provider_url(provider).ok().flatten())
        .unwrap_or_else(|| default.to_string())
}

/// Get API key from environment or config file
pub fn get_api_key(provider: &str) -> Option<String> {
    let env_keys: &[&str] = match provider {
        "deepseek" => &["DEEPSEEK_API_KEY", "RLM_DEEPSEEK_API_KEY"],
        "openai" => &["OPENAI_API_KEY", "RLM_OPENAI_API_KEY"],
        "glm" => &["GLM_API_KEY", "RLM_GLM_API_KEY"],
        "anthropic" | "claude" => &["ANTHROPIC_API_KEY", "RLM_ANTHROPIC_API_KEY"],
        _ => &[],
    };

    for key in env_keys {
        if let Ok(val) = env::var(key) {
            let v = val.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }

    let store = ConfigStore::new(ConfigStore::default_config_dir()?);
    store.get_api_key(provider).ok().flatten()
}
