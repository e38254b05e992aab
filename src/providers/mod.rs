pub mod anthropic;
pub mod cohere;
pub mod ollama;
pub mod openai;
pub mod voyage;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EmbeddingConfig;

/// Provider failures, split so callers can tell retryable transport
/// conditions from deterministic data errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid input: {message}")]
    Input {
        index: Option<usize>,
        message: String,
    },
    #[error("malformed provider response: {0}")]
    Response(String),
}

impl ProviderError {
    /// Transport conditions, 429s, and 5xx responses are worth retrying;
    /// everything else will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited | Self::Server { .. }
        )
    }

    /// Map a non-success HTTP status to the matching error kind.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited,
            500..=599 => Self::Server {
                status,
                message: body,
            },
            401 | 403 => Self::Auth(body),
            _ => Self::Input {
                index: None,
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

// ── Embedding ───────────────────────────────────────────────────────────

/// One embedding, tagged with the index of the input that produced it.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub index: usize,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub timeout: Duration,
    pub dimensions: Option<u32>,
    pub input_type: Option<String>,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            dimensions: None,
            input_type: None,
        }
    }
}

/// The embedding capability all vendor adapters implement.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(
        &self,
        model: &str,
        inputs: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Embedding>, ProviderError>;
}

// ── Chat ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A tool the model may call, in provider-neutral form.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    /// The model decides whether to call a tool.
    Auto,
    /// The model must call some tool.
    Any,
    /// The model must call the named tool.
    Tool(String),
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub stop_reason: String,
    pub content: Vec<ContentBlock>,
}

/// The chat capability all vendor adapters implement.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError>;
}

// ── Dispatch ────────────────────────────────────────────────────────────

/// Chat vendors the text-to-SQL agent can be pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Cohere,
    Ollama,
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "cohere" => Ok(Self::Cohere),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow::anyhow!("unknown chat provider: {}", other)),
        }
    }
}

/// Build the embedding adapter for a vectorizer's embedding config.
/// `api_key` must already be resolved for vendors that need one.
pub fn embedding_provider(
    config: &EmbeddingConfig,
    api_key: Option<String>,
) -> anyhow::Result<Box<dyn EmbeddingProvider>> {
    match config {
        EmbeddingConfig::OpenAi { base_url, .. } => {
            let key = api_key.ok_or_else(|| anyhow::anyhow!("openai requires an api key"))?;
            Ok(Box::new(openai::OpenAiClient::new(key, base_url.clone())))
        }
        EmbeddingConfig::Ollama { base_url, keep_alive, .. } => Ok(Box::new(
            ollama::OllamaClient::new(base_url.clone(), keep_alive.clone()),
        )),
        EmbeddingConfig::VoyageAi { .. } => {
            let key = api_key.ok_or_else(|| anyhow::anyhow!("voyageai requires an api key"))?;
            Ok(Box::new(voyage::VoyageClient::new(key)))
        }
    }
}

/// Build the chat adapter for an agent config.
pub fn chat_provider(
    kind: ProviderKind,
    api_key: Option<String>,
) -> anyhow::Result<Box<dyn ChatProvider>> {
    match kind {
        ProviderKind::Anthropic => {
            let key = api_key.ok_or_else(|| anyhow::anyhow!("anthropic requires an api key"))?;
            Ok(Box::new(anthropic::AnthropicClient::new(key)))
        }
        ProviderKind::OpenAi => {
            let key = api_key.ok_or_else(|| anyhow::anyhow!("openai requires an api key"))?;
            Ok(Box::new(openai::OpenAiClient::new(key, None)))
        }
        ProviderKind::Cohere => {
            let key = api_key.ok_or_else(|| anyhow::anyhow!("cohere requires an api key"))?;
            Ok(Box::new(cohere::CohereClient::new(key)))
        }
        ProviderKind::Ollama => Ok(Box::new(ollama::OllamaClient::new(None, None))),
    }
}

/// The environment variable a vendor's key conventionally lives in.
pub fn default_key_name(config: &EmbeddingConfig) -> Option<&'static str> {
    match config {
        EmbeddingConfig::OpenAi { .. } => Some("OPENAI_API_KEY"),
        EmbeddingConfig::VoyageAi { .. } => Some("VOYAGE_API_KEY"),
        EmbeddingConfig::Ollama { .. } => None,
    }
}

/// The api_key_name override carried in the embedding config, if any.
pub fn api_key_name(config: &EmbeddingConfig) -> Option<&str> {
    match config {
        EmbeddingConfig::OpenAi { api_key_name, .. }
        | EmbeddingConfig::VoyageAi { api_key_name, .. } => api_key_name.as_deref(),
        EmbeddingConfig::Ollama { .. } => None,
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Transport(e.to_string()))
}
