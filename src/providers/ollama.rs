use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    http_client, ChatProvider, ChatRequest, ChatResponse, ContentBlock, EmbedOptions, Embedding,
    EmbeddingProvider, ProviderError, ToolChoice,
};

// ── Ollama API types ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct ApiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    message: ApiResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    function: ApiToolFunction,
}

#[derive(Debug, Deserialize)]
struct ApiToolFunction {
    name: String,
    arguments: serde_json::Value,
}

// ── Client ───────────────────────────────────────────────────────────

/// Local Ollama daemon. No API key; the daemon ignores forced tool choice,
/// so the request's choice only shapes the tool list we send.
pub struct OllamaClient {
    base_url: String,
    keep_alive: Option<String>,
}

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

impl OllamaClient {
    pub fn new(base_url: Option<String>, keep_alive: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            keep_alive,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaClient {
    async fn embed(
        &self,
        model: &str,
        inputs: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Embedding>, ProviderError> {
        let body = EmbedRequest {
            model,
            input: inputs,
            keep_alive: self.keep_alive.as_deref(),
        };

        let client = http_client(options.timeout)?;
        let resp = client
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Response(e.to_string()))?;

        if parsed.embeddings.len() != inputs.len() {
            return Err(ProviderError::Response(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                parsed.embeddings.len()
            )));
        }

        Ok(parsed
            .embeddings
            .into_iter()
            .enumerate()
            .map(|(index, vector)| Embedding { index, vector })
            .collect())
    }
}

#[async_trait]
impl ChatProvider for OllamaClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| ApiMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        }));

        let tools = match &request.tool_choice {
            ToolChoice::Tool(name) => request
                .tools
                .iter()
                .filter(|t| t.name == *name)
                .map(tool_json)
                .collect(),
            _ => request.tools.iter().map(tool_json).collect(),
        };

        let body = ApiChatRequest {
            model: &request.model,
            messages,
            stream: false,
            tools,
        };

        let client = http_client(timeout)?;
        let resp = client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: ApiChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Response(e.to_string()))?;

        let mut content = Vec::new();
        if !parsed.message.content.is_empty() {
            content.push(ContentBlock::Text {
                text: parsed.message.content,
            });
        }
        for (i, call) in parsed.message.tool_calls.into_iter().enumerate() {
            content.push(ContentBlock::ToolUse {
                id: format!("call_{}", i),
                name: call.function.name,
                input: call.function.arguments,
            });
        }

        let stop_reason = if content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
        {
            "tool_use".to_string()
        } else {
            parsed.done_reason.unwrap_or_else(|| "stop".to_string())
        };

        Ok(ChatResponse {
            stop_reason,
            content,
        })
    }
}

fn tool_json(tool: &super::ToolSpec) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_url() {
        let client = OllamaClient::new(None, None);
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_custom_base_url() {
        let client = OllamaClient::new(Some("http://10.0.0.2:11434".to_string()), None);
        assert_eq!(client.base_url, "http://10.0.0.2:11434");
    }

    #[test]
    fn test_tool_json_shape() {
        let tool = super::super::ToolSpec {
            name: "lookup".to_string(),
            description: "Look something up".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let value = tool_json(&tool);
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "lookup");
        assert_eq!(value["function"]["parameters"]["type"], "object");
    }
}
