use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    http_client, ChatProvider, ChatRequest, ChatResponse, ContentBlock, ProviderError, ToolChoice,
};

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    #[serde(default)]
    finish_reason: Option<String>,
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Vec<ApiContent>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiToolFunction,
}

#[derive(Debug, Deserialize)]
struct ApiToolFunction {
    name: String,
    arguments: String,
}

pub struct CohereClient {
    api_key: String,
    base_url: String,
}

const DEFAULT_BASE_URL: &str = "https://api.cohere.com/v2";

impl CohereClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl ChatProvider for CohereClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for m in &request.messages {
            messages.push(serde_json::json!({"role": m.role, "content": m.content}));
        }

        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();

        // Forced tool choice narrows the tool list; the API itself only
        // distinguishes optional from required.
        let (tools, tool_choice) = match &request.tool_choice {
            ToolChoice::Auto => (tools, serde_json::Value::Null),
            ToolChoice::Any => (tools, serde_json::json!("REQUIRED")),
            ToolChoice::Tool(name) => (
                tools
                    .into_iter()
                    .filter(|t| t["function"]["name"] == name.as_str())
                    .collect(),
                serde_json::json!("REQUIRED"),
            ),
        };

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "tools": tools,
            "max_tokens": request.max_tokens,
        });
        if !tool_choice.is_null() {
            body["tool_choice"] = tool_choice;
        }

        let client = http_client(timeout)?;
        let resp = client
            .post(format!("{}/chat", self.base_url))
            .bearer_auth(&self.api_key)
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
        for block in parsed.message.content {
            if let Some(text) = block.text {
                if !text.is_empty() {
                    content.push(ContentBlock::Text { text });
                }
            }
        }
        for call in parsed.message.tool_calls {
            let input = serde_json::from_str(&call.function.arguments)
                .map_err(|e| ProviderError::Response(format!("bad tool arguments: {}", e)))?;
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        let stop_reason = match parsed.finish_reason.as_deref() {
            Some("TOOL_CALL") => "tool_use".to_string(),
            Some(other) => other.to_lowercase(),
            None => "stop".to_string(),
        };

        Ok(ChatResponse {
            stop_reason,
            content,
        })
    }
}
