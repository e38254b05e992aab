use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    http_client, ChatProvider, ChatRequest, ChatResponse, ContentBlock, ProviderError, ToolChoice,
};

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    stop_reason: Option<String>,
    content: Vec<ApiContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

pub struct AnthropicClient {
    api_key: String,
    base_url: String,
}

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let tool_choice = match &request.tool_choice {
            ToolChoice::Auto => serde_json::json!({"type": "auto"}),
            ToolChoice::Any => serde_json::json!({"type": "any"}),
            ToolChoice::Tool(name) => serde_json::json!({"type": "tool", "name": name}),
        };

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
            "tools": tools,
            "tool_choice": tool_choice,
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(user_id) = &request.user_id {
            body["metadata"] = serde_json::json!({"user_id": user_id});
        }

        let client = http_client(timeout)?;
        let resp = client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Response(e.to_string()))?;

        let content = parsed
            .content
            .into_iter()
            .map(|block| match block {
                ApiContentBlock::Text { text } => ContentBlock::Text { text },
                ApiContentBlock::ToolUse { id, name, input } => {
                    ContentBlock::ToolUse { id, name, input }
                }
            })
            .collect();

        Ok(ChatResponse {
            stop_reason: parsed.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_decoding() {
        let parsed: MessagesResponse = serde_json::from_value(serde_json::json!({
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "Looking this up."},
                {"type": "tool_use", "id": "toolu_1", "name": "lookup",
                 "input": {"question": "which tables?"}}
            ]
        }))
        .unwrap();
        assert_eq!(parsed.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(parsed.content.len(), 2);
        match &parsed.content[1] {
            ApiContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "lookup");
                assert_eq!(input["question"], "which tables?");
            }
            other => panic!("expected tool_use, got {:?}", other),
        }
    }
}
