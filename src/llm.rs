use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub tools: Vec<ToolSchema>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl ChatResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// User-supplied model callback. The runtime only ever talks to this trait;
/// the wire protocol behind it is the implementation's business.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_owned(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

pub struct AnthropicModel {
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicModel {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed building llm http client")?;
        Ok(Self { config, client })
    }

    async fn try_request(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if self.config.api_key.is_empty() {
            return Err(anyhow!("no llm api key configured"));
        }
        let body = WireRequest {
            model: &self.config.model,
            max_tokens: if request.max_tokens == 0 {
                DEFAULT_MAX_TOKENS
            } else {
                request.max_tokens
            },
            system: &request.system,
            tools: &request.tools,
            messages: &request.messages,
        };
        let response = self
            .client
            .post(format!("{ANTHROPIC_API_BASE}/messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("llm request failed to send")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("llm api error ({status}): {text}"));
        }
        let wire = response
            .json::<WireResponse>()
            .await
            .context("llm response did not parse")?;
        Ok(ChatResponse {
            content: wire.content,
            stop_reason: wire.stop_reason,
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                warn!(attempt, "retrying llm request");
            }
            match self.try_request(request).await {
                Ok(response) => return Ok(response),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("llm request failed")))
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [ToolSchema],
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChatResponse, ContentBlock};

    #[test]
    fn response_splits_text_and_tool_uses() {
        let response = ChatResponse {
            content: vec![
                ContentBlock::Text {
                    text: "thinking".to_owned(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".to_owned(),
                    name: "macro_call".to_owned(),
                    input: json!({"message": "group mid"}),
                },
            ],
            stop_reason: Some("tool_use".to_owned()),
        };
        assert_eq!(response.text(), "thinking");
        let uses = response.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "macro_call");
    }

    #[test]
    fn content_blocks_use_wire_tags() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "toolu_1".to_owned(),
            content: "{\"ok\":true}".to_owned(),
            is_error: false,
        };
        let json = serde_json::to_value(&block).expect("block should serialize");
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "toolu_1");

        let parsed: ContentBlock = serde_json::from_value(json!({
            "type": "tool_use",
            "id": "toolu_2",
            "name": "recommend",
            "input": {"champion": "Ahri"}
        }))
        .expect("tool_use should parse");
        assert!(matches!(parsed, ContentBlock::ToolUse { .. }));
    }
}
