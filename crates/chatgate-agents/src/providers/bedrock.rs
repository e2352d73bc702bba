use async_trait::async_trait;
use chatgate_common::{Error, ProviderFamily, Result, TokenUsage, ToolCallRequest};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    ChatMessage, ChatRole, ContentBlock, EventStream, ImageSource, LlmRequest, ProviderAdapter,
    ProviderEvent, request_error, single_shot, status_error,
};

const PROVIDER: &str = "aws";
const DEFAULT_REGION: &str = "us-east-1";

/// AWS Bedrock Converse API, authenticated with a Bedrock API key (bearer token).
///
/// Always single-shot: the whole answer arrives in one response and is replayed as events.
pub struct BedrockAdapter {
    client: Client,
    token: String,
    base_url: String,
}

impl BedrockAdapter {
    pub fn new(token: String, region: Option<String>, base_url: Option<String>) -> Self {
        let region = region.unwrap_or_else(|| DEFAULT_REGION.to_string());
        Self {
            client: Client::new(),
            token,
            base_url: base_url
                .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com")),
        }
    }

    /// The model id is one path segment; ARNs and profile ids carry `:` and `/`.
    fn converse_url(&self, model_id: &str) -> String {
        format!(
            "{}/model/{}/converse",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(model_id)
        )
    }

    fn build_body(&self, request: &LlmRequest) -> Result<Value> {
        let (messages, extra_system) = convert_messages(&request.messages)?;

        let mut system = Vec::new();
        if let Some(text) = &request.system {
            system.push(json!({"text": text}));
        }
        if let Some(text) = extra_system {
            system.push(json!({"text": text}));
        }

        let mut inference = serde_json::Map::new();
        if let Some(max_tokens) = request.max_tokens {
            inference.insert("maxTokens".to_string(), json!(max_tokens));
        }
        if let Some(temp) = request.temperature {
            inference.insert("temperature".to_string(), json!(temp));
        }

        let mut body = json!({"messages": messages});
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !inference.is_empty() {
            body["inferenceConfig"] = Value::Object(inference);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({"toolSpec": {
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": {"json": t.input_schema}
                    }})
                })
                .collect();
            body["toolConfig"] = json!({"tools": tools});
        }
        Ok(body)
    }
}

fn convert_messages(messages: &[ChatMessage]) -> Result<(Vec<Value>, Option<String>)> {
    let mut converted: Vec<Value> = Vec::new();
    let mut system_parts = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    for msg in messages {
        if msg.role != ChatRole::Tool && !pending_results.is_empty() {
            converted.push(json!({"role": "user", "content": std::mem::take(&mut pending_results)}));
        }
        match msg.role {
            ChatRole::System => system_parts.push(msg.text()),
            ChatRole::Tool => {
                for block in msg.blocks() {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } = block
                    {
                        pending_results.push(json!({"toolResult": {
                            "toolUseId": tool_use_id,
                            "content": [{"text": content}]
                        }}));
                    }
                }
            }
            ChatRole::User | ChatRole::Assistant => {
                let mut parts = Vec::new();
                for block in msg.blocks() {
                    match block {
                        ContentBlock::Text { text } if !text.is_empty() => {
                            parts.push(json!({"text": text}));
                        }
                        ContentBlock::Image { url } => match ImageSource::resolve(&url)? {
                            ImageSource::Base64 { media_type, data } => {
                                let format = media_type.trim_start_matches("image/").to_string();
                                parts.push(json!({"image": {
                                    "format": format,
                                    "source": {"bytes": data}
                                }}));
                            }
                            ImageSource::Url(url) => {
                                debug!(%url, "remote image URLs are not supported by Converse, sending as text");
                                parts.push(json!({"text": url}));
                            }
                        },
                        ContentBlock::ToolUse {
                            id,
                            name,
                            arguments,
                        } => {
                            let input: Value = serde_json::from_str(&arguments)
                                .ok()
                                .filter(Value::is_object)
                                .unwrap_or_else(|| json!({}));
                            parts.push(json!({"toolUse": {
                                "toolUseId": id,
                                "name": name,
                                "input": input
                            }}));
                        }
                        _ => {}
                    }
                }
                if parts.is_empty() {
                    continue;
                }
                let role = if msg.role == ChatRole::User {
                    "user"
                } else {
                    "assistant"
                };
                converted.push(json!({"role": role, "content": parts}));
            }
        }
    }
    if !pending_results.is_empty() {
        converted.push(json!({"role": "user", "content": pending_results}));
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    Ok((converted, system))
}

fn convert_response(raw: &Value) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    let mut text = String::new();
    let mut calls = Vec::new();

    for block in raw["output"]["message"]["content"]
        .as_array()
        .into_iter()
        .flatten()
    {
        if let Some(t) = block["text"].as_str() {
            text.push_str(t);
        } else if let Some(tool_use) = block.get("toolUse") {
            calls.push(ToolCallRequest {
                id: tool_use["toolUseId"].as_str().unwrap_or_default().to_string(),
                name: tool_use["name"].as_str().unwrap_or_default().to_string(),
                arguments: tool_use["input"].to_string(),
            });
        }
    }

    if !text.is_empty() {
        events.push(ProviderEvent::TextDelta(text));
    }
    events.extend(calls.into_iter().map(ProviderEvent::ToolCallRequested));
    if let Some(u) = raw["usage"].as_object() {
        events.push(ProviderEvent::Usage(TokenUsage {
            input_tokens: u.get("inputTokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: u.get("outputTokens").and_then(Value::as_u64).unwrap_or(0),
        }));
    }
    events
}

#[async_trait]
impl ProviderAdapter for BedrockAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Aws
    }

    async fn send(&self, request: &LlmRequest) -> Result<EventStream> {
        let body = self.build_body(request)?;

        let response = self
            .client
            .post(self.converse_url(&request.model))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }

        let raw: Value = response.json().await.map_err(|e| {
            Error::ProviderUnavailable(format!("failed to parse Converse response: {e}"))
        })?;
        Ok(single_shot(convert_response(&raw)))
    }

    async fn health_check(&self) -> Result<bool> {
        // The runtime endpoint has no cheap status call; reachable and not rejecting the token is enough.
        match self
            .client
            .get(&self.base_url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(resp) => Ok(!matches!(resp.status().as_u16(), 401 | 403)),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MessagePart, ToolDefinition};

    #[test]
    fn default_endpoint_uses_region_and_encodes_model_id() {
        let adapter = BedrockAdapter::new("t".to_string(), Some("eu-west-1".to_string()), None);
        assert_eq!(
            adapter.converse_url("amazon.nova-pro-v1:0"),
            "https://bedrock-runtime.eu-west-1.amazonaws.com/model/amazon.nova-pro-v1%3A0/converse"
        );
    }

    #[test]
    fn reserved_characters_in_model_id_stay_inside_one_segment() {
        let adapter = BedrockAdapter::new(
            "t".to_string(),
            None,
            Some("http://localhost:9000/".to_string()),
        );
        assert_eq!(
            adapter.converse_url(
                "arn:aws:bedrock:us-east-1:123456789012:inference-profile/us.anthropic.claude-v2"
            ),
            "http://localhost:9000/model/arn%3Aaws%3Abedrock%3Aus-east-1%3A123456789012%3A\
             inference-profile%2Fus.anthropic.claude-v2/converse"
        );
        assert_eq!(
            adapter.converse_url("odd?id#frag"),
            "http://localhost:9000/model/odd%3Fid%23frag/converse"
        );
    }

    #[test]
    fn body_maps_tools_and_tool_results() {
        let adapter = BedrockAdapter::new("t".to_string(), None, None);
        let mut request = LlmRequest::new(
            "amazon.nova-pro-v1:0",
            vec![
                ChatMessage::user("time?"),
                ChatMessage {
                    role: ChatRole::Assistant,
                    content: MessagePart::Parts(vec![ContentBlock::ToolUse {
                        id: "tu-1".to_string(),
                        name: "current_time".to_string(),
                        arguments: "{}".to_string(),
                    }]),
                },
                ChatMessage {
                    role: ChatRole::Tool,
                    content: MessagePart::Parts(vec![ContentBlock::ToolResult {
                        tool_use_id: "tu-1".to_string(),
                        content: "noon".to_string(),
                    }]),
                },
            ],
        );
        request.system = Some("sys".to_string());
        request.max_tokens = Some(100);
        request.tools = vec![ToolDefinition {
            name: "current_time".to_string(),
            description: "now".to_string(),
            input_schema: json!({"type": "object"}),
        }];

        let body = adapter.build_body(&request).unwrap();
        assert_eq!(body["system"][0]["text"], "sys");
        assert_eq!(body["inferenceConfig"]["maxTokens"], 100);
        assert_eq!(body["messages"][1]["content"][0]["toolUse"]["toolUseId"], "tu-1");
        assert_eq!(body["messages"][2]["content"][0]["toolResult"]["toolUseId"], "tu-1");
        assert_eq!(
            body["toolConfig"]["tools"][0]["toolSpec"]["name"],
            "current_time"
        );
    }

    #[test]
    fn converse_output_becomes_events() {
        let raw = json!({
            "output": {"message": {"role": "assistant", "content": [
                {"text": "Let me check."},
                {"toolUse": {"toolUseId": "tu-9", "name": "lookup", "input": {"q": "x"}}}
            ]}},
            "stopReason": "tool_use",
            "usage": {"inputTokens": 12, "outputTokens": 7, "totalTokens": 19}
        });

        let events = convert_response(&raw);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], ProviderEvent::ToolCallRequested(c) if c.arguments == "{\"q\":\"x\"}"));
        assert!(matches!(
            events[2],
            ProviderEvent::Usage(TokenUsage { input_tokens: 12, output_tokens: 7 })
        ));
    }
}
