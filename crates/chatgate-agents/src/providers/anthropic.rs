use async_trait::async_trait;
use chatgate_common::{Error, ProviderFamily, Result, TokenUsage, ToolCallRequest};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};

use super::lines::sse_data;
use super::tool_calls::PartialToolCalls;
use super::{
    ChatMessage, ChatRole, ContentBlock, EventStream, ImageSource, LlmRequest, ProviderAdapter,
    ProviderEvent, StreamDecoder, decode_stream, request_error, single_shot, status_error,
};

const PROVIDER: &str = "anthropic";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const HEALTH_CHECK_MODEL: &str = "claude-3-5-haiku-latest";

/// Anthropic Messages API.
pub struct AnthropicAdapter {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: Client::new(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }

    fn create_request_body(&self, request: &LlmRequest) -> Result<Value> {
        let (messages, extra_system) = process_messages(&request.messages)?;

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(1024),
            "stream": request.stream,
        });

        let system = match (&request.system, extra_system) {
            (Some(system), Some(extra)) => Some(format!("{system}\n\n{extra}")),
            (Some(system), None) => Some(system.clone()),
            (None, extra) => extra,
        };
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(user) = &request.user {
            body["metadata"] = json!({"user_id": user});
        }

        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema
                })
            })
            .collect();
        if let Some(search) = &request.search {
            tools.push(json!({"type": search, "name": "web_search"}));
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        Ok(body)
    }
}

/// Convert to Anthropic messages. Consecutive tool results are grouped into one user
/// turn and system messages are lifted out, returned as extra system text.
fn process_messages(messages: &[ChatMessage]) -> Result<(Vec<Value>, Option<String>)> {
    let mut processed: Vec<Value> = Vec::new();
    let mut system_parts = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    for msg in messages {
        if msg.role != ChatRole::Tool && !pending_results.is_empty() {
            processed.push(json!({"role": "user", "content": std::mem::take(&mut pending_results)}));
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
                        pending_results.push(json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": content
                        }));
                    }
                }
            }
            ChatRole::User | ChatRole::Assistant => {
                let mut parts = Vec::new();
                for block in msg.blocks() {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                parts.push(json!({"type": "text", "text": text}));
                            }
                        }
                        ContentBlock::Image { url } => {
                            let source = match ImageSource::resolve(&url)? {
                                ImageSource::Url(url) => json!({"type": "url", "url": url}),
                                ImageSource::Base64 { media_type, data } => json!({
                                    "type": "base64",
                                    "media_type": media_type,
                                    "data": data
                                }),
                            };
                            parts.push(json!({"type": "image", "source": source}));
                        }
                        ContentBlock::ToolUse {
                            id,
                            name,
                            arguments,
                        } => {
                            // The API requires an object; unparsable arguments were already
                            // answered with an error tool result.
                            let input: Value = serde_json::from_str(&arguments)
                                .ok()
                                .filter(Value::is_object)
                                .unwrap_or_else(|| json!({}));
                            parts.push(json!({
                                "type": "tool_use",
                                "id": id,
                                "name": name,
                                "input": input
                            }));
                        }
                        ContentBlock::ToolResult { .. } => {}
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
                processed.push(json!({"role": role, "content": parts}));
            }
        }
    }
    if !pending_results.is_empty() {
        processed.push(json!({"role": "user", "content": pending_results}));
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    Ok((processed, system))
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    async fn send(&self, request: &LlmRequest) -> Result<EventStream> {
        let body = self.create_request_body(request)?;

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }

        if !request.stream {
            let raw: Value = response.json().await.map_err(|e| {
                Error::ProviderUnavailable(format!("failed to parse Anthropic response: {e}"))
            })?;
            return convert_response(&raw).map(single_shot);
        }

        let payloads = sse_data(PROVIDER, response.bytes_stream().boxed());
        Ok(decode_stream(payloads, MessagesDecoder::default()))
    }

    async fn health_check(&self) -> Result<bool> {
        let body = json!({
            "model": HEALTH_CHECK_MODEL,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}]
        });

        match self.post(&body).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn convert_response(raw: &Value) -> Result<Vec<ProviderEvent>> {
    let blocks = raw["content"]
        .as_array()
        .ok_or_else(|| Error::ProviderUnavailable("Anthropic response missing content".to_string()))?;

    let mut events = Vec::new();
    for block in blocks {
        match block["type"].as_str().unwrap_or_default() {
            "text" => {
                let text = block["text"].as_str().unwrap_or_default();
                if !text.is_empty() {
                    events.push(ProviderEvent::TextDelta(text.to_string()));
                }
            }
            "tool_use" => events.push(ProviderEvent::ToolCallRequested(ToolCallRequest {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].to_string(),
            })),
            _ => {}
        }
    }

    if let Some(u) = raw["usage"].as_object() {
        events.push(ProviderEvent::Usage(TokenUsage {
            input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        }));
    }
    Ok(events)
}

#[derive(Default)]
struct MessagesDecoder {
    tool_calls: PartialToolCalls,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl StreamDecoder for MessagesDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<ProviderEvent>> {
        let json: Value = serde_json::from_str(payload).map_err(|e| {
            Error::ProviderUnavailable(format!("invalid Anthropic stream event: {e}"))
        })?;
        let index = json["index"].as_u64().unwrap_or(0);

        let mut events = Vec::new();
        match json["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let input = json["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
                self.usage.get_or_insert_with(TokenUsage::default).input_tokens = input;
            }
            "content_block_start" => {
                let block = &json["content_block"];
                match block["type"].as_str().unwrap_or_default() {
                    "text" => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    "tool_use" => self.tool_calls.start(
                        index,
                        block["id"].as_str().unwrap_or_default(),
                        block["name"].as_str().unwrap_or_default(),
                    ),
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &json["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    "input_json_delta" => self
                        .tool_calls
                        .push_arguments(index, delta["partial_json"].as_str().unwrap_or_default()),
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(call) = self.tool_calls.finish_one(index) {
                    events.push(ProviderEvent::ToolCallRequested(call?));
                }
            }
            "message_delta" => {
                if let Some(output) = json["usage"]["output_tokens"].as_u64() {
                    self.usage.get_or_insert_with(TokenUsage::default).output_tokens = output;
                }
            }
            "message_stop" => self.finished = true,
            "error" => {
                let message = json["error"]["message"].as_str().unwrap_or("unknown error");
                return Err(Error::ProviderUnavailable(format!(
                    "Anthropic stream error: {message}"
                )));
            }
            _ => {}
        }
        Ok(events)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) -> Result<Vec<ProviderEvent>> {
        let mut events: Vec<ProviderEvent> = self
            .tool_calls
            .finish()?
            .into_iter()
            .map(ProviderEvent::ToolCallRequested)
            .collect();
        if let Some(usage) = self.usage.take() {
            events.push(ProviderEvent::Usage(usage));
        }
        Ok(events)
    }
}
