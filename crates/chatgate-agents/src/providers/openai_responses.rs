use async_trait::async_trait;
use chatgate_common::{Error, ProviderFamily, Result, TokenUsage, ToolCallRequest};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::warn;

use super::lines::sse_data;
use super::tool_calls::PartialToolCalls;
use super::{
    ChatRole, ContentBlock, EventStream, ImageSource, LlmRequest, ProviderAdapter, ProviderEvent,
    StreamDecoder, decode_stream, request_error, single_shot, status_error,
};

const PROVIDER: &str = "openai-responses";

/// OpenAI Responses API (`/v1/responses`), streamed as server-sent events.
#[derive(Clone)]
pub struct OpenAiResponsesAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiResponsesAdapter {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
    }

    fn build_body(&self, request: &LlmRequest) -> Result<Value> {
        let mut input = Vec::new();
        for msg in &request.messages {
            match msg.role {
                ChatRole::System => input.push(json!({"role": "system", "content": msg.text()})),
                ChatRole::User => {
                    let mut parts = Vec::new();
                    for block in msg.blocks() {
                        match block {
                            ContentBlock::Text { text } => {
                                parts.push(json!({"type": "input_text", "text": text}));
                            }
                            ContentBlock::Image { url } => {
                                parts.push(json!({
                                    "type": "input_image",
                                    "image_url": ImageSource::resolve(&url)?.data_url(),
                                }));
                            }
                            _ => {}
                        }
                    }
                    input.push(json!({"role": "user", "content": parts}));
                }
                ChatRole::Assistant => {
                    for block in msg.blocks() {
                        match block {
                            ContentBlock::Text { text } if !text.is_empty() => {
                                input.push(json!({"role": "assistant", "content": text}));
                            }
                            ContentBlock::ToolUse {
                                id,
                                name,
                                arguments,
                            } => input.push(json!({
                                "type": "function_call",
                                "call_id": id,
                                "name": name,
                                "arguments": arguments,
                            })),
                            _ => {}
                        }
                    }
                }
                ChatRole::Tool => {
                    for block in msg.blocks() {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } = block
                        {
                            input.push(json!({
                                "type": "function_call_output",
                                "call_id": tool_use_id,
                                "output": content,
                            }));
                        }
                    }
                }
            }
        }

        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        if let Some(search) = &request.search {
            tools.push(json!({"type": search}));
        }

        let mut body = json!({
            "model": request.model,
            "input": input,
            "stream": request.stream,
            "store": false,
        });
        if let Some(system) = &request.system {
            body["instructions"] = json!(system);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_output_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(user) = &request.user {
            body["user"] = json!(user);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        Ok(body)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiResponsesAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAiResponses
    }

    async fn send(&self, request: &LlmRequest) -> Result<EventStream> {
        let url = format!("{}/responses", self.base_url);
        let body = self.build_body(request)?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }

        if !request.stream {
            let raw: Value = response.json().await.map_err(|e| {
                Error::ProviderUnavailable(format!("failed to parse Responses API body: {e}"))
            })?;
            return Ok(single_shot(convert_response(&raw)));
        }

        let payloads = sse_data(PROVIDER, response.bytes_stream().boxed());
        Ok(decode_stream(payloads, ResponsesDecoder::default()))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).bearer_auth(&self.api_key).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn convert_response(raw: &Value) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    for item in raw["output"].as_array().into_iter().flatten() {
        match item["type"].as_str().unwrap_or_default() {
            "message" => {
                let text: String = item["content"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter(|part| part["type"] == "output_text")
                    .filter_map(|part| part["text"].as_str())
                    .collect();
                if !text.is_empty() {
                    events.push(ProviderEvent::TextDelta(text));
                }
            }
            "function_call" => events.push(ProviderEvent::ToolCallRequested(ToolCallRequest {
                id: item["call_id"].as_str().unwrap_or_default().to_string(),
                name: item["name"].as_str().unwrap_or_default().to_string(),
                arguments: item["arguments"].as_str().unwrap_or("{}").to_string(),
            })),
            _ => {}
        }
    }
    if let Some(usage) = parse_usage(&raw["usage"]) {
        events.push(ProviderEvent::Usage(usage));
    }
    events
}

fn parse_usage(usage: &Value) -> Option<TokenUsage> {
    usage.as_object().map(|u| TokenUsage {
        input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
    })
}

#[derive(Default)]
struct ResponsesDecoder {
    tool_calls: PartialToolCalls,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl StreamDecoder for ResponsesDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<ProviderEvent>> {
        let event: Value = serde_json::from_str(payload).map_err(|e| {
            Error::ProviderUnavailable(format!("invalid Responses API event: {e}"))
        })?;
        let index = event["output_index"].as_u64().unwrap_or(0);

        let mut events = Vec::new();
        match event["type"].as_str().unwrap_or_default() {
            "response.output_text.delta" => {
                if let Some(delta) = event["delta"].as_str().filter(|d| !d.is_empty()) {
                    events.push(ProviderEvent::TextDelta(delta.to_string()));
                }
            }
            "response.output_item.added" => {
                let item = &event["item"];
                if item["type"] == "function_call" {
                    self.tool_calls.start(
                        index,
                        item["call_id"].as_str().unwrap_or_default(),
                        item["name"].as_str().unwrap_or_default(),
                    );
                }
            }
            "response.function_call_arguments.delta" => {
                self.tool_calls
                    .push_arguments(index, event["delta"].as_str().unwrap_or_default());
            }
            "response.output_item.done" => {
                let item = &event["item"];
                if item["type"] == "function_call" {
                    if let Some(arguments) = item["arguments"].as_str() {
                        self.tool_calls.set_arguments(index, arguments);
                    }
                    if let Some(call) = self.tool_calls.finish_one(index) {
                        events.push(ProviderEvent::ToolCallRequested(call?));
                    }
                }
            }
            "response.completed" => {
                self.usage = parse_usage(&event["response"]["usage"]);
                self.finished = true;
            }
            "response.incomplete" => {
                warn!(
                    reason = event["response"]["incomplete_details"]["reason"]
                        .as_str()
                        .unwrap_or("unknown"),
                    "response ended incomplete"
                );
                self.usage = parse_usage(&event["response"]["usage"]);
                self.finished = true;
            }
            "response.failed" => {
                let message = event["response"]["error"]["message"]
                    .as_str()
                    .unwrap_or("response failed");
                return Err(Error::ProviderUnavailable(format!(
                    "Responses API failure: {message}"
                )));
            }
            "error" => {
                let message = event["message"].as_str().unwrap_or("unknown error");
                return Err(Error::ProviderUnavailable(format!(
                    "Responses API error: {message}"
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
