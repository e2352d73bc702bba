use async_trait::async_trait;
use chatgate_common::{Error, ProviderFamily, Result, TokenUsage, ToolCallRequest};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use super::lines::ndjson_lines;
use super::tool_calls::generated_call_id;
use super::{
    ChatRole, ContentBlock, EventStream, ImageSource, LlmRequest, ProviderAdapter, ProviderEvent,
    StreamDecoder, decode_stream, request_error, single_shot, status_error,
};

const PROVIDER: &str = "local";

/// Local Ollama server (`/api/chat`), streamed as newline-delimited JSON.
#[derive(Clone)]
pub struct OllamaAdapter {
    base_url: String,
    client: Client,
}

impl OllamaAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".to_string()),
            client: Client::new(),
        }
    }

    fn build_request_body(&self, request: &LlmRequest) -> Result<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }

        for msg in &request.messages {
            let mut text_parts = Vec::new();
            let mut images = Vec::new();
            let mut tool_calls = Vec::new();

            for block in msg.blocks() {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text),
                    ContentBlock::Image { url } => match ImageSource::resolve(&url)? {
                        ImageSource::Base64 { data, .. } => images.push(data),
                        ImageSource::Url(url) => {
                            return Err(Error::Agent(format!(
                                "local models need inline images, got remote URL {url}"
                            )));
                        }
                    },
                    ContentBlock::ToolUse {
                        name, arguments, ..
                    } => {
                        let arguments: Value =
                            serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}));
                        tool_calls.push(json!({"function": {"name": name, "arguments": arguments}}));
                    }
                    ContentBlock::ToolResult { content, .. } => text_parts.push(content),
                }
            }

            let mut msg_obj = json!({
                "role": match msg.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                },
                "content": text_parts.join("\n"),
            });
            if !images.is_empty() {
                msg_obj["images"] = json!(images);
            }
            if !tool_calls.is_empty() {
                msg_obj["tool_calls"] = json!(tool_calls);
            }
            messages.push(msg_obj);
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });

        let mut options = serde_json::Map::new();
        if let Some(temp) = request.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema
                        }
                    }))
                    .collect::<Vec<_>>()
            );
        }

        Ok(body)
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;

        if !res.status().is_success() {
            return Err(status_error(PROVIDER, res).await);
        }

        let models_res: OllamaModelsResponse = res
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse models response: {e}")))?;

        Ok(models_res.models.into_iter().map(|m| m.name).collect())
    }
}

#[derive(Deserialize)]
struct OllamaChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: u64,
    #[serde(default)]
    prompt_eval_count: u64,
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct OllamaModelsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

/// Ollama sends whole tool calls without identifiers; one is generated per call.
fn chunk_events(chunk: OllamaChunk) -> Result<Vec<ProviderEvent>> {
    if let Some(error) = chunk.error {
        return Err(Error::ProviderUnavailable(format!("Ollama error: {error}")));
    }

    let mut events = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            events.push(ProviderEvent::TextDelta(message.content));
        }
        for call in message.tool_calls {
            let arguments = if call.function.arguments.is_null() {
                "{}".to_string()
            } else {
                call.function.arguments.to_string()
            };
            events.push(ProviderEvent::ToolCallRequested(ToolCallRequest {
                id: generated_call_id(),
                name: call.function.name,
                arguments,
            }));
        }
    }
    if chunk.done {
        events.push(ProviderEvent::Usage(TokenUsage {
            input_tokens: chunk.prompt_eval_count,
            output_tokens: chunk.eval_count,
        }));
    }
    Ok(events)
}

#[derive(Default)]
struct ChatDecoder {
    finished: bool,
}

impl StreamDecoder for ChatDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<ProviderEvent>> {
        let chunk: OllamaChunk = serde_json::from_str(payload).map_err(|e| {
            Error::ProviderUnavailable(format!("failed to parse Ollama stream chunk: {e}"))
        })?;
        self.finished = chunk.done;
        chunk_events(chunk)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) -> Result<Vec<ProviderEvent>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Local
    }

    async fn send(&self, request: &LlmRequest) -> Result<EventStream> {
        let body = self.build_request_body(request)?;
        let url = format!("{}/api/chat", self.base_url);

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;

        if !res.status().is_success() {
            return Err(status_error(PROVIDER, res).await);
        }

        if !request.stream {
            let chunk: OllamaChunk = res.json().await.map_err(|e| {
                Error::ProviderUnavailable(format!("failed to parse Ollama response: {e}"))
            })?;
            return chunk_events(chunk).map(single_shot);
        }

        let lines = ndjson_lines(PROVIDER, res.bytes_stream().boxed());
        Ok(decode_stream(lines, ChatDecoder::default()))
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatMessage, MessagePart};

    #[test]
    fn tool_calls_get_generated_ids() {
        let chunk: OllamaChunk = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"lookup","arguments":{"q":"x"}}}]},"done":false}"#,
        )
        .unwrap();
        let events = chunk_events(chunk).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::ToolCallRequested(call) => {
                assert!(call.id.starts_with("call_"));
                assert_eq!(call.arguments, "{\"q\":\"x\"}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn done_chunk_reports_usage_and_finishes() {
        let mut decoder = ChatDecoder::default();
        let events = decoder
            .decode(r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":4,"eval_count":9}"#)
            .unwrap();
        assert!(decoder.is_finished());
        assert!(matches!(
            events[0],
            ProviderEvent::Usage(TokenUsage { input_tokens: 4, output_tokens: 9 })
        ));
    }

    #[test]
    fn body_carries_system_options_and_tool_messages() {
        let adapter = OllamaAdapter::new(None);
        let mut request = LlmRequest::new(
            "llama3.1",
            vec![
                ChatMessage::user("hi"),
                ChatMessage {
                    role: ChatRole::Tool,
                    content: MessagePart::Parts(vec![ContentBlock::ToolResult {
                        tool_use_id: "call_1".to_string(),
                        content: "42".to_string(),
                    }]),
                },
            ],
        );
        request.system = Some("sys".to_string());
        request.temperature = Some(0.2);

        let body = adapter.build_request_body(&request).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["content"], "42");
        assert_eq!(body["options"]["temperature"], 0.2);
    }
}
