use async_trait::async_trait;
use chatgate_common::{Error, ProviderFamily, Result, TokenUsage, ToolCallRequest};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::lines::sse_data;
use super::tool_calls::PartialToolCalls;
use super::{
    ChatMessage, ChatRole, ContentBlock, EventStream, ImageSource, LlmRequest, MessagePart,
    ProviderAdapter, ProviderEvent, StreamDecoder, decode_stream, request_error, single_shot,
    status_error,
};

const PROVIDER: &str = "openai";

/// OpenAI-compatible Chat Completions API.
#[derive(Clone)]
pub struct OpenAiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
    }

    fn convert_request(&self, request: &LlmRequest) -> Result<OpenAiRequest> {
        let mut messages = Vec::new();

        if let Some(system_prompt) = &request.system {
            messages.push(OpenAiMessage::System {
                content: system_prompt.clone(),
            });
        }

        for msg in &request.messages {
            convert_message(msg, &mut messages)?;
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: "function".to_string(),
                        function: OpenAiFunctionDefinition {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        Ok(OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_completion_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            stream: request.stream,
            stream_options: request
                .stream
                .then_some(OpenAiStreamOptions { include_usage: true }),
            user: request.user.clone(),
            web_search_options: request
                .search
                .as_ref()
                .map(|_| serde_json::json!({})),
        })
    }
}

fn convert_message(msg: &ChatMessage, out: &mut Vec<OpenAiMessage>) -> Result<()> {
    match msg.role {
        ChatRole::System => out.push(OpenAiMessage::System {
            content: msg.text(),
        }),
        ChatRole::User => {
            let content = match &msg.content {
                MessagePart::Text(t) => OpenAiUserContent::Text(t.clone()),
                MessagePart::Parts(parts) => {
                    let mut open_ai_parts = Vec::new();
                    for part in parts {
                        match part {
                            ContentBlock::Text { text } => {
                                open_ai_parts.push(OpenAiContentPart::Text { text: text.clone() });
                            }
                            ContentBlock::Image { url } => {
                                open_ai_parts.push(OpenAiContentPart::ImageUrl {
                                    image_url: OpenAiImageUrl {
                                        url: ImageSource::resolve(url)?.data_url(),
                                    },
                                });
                            }
                            _ => {}
                        }
                    }
                    OpenAiUserContent::Parts(open_ai_parts)
                }
            };
            out.push(OpenAiMessage::User { content });
        }
        ChatRole::Assistant => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for block in msg.blocks() {
                match block {
                    ContentBlock::Text { text } if !text.is_empty() => text_parts.push(text),
                    ContentBlock::ToolUse {
                        id,
                        name,
                        arguments,
                    } => tool_calls.push(OpenAiToolCall {
                        id,
                        kind: "function".to_string(),
                        function: OpenAiFunctionCall { name, arguments },
                    }),
                    _ => {}
                }
            }
            out.push(OpenAiMessage::Assistant {
                content: (!text_parts.is_empty()).then(|| text_parts.join("\n")),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            });
        }
        ChatRole::Tool => {
            let mut found = false;
            for block in msg.blocks() {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } = block
                {
                    out.push(OpenAiMessage::Tool {
                        tool_call_id: tool_use_id,
                        content,
                    });
                    found = true;
                }
            }
            if !found {
                return Err(Error::Agent(
                    "tool message must carry a tool result".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    async fn send(&self, request: &LlmRequest) -> Result<EventStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.convert_request(request)?;

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
            let parsed: OpenAiResponse = response.json().await.map_err(|e| {
                Error::ProviderUnavailable(format!("failed to parse OpenAI response: {e}"))
            })?;
            return convert_response(parsed).map(single_shot);
        }

        let payloads = sse_data(PROVIDER, response.bytes_stream().boxed());
        Ok(decode_stream(payloads, ChatCompletionsDecoder::default()))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self.client.get(&url).bearer_auth(&self.api_key).send().await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn convert_response(response: OpenAiResponse) -> Result<Vec<ProviderEvent>> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::ProviderUnavailable("no choices in OpenAI response".to_string()))?;

    let mut events = Vec::new();
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        events.push(ProviderEvent::TextDelta(text));
    }
    for tc in choice.message.tool_calls.unwrap_or_default() {
        events.push(ProviderEvent::ToolCallRequested(ToolCallRequest {
            id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        }));
    }
    if let Some(usage) = response.usage {
        events.push(ProviderEvent::Usage(usage.into()));
    }
    Ok(events)
}

#[derive(Default)]
struct ChatCompletionsDecoder {
    tool_calls: PartialToolCalls,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl StreamDecoder for ChatCompletionsDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<ProviderEvent>> {
        if payload.trim() == "[DONE]" {
            self.finished = true;
            return Ok(Vec::new());
        }

        let chunk: OpenAiStreamChunk = serde_json::from_str(payload).map_err(|e| {
            Error::ProviderUnavailable(format!("invalid OpenAI stream chunk: {e}"))
        })?;
        if let Some(error) = chunk.error {
            return Err(Error::ProviderUnavailable(format!(
                "OpenAI stream error: {}",
                error.message
            )));
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                events.push(ProviderEvent::TextDelta(content));
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                let function = tc.function.unwrap_or_default();
                self.tool_calls.merge(
                    tc.index,
                    tc.id.as_deref(),
                    function.name.as_deref(),
                    function.arguments.as_deref(),
                );
            }
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
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

// Request Types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_search_options: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: OpenAiUserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize)]
#[serde(untagged)]
enum OpenAiUserContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Serialize)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionDefinition,
}

#[derive(Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response Types
#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(usage: OpenAiUsage) -> Self {
        TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

// Stream Response Types
#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiErrorBody>,
}

#[derive(Deserialize)]
struct OpenAiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiStreamToolCall {
    index: u64,
    id: Option<String>,
    function: Option<OpenAiStreamFunctionCall>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamFunctionCall {
    name: Option<String>,
    arguments: Option<String>,
}
