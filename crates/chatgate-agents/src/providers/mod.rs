use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chatgate_common::{Error, ProviderFamily, Result, TokenUsage, ToolCallRequest};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

pub mod anthropic;
pub mod bedrock;
pub(crate) mod lines;
pub mod ollama;
pub mod openai;
pub mod openai_responses;
pub(crate) mod tool_calls;

pub use anthropic::AnthropicAdapter;
pub use bedrock::BedrockAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use openai_responses::OpenAiResponsesAdapter;

/// Normalized stream of provider output. Ends with exactly one `Done` or `Failed`.
pub type EventStream = BoxStream<'static, ProviderEvent>;

/// One backend wire protocol behind the uniform send contract.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    /// Start a request. Connection and HTTP-status failures come back as `Err`;
    /// everything after that is reported through the returned stream.
    async fn send(&self, request: &LlmRequest) -> Result<EventStream>;

    /// Check if the provider is reachable and configured.
    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolCallRequested(ToolCallRequest),
    Usage(TokenUsage),
    Done,
    Failed(Error),
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderEvent::Done | ProviderEvent::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Provider-side model identifier.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tools: Vec<ToolDefinition>,
    /// End-user identifier forwarded for provider abuse monitoring.
    pub user: Option<String>,
    /// Built-in search tool tag to enable, if the model has one.
    pub search: Option<String>,
    pub stream: bool,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            system: None,
            max_tokens: None,
            temperature: None,
            tools: Vec::new(),
            user: None,
            search: None,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessagePart,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessagePart::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessagePart::Text(text.into()),
        }
    }

    /// Plain text of the message, joining text blocks.
    pub fn text(&self) -> String {
        match &self.content {
            MessagePart::Text(text) => text.clone(),
            MessagePart::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            MessagePart::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessagePart::Parts(parts) => parts.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Text(String),
    Parts(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { url: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        /// Raw argument JSON as the model produced it.
        arguments: String,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Bound the whole exchange with one provider by a single deadline.
///
/// The deadline covers reading local attachments, connecting, and every event
/// after it. Expiry turns into
/// `Failed(ProviderTimeout)`, as does a stream that stops without a terminal event
/// into a generic failure.
pub fn send_with_deadline(
    adapter: Arc<dyn ProviderAdapter>,
    request: LlmRequest,
    timeout: Duration,
) -> EventStream {
    enum State {
        Connect(Arc<dyn ProviderAdapter>, LlmRequest),
        Streaming(EventStream),
        Finished,
    }

    let deadline = Instant::now() + timeout;
    stream::unfold(State::Connect(adapter, request), move |state| async move {
        let mut events = match state {
            State::Finished => return None,
            State::Streaming(events) => events,
            State::Connect(adapter, mut request) => {
                let connect = async {
                    inline_local_images(&mut request).await?;
                    adapter.send(&request).await
                };
                match timeout_at(deadline, connect).await {
                    Ok(Ok(events)) => events,
                    Ok(Err(e)) => return Some((ProviderEvent::Failed(e), State::Finished)),
                    Err(_) => {
                        return Some((
                            ProviderEvent::Failed(Error::ProviderTimeout(timeout)),
                            State::Finished,
                        ));
                    }
                }
            }
        };

        match timeout_at(deadline, events.next()).await {
            Ok(Some(event)) => {
                let next = if event.is_terminal() {
                    State::Finished
                } else {
                    State::Streaming(events)
                };
                Some((event, next))
            }
            Ok(None) => Some((
                ProviderEvent::Failed(Error::Agent(
                    "provider stream ended without completing".to_string(),
                )),
                State::Finished,
            )),
            Err(_) => Some((
                ProviderEvent::Failed(Error::ProviderTimeout(timeout)),
                State::Finished,
            )),
        }
    })
    .boxed()
}

/// A stream made only of a failure.
pub fn failed_stream(error: Error) -> EventStream {
    stream::iter(vec![ProviderEvent::Failed(error)]).boxed()
}

/// Events of a complete, already-received response, terminated by `Done`.
pub(crate) fn single_shot(mut events: Vec<ProviderEvent>) -> EventStream {
    events.push(ProviderEvent::Done);
    stream::iter(events).boxed()
}

/// Incremental decoder of one provider's streaming payloads.
pub(crate) trait StreamDecoder: Send + 'static {
    /// Decode one payload (an SSE `data` field or an NDJSON line).
    fn decode(&mut self, payload: &str) -> Result<Vec<ProviderEvent>>;

    /// Whether the provider signalled the end of its output.
    fn is_finished(&self) -> bool;

    /// Flush buffered state once the output ends. Incomplete tool calls fail here.
    fn finish(&mut self) -> Result<Vec<ProviderEvent>>;
}

/// Drive a decoder over a payload stream, guaranteeing exactly one terminal event.
pub(crate) fn decode_stream<D: StreamDecoder>(
    payloads: BoxStream<'static, Result<String>>,
    decoder: D,
) -> EventStream {
    struct State<D> {
        payloads: BoxStream<'static, Result<String>>,
        decoder: D,
        queue: VecDeque<ProviderEvent>,
        terminated: bool,
    }

    impl<D> State<D> {
        fn enqueue(&mut self, events: Vec<ProviderEvent>) {
            for event in events {
                if self.terminated {
                    break;
                }
                self.terminated = event.is_terminal();
                self.queue.push_back(event);
            }
        }

        fn fail(&mut self, error: Error) {
            if !self.terminated {
                self.queue.push_back(ProviderEvent::Failed(error));
                self.terminated = true;
            }
        }
    }

    let state = State {
        payloads,
        decoder,
        queue: VecDeque::new(),
        terminated: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((event, state));
            }
            if state.terminated {
                return None;
            }

            let next = if state.decoder.is_finished() {
                None
            } else {
                state.payloads.next().await
            };

            match next {
                Some(Ok(payload)) => match state.decoder.decode(&payload) {
                    Ok(events) => state.enqueue(events),
                    Err(e) => state.fail(e),
                },
                Some(Err(e)) => state.fail(e),
                None => {
                    match state.decoder.finish() {
                        Ok(events) => state.enqueue(events),
                        Err(e) => state.fail(e),
                    }
                    if !state.terminated {
                        state.queue.push_back(ProviderEvent::Done);
                        state.terminated = true;
                    }
                }
            }
        }
    })
    .boxed()
}

pub(crate) fn request_error(provider: &str, e: reqwest::Error) -> Error {
    Error::ProviderUnavailable(format!("{provider} request failed: {e}"))
}

/// Turn a non-success HTTP response into a `ProviderUnavailable` carrying status and body.
pub(crate) async fn status_error(provider: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    debug!(provider, %status, "provider returned error status");
    Error::ProviderUnavailable(format!(
        "{provider} API error status={}, body={body}",
        status.as_u16()
    ))
}

/// Image payload resolved from an attachment reference.
pub(crate) enum ImageSource {
    Url(String),
    Base64 { media_type: String, data: String },
}

impl ImageSource {
    /// Resolve a data URL or a remote URL. Local paths must already be inlined
    /// by [`inline_local_images`].
    pub(crate) fn resolve(reference: &str) -> Result<Self> {
        if let Some(rest) = reference.strip_prefix("data:") {
            let (meta, data) = rest
                .split_once(',')
                .ok_or_else(|| Error::Agent("invalid data URL".to_string()))?;
            let media_type = meta.split(';').next().unwrap_or("image/jpeg");
            return Ok(ImageSource::Base64 {
                media_type: media_type.to_string(),
                data: data.to_string(),
            });
        }
        if is_remote(reference) {
            return Ok(ImageSource::Url(reference.to_string()));
        }
        Err(Error::Agent(format!(
            "attachment {reference} was not loaded before sending"
        )))
    }

    async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::Agent(format!("failed to read attachment {}: {e}", path.display()))
        })?;
        Ok(ImageSource::Base64 {
            media_type: media_type_for(path).to_string(),
            data: BASE64.encode(bytes),
        })
    }

    pub(crate) fn data_url(&self) -> String {
        match self {
            ImageSource::Url(url) => url.clone(),
            ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        }
    }
}

fn is_remote(reference: &str) -> bool {
    reference.starts_with("data:")
        || reference.starts_with("http://")
        || reference.starts_with("https://")
}

/// Replace image blocks that point at local files with data URLs, reading
/// the files without blocking the runtime.
pub async fn inline_local_images(request: &mut LlmRequest) -> Result<()> {
    for message in &mut request.messages {
        let MessagePart::Parts(parts) = &mut message.content else {
            continue;
        };
        for part in parts {
            if let ContentBlock::Image { url } = part {
                if !is_remote(url) {
                    let source = ImageSource::load(Path::new(url.as_str())).await?;
                    *url = source.data_url();
                }
            }
        }
    }
    Ok(())
}

fn media_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticAdapter {
        events: std::sync::Mutex<Option<Vec<ProviderEvent>>>,
        connect_delay: Duration,
    }

    #[async_trait]
    impl ProviderAdapter for StaticAdapter {
        fn family(&self) -> ProviderFamily {
            ProviderFamily::Local
        }

        async fn send(&self, _request: &LlmRequest) -> Result<EventStream> {
            tokio::time::sleep(self.connect_delay).await;
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            Ok(stream::iter(events).boxed())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn adapter(events: Vec<ProviderEvent>, connect_delay: Duration) -> Arc<dyn ProviderAdapter> {
        Arc::new(StaticAdapter {
            events: std::sync::Mutex::new(Some(events)),
            connect_delay,
        })
    }

    #[tokio::test]
    async fn deadline_passes_events_through_until_done() {
        let events = send_with_deadline(
            adapter(
                vec![
                    ProviderEvent::TextDelta("4".to_string()),
                    ProviderEvent::Done,
                    ProviderEvent::TextDelta("ignored".to_string()),
                ],
                Duration::ZERO,
            ),
            LlmRequest::new("m", vec![]),
            Duration::from_secs(5),
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "4"));
        assert!(matches!(events[1], ProviderEvent::Done));
    }

    #[tokio::test]
    async fn deadline_covers_slow_connect() {
        let events = send_with_deadline(
            adapter(vec![ProviderEvent::Done], Duration::from_millis(200)),
            LlmRequest::new("m", vec![]),
            Duration::from_millis(20),
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ProviderEvent::Failed(e) if e.is_timeout()));
    }

    #[tokio::test]
    async fn stream_without_terminal_event_fails() {
        let events = send_with_deadline(
            adapter(
                vec![ProviderEvent::TextDelta("half".to_string())],
                Duration::ZERO,
            ),
            LlmRequest::new("m", vec![]),
            Duration::from_secs(5),
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ProviderEvent::Failed(e) if !e.is_timeout()));
    }

    #[test]
    fn data_url_resolves_to_base64() {
        match ImageSource::resolve("data:image/png;base64,AAAA").unwrap() {
            ImageSource::Base64 { media_type, data } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "AAAA");
            }
            ImageSource::Url(_) => panic!("expected base64 source"),
        }
    }

    fn image_request(url: &str) -> LlmRequest {
        LlmRequest::new(
            "m",
            vec![ChatMessage {
                role: ChatRole::User,
                content: MessagePart::Parts(vec![
                    ContentBlock::Text {
                        text: "what is this?".to_string(),
                    },
                    ContentBlock::Image {
                        url: url.to_string(),
                    },
                ]),
            }],
        )
    }

    fn image_url(request: &LlmRequest) -> String {
        match &request.messages[0].blocks()[1] {
            ContentBlock::Image { url } => url.clone(),
            other => panic!("expected image block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_file_is_read_and_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, b"png-bytes").unwrap();

        let mut request = image_request(path.to_str().unwrap());
        inline_local_images(&mut request).await.unwrap();
        assert_eq!(
            image_url(&request),
            format!("data:image/png;base64,{}", BASE64.encode(b"png-bytes"))
        );

        let mut remote = image_request("https://example.com/a.png");
        inline_local_images(&mut remote).await.unwrap();
        assert_eq!(image_url(&remote), "https://example.com/a.png");
    }

    #[test]
    fn unloaded_local_path_is_refused_without_touching_disk() {
        let err = match ImageSource::resolve("/no/such/pic.png") {
            Ok(_) => panic!("local path should not resolve synchronously"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("not loaded"));
    }

    /// Records the request it was handed.
    struct CapturingAdapter {
        seen: std::sync::Mutex<Option<LlmRequest>>,
    }

    #[async_trait]
    impl ProviderAdapter for CapturingAdapter {
        fn family(&self) -> ProviderFamily {
            ProviderFamily::Local
        }

        async fn send(&self, request: &LlmRequest) -> Result<EventStream> {
            *self.seen.lock().unwrap() = Some(request.clone());
            Ok(single_shot(Vec::new()))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn deadline_send_inlines_local_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.webp");
        std::fs::write(&path, b"webp-bytes").unwrap();
        let capturing = Arc::new(CapturingAdapter {
            seen: std::sync::Mutex::new(None),
        });

        let events = send_with_deadline(
            capturing.clone(),
            image_request(path.to_str().unwrap()),
            Duration::from_secs(5),
        )
        .collect::<Vec<_>>()
        .await;
        assert!(matches!(events[..], [ProviderEvent::Done]));

        let seen = capturing.seen.lock().unwrap().take().unwrap();
        assert!(image_url(&seen).starts_with("data:image/webp;base64,"));
    }

    #[tokio::test]
    async fn missing_local_attachment_fails_the_stream() {
        let events = send_with_deadline(
            adapter(vec![ProviderEvent::Done], Duration::ZERO),
            image_request("/no/such/pic.png"),
            Duration::from_secs(5),
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::Failed(e) => assert!(e.to_string().contains("failed to read attachment")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
