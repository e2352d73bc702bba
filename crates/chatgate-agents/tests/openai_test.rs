use chatgate_agents::providers::{
    ChatMessage, LlmRequest, OpenAiAdapter, ProviderAdapter, ProviderEvent, ToolDefinition,
};
use chatgate_common::{Error, TokenUsage};
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(text: &str, stream: bool) -> LlmRequest {
    let mut request = LlmRequest::new("gpt-4o-mini", vec![ChatMessage::user(text)]);
    request.system = Some("You are a helpful assistant.".to_string());
    request.stream = stream;
    request
}

fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body: String = chunks
        .iter()
        .map(|c| format!("data: {c}\n\n"))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_openai_completion() {
    let mock_server = MockServer::start().await;

    let response_body = json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello there!"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
    });

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new("test-key".to_string(), Some(mock_server.uri()));
    let events: Vec<ProviderEvent> = adapter
        .send(&request("Hello", false))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "Hello there!"));
    assert!(matches!(
        events[1],
        ProviderEvent::Usage(TokenUsage { input_tokens: 9, output_tokens: 12 })
    ));
    assert!(matches!(events[2], ProviderEvent::Done));
}

#[tokio::test]
async fn test_openai_tool_use() {
    let mock_server = MockServer::start().await;

    let response_body = json!({
        "id": "chatcmpl-123",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_abc123",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"location\": \"Boston\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }]
    });

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new("test-key".to_string(), Some(mock_server.uri()));
    let mut req = request("What is the weather in Boston?", false);
    req.tools = vec![ToolDefinition {
        name: "get_weather".to_string(),
        description: "Get weather".to_string(),
        input_schema: json!({"type": "object", "properties": {"location": {"type": "string"}}}),
    }];

    let events: Vec<ProviderEvent> = adapter.send(&req).await.unwrap().collect().await;
    match &events[0] {
        ProviderEvent::ToolCallRequested(call) => {
            assert_eq!(call.id, "call_abc123");
            assert_eq!(call.name, "get_weather");
            assert_eq!(call.arguments, "{\"location\": \"Boston\"}");
        }
        other => panic!("expected tool call, got {other:?}"),
    }
    assert!(matches!(events.last(), Some(ProviderEvent::Done)));
}

#[tokio::test]
async fn test_openai_stream() {
    let mock_server = MockServer::start().await;

    let body = sse_body(&[
        json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]}),
        json!({"choices": [{"index": 0, "delta": {"content": "lo"}}]}),
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true, "stream_options": {"include_usage": true}})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new("test-key".to_string(), Some(mock_server.uri()));
    let events: Vec<ProviderEvent> = adapter
        .send(&request("Hello", true))
        .await
        .unwrap()
        .collect()
        .await;

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            ProviderEvent::TextDelta(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello");
    assert!(events.iter().any(|e| matches!(
        e,
        ProviderEvent::Usage(TokenUsage { input_tokens: 5, output_tokens: 2 })
    )));
    assert!(matches!(events.last(), Some(ProviderEvent::Done)));
}

#[tokio::test]
async fn test_openai_stream_assembles_fragmented_tool_calls() {
    let mock_server = MockServer::start().await;

    let body = sse_body(&[
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": ""}}]}}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"q\":"}}]}}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 1, "id": "call_2", "function": {"name": "current_time", "arguments": "{}"}}]}}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"rust\"}"}}]}}]}),
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new("test-key".to_string(), Some(mock_server.uri()));
    let events: Vec<ProviderEvent> = adapter
        .send(&request("look it up", true))
        .await
        .unwrap()
        .collect()
        .await;

    let calls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProviderEvent::ToolCallRequested(call) => Some(call),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].arguments, "{\"q\":\"rust\"}");
    assert_eq!(calls[1].name, "current_time");
    assert!(matches!(events.last(), Some(ProviderEvent::Done)));
}

#[tokio::test]
async fn test_openai_error_status_is_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new("bad-key".to_string(), Some(mock_server.uri()));
    let err = match adapter.send(&request("Hello", true)).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    match err {
        Error::ProviderUnavailable(msg) => {
            assert!(msg.contains("status=401"));
            assert!(msg.contains("invalid api key"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}
