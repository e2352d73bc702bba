use chatgate_agents::providers::{
    BedrockAdapter, ChatMessage, LlmRequest, OpenAiResponsesAdapter, ProviderAdapter,
    ProviderEvent,
};
use chatgate_common::{Error, TokenUsage, ToolCallRequest};
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(model: &str, stream: bool) -> LlmRequest {
    let mut request = LlmRequest::new(model, vec![ChatMessage::user("What's new in Rust?")]);
    request.stream = stream;
    request
}

fn sse_body(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|e| format!("event: {}\ndata: {e}\n\n", e["type"].as_str().unwrap_or("message")))
        .collect()
}

fn tool_calls(events: &[ProviderEvent]) -> Vec<&ToolCallRequest> {
    events
        .iter()
        .filter_map(|e| match e {
            ProviderEvent::ToolCallRequested(call) => Some(call),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_responses_stream_with_search_and_function_call() {
    let mock_server = MockServer::start().await;

    let body = sse_body(&[
        json!({"type": "response.created", "response": {"id": "resp_1"}}),
        json!({"type": "response.output_text.delta", "output_index": 0, "delta": "Checking"}),
        json!({"type": "response.output_item.added", "output_index": 1, "item": {"type": "function_call", "call_id": "call_9", "name": "lookup", "arguments": ""}}),
        json!({"type": "response.function_call_arguments.delta", "output_index": 1, "delta": "{\"q\":"}),
        json!({"type": "response.function_call_arguments.delta", "output_index": 1, "delta": "\"rust 2024\"}"}),
        json!({"type": "response.output_item.done", "output_index": 1, "item": {"type": "function_call", "call_id": "call_9", "name": "lookup", "arguments": "{\"q\":\"rust 2024\"}"}}),
        json!({"type": "response.completed", "response": {"usage": {"input_tokens": 30, "output_tokens": 8}}}),
    ]);

    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_partial_json(json!({"stream": true, "store": false})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiResponsesAdapter::new("test-key".to_string(), Some(mock_server.uri()));
    let mut req = request("gpt-4o", true);
    req.search = Some("web_search_preview".to_string());

    let events: Vec<ProviderEvent> = adapter.send(&req).await.unwrap().collect().await;

    assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "Checking"));
    let calls = tool_calls(&events);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_9");
    assert_eq!(calls[0].arguments, "{\"q\":\"rust 2024\"}");
    assert!(events.iter().any(|e| matches!(
        e,
        ProviderEvent::Usage(TokenUsage { input_tokens: 30, output_tokens: 8 })
    )));
    assert!(matches!(events.last(), Some(ProviderEvent::Done)));

    let received = mock_server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let tools = sent["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["type"] == "web_search_preview"));
}

#[tokio::test]
async fn test_responses_failed_event_ends_stream() {
    let mock_server = MockServer::start().await;

    let body = sse_body(&[
        json!({"type": "response.output_text.delta", "output_index": 0, "delta": "Par"}),
        json!({"type": "response.failed", "response": {"error": {"message": "server overloaded"}}}),
        json!({"type": "response.output_text.delta", "output_index": 0, "delta": "ignored"}),
    ]);

    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiResponsesAdapter::new("test-key".to_string(), Some(mock_server.uri()));
    let events: Vec<ProviderEvent> = adapter
        .send(&request("o3", true))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        ProviderEvent::Failed(Error::ProviderUnavailable(msg)) if msg.contains("server overloaded")
    ));
}

#[tokio::test]
async fn test_responses_single_shot() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_2",
            "output": [
                {"type": "web_search_call", "status": "completed"},
                {"type": "message", "content": [{"type": "output_text", "text": "Rust 1.85 shipped the 2024 edition."}]}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 9}
        })))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiResponsesAdapter::new("test-key".to_string(), Some(mock_server.uri()));
    let events: Vec<ProviderEvent> = adapter
        .send(&request("gpt-4o", false))
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t.contains("2024 edition")));
    assert!(matches!(events.last(), Some(ProviderEvent::Done)));
}

#[tokio::test]
async fn test_bedrock_converse_normalizes_tool_use() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/model/amazon.nova-lite/converse"))
        .and(header("authorization", "Bearer bedrock-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": {"message": {"role": "assistant", "content": [
                {"text": "Let me check."},
                {"toolUse": {"toolUseId": "tooluse_1", "name": "current_time", "input": {"utc_offset_hours": 2}}}
            ]}},
            "stopReason": "tool_use",
            "usage": {"inputTokens": 14, "outputTokens": 6, "totalTokens": 20}
        })))
        .mount(&mock_server)
        .await;

    let adapter = BedrockAdapter::new("bedrock-token".to_string(), None, Some(mock_server.uri()));
    // Converse has no streaming in this adapter; a streaming request still gets one shot.
    let events: Vec<ProviderEvent> = adapter
        .send(&request("amazon.nova-lite", true))
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "Let me check."));
    let calls = tool_calls(&events);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "tooluse_1");
    let args: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
    assert_eq!(args["utc_offset_hours"], 2);
    assert!(events.iter().any(|e| matches!(
        e,
        ProviderEvent::Usage(TokenUsage { input_tokens: 14, output_tokens: 6 })
    )));
    assert!(matches!(events.last(), Some(ProviderEvent::Done)));
}

#[tokio::test]
async fn test_bedrock_rejected_token_is_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/model/amazon.nova-lite/converse"))
        .respond_with(ResponseTemplate::new(403).set_body_string("{\"message\":\"forbidden\"}"))
        .mount(&mock_server)
        .await;

    let adapter = BedrockAdapter::new("bad".to_string(), None, Some(mock_server.uri()));
    let result = adapter.send(&request("amazon.nova-lite", false)).await;
    assert!(matches!(result, Err(Error::ProviderUnavailable(msg)) if msg.contains("status=403")));
}
