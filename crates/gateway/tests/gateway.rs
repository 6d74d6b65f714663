//! End-to-end tests: a real axum surface in front of mock upstreams.

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::IntoResponse,
    routing::post,
};
use credentials::CredentialStore;
use gateway::{prompts::PromptCache, signature::SignatureStore};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Spawn a mock upstream, returning its base address.
async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{address}")
}

/// Build the gateway surface from a YAML config, with throwaway stores.
fn surface(yaml: &str) -> Router {
    let config: config::Config = serde_yaml::from_str(yaml).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let credentials = CredentialStore::load_from(dir.path().join("auth.json")).unwrap();
    let signatures = SignatureStore::in_memory().unwrap();
    let prompts = PromptCache::new(
        dir.path().join("cache"),
        "http://192.0.2.1:1".to_string(),
        "v1".to_string(),
        reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap(),
    );

    gateway::router(gateway::assemble(config, credentials, signatures, prompts))
}

async fn post_json(router: &Router, path: &str, body: Value) -> (StatusCode, String) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    (status, String::from_utf8_lossy(&bytes).to_string())
}

async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_and_listing_endpoints() {
    let router = surface(
        r#"
        providers:
          openai:
            type: openai
            apiKey: sk-test
        routing:
          modelMapping:
            my-model:
              provider: openai
              upstreamModel: gpt-4o
        "#,
    );

    let (status, body) = get(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = get(&router, "/providers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["providers"][0]["id"], "openai");

    let (status, body) = get(&router, "/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "my-model");
    assert_eq!(body["data"][0]["provider"], "openai");
    assert_eq!(body["mappings"]["my-model"], "gpt-4o");
}

#[tokio::test]
async fn openai_client_reaches_anthropic_upstream() {
    // The mock echoes the last user message back as an Anthropic response.
    async fn messages(Json(body): Json<Value>) -> impl IntoResponse {
        let text = body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_array())
            .and_then(|c| c.first())
            .and_then(|c| c["text"].as_str())
            .unwrap_or("?")
            .to_string();

        Json(json!({
            "id": "msg_echo",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "model": body["model"],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        }))
    }

    let upstream = spawn_upstream(Router::new().route("/v1/messages", post(messages))).await;

    let router = surface(&format!(
        r#"
        providers:
          anthropic:
            type: anthropic
            apiKey: sk-test
            baseUrl: {upstream}/v1
        routing:
          modelMapping:
            claude-3-sonnet:
              provider: anthropic
        "#
    ));

    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        json!({
            "model": "claude-3-sonnet",
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");

    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["choices"][0]["message"]["content"], "hi");
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(value["model"], "claude-3-sonnet");
}

#[tokio::test]
async fn streaming_tool_call_translates_to_anthropic_events() {
    // Mock OpenAI upstream streaming one tool call and a finish.
    async fn chat_completions() -> impl IntoResponse {
        let chunks = [
            json!({
                "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [
                    {"index": 0, "id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": ""}}
                ]}}]
            }),
            json!({
                "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"loc\":\"NYC\"}"}}
                ]}}]
            }),
            json!({
                "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]
            }),
        ];

        let mut body = String::new();
        for chunk in &chunks {
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");

        ([(header::CONTENT_TYPE, "text/event-stream")], body)
    }

    let upstream = spawn_upstream(Router::new().route("/v1/chat/completions", post(chat_completions))).await;

    let router = surface(&format!(
        r#"
        providers:
          openai:
            type: openai
            apiKey: sk-test
            baseUrl: {upstream}/v1
        routing:
          modelMapping:
            claude-3-sonnet:
              provider: openai
              upstreamModel: gpt-4o
        "#
    ));

    let (status, body) = post_json(
        &router,
        "/v1/messages",
        json!({
            "model": "claude-3-sonnet",
            "max_tokens": 512,
            "stream": true,
            "system": "be brief",
            "messages": [{"role": "user", "content": "weather?"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");

    // Event order per the Anthropic grammar, tool block fully bracketed.
    let events: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect();

    assert_eq!(
        events,
        [
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ],
        "{body}"
    );

    // The start event names the tool, deltas reassemble the arguments.
    assert!(body.contains(r#""name":"get_weather""#), "{body}");

    let mut arguments = String::new();
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let Ok(value) = serde_json::from_str::<Value>(data) else { continue };

        if value["type"] == "content_block_delta"
            && let Some(fragment) = value["delta"]["partial_json"].as_str()
        {
            arguments.push_str(fragment);
        }
        if value["type"] == "message_delta" {
            assert_eq!(value["delta"]["stop_reason"], "tool_use");
        }
    }
    assert_eq!(arguments, r#"{"loc":"NYC"}"#);
}

#[tokio::test]
async fn rate_limited_upstream_falls_back_to_mapped_model() {
    // Anthropic mock always 429s with Retry-After; OpenAI mock echoes.
    async fn rate_limited() -> impl IntoResponse {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "2")],
            Json(json!({"error": {"message": "slow down"}})),
        )
    }

    async fn echo(Json(body): Json<Value>) -> impl IntoResponse {
        Json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 0,
            "model": body["model"],
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "fallback says hi"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 3, "total_tokens": 5}
        }))
    }

    let anthropic = spawn_upstream(Router::new().route("/v1/messages", post(rate_limited))).await;
    let openai = spawn_upstream(Router::new().route("/v1/chat/completions", post(echo))).await;

    let router = surface(&format!(
        r#"
        providers:
          anthropic:
            type: anthropic
            apiKey: sk-a
            baseUrl: {anthropic}/v1
          openai:
            type: openai
            apiKey: sk-o
            baseUrl: {openai}/v1
        routing:
          rotateOn429: true
          maxRetryAttempts: 4
          modelMapping:
            claude-3-sonnet:
              provider: anthropic
              fallbacks: [gpt-4o]
            gpt-4o:
              provider: openai
        "#
    ));

    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        json!({
            "model": "claude-3-sonnet",
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");

    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["choices"][0]["message"]["content"], "fallback says hi");

    // The second request skips the cooled-down primary immediately.
    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        json!({
            "model": "claude-3-sonnet",
            "messages": [{"role": "user", "content": "again"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["choices"][0]["message"]["content"], "fallback says hi");
}

#[tokio::test]
async fn unknown_provider_is_a_400() {
    let router = surface("{}");

    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        json!({"model": "mystery-model", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("mystery-model"), "{body}");
}

#[tokio::test]
async fn missing_credentials_is_a_401() {
    let router = surface(
        r#"
        providers:
          anthropic:
            type: anthropic
        routing:
          modelMapping:
            claude-3-sonnet:
              provider: anthropic
        "#,
    );

    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        json!({"model": "claude-3-sonnet", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED, "{body}");
}

#[tokio::test]
async fn malformed_body_is_a_400() {
    let router = surface("{}");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn proxy_translates_between_explicit_formats() {
    async fn messages(Json(body): Json<Value>) -> impl IntoResponse {
        Json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "proxied"}],
            "model": body["model"],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }))
    }

    let upstream = spawn_upstream(Router::new().route("/v1/messages", post(messages))).await;

    let router = surface(&format!(
        r#"
        providers:
          anthropic:
            type: anthropic
            apiKey: sk-test
            baseUrl: {upstream}/v1
        routing:
          defaultProvider: anthropic
        "#
    ));

    // OpenAI-shaped request in, Gemini-shaped response out.
    let (status, body) = post_json(
        &router,
        "/v1/proxy?from=openai&to=gemini&model=claude-3-sonnet",
        json!({
            "model": "ignored",
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");

    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        value["candidates"][0]["content"]["parts"][0]["text"],
        "proxied"
    );
    assert_eq!(value["candidates"][0]["finishReason"], "STOP");
}
