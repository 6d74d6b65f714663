//! llmux gateway: the translation and routing engine plus its HTTP surface.
//!
//! Requests arrive in any of four vendor wire formats, are parsed into a
//! unified representation, routed to a provider and account, translated to
//! the upstream's format, and the reply (streaming or not) is translated
//! back to the caller's dialect.

use std::{convert::Infallible, sync::Arc};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Sse, sse::Event},
    routing::{get, post},
};
use config::{Config, ProviderKind};
use credentials::CredentialStore;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

pub mod codec;
pub mod cooldown;
pub mod error;
pub mod handler;
mod http_client;
pub mod messages;
pub mod prompts;
pub mod provider;
pub mod rotation;
pub mod router;
pub mod schema;
pub mod signature;
pub mod streaming;
pub mod thinking;

pub use codec::Format;
pub use error::{GatewayError, GatewayResult};
pub use handler::{Gateway, GatewayResponse};

use crate::{
    codec::detect::detect_format,
    prompts::PromptCache,
    router::ModelLookup,
    signature::SignatureStore,
};

/// Published instruction-template source for the Codex path.
const TEMPLATE_SOURCE_URL: &str = "https://raw.githubusercontent.com/openai/codex";
const TEMPLATE_SOURCE_TAG: &str = "main";

/// Build the gateway from configuration and the default persistent stores.
pub fn build_gateway(config: Config) -> anyhow::Result<Arc<Gateway>> {
    let credentials = CredentialStore::load_default()?;

    let signature_path = dirs::home_dir()
        .map(|home| home.join(".llmux").join("signatures.db"))
        .unwrap_or_else(|| ".llmux/signatures.db".into());
    let signatures = SignatureStore::open(signature_path)?;

    let prompts = PromptCache::default_location(
        TEMPLATE_SOURCE_URL.to_string(),
        TEMPLATE_SOURCE_TAG.to_string(),
        reqwest::Client::new(),
    );

    Ok(assemble(config, credentials, signatures, prompts))
}

/// Assemble a gateway from explicit components; used directly by tests.
pub fn assemble(
    config: Config,
    credentials: CredentialStore,
    signatures: SignatureStore,
    prompts: PromptCache,
) -> Arc<Gateway> {
    let mut gateway = Gateway::new(config, credentials, signatures, prompts);

    // The router's dynamic lookup is injected after construction so it can
    // consult the assembled provider table.
    let providers: Vec<(String, ProviderKind)> = gateway
        .providers
        .values()
        .map(|provider| (provider.id.clone(), provider.config.kind))
        .collect();

    gateway.router = gateway.router.clone().with_lookup(Arc::new(FamilyLookup { providers }));

    Arc::new(gateway)
}

/// Model-family lookup over the configured providers: a bare model name is
/// routed to the first provider whose kind matches its family.
struct FamilyLookup {
    providers: Vec<(String, ProviderKind)>,
}

#[async_trait]
impl ModelLookup for FamilyLookup {
    async fn provider_for_model(&self, model: &str) -> Option<String> {
        let lower = model.to_ascii_lowercase();

        let wanted = if lower.starts_with("claude") {
            &[ProviderKind::Anthropic, ProviderKind::OpencodeZen, ProviderKind::Antigravity][..]
        } else if lower.starts_with("gemini") {
            &[ProviderKind::Gemini, ProviderKind::Antigravity][..]
        } else if lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3")
            || lower.starts_with("o4")
        {
            &[ProviderKind::Openai, ProviderKind::OpenaiWeb][..]
        } else if lower.starts_with("codex") {
            &[ProviderKind::OpenaiWeb, ProviderKind::Openai][..]
        } else {
            return None;
        };

        for kind in wanted {
            if let Some((id, _)) = self.providers.iter().find(|(_, k)| k == kind) {
                return Some(id.clone());
            }
        }

        None
    }
}

/// Create the axum router serving the full HTTP surface.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let cors = gateway.config.server.cors;

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/providers", get(list_providers))
        .route("/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/responses", post(openai_responses))
        .route("/v1/generateContent", post(generate_content))
        .route("/v1/streamGenerateContent", post(stream_generate_content))
        .route("/v1/proxy", post(proxy))
        .with_state(gateway);

    if cors {
        router = router.layer(tower_http::cors::CorsLayer::permissive());
    }

    router
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_providers(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let providers: Vec<Value> = gateway
        .providers
        .values()
        .map(|provider| {
            json!({
                "id": provider.id,
                "type": provider.config.kind,
            })
        })
        .collect();

    Json(json!({"object": "list", "providers": providers}))
}

async fn list_models(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let mut data = Vec::new();

    for (model, entry) in gateway.router.mappings() {
        data.push(json!({"id": model, "provider": entry.provider}));
    }

    let providers: Vec<&str> = gateway.providers.keys().map(String::as_str).collect();

    let mappings: serde_json::Map<String, Value> = gateway
        .router
        .mappings()
        .iter()
        .filter_map(|(model, entry)| {
            entry
                .upstream_model
                .as_ref()
                .map(|upstream| (model.clone(), Value::String(upstream.clone())))
        })
        .collect();

    let mut body = json!({
        "object": "list",
        "data": data,
        "providers": providers,
    });

    if !mappings.is_empty()
        && let Some(object) = body.as_object_mut()
    {
        object.insert("mappings".to_string(), Value::Object(mappings));
    }

    Json(body)
}

async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> GatewayResult<impl IntoResponse> {
    let response = gateway.handle(Format::OpenaiChat, Format::OpenaiChat, body, None).await?;
    Ok(into_http(response))
}

async fn anthropic_messages(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> GatewayResult<impl IntoResponse> {
    let response = gateway.handle(Format::Anthropic, Format::Anthropic, body, None).await?;
    Ok(into_http(response))
}

async fn openai_responses(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> GatewayResult<impl IntoResponse> {
    let response = gateway
        .handle(Format::OpenaiResponses, Format::OpenaiResponses, body, None)
        .await?;
    Ok(into_http(response))
}

#[derive(Debug, Deserialize)]
struct GenerateQuery {
    model: Option<String>,
}

async fn generate_content(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<GenerateQuery>,
    body: Bytes,
) -> GatewayResult<impl IntoResponse> {
    let model = gemini_model(&query, &body)?;
    let response = gateway
        .handle(Format::Gemini, Format::Gemini, body, Some(model))
        .await?;
    Ok(into_http(response))
}

async fn stream_generate_content(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<GenerateQuery>,
    body: Bytes,
) -> GatewayResult<impl IntoResponse> {
    let model = gemini_model(&query, &body)?;

    // The Gemini wire carries streaming in the URL rather than the body.
    let response = gateway
        .handle_opts(Format::Gemini, Format::Gemini, body, Some(model), Some(true))
        .await?;
    Ok(into_http(response))
}

/// The Gemini surface takes the model from the query string, falling back
/// to a `model` field in the body.
fn gemini_model(query: &GenerateQuery, body: &[u8]) -> GatewayResult<String> {
    if let Some(model) = &query.model {
        return Ok(model.clone());
    }

    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get("model").and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| GatewayError::InvalidRequest("Missing model (use ?model=...)".to_string()))
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    from: Option<String>,
    to: Option<String>,
    model: Option<String>,
}

/// Explicit passthrough: `?from` and `?to` pick the codec pair, defaulting
/// to payload detection and a same-format reply.
async fn proxy(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ProxyQuery>,
    body: Bytes,
) -> GatewayResult<impl IntoResponse> {
    let source = match &query.from {
        Some(name) => Format::from_name(name)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("Unknown format '{name}'")))?,
        None => {
            let value: Value = serde_json::from_slice(&body)
                .map_err(|e| GatewayError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
            detect_format(&value)
        }
    };

    let sink = match &query.to {
        Some(name) => Format::from_name(name)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("Unknown format '{name}'")))?,
        None => source,
    };

    let response = gateway.handle(source, sink, body, query.model.clone()).await?;
    Ok(into_http(response))
}

fn into_http(response: GatewayResponse) -> axum::response::Response {
    match response {
        GatewayResponse::Json(value) => Json(value).into_response(),
        GatewayResponse::Stream(frames) => {
            let events = frames.map(|frame| {
                let mut event = Event::default().data(frame.data);
                if let Some(name) = frame.event {
                    event = event.event(name);
                }
                Ok::<_, Infallible>(event)
            });

            Sse::new(events).into_response()
        }
    }
}
