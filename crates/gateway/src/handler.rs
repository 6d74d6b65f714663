//! The request orchestrator.
//!
//! One inbound request runs a bounded retry loop: resolve the route, pick an
//! account, translate, dispatch, and react to the upstream's verdict with
//! the escalation ladder: account rotation, endpoint rotation (Antigravity),
//! router-driven model fallback, and finally a client-visible error.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use config::{Config, ProviderKind};
use credentials::CredentialStore;
use futures::{StreamExt, stream::BoxStream};
use indexmap::IndexMap;
use secrecy::ExposeSecret;
use serde_json::Value;

use crate::{
    codec::{self, Format, SseFrame, StreamEmitter, StreamParser},
    cooldown::{CooldownManager, parse_retry_after},
    error::{GatewayError, GatewayResult},
    http_client::http_client,
    messages::unified::{ChunkKind, UnifiedRequest},
    prompts::PromptCache,
    provider::{Provider, antigravity, openai_web},
    rotation::AccountRotator,
    router::ModelRouter,
    schema::{SchemaDialect, decode_tool_name, normalize_schema},
    signature::SignatureStore,
    streaming::{ResponseAccumulator, SseFrameSplitter},
};

/// Network back-off starts here and doubles per failed attempt.
const NETWORK_BACKOFF_START: Duration = Duration::from_secs(1);

/// Network back-off ceiling.
const NETWORK_BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Longest the loop sleeps waiting out an upstream Retry-After.
const MAX_RATE_LIMIT_SLEEP: Duration = Duration::from_secs(30);

/// Last-resort model fallbacks consulted when the router has nothing left.
const MODEL_FALLBACKS: &[(&str, &str)] = &[
    ("gemini-3-pro-high", "gemini-3-flash"),
    ("gemini-3-pro-low", "gemini-3-flash"),
    ("claude-opus-4-5-thinking", "claude-sonnet-4-5-thinking"),
    ("claude-opus-4-5", "claude-sonnet-4-5"),
];

/// Outcome of one handled request, ready for the HTTP layer.
pub enum GatewayResponse {
    /// A complete JSON body in the caller's format.
    Json(Value),
    /// An SSE frame stream in the caller's format.
    Stream(BoxStream<'static, SseFrame>),
}

/// Process-wide gateway state shared by every request.
pub struct Gateway {
    pub(crate) config: Config,
    pub(crate) providers: IndexMap<String, Provider>,
    pub(crate) credentials: CredentialStore,
    pub(crate) cooldowns: CooldownManager,
    pub(crate) rotator: AccountRotator,
    pub(crate) router: ModelRouter,
    pub(crate) signatures: SignatureStore,
    pub(crate) prompts: PromptCache,
    client: reqwest::Client,
}

impl Gateway {
    /// Assemble the gateway from its shared components.
    pub fn new(
        config: Config,
        credentials: CredentialStore,
        signatures: SignatureStore,
        prompts: PromptCache,
    ) -> Self {
        let cooldowns = CooldownManager::new();
        let rotator = AccountRotator::new(cooldowns.clone());
        let router = ModelRouter::new(config.routing.clone(), cooldowns.clone());

        let providers = config
            .providers
            .iter()
            .map(|(id, provider_config)| (id.clone(), Provider::new(id.clone(), provider_config.clone())))
            .collect();

        Self {
            config,
            providers,
            credentials,
            cooldowns,
            rotator,
            router,
            signatures,
            prompts,
            client: http_client(),
        }
    }

    /// Handle one request arriving in `source` format.
    ///
    /// `model_override` carries the model for dialects that put it in the
    /// URL (Gemini), and the `?model=` of the proxy endpoint.
    pub async fn handle(
        self: &Arc<Self>,
        source: Format,
        sink: Format,
        body: Bytes,
        model_override: Option<String>,
    ) -> GatewayResult<GatewayResponse> {
        self.handle_opts(source, sink, body, model_override, None).await
    }

    /// [`handle`](Self::handle) with an explicit streaming override, for
    /// surfaces that carry the flag in the URL (`streamGenerateContent`).
    pub async fn handle_opts(
        self: &Arc<Self>,
        source: Format,
        sink: Format,
        body: Bytes,
        model_override: Option<String>,
        stream_override: Option<bool>,
    ) -> GatewayResult<GatewayResponse> {
        let mut request = codec::parse_request(source, &body)?;

        if let Some(model) = model_override {
            request.model = model;
        }

        if let Some(stream) = stream_override {
            request.stream = Some(stream);
        }

        if request.model.is_empty() {
            return Err(GatewayError::InvalidRequest("Missing model".to_string()));
        }

        if self.config.amp.enabled
            && let Some(mapped) = self.config.amp.model_mappings.get(&request.model).cloned()
        {
            return self.forward_amp(body, &request, &mapped).await;
        }

        self.dispatch(sink, request).await
    }

    /// The retry loop. Bounded by `routing.maxRetryAttempts`.
    async fn dispatch(self: &Arc<Self>, sink: Format, request: UnifiedRequest) -> GatewayResult<GatewayResponse> {
        let client_streams = request.stream.unwrap_or(false);
        let mut requested_model = request.model.clone();

        let max_attempts = self.config.routing.max_retry_attempts.max(1);
        let mut backoff = NETWORK_BACKOFF_START;
        let mut endpoint_index = 0usize;
        let mut license_retry_done = false;
        let mut override_project: Option<String> = None;
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                log::debug!("Attempt {attempt} for model '{requested_model}'");
            }

            let route = self.router.resolve_model(&requested_model).await?;

            let Some(provider) = self.providers.get(&route.provider) else {
                return Err(GatewayError::UnknownProvider(route.provider.clone()));
            };
            let provider = provider.clone();

            let mut creds = self.credentials.ensure_fresh(&provider.id).await;
            if creds.is_empty()
                && let Some(static_credential) = provider.static_credential()
            {
                creds.push(static_credential);
            }
            if creds.is_empty() {
                return Err(GatewayError::NoCredentials(provider.id.clone()));
            }

            let upstream_model = provider.resolve_alias(&route.upstream_model).to_string();

            let Some(account) = self
                .rotator
                .get_next_available(&provider.id, &upstream_model, creds.len())
            else {
                self.router.handle_rate_limit(&requested_model, None).await;

                if self.config.routing.rotate_on_429 && !route.fallbacks.is_empty() {
                    // resolve_model walks past the cooled-down primary next
                    // time around.
                    continue;
                }

                return Err(GatewayError::RateLimited(format!(
                    "All accounts for provider '{}' are cooling down",
                    provider.id
                )));
            };
            let credential = creds[account].clone();

            let upstream_streams = client_streams || provider.config.kind == ProviderKind::OpenaiWeb;

            // Build the upstream body fresh each attempt; fallbacks may have
            // changed the provider and with it the wire format.
            let wire = provider.wire_format();
            let mut wire_request = request.clone();
            wire_request.model = upstream_model.clone();
            wire_request.stream = Some(upstream_streams);

            if !provider.thinking_enabled() {
                wire_request.thinking = None;
            }

            let dialect = match wire {
                Format::Gemini => SchemaDialect::Gemini,
                _ => SchemaDialect::Standard,
            };
            for tool in &mut wire_request.tools {
                tool.parameters = normalize_schema(&tool.parameters, dialect);
            }

            let mut body = codec::transform_request(wire, &wire_request, &upstream_model);

            let project = match provider.config.kind {
                ProviderKind::Antigravity => {
                    let project = override_project
                        .clone()
                        .or_else(|| credential.project_id().map(str::to_string))
                        .or_else(|| provider.config.project_id.clone())
                        .unwrap_or_else(|| antigravity::DEFAULT_PROJECT_ID.to_string());

                    antigravity::prepare_body(&mut body, &upstream_model, &project, &self.signatures)
                        .unwrap_or(project)
                }
                ProviderKind::OpenaiWeb => {
                    openai_web::prepare_body(&mut body, &upstream_model, &self.prompts).await;
                    String::new()
                }
                _ => String::new(),
            };

            let endpoints = provider.endpoints();
            let endpoint = endpoints[endpoint_index % endpoints.len()].clone();
            let url = provider.request_url(&endpoint, &upstream_model, upstream_streams);

            let payload = match serde_json::to_vec(&body) {
                Ok(payload) => payload,
                Err(e) => return Err(GatewayError::Internal(format!("Failed to serialize request: {e}"))),
            };

            let response = match provider
                .apply_headers(self.client.post(&url), &credential)
                .body(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("Upstream request to '{}' failed: {e}", provider.id);
                    last_error = Some(GatewayError::UpstreamNetwork(e.to_string()));

                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(NETWORK_BACKOFF_MAX);
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                return self
                    .success(
                        sink,
                        &provider,
                        response,
                        &requested_model,
                        client_streams,
                        upstream_streams,
                        project,
                        endpoint,
                        account,
                    )
                    .await;
            }

            let retry_after_header = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let error_body = response.text().await.unwrap_or_default();

            match status.as_u16() {
                429 => {
                    let retry_after = parse_retry_after(retry_after_header.as_deref(), &error_body);

                    self.rotator
                        .mark_rate_limited(&provider.id, &upstream_model, account, retry_after);

                    log::info!(
                        "Rate limited on {}/{} account {account} (retry-after: {retry_after:?}ms)",
                        provider.id,
                        upstream_model
                    );

                    // Antigravity rotates endpoints before burning accounts.
                    if provider.config.kind == ProviderKind::Antigravity && endpoint_index + 1 < endpoints.len() {
                        endpoint_index += 1;
                        last_error = Some(GatewayError::RateLimited(error_body));
                        continue;
                    }

                    if self
                        .rotator
                        .are_all_rate_limited(&provider.id, &upstream_model, creds.len())
                    {
                        self.router.handle_rate_limit(&requested_model, retry_after).await;

                        if let Some(&(_, fallback)) = MODEL_FALLBACKS
                            .iter()
                            .find(|(model, _)| *model == requested_model)
                        {
                            log::info!("Falling back from '{requested_model}' to '{fallback}'");
                            requested_model = fallback.to_string();
                        } else if self.config.routing.rotate_on_429 && !route.fallbacks.is_empty() {
                            // Router-driven fallback on the next iteration.
                        } else if route.fallbacks.is_empty() {
                            return Err(GatewayError::RateLimited(if error_body.is_empty() {
                                format!("Model '{requested_model}' is rate limited on every account")
                            } else {
                                error_body
                            }));
                        } else {
                            let wait = retry_after
                                .map(Duration::from_millis)
                                .unwrap_or(MAX_RATE_LIMIT_SLEEP)
                                .min(MAX_RATE_LIMIT_SLEEP);
                            tokio::time::sleep(wait).await;
                        }
                    }

                    last_error = Some(GatewayError::RateLimited("rate limited".to_string()));
                    continue;
                }

                403 | 400
                    if provider.config.kind == ProviderKind::Antigravity
                        && antigravity::is_license_error(status.as_u16(), &error_body) =>
                {
                    if !license_retry_done {
                        log::warn!("Antigravity license error, retrying with the default project");
                        license_retry_done = true;
                        override_project = Some(antigravity::DEFAULT_PROJECT_ID.to_string());
                        continue;
                    }

                    if endpoint_index + 1 < endpoints.len() {
                        endpoint_index += 1;
                        last_error = Some(GatewayError::Upstream {
                            status: status.as_u16(),
                            body: error_body,
                        });
                        continue;
                    }

                    return Err(GatewayError::Upstream {
                        status: status.as_u16(),
                        body: error_body,
                    });
                }

                500..=599 if provider.config.kind == ProviderKind::Antigravity => {
                    log::warn!("Antigravity endpoint '{endpoint}' returned {status}, rotating");
                    endpoint_index += 1;
                    last_error = Some(GatewayError::Upstream {
                        status: status.as_u16(),
                        body: error_body,
                    });
                    continue;
                }

                _ => {
                    return Err(GatewayError::Upstream {
                        status: status.as_u16(),
                        body: error_body,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Internal("Retry budget exhausted".to_string())))
    }

    /// Turn a 2xx upstream response into the client's representation.
    #[allow(clippy::too_many_arguments)]
    async fn success(
        self: &Arc<Self>,
        sink: Format,
        provider: &Provider,
        response: reqwest::Response,
        requested_model: &str,
        client_streams: bool,
        upstream_streams: bool,
        project: String,
        endpoint: String,
        account: usize,
    ) -> GatewayResult<GatewayResponse> {
        let wire = provider.wire_format();
        let is_antigravity = provider.config.kind == ProviderKind::Antigravity;

        if !upstream_streams {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| GatewayError::UpstreamNetwork(e.to_string()))?;

            let bytes = if is_antigravity {
                let mut value: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::Internal(format!("Invalid upstream response: {e}")))?;

                antigravity::decode_response_tool_names(&mut value);
                antigravity::remember_signatures(&value, &project, &endpoint, account, &self.signatures);

                Bytes::from(serde_json::to_vec(&value).unwrap_or_default())
            } else {
                bytes
            };

            let unified = codec::parse_response(wire, &bytes)?;
            return Ok(GatewayResponse::Json(codec::transform_response(
                sink,
                &unified,
                requested_model,
            )));
        }

        if client_streams {
            return Ok(GatewayResponse::Stream(self.translate_stream(
                wire,
                sink,
                response,
                requested_model,
                is_antigravity.then(|| (project, endpoint, account)),
            )));
        }

        // Streaming upstream, non-streaming client: buffer and synthesize
        // one response envelope.
        let unified = self
            .accumulate_stream(wire, response, is_antigravity.then(|| (project, endpoint, account)))
            .await?;

        Ok(GatewayResponse::Json(codec::transform_response(
            sink,
            &unified,
            requested_model,
        )))
    }

    /// Frame-by-frame stream translation. Frames produced by one upstream
    /// frame are flushed before the next upstream frame is read.
    fn translate_stream(
        self: &Arc<Self>,
        wire: Format,
        sink: Format,
        response: reqwest::Response,
        requested_model: &str,
        antigravity_context: Option<(String, String, usize)>,
    ) -> BoxStream<'static, SseFrame> {
        struct StreamState {
            bytes: BoxStream<'static, reqwest::Result<Bytes>>,
            splitter: SseFrameSplitter,
            parser: StreamParser,
            emitter: StreamEmitter,
            pending: VecDeque<SseFrame>,
            gateway: Arc<Gateway>,
            antigravity_context: Option<(String, String, usize)>,
            done: bool,
        }

        impl StreamState {
            fn translate(&mut self, frame: &SseFrame) {
                match self.parser.parse(frame) {
                    Ok(chunks) => {
                        for mut chunk in chunks {
                            self.rewrite(&mut chunk);
                            self.pending.extend(self.emitter.emit(&chunk));
                        }
                    }
                    Err(e) => log::warn!("Dropping untranslatable frame: {e}"),
                }
            }

            /// Antigravity post-processing on unified chunks: decode tool
            /// names and persist signatures flowing back.
            fn rewrite(&mut self, chunk: &mut crate::messages::unified::UnifiedChunk) {
                let Some((project, endpoint, account)) = &self.antigravity_context else {
                    return;
                };

                if let Some(delta) = &mut chunk.delta {
                    if let Some(name) = &delta.tool_name {
                        delta.tool_name = Some(decode_tool_name(name));
                    }

                    if chunk.kind == ChunkKind::Thinking
                        && let Some(signature) = &delta.signature
                    {
                        antigravity::remember_signatures(
                            &serde_json::json!({
                                "contents": [{"parts": [{"thought_signature": signature}]}]
                            }),
                            project,
                            endpoint,
                            *account,
                            &self.gateway.signatures,
                        );
                    }
                }
            }

            fn finish(&mut self) {
                if let Some(frame) = self.splitter.finish() {
                    self.translate(&frame);
                }
                self.pending.extend(self.emitter.finish());
                self.done = true;
            }
        }

        let state = StreamState {
            bytes: response.bytes_stream().boxed(),
            splitter: SseFrameSplitter::default(),
            parser: StreamParser::new(wire),
            emitter: StreamEmitter::new(sink, requested_model),
            pending: VecDeque::new(),
            gateway: Arc::clone(self),
            antigravity_context,
            done: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.pending.pop_front() {
                    return Some((frame, state));
                }

                if state.done {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(bytes)) => {
                        for frame in state.splitter.push(&bytes) {
                            state.translate(&frame);
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Upstream stream error: {e}");
                        let error = crate::messages::unified::UnifiedChunk {
                            kind: ChunkKind::Error,
                            error: Some(e.to_string()),
                            ..Default::default()
                        };
                        let frames = state.emitter.emit(&error);
                        state.pending.extend(frames);
                        state.done = true;
                    }
                    None => state.finish(),
                }
            }
        })
        .boxed()
    }

    /// Buffer a streamed upstream reply into one unified response.
    async fn accumulate_stream(
        self: &Arc<Self>,
        wire: Format,
        response: reqwest::Response,
        antigravity_context: Option<(String, String, usize)>,
    ) -> GatewayResult<crate::messages::unified::UnifiedResponse> {
        let mut bytes_stream = response.bytes_stream().boxed();
        let mut splitter = SseFrameSplitter::default();
        let mut parser = StreamParser::new(wire);
        let mut accumulator = ResponseAccumulator::new();

        let mut handle_frame = |frame: &SseFrame,
                                parser: &mut StreamParser,
                                accumulator: &mut ResponseAccumulator|
         -> GatewayResult<()> {
            for mut chunk in parser.parse(frame)? {
                if antigravity_context.is_some()
                    && let Some(delta) = &mut chunk.delta
                    && let Some(name) = &delta.tool_name
                {
                    delta.tool_name = Some(decode_tool_name(name));
                }
                accumulator.push(&chunk);
            }
            Ok(())
        };

        while let Some(chunk) = bytes_stream.next().await {
            let bytes = chunk.map_err(|e| GatewayError::UpstreamNetwork(e.to_string()))?;

            for frame in splitter.push(&bytes) {
                handle_frame(&frame, &mut parser, &mut accumulator)?;
            }
        }

        if let Some(frame) = splitter.finish() {
            handle_frame(&frame, &mut parser, &mut accumulator)?;
        }

        if let Some(error) = accumulator.error() {
            return Err(GatewayError::Upstream {
                status: 502,
                body: error.to_string(),
            });
        }

        let response = accumulator.into_response();

        if let Some((project, endpoint, account)) = antigravity_context {
            for part in &response.content {
                if let crate::messages::unified::ContentPart::Thinking {
                    signature: Some(signature),
                    ..
                } = part
                {
                    antigravity::remember_signatures(
                        &serde_json::json!({
                            "contents": [{"parts": [{"thought_signature": signature}]}]
                        }),
                        &project,
                        &endpoint,
                        account,
                        &self.signatures,
                    );
                }
            }
        }

        Ok(response)
    }

    /// Amp upstream-proxy mode: rewrite the model and forward the original
    /// body untranslated.
    async fn forward_amp(
        self: &Arc<Self>,
        body: Bytes,
        request: &UnifiedRequest,
        mapped_model: &str,
    ) -> GatewayResult<GatewayResponse> {
        let Some(upstream_url) = self.config.amp.upstream_url.clone() else {
            return Err(GatewayError::Internal("amp.upstreamUrl is not configured".to_string()));
        };

        let mut value: Value = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid request body: {e}")))?;

        if let Some(object) = value.as_object_mut() {
            object.insert("model".to_string(), Value::String(mapped_model.to_string()));
        }

        let mut builder = self.client.post(&upstream_url).json(&value);

        if let Some(key) = &self.config.amp.upstream_api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamNetwork(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        if request.stream.unwrap_or(false) {
            let frames = futures::stream::unfold(
                (response.bytes_stream().boxed(), SseFrameSplitter::default(), VecDeque::new()),
                |(mut bytes, mut splitter, mut pending): (
                    BoxStream<'static, reqwest::Result<Bytes>>,
                    SseFrameSplitter,
                    VecDeque<SseFrame>,
                )| async move {
                    loop {
                        if let Some(frame) = pending.pop_front() {
                            return Some((frame, (bytes, splitter, pending)));
                        }

                        match bytes.next().await? {
                            Ok(chunk) => pending.extend(splitter.push(&chunk)),
                            Err(e) => {
                                log::warn!("Amp upstream stream error: {e}");
                                return None;
                            }
                        }
                    }
                },
            );

            return Ok(GatewayResponse::Stream(frames.boxed()));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream {
                status: 502,
                body: format!("Non-JSON upstream response: {e}"),
            })?;

        Ok(GatewayResponse::Json(value))
    }
}
