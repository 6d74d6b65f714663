//! Google Gemini generateContent ↔ unified codec.
//!
//! Gemini streams complete `functionCall` parts rather than incremental
//! argument fragments, so the parser emits a start/fragment/stop triple per
//! call and the emitter buffers fragments until the block closes.

use serde_json::Value;
use std::collections::HashMap;

use crate::{
    error::GatewayError,
    messages::{
        gemini::{
            Blob, Candidate, Content, FileData, FinishReason as WireFinish, FunctionCall, FunctionCallingConfig,
            FunctionDeclaration, FunctionResponse, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
            Part, ThinkingConfig as WireThinking, Tool, ToolConfig, UsageMetadata,
        },
        unified::{
            ChunkKind, ContentPart, ImageSource, StopReason, ThinkingConfig, ToolArguments, ToolResultContent,
            UnifiedChunk, UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool,
            UnifiedToolChoice, UnifiedUsage,
        },
    },
};

use super::SseFrame;

/// Parse a Gemini generateContent request into the unified representation.
pub fn parse_request(bytes: &[u8]) -> Result<UnifiedRequest, GatewayError> {
    let request: GenerateContentRequest = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid generateContent request: {e}")))?;

    let system = request.system_instruction.map(|content| {
        content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    });

    let mut messages = Vec::new();

    for content in request.contents {
        parse_content(content, &mut messages);
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .flat_map(|tool| tool.function_declarations.unwrap_or_default())
        .map(|declaration| UnifiedTool {
            name: declaration.name,
            description: declaration.description,
            parameters: declaration.parameters.unwrap_or(Value::Object(Default::default())),
        })
        .collect();

    let tool_choice = request.tool_config.map(|config| {
        let calling = config.function_calling_config;
        match calling.mode.as_str() {
            "NONE" => UnifiedToolChoice::None,
            "ANY" => match calling.allowed_function_names.as_deref() {
                Some([name]) => UnifiedToolChoice::Tool { name: name.clone() },
                _ => UnifiedToolChoice::Required,
            },
            _ => UnifiedToolChoice::Auto,
        }
    });

    let generation = request.generation_config.unwrap_or_default();

    let thinking = generation.thinking_config.map(|config| ThinkingConfig {
        enabled: config.thinking_budget != Some(0),
        budget: config.thinking_budget.and_then(|b| u32::try_from(b).ok()),
        include_thoughts: config.include_thoughts,
        ..Default::default()
    });

    Ok(UnifiedRequest {
        model: String::new(), // Gemini carries the model in the URL, not the body.
        messages,
        system,
        system_blocks: None,
        tools,
        tool_choice,
        max_tokens: generation.max_output_tokens,
        temperature: generation.temperature,
        top_p: generation.top_p,
        top_k: generation.top_k,
        stop_sequences: generation.stop_sequences,
        thinking,
        metadata: None,
        stream: None,
    })
}

fn parse_content(content: Content, out: &mut Vec<UnifiedMessage>) {
    let role = match content.role.as_deref() {
        Some("model") => UnifiedRole::Assistant,
        _ => UnifiedRole::User,
    };

    let mut pending = Vec::new();

    for part in content.parts {
        if let Some(response) = part.function_response {
            if !pending.is_empty() {
                out.push(UnifiedMessage {
                    role,
                    parts: std::mem::take(&mut pending),
                });
            }

            let text = match &response.response {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            out.push(UnifiedMessage {
                role: UnifiedRole::Tool,
                parts: vec![ContentPart::ToolResult {
                    tool_call_id: response.id.unwrap_or(response.name),
                    content: ToolResultContent::Text(text),
                    is_error: None,
                    cache_control: None,
                }],
            });
            continue;
        }

        if let Some(unified) = parse_part(part) {
            pending.push(unified);
        }
    }

    if !pending.is_empty() {
        out.push(UnifiedMessage { role, parts: pending });
    }
}

fn parse_part(part: Part) -> Option<ContentPart> {
    if let Some(call) = part.function_call {
        return Some(ContentPart::ToolCall {
            id: call
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
            name: call.name,
            arguments: ToolArguments::Json(call.args),
            cache_control: None,
        });
    }

    if let Some(blob) = part.inline_data {
        return Some(ContentPart::Image {
            source: ImageSource::Base64 {
                media_type: blob.mime_type,
                data: blob.data,
            },
            cache_control: None,
        });
    }

    if let Some(file) = part.file_data {
        return Some(ContentPart::Image {
            source: ImageSource::Url { url: file.file_uri },
            cache_control: None,
        });
    }

    let text = part.text?;

    if part.thought {
        return Some(ContentPart::Thinking {
            text,
            signature: part.thought_signature,
            redacted: false,
            cache_control: None,
        });
    }

    Some(ContentPart::text(text))
}

/// Emit a unified request as a Gemini generateContent body.
pub fn transform_request(request: &UnifiedRequest, _model: &str) -> Value {
    // functionResponse parts need the function name; recover it from the
    // tool call that carries the same id.
    let call_names: HashMap<&str, &str> = request
        .messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|part| match part {
            ContentPart::ToolCall { id, name, .. } => Some((id.as_str(), name.as_str())),
            _ => None,
        })
        .collect();

    let mut contents: Vec<Content> = Vec::new();

    for message in &request.messages {
        let role = match message.role {
            UnifiedRole::Assistant => "model",
            UnifiedRole::User | UnifiedRole::Tool => "user",
        };

        let parts: Vec<Part> = message
            .parts
            .iter()
            .filter_map(|part| transform_part(part, &call_names))
            .collect();

        if parts.is_empty() {
            continue;
        }

        // Merge runs of same-role turns; Gemini expects alternation.
        if let Some(last) = contents.last_mut()
            && last.role.as_deref() == Some(role)
        {
            last.parts.extend(parts);
            continue;
        }

        contents.push(Content {
            role: Some(role.to_string()),
            parts,
        });
    }

    let system_instruction = request.system.clone().filter(|s| !s.is_empty()).map(|text| Content {
        role: None,
        parts: vec![Part::text(text)],
    });

    let thinking_config = request.thinking.as_ref().map(|config| WireThinking {
        thinking_budget: Some(if config.enabled {
            config.budget.map(i64::from).unwrap_or(-1)
        } else {
            0
        }),
        include_thoughts: config.include_thoughts,
    });

    let generation_config = Some(GenerationConfig {
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences.clone(),
        thinking_config,
    });

    let tools = (!request.tools.is_empty()).then(|| {
        vec![Tool {
            function_declarations: Some(
                request
                    .tools
                    .iter()
                    .map(|tool| FunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(tool.parameters.clone()),
                    })
                    .collect(),
            ),
        }]
    });

    let tool_config = request.tool_choice.as_ref().map(|choice| ToolConfig {
        function_calling_config: match choice {
            UnifiedToolChoice::Auto => FunctionCallingConfig {
                mode: "AUTO".to_string(),
                allowed_function_names: None,
            },
            UnifiedToolChoice::None => FunctionCallingConfig {
                mode: "NONE".to_string(),
                allowed_function_names: None,
            },
            UnifiedToolChoice::Required => FunctionCallingConfig {
                mode: "ANY".to_string(),
                allowed_function_names: None,
            },
            UnifiedToolChoice::Tool { name } => FunctionCallingConfig {
                mode: "ANY".to_string(),
                allowed_function_names: Some(vec![name.clone()]),
            },
        },
    });

    let body = GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config,
        generation_config,
    };

    serde_json::to_value(body).unwrap_or_default()
}

fn transform_part(part: &ContentPart, call_names: &HashMap<&str, &str>) -> Option<Part> {
    match part {
        ContentPart::Text { text, .. } => Some(Part::text(text.clone())),
        ContentPart::Thinking {
            text,
            signature,
            redacted,
            ..
        } => {
            if *redacted {
                return None;
            }
            Some(Part {
                text: Some(text.clone()),
                thought: true,
                thought_signature: signature.clone(),
                ..Default::default()
            })
        }
        ContentPart::Image { source, .. } => Some(match source {
            ImageSource::Base64 { media_type, data } => Part {
                inline_data: Some(Blob {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            },
            ImageSource::Url { url } => Part {
                file_data: Some(FileData {
                    // MIME type is not recoverable from a bare URL.
                    mime_type: "application/octet-stream".to_string(),
                    file_uri: url.clone(),
                }),
                ..Default::default()
            },
        }),
        ContentPart::ToolCall { id, name, arguments, .. } => Some(Part {
            function_call: Some(FunctionCall {
                id: Some(id.clone()),
                name: name.clone(),
                args: arguments.as_json(),
            }),
            ..Default::default()
        }),
        ContentPart::ToolResult {
            tool_call_id, content, ..
        } => {
            let name = call_names
                .get(tool_call_id.as_str())
                .map(|&name| name.to_string())
                .unwrap_or_else(|| tool_call_id.clone());

            Some(Part {
                function_response: Some(FunctionResponse {
                    id: Some(tool_call_id.clone()),
                    name,
                    response: serde_json::json!({ "result": content.joined_text() }),
                }),
                ..Default::default()
            })
        }
    }
}

/// Parse a non-streaming Gemini response.
pub fn parse_response(bytes: &[u8]) -> Result<UnifiedResponse, GatewayError> {
    let response: GenerateContentResponse = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid generateContent response: {e}")))?;

    let mut content = Vec::new();
    let mut stop_reason = None;
    let mut has_function_call = false;

    if let Some(candidate) = response.candidates.into_iter().next() {
        if let Some(body) = candidate.content {
            for part in body.parts {
                if part.function_call.is_some() {
                    has_function_call = true;
                }
                if let Some(unified) = parse_part(part) {
                    content.push(unified);
                }
            }
        }

        stop_reason = candidate.finish_reason.and_then(finish_to_stop);
    }

    // A function call wins over whatever finishReason said.
    if has_function_call {
        stop_reason = Some(StopReason::ToolUse);
    }

    Ok(UnifiedResponse {
        id: response
            .response_id
            .unwrap_or_else(|| format!("gen_{}", uuid::Uuid::new_v4().simple())),
        model: response.model_version,
        content,
        stop_reason,
        usage: response.usage_metadata.map(usage_to_unified),
    })
}

fn finish_to_stop(reason: WireFinish) -> Option<StopReason> {
    match reason {
        WireFinish::Stop => Some(StopReason::EndTurn),
        WireFinish::MaxTokens => Some(StopReason::MaxTokens),
        WireFinish::Safety | WireFinish::Blocklist | WireFinish::ProhibitedContent | WireFinish::Spii => {
            Some(StopReason::ContentFilter)
        }
        WireFinish::MalformedFunctionCall => None,
        WireFinish::Other(other) => {
            log::warn!("Unknown Gemini finish reason: {other}");
            None
        }
    }
}

fn stop_to_finish(reason: StopReason) -> WireFinish {
    match reason {
        StopReason::EndTurn | StopReason::ToolUse | StopReason::StopSequence => WireFinish::Stop,
        StopReason::MaxTokens => WireFinish::MaxTokens,
        StopReason::ContentFilter => WireFinish::Safety,
        StopReason::Error => WireFinish::Other("ERROR".to_string()),
    }
}

fn usage_to_unified(usage: UsageMetadata) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
        thinking_tokens: usage.thoughts_token_count.filter(|&t| t > 0),
        cached_tokens: usage.cached_content_token_count.filter(|&t| t > 0),
        credits: None,
    }
}

fn unified_to_usage(usage: &UnifiedUsage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: usage.input_tokens,
        candidates_token_count: usage.output_tokens,
        total_token_count: Some(usage.total()),
        thoughts_token_count: usage.thinking_tokens,
        cached_content_token_count: usage.cached_tokens,
    }
}

/// Emit a unified response as a Gemini generateContent body.
pub fn transform_response(response: &UnifiedResponse, model: &str) -> Value {
    let call_names = HashMap::new();
    let parts: Vec<Part> = response
        .content
        .iter()
        .filter_map(|part| transform_part(part, &call_names))
        .collect();

    let body = GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some("model".to_string()),
                parts,
            }),
            finish_reason: Some(stop_to_finish(response.stop_reason.unwrap_or(StopReason::EndTurn))),
            index: Some(0),
        }],
        usage_metadata: response.usage.as_ref().map(unified_to_usage),
        model_version: Some(model.to_string()),
        response_id: Some(response.id.clone()),
    };

    serde_json::to_value(body).unwrap_or_default()
}

/// Stateful parser for Gemini streamed candidates.
#[derive(Default)]
pub struct GeminiStreamParser {
    next_block: u32,
    text_block: Option<u32>,
    thinking_block: Option<u32>,
    saw_function_call: bool,
    usage: Option<UnifiedUsage>,
}

impl GeminiStreamParser {
    /// Translate one upstream frame into unified chunks.
    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedChunk>, GatewayError> {
        let Ok(response) = sonic_rs::from_str::<GenerateContentResponse>(&frame.data) else {
            log::warn!("Failed to parse Gemini streaming chunk, skipping frame");
            return Ok(Vec::new());
        };

        let mut out = Vec::new();

        if let Some(usage) = response.usage_metadata {
            let unified = usage_to_unified(usage);
            self.usage = Some(unified);
            out.push(UnifiedChunk::usage(unified));
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            return Ok(out);
        };

        if let Some(content) = candidate.content {
            for part in content.parts {
                self.parse_stream_part(part, &mut out);
            }
        }

        if let Some(finish) = candidate.finish_reason {
            let stop = if self.saw_function_call {
                StopReason::ToolUse
            } else {
                finish_to_stop(finish).unwrap_or(StopReason::EndTurn)
            };

            let mut done = UnifiedChunk::done(stop);
            done.usage = self.usage;
            out.push(done);
        }

        if let Some(model) = response.model_version
            && let Some(first) = out.first_mut()
        {
            first.model = Some(model);
        }

        Ok(out)
    }

    fn parse_stream_part(&mut self, part: Part, out: &mut Vec<UnifiedChunk>) {
        if let Some(call) = part.function_call {
            self.saw_function_call = true;

            let index = self.next_block;
            self.next_block += 1;

            let id = call
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));

            // The wire carries complete calls; expand into the unified
            // start / fragment / stop shape so every sink sees one grammar.
            out.push(UnifiedChunk::tool_call_start(index, id, call.name));
            out.push(UnifiedChunk::tool_call_fragment(
                index,
                serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string()),
            ));
            out.push(UnifiedChunk::block_stop(index));
            return;
        }

        let Some(text) = part.text else { return };

        if part.thought {
            let index = *self.thinking_block.get_or_insert_with(|| {
                let index = self.next_block;
                self.next_block += 1;
                index
            });

            if let Some(signature) = part.thought_signature {
                let mut chunk = UnifiedChunk::thinking_signature(index, signature);
                if let Some(delta) = &mut chunk.delta {
                    delta.text = Some(text);
                }
                out.push(chunk);
            } else {
                out.push(UnifiedChunk::thinking(index, text));
            }
            return;
        }

        let index = *self.text_block.get_or_insert_with(|| {
            let index = self.next_block;
            self.next_block += 1;
            index
        });
        out.push(UnifiedChunk::content(index, text));
    }
}

/// Pending tool call being reassembled by the emitter.
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful emitter producing Gemini streaming frames.
///
/// Tool-argument fragments are buffered per block and emitted as one
/// complete `functionCall` part when the block closes; this wire has no
/// incremental call representation.
pub struct GeminiStreamEmitter {
    model: String,
    pending_calls: HashMap<u32, PendingCall>,
    saw_function_call: bool,
    usage: Option<UnifiedUsage>,
    finished: bool,
}

impl GeminiStreamEmitter {
    /// A fresh emitter for one client connection.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            pending_calls: HashMap::new(),
            saw_function_call: false,
            usage: None,
            finished: false,
        }
    }

    /// Translate one unified chunk into Gemini frames.
    pub fn emit(&mut self, chunk: &UnifiedChunk) -> Vec<SseFrame> {
        match chunk.kind {
            ChunkKind::Content => {
                let text = chunk.delta.as_ref().and_then(|d| d.text.clone()).unwrap_or_default();
                vec![self.frame(vec![Part::text(text)], None)]
            }

            ChunkKind::Thinking => {
                let Some(delta) = &chunk.delta else { return Vec::new() };
                let part = Part {
                    text: Some(delta.text.clone().unwrap_or_default()),
                    thought: true,
                    thought_signature: delta.signature.clone(),
                    ..Default::default()
                };
                vec![self.frame(vec![part], None)]
            }

            ChunkKind::ToolCall => {
                let Some(delta) = &chunk.delta else { return Vec::new() };
                let block = chunk.block_index.unwrap_or(0);

                if let Some(id) = &delta.tool_call_id {
                    self.pending_calls.insert(
                        block,
                        PendingCall {
                            id: id.clone(),
                            name: delta.tool_name.clone().unwrap_or_default(),
                            arguments: delta.partial_json.clone().unwrap_or_default(),
                        },
                    );
                } else if let Some(partial) = &delta.partial_json
                    && let Some(pending) = self.pending_calls.get_mut(&block)
                {
                    pending.arguments.push_str(partial);
                }

                Vec::new()
            }

            ChunkKind::BlockStop => {
                let Some(block) = chunk.block_index else { return Vec::new() };
                match self.flush_call(block) {
                    Some(part) => vec![self.frame(vec![part], None)],
                    None => Vec::new(),
                }
            }

            ChunkKind::Usage => {
                self.usage = chunk.usage.or(self.usage);
                Vec::new()
            }

            ChunkKind::Done => {
                if self.finished {
                    return Vec::new();
                }
                self.finished = true;

                // Flush calls whose block_stop never arrived.
                let blocks: Vec<u32> = self.pending_calls.keys().copied().collect();
                let mut parts = Vec::new();
                for block in blocks {
                    if let Some(part) = self.flush_call(block) {
                        parts.push(part);
                    }
                }

                let stop = chunk.stop_reason.unwrap_or(StopReason::EndTurn);
                let usage = chunk.usage.or(self.usage);

                let body = GenerateContentResponse {
                    candidates: vec![Candidate {
                        content: (!parts.is_empty()).then(|| Content {
                            role: Some("model".to_string()),
                            parts,
                        }),
                        finish_reason: Some(stop_to_finish(stop)),
                        index: Some(0),
                    }],
                    usage_metadata: usage.as_ref().map(unified_to_usage),
                    model_version: Some(self.model.clone()),
                    response_id: None,
                };

                vec![SseFrame::data(sonic_rs::to_string(&body).unwrap_or_default())]
            }

            ChunkKind::Error => {
                self.finished = true;
                let message = chunk.error.clone().unwrap_or_else(|| "stream error".to_string());
                vec![SseFrame::data(
                    serde_json::json!({ "error": { "message": message } }).to_string(),
                )]
            }

            ChunkKind::ToolResult => Vec::new(),
        }
    }

    /// Terminate the stream if the upstream never sent a done chunk.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        let stop = if self.saw_function_call {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        self.emit(&UnifiedChunk::done(stop))
    }

    fn flush_call(&mut self, block: u32) -> Option<Part> {
        let pending = self.pending_calls.remove(&block)?;
        self.saw_function_call = true;

        let args: Value =
            serde_json::from_str(&pending.arguments).unwrap_or(Value::Object(Default::default()));

        Some(Part {
            function_call: Some(FunctionCall {
                id: Some(pending.id),
                name: pending.name,
                args,
            }),
            ..Default::default()
        })
    }

    fn frame(&self, parts: Vec<Part>, finish: Option<WireFinish>) -> SseFrame {
        let body = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: Some(self.model.clone()),
            response_id: None,
        };

        SseFrame::data(sonic_rs::to_string(&body).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_contents_and_function_responses() {
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "weather?"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"id": "call_1", "name": "get_weather", "args": {"loc": "NYC"}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"id": "call_1", "name": "get_weather", "response": {"result": "sunny"}}}
                ]}
            ],
            "systemInstruction": {"parts": [{"text": "be brief"}]},
            "generationConfig": {"maxOutputTokens": 256, "temperature": 0.2}
        });

        let request = parse_request(body.to_string().as_bytes()).unwrap();

        assert_eq!(request.system.as_deref(), Some("be brief"));
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].role, UnifiedRole::Assistant);
        assert_eq!(request.messages[2].role, UnifiedRole::Tool);
    }

    #[test]
    fn finish_reason_mapping() {
        for (wire, expected) in [
            ("STOP", Some(StopReason::EndTurn)),
            ("MAX_TOKENS", Some(StopReason::MaxTokens)),
            ("SAFETY", Some(StopReason::ContentFilter)),
            ("BLOCKLIST", Some(StopReason::ContentFilter)),
            ("PROHIBITED_CONTENT", Some(StopReason::ContentFilter)),
            ("SPII", Some(StopReason::ContentFilter)),
            ("SOMETHING_ELSE", None),
        ] {
            let body = json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "x"}]}, "finishReason": wire}]
            });
            let response = parse_response(body.to_string().as_bytes()).unwrap();
            assert_eq!(response.stop_reason, expected, "finishReason {wire}");
        }
    }

    #[test]
    fn function_call_forces_tool_use() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {}}}
                ]},
                "finishReason": "STOP"
            }]
        });

        let response = parse_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn usage_metadata_mapping() {
        let body = json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "x"}]}, "finishReason": "STOP"}],
            "usageMetadata": {
                "promptTokenCount": 11,
                "candidatesTokenCount": 22,
                "thoughtsTokenCount": 5,
                "cachedContentTokenCount": 3
            }
        });

        let response = parse_response(body.to_string().as_bytes()).unwrap();
        let usage = response.usage.unwrap();

        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 22);
        assert_eq!(usage.thinking_tokens, Some(5));
        assert_eq!(usage.cached_tokens, Some(3));
    }

    #[test]
    fn thought_parts_round_trip() {
        let body = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"text": "pondering", "thought": true, "thoughtSignature": "sig-1"},
                    {"text": "answer"}
                ]}
            ]
        });

        let request = parse_request(body.to_string().as_bytes()).unwrap();
        let wire = transform_request(&request, "gemini-2.5-pro");

        let parts = wire["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["thought"], true);
        assert_eq!(parts[0]["thoughtSignature"], "sig-1");
        assert!(parts[1].get("thought").is_none());
    }

    #[test]
    fn stream_expands_function_call_to_block_triple() {
        let mut parser = GeminiStreamParser::default();

        let frame = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"id": "call_1", "name": "get_weather", "args": {"loc": "NYC"}}}
                ]},
                "finishReason": "STOP"
            }]
        });

        let chunks = parser.parse(&SseFrame::data(frame.to_string())).unwrap();
        let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            [ChunkKind::ToolCall, ChunkKind::ToolCall, ChunkKind::BlockStop, ChunkKind::Done]
        );
        assert_eq!(chunks[3].stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn emitter_buffers_fragments_until_block_stop() {
        let mut emitter = GeminiStreamEmitter::new("gemini-2.5-pro");

        assert!(emitter.emit(&UnifiedChunk::tool_call_start(0, "call_1", "get_weather")).is_empty());
        assert!(emitter.emit(&UnifiedChunk::tool_call_fragment(0, "{\"loc\":")).is_empty());
        assert!(emitter.emit(&UnifiedChunk::tool_call_fragment(0, "\"NYC\"}")).is_empty());

        let frames = emitter.emit(&UnifiedChunk::block_stop(0));
        assert_eq!(frames.len(), 1);

        let value: Value = serde_json::from_str(&frames[0].data).unwrap();
        let call = &value["candidates"][0]["content"]["parts"][0]["functionCall"];
        assert_eq!(call["name"], "get_weather");
        assert_eq!(call["args"]["loc"], "NYC");
    }
}
