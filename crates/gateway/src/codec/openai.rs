//! OpenAI Chat Completions ↔ unified codec.

use serde_json::Value;
use std::collections::HashMap;

use crate::{
    error::GatewayError,
    messages::{
        openai::{
            ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole,
            ContentPart as WirePart, FinishReason, FunctionCallDelta, GlmThinking, ImageUrl, MessageContent,
            MessageDelta, StopSequences, ToolCallDelta, ToolChoice, ToolKind, Usage,
        },
        unified::{
            ChunkKind, ContentPart, ImageSource, StopReason, ThinkingConfig, ThinkingEffort, ToolArguments,
            ToolResultContent, UnifiedChunk, UnifiedMessage, UnifiedMetadata, UnifiedRequest, UnifiedResponse,
            UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
        },
    },
};

use super::SseFrame;

/// Model families whose requests need the reasoning-model rewrites:
/// `max_completion_tokens`, no sampling knobs, `developer` system role.
pub(crate) fn is_reasoning_model(model: &str) -> bool {
    ["o1", "o3", "o4", "gpt-5"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

fn is_glm_model(model: &str) -> bool {
    model.starts_with("glm-")
}

/// Parse an OpenAI Chat Completions request into the unified representation.
pub fn parse_request(bytes: &[u8]) -> Result<UnifiedRequest, GatewayError> {
    let request: ChatCompletionRequest = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid chat completion request: {e}")))?;

    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_parts.push(content.joined_text());
                }
            }
            ChatRole::Tool => {
                let tool_call_id = message.tool_call_id.unwrap_or_default();
                let text = message.content.map(|c| c.joined_text()).unwrap_or_default();

                messages.push(UnifiedMessage {
                    role: UnifiedRole::Tool,
                    parts: vec![ContentPart::ToolResult {
                        tool_call_id,
                        content: ToolResultContent::Text(text),
                        is_error: None,
                        cache_control: None,
                    }],
                });
            }
            ChatRole::User => {
                messages.push(UnifiedMessage {
                    role: UnifiedRole::User,
                    parts: parse_content_parts(message.content),
                });
            }
            ChatRole::Assistant => {
                let mut parts = Vec::new();

                if let Some(reasoning) = message.reasoning_content
                    && !reasoning.is_empty()
                {
                    parts.push(ContentPart::Thinking {
                        text: reasoning,
                        signature: None,
                        redacted: false,
                        cache_control: None,
                    });
                }

                parts.extend(parse_content_parts(message.content));

                for call in message.tool_calls.unwrap_or_default() {
                    parts.push(ContentPart::ToolCall {
                        id: call.id,
                        name: call.function.name,
                        arguments: ToolArguments::Raw(call.function.arguments),
                        cache_control: None,
                    });
                }

                messages.push(UnifiedMessage {
                    role: UnifiedRole::Assistant,
                    parts,
                });
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };

    let thinking = parse_thinking(request.reasoning_effort.as_deref(), request.thinking.as_ref());

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| UnifiedTool {
            name: tool.function.name,
            description: tool.function.description,
            parameters: tool.function.parameters,
        })
        .collect();

    Ok(UnifiedRequest {
        model: request.model,
        messages,
        system,
        system_blocks: None,
        tools,
        tool_choice: request.tool_choice.map(parse_tool_choice),
        max_tokens: request.max_tokens.or(request.max_completion_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop.map(StopSequences::into_vec),
        thinking,
        metadata: request.user.map(|user_id| UnifiedMetadata {
            user_id: Some(user_id),
            session_id: None,
        }),
        stream: request.stream,
    })
}

fn parse_content_parts(content: Option<MessageContent>) -> Vec<ContentPart> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![ContentPart::text(text)]
            }
        }
        Some(MessageContent::Parts(parts)) => parts
            .into_iter()
            .map(|part| match part {
                WirePart::Text { text } => ContentPart::text(text),
                WirePart::ImageUrl { image_url } => ContentPart::Image {
                    source: parse_image_url(&image_url.url),
                    cache_control: None,
                },
            })
            .collect(),
    }
}

fn parse_image_url(url: &str) -> ImageSource {
    // data:<mime>;base64,<payload>
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((mime, data)) = rest.split_once(";base64,")
    {
        return ImageSource::Base64 {
            media_type: mime.to_string(),
            data: data.to_string(),
        };
    }

    ImageSource::Url { url: url.to_string() }
}

fn parse_thinking(reasoning_effort: Option<&str>, glm: Option<&GlmThinking>) -> Option<ThinkingConfig> {
    if let Some(glm) = glm {
        return Some(ThinkingConfig {
            enabled: glm.kind == "enabled",
            preserve_context: glm.clear_thinking.map(|clear| !clear),
            ..Default::default()
        });
    }

    let effort = match reasoning_effort? {
        "none" => ThinkingEffort::None,
        "low" => ThinkingEffort::Low,
        "medium" => ThinkingEffort::Medium,
        _ => ThinkingEffort::High,
    };

    Some(ThinkingConfig {
        enabled: effort != ThinkingEffort::None,
        effort: Some(effort),
        ..Default::default()
    })
}

fn parse_tool_choice(choice: ToolChoice) -> UnifiedToolChoice {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "none" => UnifiedToolChoice::None,
            "required" => UnifiedToolChoice::Required,
            _ => UnifiedToolChoice::Auto,
        },
        ToolChoice::Function { function, .. } => UnifiedToolChoice::Tool { name: function.name },
    }
}

/// Emit a unified request as an OpenAI Chat Completions body.
pub fn transform_request(request: &UnifiedRequest, model: &str) -> Value {
    let reasoning = is_reasoning_model(model);
    let mut messages = Vec::new();

    if let Some(system) = collect_system_text(request) {
        let role = if reasoning { ChatRole::Developer } else { ChatRole::System };

        messages.push(ChatMessage {
            role,
            content: Some(MessageContent::Text(system)),
            tool_calls: None,
            tool_call_id: None,
            reasoning_content: None,
        });
    }

    for message in &request.messages {
        messages.extend(transform_message(message));
    }

    let mut body = ChatCompletionRequest {
        model: model.to_string(),
        messages,
        stream: request.stream,
        temperature: if reasoning { None } else { request.temperature },
        top_p: if reasoning { None } else { request.top_p },
        stop: request.stop_sequences.clone().map(StopSequences::Many),
        user: request.metadata.as_ref().and_then(|m| m.user_id.clone()),
        ..Default::default()
    };

    if reasoning {
        body.max_completion_tokens = request.max_tokens;
        body.reasoning_effort = request
            .thinking
            .as_ref()
            .and_then(|t| t.effort)
            .map(|e| e.as_str().to_string());
    } else {
        body.max_tokens = request.max_tokens;
    }

    if is_glm_model(model)
        && let Some(thinking) = &request.thinking
    {
        body.thinking = Some(GlmThinking {
            kind: if thinking.enabled { "enabled" } else { "disabled" }.to_string(),
            clear_thinking: thinking.preserve_context.map(|preserve| !preserve),
        });
    }

    if !request.tools.is_empty() {
        body.tools = Some(
            request
                .tools
                .iter()
                .map(|tool| crate::messages::openai::Tool {
                    kind: ToolKind::Function,
                    function: crate::messages::openai::FunctionDef {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect(),
        );
    }

    body.tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        UnifiedToolChoice::Auto => ToolChoice::Mode("auto".to_string()),
        UnifiedToolChoice::None => ToolChoice::Mode("none".to_string()),
        UnifiedToolChoice::Required => ToolChoice::Mode("required".to_string()),
        UnifiedToolChoice::Tool { name } => ToolChoice::Function {
            kind: ToolKind::Function,
            function: crate::messages::openai::FunctionName { name: name.clone() },
        },
    });

    serde_json::to_value(body).unwrap_or_default()
}

fn collect_system_text(request: &UnifiedRequest) -> Option<String> {
    if let Some(blocks) = &request.system_blocks {
        let joined = blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n");
        if !joined.is_empty() {
            return Some(joined);
        }
    }

    request.system.clone().filter(|s| !s.is_empty())
}

fn transform_message(message: &UnifiedMessage) -> Vec<ChatMessage> {
    match message.role {
        UnifiedRole::Tool => message
            .parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult {
                    tool_call_id, content, ..
                } => Some(ChatMessage {
                    role: ChatRole::Tool,
                    content: Some(MessageContent::Text(content.joined_text())),
                    tool_calls: None,
                    tool_call_id: Some(tool_call_id.clone()),
                    reasoning_content: None,
                }),
                _ => None,
            })
            .collect(),

        UnifiedRole::User => {
            // Tool results embedded in user messages (Anthropic convention)
            // become standalone tool-role messages on this wire.
            let mut out = Vec::new();
            let mut parts = Vec::new();

            for part in &message.parts {
                match part {
                    ContentPart::ToolResult {
                        tool_call_id, content, ..
                    } => out.push(ChatMessage {
                        role: ChatRole::Tool,
                        content: Some(MessageContent::Text(content.joined_text())),
                        tool_calls: None,
                        tool_call_id: Some(tool_call_id.clone()),
                        reasoning_content: None,
                    }),
                    ContentPart::Text { text, .. } => parts.push(WirePart::Text { text: text.clone() }),
                    ContentPart::Image { source, .. } => parts.push(WirePart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_source_to_url(source),
                        },
                    }),
                    _ => {}
                }
            }

            if !parts.is_empty() {
                let content = match parts.as_slice() {
                    [WirePart::Text { text }] => MessageContent::Text(text.clone()),
                    _ => MessageContent::Parts(parts),
                };

                out.push(ChatMessage {
                    role: ChatRole::User,
                    content: Some(content),
                    tool_calls: None,
                    tool_call_id: None,
                    reasoning_content: None,
                });
            }

            out
        }

        UnifiedRole::Assistant => {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut tool_calls = Vec::new();

            for part in &message.parts {
                match part {
                    ContentPart::Text { text: t, .. } => text.push_str(t),
                    ContentPart::Thinking { text: t, .. } => reasoning.push_str(t),
                    ContentPart::ToolCall { id, name, arguments, .. } => {
                        tool_calls.push(crate::messages::openai::ToolCall {
                            id: id.clone(),
                            kind: ToolKind::Function,
                            function: crate::messages::openai::FunctionCall {
                                name: name.clone(),
                                arguments: arguments.to_raw(),
                            },
                        });
                    }
                    _ => {}
                }
            }

            vec![ChatMessage {
                role: ChatRole::Assistant,
                content: if text.is_empty() {
                    None
                } else {
                    Some(MessageContent::Text(text))
                },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
                reasoning_content: if reasoning.is_empty() { None } else { Some(reasoning) },
            }]
        }
    }
}

fn image_source_to_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url.clone(),
    }
}

/// Parse a non-streaming OpenAI response.
pub fn parse_response(bytes: &[u8]) -> Result<UnifiedResponse, GatewayError> {
    let response: ChatCompletionResponse = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid chat completion response: {e}")))?;

    let mut content = Vec::new();
    let mut stop_reason = None;

    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(reasoning) = choice.message.reasoning_content
            && !reasoning.is_empty()
        {
            content.push(ContentPart::Thinking {
                text: reasoning,
                signature: None,
                redacted: false,
                cache_control: None,
            });
        }

        if let Some(body) = choice.message.content {
            let text = body.joined_text();
            if !text.is_empty() {
                content.push(ContentPart::text(text));
            }
        }

        for call in choice.message.tool_calls.unwrap_or_default() {
            content.push(ContentPart::ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: ToolArguments::Raw(call.function.arguments),
                cache_control: None,
            });
        }

        stop_reason = choice.finish_reason.map(finish_to_stop);
    }

    Ok(UnifiedResponse {
        id: response.id,
        model: Some(response.model),
        content,
        stop_reason,
        usage: response.usage.map(usage_to_unified),
    })
}

fn finish_to_stop(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::ContentFilter,
        FinishReason::Other(other) => {
            log::warn!("Unknown OpenAI finish reason: {other}");
            StopReason::EndTurn
        }
    }
}

fn stop_to_finish(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::ContentFilter => FinishReason::ContentFilter,
        StopReason::Error => FinishReason::Other("error".to_string()),
    }
}

fn usage_to_unified(usage: Usage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: Some(usage.total_tokens),
        thinking_tokens: usage
            .completion_tokens_details
            .map(|d| d.reasoning_tokens)
            .filter(|&t| t > 0),
        cached_tokens: usage
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .filter(|&t| t > 0),
        credits: None,
    }
}

fn unified_to_usage(usage: &UnifiedUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total(),
        prompt_tokens_details: usage.cached_tokens.map(|cached_tokens| {
            crate::messages::openai::PromptTokensDetails { cached_tokens }
        }),
        completion_tokens_details: usage.thinking_tokens.map(|reasoning_tokens| {
            crate::messages::openai::CompletionTokensDetails { reasoning_tokens }
        }),
    }
}

/// Emit a unified response as an OpenAI Chat Completions body.
pub fn transform_response(response: &UnifiedResponse, model: &str) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for part in &response.content {
        match part {
            ContentPart::Text { text: t, .. } => text.push_str(t),
            ContentPart::Thinking { text: t, .. } => reasoning.push_str(t),
            ContentPart::ToolCall { id, name, arguments, .. } => {
                tool_calls.push(crate::messages::openai::ToolCall {
                    id: id.clone(),
                    kind: ToolKind::Function,
                    function: crate::messages::openai::FunctionCall {
                        name: name.clone(),
                        arguments: arguments.to_raw(),
                    },
                });
            }
            _ => {}
        }
    }

    let body = ChatCompletionResponse {
        id: if response.id.is_empty() {
            format!("chatcmpl-{}", uuid::Uuid::new_v4())
        } else {
            response.id.clone()
        },
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: model.to_string(),
        choices: vec![crate::messages::openai::ChatChoice {
            index: 0,
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: if text.is_empty() {
                    None
                } else {
                    Some(MessageContent::Text(text))
                },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
                reasoning_content: if reasoning.is_empty() { None } else { Some(reasoning) },
            },
            finish_reason: Some(stop_to_finish(response.stop_reason.unwrap_or(StopReason::EndTurn))),
        }],
        usage: response.usage.as_ref().map(unified_to_usage),
    };

    serde_json::to_value(body).unwrap_or_default()
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Stateful parser for OpenAI streaming chunks.
///
/// Tracks block indices so that downstream emitters (Anthropic in
/// particular) can pair tool-call starts with their argument fragments.
#[derive(Default)]
pub struct OpenaiStreamParser {
    next_block: u32,
    text_block: Option<u32>,
    thinking_block: Option<u32>,
    /// OpenAI tool_calls array index → unified block index.
    tool_blocks: HashMap<u32, u32>,
    open_tool_block: Option<u32>,
    finished: bool,
}

impl OpenaiStreamParser {
    /// Translate one upstream frame into unified chunks.
    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedChunk>, GatewayError> {
        if frame.data.trim() == "[DONE]" {
            if self.finished {
                return Ok(Vec::new());
            }
            self.finished = true;
            return Ok(vec![UnifiedChunk::done(StopReason::EndTurn)]);
        }

        let Ok(chunk) = sonic_rs::from_str::<ChatCompletionChunk>(&frame.data) else {
            log::warn!("Failed to parse OpenAI streaming chunk, skipping frame");
            return Ok(Vec::new());
        };

        let mut out = Vec::new();

        if let Some(choice) = chunk.choices.into_iter().next() {
            self.parse_delta(choice.delta, &mut out);

            if let Some(finish) = choice.finish_reason {
                self.close_open_blocks(&mut out);
                self.finished = true;
                out.push(UnifiedChunk::done(finish_to_stop(finish)));
            }
        }

        if let Some(usage) = chunk.usage {
            out.push(UnifiedChunk::usage(usage_to_unified(usage)));
        }

        if !chunk.model.is_empty()
            && let Some(first) = out.first_mut()
        {
            first.model = Some(chunk.model);
        }

        Ok(out)
    }

    fn parse_delta(&mut self, delta: MessageDelta, out: &mut Vec<UnifiedChunk>) {
        if let Some(reasoning) = delta.reasoning_content
            && !reasoning.is_empty()
        {
            let index = *self.thinking_block.get_or_insert_with(|| {
                let index = self.next_block;
                self.next_block += 1;
                index
            });
            out.push(UnifiedChunk::thinking(index, reasoning));
        }

        if let Some(content) = delta.content
            && !content.is_empty()
        {
            let index = *self.text_block.get_or_insert_with(|| {
                let index = self.next_block;
                self.next_block += 1;
                index
            });
            out.push(UnifiedChunk::content(index, content));
        }

        for call in delta.tool_calls.unwrap_or_default() {
            self.parse_tool_call_delta(call, out);
        }
    }

    fn parse_tool_call_delta(&mut self, call: ToolCallDelta, out: &mut Vec<UnifiedChunk>) {
        let FunctionCallDelta { name, arguments } = call.function.unwrap_or_default();

        // A chunk carrying an id (or a name) opens a new call; later chunks
        // reference the same array index with argument fragments only.
        let starts_new = call.id.is_some() || name.is_some();

        if starts_new {
            if let Some(open) = self.open_tool_block.take() {
                out.push(UnifiedChunk::block_stop(open));
            }

            let index = self.next_block;
            self.next_block += 1;
            self.tool_blocks.insert(call.index, index);
            self.open_tool_block = Some(index);

            out.push(UnifiedChunk::tool_call_start(
                index,
                call.id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                name.unwrap_or_default(),
            ));
        }

        if let Some(arguments) = arguments
            && !arguments.is_empty()
        {
            let Some(&index) = self.tool_blocks.get(&call.index) else {
                log::warn!("Tool argument fragment for unknown tool call index {}", call.index);
                return;
            };
            out.push(UnifiedChunk::tool_call_fragment(index, arguments));
        }
    }

    fn close_open_blocks(&mut self, out: &mut Vec<UnifiedChunk>) {
        if let Some(open) = self.open_tool_block.take() {
            out.push(UnifiedChunk::block_stop(open));
        }
    }
}

/// Stateful emitter producing OpenAI streaming frames.
pub struct OpenaiStreamEmitter {
    id: String,
    model: String,
    created: u64,
    sent_role: bool,
    /// Unified block index → OpenAI tool_calls array index.
    tool_indices: HashMap<u32, u32>,
    next_tool_index: u32,
    pending_usage: Option<UnifiedUsage>,
    finished: bool,
}

impl OpenaiStreamEmitter {
    /// A fresh emitter for one client connection.
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            created: now_unix(),
            sent_role: false,
            tool_indices: HashMap::new(),
            next_tool_index: 0,
            pending_usage: None,
            finished: false,
        }
    }

    /// Translate one unified chunk into OpenAI frames.
    pub fn emit(&mut self, chunk: &UnifiedChunk) -> Vec<SseFrame> {
        match chunk.kind {
            ChunkKind::Content => {
                let text = chunk.delta.as_ref().and_then(|d| d.text.clone()).unwrap_or_default();
                let role = self.role_once();
                vec![self.frame(
                    MessageDelta {
                        role,
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )]
            }

            ChunkKind::Thinking => {
                let Some(delta) = &chunk.delta else { return Vec::new() };
                // Signature-only deltas have no representation on this wire.
                let text = delta.text.clone().unwrap_or_default();
                if text.is_empty() && delta.signature.is_some() {
                    return Vec::new();
                }
                let role = self.role_once();
                vec![self.frame(
                    MessageDelta {
                        role,
                        reasoning_content: Some(text),
                        ..Default::default()
                    },
                    None,
                )]
            }

            ChunkKind::ToolCall => {
                let Some(delta) = &chunk.delta else { return Vec::new() };
                let block = chunk.block_index.unwrap_or(0);

                let mut call = ToolCallDelta::default();

                if let Some(id) = &delta.tool_call_id {
                    // Start of a new call: allocate the wire-side index.
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(block, index);

                    call.index = index;
                    call.id = Some(id.clone());
                    call.kind = Some(ToolKind::Function);
                    call.function = Some(FunctionCallDelta {
                        name: delta.tool_name.clone(),
                        arguments: Some(delta.partial_json.clone().unwrap_or_default()),
                    });
                } else if let Some(partial) = &delta.partial_json {
                    call.index = self.tool_indices.get(&block).copied().unwrap_or(0);
                    call.function = Some(FunctionCallDelta {
                        name: None,
                        arguments: Some(partial.clone()),
                    });
                } else {
                    return Vec::new();
                }

                let role = self.role_once();
                vec![self.frame(
                    MessageDelta {
                        role,
                        tool_calls: Some(vec![call]),
                        ..Default::default()
                    },
                    None,
                )]
            }

            ChunkKind::Usage => {
                self.pending_usage = chunk.usage;
                Vec::new()
            }

            ChunkKind::Done => {
                if self.finished {
                    return Vec::new();
                }
                self.finished = true;

                let finish = stop_to_finish(chunk.stop_reason.unwrap_or(StopReason::EndTurn));
                let usage = chunk.usage.or(self.pending_usage);

                let mut body = ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: self.created,
                    model: self.model.clone(),
                    choices: vec![crate::messages::openai::ChatChoiceDelta {
                        index: 0,
                        delta: MessageDelta::default(),
                        finish_reason: Some(finish),
                    }],
                    usage: None,
                };
                body.usage = usage.as_ref().map(unified_to_usage);

                vec![
                    SseFrame::data(sonic_rs::to_string(&body).unwrap_or_default()),
                    SseFrame::data("[DONE]"),
                ]
            }

            ChunkKind::Error => {
                let message = chunk.error.clone().unwrap_or_else(|| "stream error".to_string());
                let body = serde_json::json!({ "error": { "message": message } });
                self.finished = true;
                vec![SseFrame::data(body.to_string()), SseFrame::data("[DONE]")]
            }

            ChunkKind::BlockStop | ChunkKind::ToolResult => Vec::new(),
        }
    }

    /// Terminate the stream if the upstream never sent a done chunk.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.emit(&UnifiedChunk::done(StopReason::EndTurn))
    }

    fn role_once(&mut self) -> Option<ChatRole> {
        if self.sent_role {
            None
        } else {
            self.sent_role = true;
            Some(ChatRole::Assistant)
        }
    }

    fn frame(&self, delta: MessageDelta, finish: Option<FinishReason>) -> SseFrame {
        let body = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![crate::messages::openai::ChatChoiceDelta {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage: None,
        };

        SseFrame::data(sonic_rs::to_string(&body).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_system_and_tool_messages() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "developer", "content": "use metric units"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"loc\":\"NYC\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ]
        });

        let request = parse_request(body.to_string().as_bytes()).unwrap();

        assert_eq!(request.system.as_deref(), Some("be brief\nuse metric units"));
        assert_eq!(request.messages.len(), 3);

        let assistant = &request.messages[1];
        assert_eq!(assistant.role, UnifiedRole::Assistant);
        assert!(matches!(
            &assistant.parts[0],
            ContentPart::ToolCall { id, name, .. } if id == "call_1" && name == "get_weather"
        ));

        let tool = &request.messages[2];
        assert_eq!(tool.role, UnifiedRole::Tool);
        assert_eq!(tool.parts.len(), 1);
    }

    #[test]
    fn malformed_tool_arguments_become_empty_object() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "assistant", "tool_calls": [
                    {"id": "c", "type": "function", "function": {"name": "f", "arguments": "{broken"}}
                ]}
            ]
        });

        let request = parse_request(body.to_string().as_bytes()).unwrap();
        let ContentPart::ToolCall { arguments, .. } = &request.messages[0].parts[0] else {
            panic!("expected tool call");
        };
        assert_eq!(arguments.as_json(), json!({}));
    }

    #[test]
    fn reasoning_models_use_completion_token_budget() {
        let request = UnifiedRequest {
            model: "o3-mini".to_string(),
            messages: vec![UnifiedMessage::user("hi")],
            system: Some("be brief".to_string()),
            max_tokens: Some(512),
            temperature: Some(0.5),
            top_p: Some(0.9),
            thinking: Some(ThinkingConfig {
                enabled: true,
                effort: Some(ThinkingEffort::High),
                ..Default::default()
            }),
            ..Default::default()
        };

        let body = transform_request(&request, "o3-mini");

        assert_eq!(body["max_completion_tokens"], 512);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(body["messages"][0]["role"], "developer");
    }

    #[test]
    fn glm_models_get_nested_thinking() {
        let request = UnifiedRequest {
            model: "glm-4.6".to_string(),
            messages: vec![UnifiedMessage::user("hi")],
            thinking: Some(ThinkingConfig {
                enabled: true,
                preserve_context: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let body = transform_request(&request, "glm-4.6");

        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["clear_thinking"], false);
    }

    #[test]
    fn glm_clear_thinking_maps_to_preserve_context() {
        let body = json!({
            "model": "glm-4.6",
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "clear_thinking": false}
        });

        let request = parse_request(body.to_string().as_bytes()).unwrap();
        let thinking = request.thinking.unwrap();
        assert!(thinking.enabled);
        assert_eq!(thinking.preserve_context, Some(true));
    }

    #[test]
    fn request_round_trips_through_wire_format() {
        let request = UnifiedRequest {
            model: "gpt-4o".to_string(),
            messages: vec![UnifiedMessage::user("hello")],
            system: Some("be brief".to_string()),
            max_tokens: Some(100),
            ..Default::default()
        };

        let wire = transform_request(&request, "gpt-4o");
        let parsed = parse_request(wire.to_string().as_bytes()).unwrap();

        assert_eq!(parsed.system, request.system);
        assert_eq!(parsed.max_tokens, request.max_tokens);
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].joined_text(), "hello");
    }

    #[test]
    fn stream_done_sentinel() {
        let mut parser = OpenaiStreamParser::default();
        let chunks = parser.parse(&SseFrame::data("[DONE]")).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Done);
        assert_eq!(chunks[0].stop_reason, Some(StopReason::EndTurn));

        // A second sentinel is swallowed.
        assert!(parser.parse(&SseFrame::data("[DONE]")).unwrap().is_empty());
    }

    #[test]
    fn stream_tool_call_fragments_carry_partial_json() {
        let mut parser = OpenaiStreamParser::default();

        let first = json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": "get_weather", "arguments": ""}}
            ]}}]
        });
        let chunks = parser.parse(&SseFrame::data(first.to_string())).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::ToolCall);
        let delta = chunks[0].delta.as_ref().unwrap();
        assert_eq!(delta.tool_name.as_deref(), Some("get_weather"));

        let second = json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"loc\":"}}
            ]}}]
        });
        let chunks = parser.parse(&SseFrame::data(second.to_string())).unwrap();
        assert_eq!(chunks.len(), 1);
        let delta = chunks[0].delta.as_ref().unwrap();
        assert_eq!(delta.partial_json.as_deref(), Some("{\"loc\":"));
        assert!(delta.tool_call_id.is_none());
    }

    #[test]
    fn reasoning_content_becomes_thinking_chunk() {
        let mut parser = OpenaiStreamParser::default();

        let frame = json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "glm-4.6",
            "choices": [{"index": 0, "delta": {"reasoning_content": "pondering"}}]
        });

        let chunks = parser.parse(&SseFrame::data(frame.to_string())).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Thinking);
    }

    #[test]
    fn emitter_terminates_with_done_sentinel() {
        let mut emitter = OpenaiStreamEmitter::new("gpt-4o");

        let frames = emitter.emit(&UnifiedChunk::content(0, "hello"));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.contains("\"content\":\"hello\""));

        let frames = emitter.emit(&UnifiedChunk::done(StopReason::ToolUse));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].data.contains("tool_calls"));
        assert_eq!(frames[1].data, "[DONE]");

        assert!(emitter.finish().is_empty());
    }
}
