//! Anthropic Messages ↔ unified codec.
//!
//! The streaming side is the most involved of the four dialects: content
//! arrives as typed events with explicit block indices, and emission has to
//! reconstruct that structure from flat unified chunks, including the
//! `content_block_start` / `input_json_delta` / `content_block_stop` triple
//! for every tool call.

use serde_json::Value;
use std::collections::HashMap;

use crate::{
    error::GatewayError,
    messages::{
        anthropic::{
            BlockDelta, ContentBlock, ImageSource as WireImageSource, InputMessage, MessageContent,
            MessageDeltaData, MessageStart, MessagesRequest, MessagesResponse, Metadata, Role, StopReason as WireStop,
            StreamContentBlock, StreamEvent, SystemBlock as WireSystemBlock, SystemPrompt, ThinkingParam, ToolChoice,
            ToolDef, ToolResultContent as WireToolResult, Usage,
        },
        unified::{
            ChunkKind, ContentPart, ImageSource, StopReason, SystemBlock, ThinkingConfig, ToolArguments,
            ToolResultContent, UnifiedChunk, UnifiedMessage, UnifiedMetadata, UnifiedRequest, UnifiedResponse,
            UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
        },
    },
};

use super::SseFrame;

/// Anthropic requires `max_tokens`; used when the client left it unset.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Default thinking budget when the client enabled thinking without one.
const DEFAULT_THINKING_BUDGET: u32 = 1024;

/// Tool-argument fragments are re-chunked to at most this many bytes per
/// `input_json_delta`; some strict clients reject larger deltas.
const MAX_JSON_DELTA_BYTES: usize = 50;

/// Parse an Anthropic Messages request into the unified representation.
pub fn parse_request(bytes: &[u8]) -> Result<UnifiedRequest, GatewayError> {
    let request: MessagesRequest = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid messages request: {e}")))?;

    let (system, system_blocks) = match request.system {
        None => (None, None),
        Some(SystemPrompt::Text(text)) => (Some(text), None),
        Some(SystemPrompt::Blocks(blocks)) => {
            let joined = blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n");
            let unified = blocks
                .into_iter()
                .map(|block| SystemBlock {
                    text: block.text,
                    cache_control: block
                        .cache_control
                        .and_then(|value| serde_json::from_value(value).ok()),
                })
                .collect();
            (Some(joined), Some(unified))
        }
    };

    let mut messages = Vec::new();

    for message in request.messages {
        parse_message(message, &mut messages);
    }

    let thinking = request.thinking.map(|param| match param {
        ThinkingParam::Enabled { budget_tokens } => ThinkingConfig {
            enabled: true,
            budget: Some(budget_tokens),
            ..Default::default()
        },
        ThinkingParam::Disabled => ThinkingConfig::default(),
    });

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| UnifiedTool {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        })
        .collect();

    let tool_choice = request.tool_choice.map(|choice| match choice {
        ToolChoice::Auto => UnifiedToolChoice::Auto,
        ToolChoice::Any => UnifiedToolChoice::Required,
        ToolChoice::None => UnifiedToolChoice::None,
        ToolChoice::Tool { name } => UnifiedToolChoice::Tool { name },
    });

    Ok(UnifiedRequest {
        model: request.model,
        messages,
        system,
        system_blocks,
        tools,
        tool_choice,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences,
        thinking,
        metadata: request.metadata.and_then(|m| {
            m.user_id.map(|user_id| UnifiedMetadata {
                user_id: Some(user_id),
                session_id: None,
            })
        }),
        stream: request.stream,
    })
}

/// Split one wire message into unified messages. Tool results embedded in a
/// user message become standalone tool-role messages, preserving order.
fn parse_message(message: InputMessage, out: &mut Vec<UnifiedMessage>) {
    let role = match message.role {
        Role::User => UnifiedRole::User,
        Role::Assistant => UnifiedRole::Assistant,
    };

    let blocks = match message.content {
        MessageContent::Text(text) => {
            out.push(UnifiedMessage {
                role,
                parts: vec![ContentPart::text(text)],
            });
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut pending = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
                cache_control,
            } => {
                if !pending.is_empty() {
                    out.push(UnifiedMessage {
                        role,
                        parts: std::mem::take(&mut pending),
                    });
                }

                let content = match content {
                    None => ToolResultContent::Text(String::new()),
                    Some(WireToolResult::Text(text)) => ToolResultContent::Text(text),
                    Some(WireToolResult::Blocks(blocks)) => {
                        ToolResultContent::Parts(blocks.into_iter().filter_map(parse_block).collect())
                    }
                };

                out.push(UnifiedMessage {
                    role: UnifiedRole::Tool,
                    parts: vec![ContentPart::ToolResult {
                        tool_call_id: tool_use_id,
                        content,
                        is_error,
                        cache_control: cache_control.and_then(|v| serde_json::from_value(v).ok()),
                    }],
                });
            }
            other => {
                if let Some(part) = parse_block(other) {
                    pending.push(part);
                }
            }
        }
    }

    if !pending.is_empty() {
        out.push(UnifiedMessage { role, parts: pending });
    }
}

fn parse_block(block: ContentBlock) -> Option<ContentPart> {
    match block {
        ContentBlock::Text { text, cache_control } => Some(ContentPart::Text {
            text,
            cache_control: cache_control.and_then(|v| serde_json::from_value(v).ok()),
        }),
        ContentBlock::Image { source, cache_control } => Some(ContentPart::Image {
            source: match source {
                WireImageSource::Base64 { media_type, data } => ImageSource::Base64 { media_type, data },
                WireImageSource::Url { url } => ImageSource::Url { url },
            },
            cache_control: cache_control.and_then(|v| serde_json::from_value(v).ok()),
        }),
        ContentBlock::ToolUse {
            id,
            name,
            input,
            cache_control,
        } => Some(ContentPart::ToolCall {
            id,
            name,
            arguments: ToolArguments::Json(input),
            cache_control: cache_control.and_then(|v| serde_json::from_value(v).ok()),
        }),
        ContentBlock::Thinking { thinking, signature } => Some(ContentPart::Thinking {
            text: thinking,
            signature,
            redacted: false,
            cache_control: None,
        }),
        ContentBlock::RedactedThinking { data } => Some(ContentPart::Thinking {
            text: String::new(),
            signature: Some(data),
            redacted: true,
            cache_control: None,
        }),
        ContentBlock::ToolResult { .. } => None,
    }
}

/// Emit a unified request as an Anthropic Messages body.
pub fn transform_request(request: &UnifiedRequest, model: &str) -> Value {
    let system = if let Some(blocks) = &request.system_blocks {
        Some(SystemPrompt::Blocks(
            blocks
                .iter()
                .map(|block| WireSystemBlock {
                    kind: "text".to_string(),
                    text: block.text.clone(),
                    cache_control: block
                        .cache_control
                        .as_ref()
                        .and_then(|c| serde_json::to_value(c).ok()),
                })
                .collect(),
        ))
    } else {
        request.system.clone().filter(|s| !s.is_empty()).map(SystemPrompt::Text)
    };

    let mut messages: Vec<InputMessage> = Vec::new();

    for message in &request.messages {
        let (role, blocks) = transform_message(message);

        if blocks.is_empty() {
            continue;
        }

        // The upstream requires strict user/assistant alternation; merge
        // consecutive same-role messages (tool results become user blocks).
        if let Some(last) = messages.last_mut()
            && last.role == role
            && let MessageContent::Blocks(existing) = &mut last.content
        {
            existing.extend(blocks);
            continue;
        }

        messages.push(InputMessage {
            role,
            content: MessageContent::Blocks(blocks),
        });
    }

    let thinking = request.thinking.as_ref().and_then(|config| {
        config.enabled.then_some(ThinkingParam::Enabled {
            budget_tokens: config.budget.unwrap_or(DEFAULT_THINKING_BUDGET),
        })
    });

    let body = MessagesRequest {
        model: model.to_string(),
        messages,
        system,
        max_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences.clone(),
        stream: request.stream,
        tools: (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|tool| ToolDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect()
        }),
        tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
            UnifiedToolChoice::Auto => ToolChoice::Auto,
            UnifiedToolChoice::Required => ToolChoice::Any,
            UnifiedToolChoice::None => ToolChoice::None,
            UnifiedToolChoice::Tool { name } => ToolChoice::Tool { name: name.clone() },
        }),
        thinking,
        metadata: request.metadata.as_ref().and_then(|m| {
            m.user_id.clone().map(|user_id| Metadata { user_id: Some(user_id) })
        }),
    };

    serde_json::to_value(body).unwrap_or_default()
}

fn transform_message(message: &UnifiedMessage) -> (Role, Vec<ContentBlock>) {
    let role = match message.role {
        UnifiedRole::Assistant => Role::Assistant,
        // Tool results ride on user messages on this wire.
        UnifiedRole::User | UnifiedRole::Tool => Role::User,
    };

    let blocks = message.parts.iter().filter_map(transform_part).collect();
    (role, blocks)
}

fn transform_part(part: &ContentPart) -> Option<ContentBlock> {
    match part {
        ContentPart::Text { text, cache_control } => Some(ContentBlock::Text {
            text: text.clone(),
            cache_control: cache_control.as_ref().and_then(|c| serde_json::to_value(c).ok()),
        }),
        ContentPart::Image { source, cache_control } => Some(ContentBlock::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => WireImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageSource::Url { url } => WireImageSource::Url { url: url.clone() },
            },
            cache_control: cache_control.as_ref().and_then(|c| serde_json::to_value(c).ok()),
        }),
        ContentPart::ToolCall {
            id,
            name,
            arguments,
            cache_control,
        } => Some(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: arguments.as_json(),
            cache_control: cache_control.as_ref().and_then(|c| serde_json::to_value(c).ok()),
        }),
        ContentPart::ToolResult {
            tool_call_id,
            content,
            is_error,
            cache_control,
        } => Some(ContentBlock::ToolResult {
            tool_use_id: tool_call_id.clone(),
            content: Some(match content {
                ToolResultContent::Text(text) => WireToolResult::Text(text.clone()),
                ToolResultContent::Parts(parts) => {
                    WireToolResult::Blocks(parts.iter().filter_map(transform_part).collect())
                }
            }),
            is_error: *is_error,
            cache_control: cache_control.as_ref().and_then(|c| serde_json::to_value(c).ok()),
        }),
        ContentPart::Thinking {
            text,
            signature,
            redacted,
            ..
        } => {
            if *redacted {
                Some(ContentBlock::RedactedThinking {
                    data: signature.clone().unwrap_or_default(),
                })
            } else {
                Some(ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: signature.clone(),
                })
            }
        }
    }
}

/// Parse a non-streaming Anthropic response.
pub fn parse_response(bytes: &[u8]) -> Result<UnifiedResponse, GatewayError> {
    let response: MessagesResponse = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid messages response: {e}")))?;

    Ok(UnifiedResponse {
        id: response.id,
        model: Some(response.model),
        content: response.content.into_iter().filter_map(parse_block).collect(),
        stop_reason: response.stop_reason.map(wire_stop_to_unified),
        usage: Some(usage_to_unified(response.usage)),
    })
}

fn wire_stop_to_unified(reason: WireStop) -> StopReason {
    match reason {
        WireStop::EndTurn => StopReason::EndTurn,
        WireStop::MaxTokens => StopReason::MaxTokens,
        WireStop::StopSequence => StopReason::StopSequence,
        WireStop::ToolUse => StopReason::ToolUse,
        WireStop::Refusal => StopReason::ContentFilter,
        WireStop::Other(other) => {
            log::warn!("Unknown Anthropic stop reason: {other}");
            StopReason::EndTurn
        }
    }
}

fn unified_stop_to_wire(reason: StopReason) -> WireStop {
    match reason {
        StopReason::EndTurn => WireStop::EndTurn,
        StopReason::MaxTokens => WireStop::MaxTokens,
        StopReason::StopSequence => WireStop::StopSequence,
        StopReason::ToolUse => WireStop::ToolUse,
        StopReason::ContentFilter => WireStop::Refusal,
        StopReason::Error => WireStop::EndTurn,
    }
}

fn usage_to_unified(usage: Usage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: None,
        thinking_tokens: None,
        cached_tokens: usage.cache_read_input_tokens.filter(|&t| t > 0),
        credits: None,
    }
}

/// Emit a unified response as an Anthropic Messages body.
pub fn transform_response(response: &UnifiedResponse, model: &str) -> Value {
    let content = response.content.iter().filter_map(transform_part).collect();

    let body = MessagesResponse {
        id: if response.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else {
            response.id.clone()
        },
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(unified_stop_to_wire(
            response.stop_reason.unwrap_or(StopReason::EndTurn),
        )),
        stop_sequence: None,
        usage: response
            .usage
            .map(|usage| Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_read_input_tokens: usage.cached_tokens,
                cache_creation_input_tokens: None,
            })
            .unwrap_or_default(),
    };

    serde_json::to_value(body).unwrap_or_default()
}

/// Stateful parser for Anthropic streaming events.
#[derive(Default)]
pub struct AnthropicStreamParser {
    stop_reason: Option<StopReason>,
    input_tokens: u64,
    finished: bool,
}

impl AnthropicStreamParser {
    /// Translate one upstream frame into unified chunks.
    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedChunk>, GatewayError> {
        let Ok(event) = sonic_rs::from_str::<StreamEvent>(&frame.data) else {
            log::warn!("Failed to parse Anthropic streaming event, skipping frame");
            return Ok(Vec::new());
        };

        let chunks = match event {
            StreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;

                let mut chunk = UnifiedChunk::usage(usage_to_unified(message.usage));
                chunk.model = Some(message.model);
                vec![chunk]
            }

            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                StreamContentBlock::ToolUse { id, name, .. } => {
                    vec![UnifiedChunk::tool_call_start(index, id, name)]
                }
                StreamContentBlock::Text { text } if !text.is_empty() => {
                    vec![UnifiedChunk::content(index, text)]
                }
                StreamContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                    vec![UnifiedChunk::thinking(index, thinking)]
                }
                _ => Vec::new(),
            },

            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![UnifiedChunk::content(index, text)],
                BlockDelta::InputJsonDelta { partial_json } => {
                    vec![UnifiedChunk::tool_call_fragment(index, partial_json)]
                }
                BlockDelta::ThinkingDelta { thinking } => vec![UnifiedChunk::thinking(index, thinking)],
                BlockDelta::SignatureDelta { signature } => {
                    vec![UnifiedChunk::thinking_signature(index, signature)]
                }
            },

            StreamEvent::ContentBlockStop { index } => vec![UnifiedChunk::block_stop(index)],

            StreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason.map(wire_stop_to_unified);

                match usage {
                    Some(usage) => {
                        let mut unified = usage_to_unified(usage);
                        // message_delta usage omits input tokens; carry over
                        // the count seeded by message_start.
                        if unified.input_tokens == 0 {
                            unified.input_tokens = self.input_tokens;
                        }
                        vec![UnifiedChunk::usage(unified)]
                    }
                    None => Vec::new(),
                }
            }

            StreamEvent::MessageStop => {
                self.finished = true;
                vec![UnifiedChunk::done(self.stop_reason.unwrap_or(StopReason::EndTurn))]
            }

            StreamEvent::Ping => Vec::new(),

            StreamEvent::Error { error } => {
                log::error!("Anthropic stream error: {} - {}", error.kind, error.message);
                vec![UnifiedChunk {
                    kind: ChunkKind::Error,
                    error: Some(error.message),
                    ..Default::default()
                }]
            }
        };

        Ok(chunks)
    }
}

/// Wire-side block bookkeeping for the emitter.
#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    Text,
    ToolUse,
    Thinking,
}

/// Stateful emitter producing Anthropic streaming frames.
///
/// Guarantees the event grammar the upstream documents: exactly one
/// `message_start`, every block bracketed by `content_block_start` /
/// `content_block_stop`, one open block at a time, and a final
/// `message_delta` + `message_stop` pair.
pub struct AnthropicStreamEmitter {
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    /// Unified block index → wire block index.
    indices: HashMap<u32, u32>,
    next_index: u32,
    open: Option<(u32, OpenBlock)>,
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicStreamEmitter {
    /// A fresh emitter for one client connection.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            finished: false,
            indices: HashMap::new(),
            next_index: 0,
            open: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Translate one unified chunk into Anthropic frames.
    pub fn emit(&mut self, chunk: &UnifiedChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        match chunk.kind {
            ChunkKind::Content => {
                let text = chunk.delta.as_ref().and_then(|d| d.text.clone()).unwrap_or_default();
                self.ensure_started(&mut frames);
                let index = self.ensure_block(chunk.block_index.unwrap_or(0), OpenBlock::Text, None, &mut frames);

                frames.push(event_frame(&StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text },
                }));
            }

            ChunkKind::Thinking => {
                let Some(delta) = &chunk.delta else { return frames };
                self.ensure_started(&mut frames);
                let index =
                    self.ensure_block(chunk.block_index.unwrap_or(0), OpenBlock::Thinking, None, &mut frames);

                if let Some(signature) = &delta.signature {
                    frames.push(event_frame(&StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::SignatureDelta {
                            signature: signature.clone(),
                        },
                    }));
                }

                if let Some(text) = &delta.text
                    && !text.is_empty()
                {
                    frames.push(event_frame(&StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::ThinkingDelta { thinking: text.clone() },
                    }));
                }
            }

            ChunkKind::ToolCall => {
                let Some(delta) = &chunk.delta else { return frames };
                self.ensure_started(&mut frames);

                if let Some(id) = &delta.tool_call_id {
                    // New call: open its block explicitly.
                    let start = StreamContentBlock::ToolUse {
                        id: id.clone(),
                        name: delta.tool_name.clone().unwrap_or_default(),
                        input: Value::Object(Default::default()),
                    };
                    self.ensure_block(
                        chunk.block_index.unwrap_or(0),
                        OpenBlock::ToolUse,
                        Some(start),
                        &mut frames,
                    );
                }

                if let Some(partial) = &delta.partial_json
                    && !partial.is_empty()
                {
                    // A fragment without a preceding start still goes out as
                    // input_json_delta; the surrounding server layer is
                    // expected to have opened the block.
                    let index = chunk
                        .block_index
                        .and_then(|block| self.indices.get(&block).copied())
                        .unwrap_or_else(|| self.next_index.saturating_sub(1));

                    for piece in split_json_fragments(partial) {
                        frames.push(event_frame(&StreamEvent::ContentBlockDelta {
                            index,
                            delta: BlockDelta::InputJsonDelta {
                                partial_json: piece.to_string(),
                            },
                        }));
                    }
                }
            }

            ChunkKind::BlockStop => {
                if let Some(block) = chunk.block_index
                    && let Some(&index) = self.indices.get(&block)
                    && self.open.map(|(open, _)| open) == Some(index)
                {
                    self.open = None;
                    frames.push(event_frame(&StreamEvent::ContentBlockStop { index }));
                }
            }

            ChunkKind::Usage => {
                if let Some(usage) = &chunk.usage {
                    if usage.input_tokens > 0 {
                        self.input_tokens = usage.input_tokens;
                    }
                    if usage.output_tokens > 0 {
                        self.output_tokens = usage.output_tokens;
                    }
                }
                // Usage rides on message_start / message_delta, nothing to
                // emit on its own.
            }

            ChunkKind::Done => {
                if self.finished {
                    return frames;
                }
                self.ensure_started(&mut frames);
                self.finished = true;

                // A dangling tool (or any) block must close before the
                // message-level events.
                if let Some((index, _)) = self.open.take() {
                    frames.push(event_frame(&StreamEvent::ContentBlockStop { index }));
                }

                let usage = chunk.usage.map(|u| to_wire_usage(&u)).unwrap_or(Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                    cache_read_input_tokens: None,
                    cache_creation_input_tokens: None,
                });

                frames.push(event_frame(&StreamEvent::MessageDelta {
                    delta: MessageDeltaData {
                        stop_reason: Some(unified_stop_to_wire(
                            chunk.stop_reason.unwrap_or(StopReason::EndTurn),
                        )),
                        stop_sequence: None,
                    },
                    usage: Some(usage),
                }));
                frames.push(event_frame(&StreamEvent::MessageStop));
            }

            ChunkKind::Error => {
                self.finished = true;
                frames.push(event_frame(&StreamEvent::Error {
                    error: crate::messages::anthropic::StreamError {
                        kind: "api_error".to_string(),
                        message: chunk.error.clone().unwrap_or_else(|| "stream error".to_string()),
                    },
                }));
            }

            ChunkKind::ToolResult => {}
        }

        frames
    }

    /// Terminate the stream if the upstream never sent a done chunk.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.emit(&UnifiedChunk::done(StopReason::EndTurn))
    }

    fn ensure_started(&mut self, frames: &mut Vec<SseFrame>) {
        if self.started {
            return;
        }
        self.started = true;

        frames.push(event_frame(&StreamEvent::MessageStart {
            message: MessageStart {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                    cache_read_input_tokens: None,
                    cache_creation_input_tokens: None,
                },
            },
        }));
    }

    /// Map a unified block index to a wire index, opening the block (and
    /// closing any other open block) when needed. Returns the wire index.
    fn ensure_block(
        &mut self,
        block: u32,
        kind: OpenBlock,
        tool_start: Option<StreamContentBlock>,
        frames: &mut Vec<SseFrame>,
    ) -> u32 {
        if let Some(&index) = self.indices.get(&block) {
            if self.open.map(|(open, _)| open) == Some(index) {
                return index;
            }
        }

        // One open block at a time on this wire.
        if let Some((open_index, _)) = self.open.take() {
            frames.push(event_frame(&StreamEvent::ContentBlockStop { index: open_index }));
        }

        let index = self.next_index;
        self.next_index += 1;
        self.indices.insert(block, index);
        self.open = Some((index, kind));

        let content_block = tool_start.unwrap_or(match kind {
            OpenBlock::Text => StreamContentBlock::Text { text: String::new() },
            OpenBlock::Thinking => StreamContentBlock::Thinking {
                thinking: String::new(),
            },
            OpenBlock::ToolUse => StreamContentBlock::ToolUse {
                id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                name: String::new(),
                input: Value::Object(Default::default()),
            },
        });

        frames.push(event_frame(&StreamEvent::ContentBlockStart {
            index,
            content_block,
        }));

        index
    }
}

fn to_wire_usage(usage: &UnifiedUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: usage.cached_tokens,
        cache_creation_input_tokens: None,
    }
}

fn event_frame(event: &StreamEvent) -> SseFrame {
    SseFrame::event(
        event.event_name(),
        sonic_rs::to_string(event).unwrap_or_default(),
    )
}

/// Split a fragment at UTF-8 boundaries into pieces of at most
/// [`MAX_JSON_DELTA_BYTES`] bytes.
fn split_json_fragments(fragment: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = fragment;

    while rest.len() > MAX_JSON_DELTA_BYTES {
        let mut cut = MAX_JSON_DELTA_BYTES;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }

    if !rest.is_empty() || pieces.is_empty() {
        pieces.push(rest);
    }

    pieces
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_system_blocks_and_tool_results() {
        let body = json!({
            "model": "claude-3-sonnet",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "be brief", "cache_control": {"type": "ephemeral"}}],
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"loc": "NYC"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "sunny"},
                    {"type": "text", "text": "and now?"}
                ]}
            ]
        });

        let request = parse_request(body.to_string().as_bytes()).unwrap();

        assert_eq!(request.system.as_deref(), Some("be brief"));
        assert!(request.system_blocks.is_some());
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[2].role, UnifiedRole::Tool);
        assert_eq!(request.messages[3].role, UnifiedRole::User);
    }

    #[test]
    fn thinking_signature_survives_round_trip() {
        let body = json!({
            "model": "claude-opus-4",
            "max_tokens": 1024,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "T", "signature": "S"},
                    {"type": "text", "text": "answer"}
                ]}
            ]
        });

        let request = parse_request(body.to_string().as_bytes()).unwrap();
        let wire = transform_request(&request, "claude-opus-4");

        assert_eq!(wire["messages"][0]["content"][0]["thinking"], "T");
        assert_eq!(wire["messages"][0]["content"][0]["signature"], "S");
    }

    #[test]
    fn merges_consecutive_user_and_tool_messages() {
        let request = UnifiedRequest {
            model: "claude-3-sonnet".to_string(),
            messages: vec![
                UnifiedMessage {
                    role: UnifiedRole::Tool,
                    parts: vec![ContentPart::ToolResult {
                        tool_call_id: "toolu_1".to_string(),
                        content: ToolResultContent::Text("sunny".to_string()),
                        is_error: None,
                        cache_control: None,
                    }],
                },
                UnifiedMessage::user("and now?"),
            ],
            ..Default::default()
        };

        let wire = transform_request(&request, "claude-3-sonnet");
        let messages = wire["messages"].as_array().unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn stream_events_map_to_chunks() {
        let mut parser = AnthropicStreamParser::default();

        let start = json!({
            "type": "message_start",
            "message": {
                "id": "msg_1", "type": "message", "role": "assistant", "content": [],
                "model": "claude-3-sonnet", "stop_reason": null, "stop_sequence": null,
                "usage": {"input_tokens": 10, "output_tokens": 0}
            }
        });
        let chunks = parser.parse(&SseFrame::event("message_start", start.to_string())).unwrap();
        assert_eq!(chunks[0].kind, ChunkKind::Usage);
        assert_eq!(chunks[0].usage.unwrap().input_tokens, 10);

        let delta = json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "hi"}
        });
        let chunks = parser.parse(&SseFrame::event("content_block_delta", delta.to_string())).unwrap();
        assert_eq!(chunks[0].kind, ChunkKind::Content);

        let signature = json!({
            "type": "content_block_delta", "index": 1,
            "delta": {"type": "signature_delta", "signature": "sig"}
        });
        let chunks = parser
            .parse(&SseFrame::event("content_block_delta", signature.to_string()))
            .unwrap();
        assert_eq!(chunks[0].kind, ChunkKind::Thinking);
        let d = chunks[0].delta.as_ref().unwrap();
        assert_eq!(d.signature.as_deref(), Some("sig"));
        assert_eq!(d.text.as_deref(), Some(""));

        let stop = json!({
            "type": "message_delta",
            "delta": {"stop_reason": "tool_use"},
            "usage": {"output_tokens": 7}
        });
        parser.parse(&SseFrame::event("message_delta", stop.to_string())).unwrap();

        let done = parser
            .parse(&SseFrame::event("message_stop", json!({"type": "message_stop"}).to_string()))
            .unwrap();
        assert_eq!(done[0].kind, ChunkKind::Done);
        assert_eq!(done[0].stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn ping_frames_are_ignored() {
        let mut parser = AnthropicStreamParser::default();
        let chunks = parser
            .parse(&SseFrame::event("ping", json!({"type": "ping"}).to_string()))
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn emitter_frames_tool_call_as_start_delta_stop() {
        let mut emitter = AnthropicStreamEmitter::new("claude-3-sonnet");

        let mut frames = Vec::new();
        frames.extend(emitter.emit(&UnifiedChunk::tool_call_start(0, "call_1", "get_weather")));
        frames.extend(emitter.emit(&UnifiedChunk::tool_call_fragment(0, r#"{"loc":"NYC"}"#)));

        let mut done = UnifiedChunk::done(StopReason::ToolUse);
        done.usage = Some(UnifiedUsage {
            input_tokens: 3,
            output_tokens: 9,
            ..Default::default()
        });
        frames.extend(emitter.emit(&done));

        let events: Vec<&str> = frames.iter().map(|f| f.event.as_deref().unwrap()).collect();
        assert_eq!(
            events,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );

        // Reassembling the partial_json deltas restores the arguments.
        let mut assembled = String::new();
        for frame in &frames {
            if frame.event.as_deref() == Some("content_block_delta") {
                let value: Value = serde_json::from_str(&frame.data).unwrap();
                assembled.push_str(value["delta"]["partial_json"].as_str().unwrap());
            }
        }
        assert_eq!(assembled, r#"{"loc":"NYC"}"#);
    }

    #[test]
    fn emitter_splits_large_fragments() {
        let mut emitter = AnthropicStreamEmitter::new("claude-3-sonnet");
        emitter.emit(&UnifiedChunk::tool_call_start(0, "call_1", "dump"));

        let long = "x".repeat(120);
        let frames = emitter.emit(&UnifiedChunk::tool_call_fragment(0, format!("\"{long}\"")));

        assert!(frames.len() >= 3);
        let mut assembled = String::new();
        for frame in &frames {
            let value: Value = serde_json::from_str(&frame.data).unwrap();
            assembled.push_str(value["delta"]["partial_json"].as_str().unwrap());
        }
        assert_eq!(assembled, format!("\"{long}\""));
    }

    #[test]
    fn emitter_switches_blocks_cleanly() {
        let mut emitter = AnthropicStreamEmitter::new("claude-3-sonnet");

        let mut frames = Vec::new();
        frames.extend(emitter.emit(&UnifiedChunk::content(0, "thinking about it... ")));
        frames.extend(emitter.emit(&UnifiedChunk::tool_call_start(1, "call_1", "get_weather")));
        frames.extend(emitter.emit(&UnifiedChunk::done(StopReason::ToolUse)));

        let events: Vec<&str> = frames.iter().map(|f| f.event.as_deref().unwrap()).collect();
        assert_eq!(
            events,
            [
                "message_start",
                "content_block_start", // text
                "content_block_delta",
                "content_block_stop",  // text closed before tool opens
                "content_block_start", // tool_use
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }
}
