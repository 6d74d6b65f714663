//! OpenAI Responses API ↔ unified codec.
//!
//! The Responses format flattens tool calls into the top-level `input`
//! array; parsing re-groups consecutive function items under the preceding
//! assistant message, and emission flattens them back out.

use serde_json::Value;
use std::collections::HashMap;

use crate::{
    error::GatewayError,
    messages::{
        responses::{
            ContentPart as WirePart, Input, InputItem, MessageContent, OutputItem, ReasoningConfig, Response,
            ResponsesRequest, ResponsesTool, ResponsesUsage, StreamEvent,
        },
        unified::{
            ChunkKind, ContentPart, StopReason, ThinkingConfig, ThinkingEffort, ToolArguments, ToolResultContent,
            UnifiedChunk, UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool,
            UnifiedToolChoice, UnifiedUsage,
        },
    },
};

use super::SseFrame;

/// Parse a Responses API request into the unified representation.
pub fn parse_request(bytes: &[u8]) -> Result<UnifiedRequest, GatewayError> {
    let request: ResponsesRequest = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid responses request: {e}")))?;

    let mut system_parts = Vec::new();

    if let Some(instructions) = &request.instructions
        && !instructions.is_empty()
    {
        system_parts.push(instructions.clone());
    }

    let mut messages: Vec<UnifiedMessage> = Vec::new();

    match request.input {
        Input::Text(text) => messages.push(UnifiedMessage::user(text)),
        Input::Items(items) => {
            for item in items {
                parse_item(item, &mut system_parts, &mut messages);
            }
        }
    }

    let thinking = request.reasoning.as_ref().and_then(|r| r.effort.as_deref()).map(|effort| {
        let effort = match effort {
            "none" => ThinkingEffort::None,
            "low" => ThinkingEffort::Low,
            "medium" => ThinkingEffort::Medium,
            _ => ThinkingEffort::High,
        };
        ThinkingConfig {
            enabled: effort != ThinkingEffort::None,
            effort: Some(effort),
            ..Default::default()
        }
    });

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| UnifiedTool {
            name: tool.name,
            description: tool.description,
            parameters: tool.parameters,
        })
        .collect();

    let tool_choice = request.tool_choice.as_ref().and_then(parse_tool_choice);

    Ok(UnifiedRequest {
        model: request.model,
        messages,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
        system_blocks: None,
        tools,
        tool_choice,
        max_tokens: request.max_output_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: None,
        thinking,
        metadata: None,
        stream: request.stream,
    })
}

/// Fold one flattened input item into the message list. Function items are
/// re-grouped under the preceding assistant message.
fn parse_item(item: InputItem, system_parts: &mut Vec<String>, messages: &mut Vec<UnifiedMessage>) {
    match item {
        InputItem::Message { role, content } => {
            let text = content.joined_text();

            match role.as_str() {
                "system" | "developer" => system_parts.push(text),
                "assistant" => messages.push(UnifiedMessage::assistant(text)),
                _ => messages.push(UnifiedMessage::user(text)),
            }
        }

        InputItem::FunctionCall { call_id, name, arguments } => {
            let part = ContentPart::ToolCall {
                id: call_id,
                name,
                arguments: ToolArguments::Raw(arguments),
                cache_control: None,
            };

            match messages.last_mut() {
                Some(message) if message.role == UnifiedRole::Assistant => message.parts.push(part),
                _ => messages.push(UnifiedMessage {
                    role: UnifiedRole::Assistant,
                    parts: vec![part],
                }),
            }
        }

        InputItem::FunctionCallOutput { call_id, output } => {
            messages.push(UnifiedMessage {
                role: UnifiedRole::Tool,
                parts: vec![ContentPart::ToolResult {
                    tool_call_id: call_id,
                    content: ToolResultContent::Text(output),
                    is_error: None,
                    cache_control: None,
                }],
            });
        }

        InputItem::Reasoning {
            summary,
            encrypted_content,
        } => {
            let text = summary
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");

            let part = ContentPart::Thinking {
                text,
                signature: encrypted_content,
                redacted: false,
                cache_control: None,
            };

            match messages.last_mut() {
                Some(message) if message.role == UnifiedRole::Assistant => message.parts.push(part),
                _ => messages.push(UnifiedMessage {
                    role: UnifiedRole::Assistant,
                    parts: vec![part],
                }),
            }
        }
    }
}

fn parse_tool_choice(value: &Value) -> Option<UnifiedToolChoice> {
    if let Some(mode) = value.as_str() {
        return Some(match mode {
            "none" => UnifiedToolChoice::None,
            "required" => UnifiedToolChoice::Required,
            _ => UnifiedToolChoice::Auto,
        });
    }

    value
        .get("name")
        .and_then(Value::as_str)
        .map(|name| UnifiedToolChoice::Tool { name: name.to_string() })
}

/// Emit a unified request as a Responses API body.
pub fn transform_request(request: &UnifiedRequest, model: &str) -> Value {
    let mut items = Vec::new();

    for message in &request.messages {
        match message.role {
            UnifiedRole::Tool => {
                for part in &message.parts {
                    if let ContentPart::ToolResult {
                        tool_call_id, content, ..
                    } = part
                    {
                        items.push(InputItem::FunctionCallOutput {
                            call_id: tool_call_id.clone(),
                            output: content.joined_text(),
                        });
                    }
                }
            }

            UnifiedRole::User => {
                let text = message.joined_text();
                if !text.is_empty() {
                    items.push(InputItem::Message {
                        role: "user".to_string(),
                        content: MessageContent::Parts(vec![WirePart::InputText { text }]),
                    });
                }
            }

            UnifiedRole::Assistant => {
                let text = message.joined_text();
                if !text.is_empty() {
                    items.push(InputItem::Message {
                        role: "assistant".to_string(),
                        content: MessageContent::Parts(vec![WirePart::OutputText { text }]),
                    });
                }

                // Tool calls flatten back out as sibling items.
                for part in &message.parts {
                    match part {
                        ContentPart::ToolCall { id, name, arguments, .. } => {
                            items.push(InputItem::FunctionCall {
                                call_id: id.clone(),
                                name: name.clone(),
                                arguments: arguments.to_raw(),
                            });
                        }
                        ContentPart::Thinking {
                            text, signature: Some(signature), ..
                        } => {
                            items.push(InputItem::Reasoning {
                                summary: if text.is_empty() {
                                    Vec::new()
                                } else {
                                    vec![serde_json::json!({"type": "summary_text", "text": text})]
                                },
                                encrypted_content: Some(signature.clone()),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    let reasoning = request.thinking.as_ref().and_then(|config| {
        config.effort.map(|effort| ReasoningConfig {
            effort: Some(effort.as_str().to_string()),
            summary: None,
        })
    });

    let body = ResponsesRequest {
        model: model.to_string(),
        input: Input::Items(items),
        instructions: request.system.clone().filter(|s| !s.is_empty()),
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        tools: (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|tool| ResponsesTool {
                    kind: "function".to_string(),
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                })
                .collect()
        }),
        tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
            UnifiedToolChoice::Auto => Value::String("auto".to_string()),
            UnifiedToolChoice::None => Value::String("none".to_string()),
            UnifiedToolChoice::Required => Value::String("required".to_string()),
            UnifiedToolChoice::Tool { name } => serde_json::json!({"type": "function", "name": name}),
        }),
        reasoning,
        previous_response_id: None,
        truncation: None,
        store: None,
    };

    serde_json::to_value(body).unwrap_or_default()
}

/// Parse a non-streaming Responses API response.
pub fn parse_response(bytes: &[u8]) -> Result<UnifiedResponse, GatewayError> {
    let response: Response = sonic_rs::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid responses response: {e}")))?;

    Ok(build_response(response))
}

fn build_response(response: Response) -> UnifiedResponse {
    let mut content = Vec::new();
    let mut has_tool_calls = false;

    for item in response.output {
        match item {
            OutputItem::Message { content: parts, .. } => {
                let text: String = parts
                    .iter()
                    .filter_map(|part| match part {
                        WirePart::OutputText { text } | WirePart::InputText { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();

                if !text.is_empty() {
                    content.push(ContentPart::text(text));
                }
            }
            OutputItem::FunctionCall {
                call_id, name, arguments, ..
            } => {
                has_tool_calls = true;
                content.push(ContentPart::ToolCall {
                    id: call_id,
                    name,
                    arguments: ToolArguments::Raw(arguments),
                    cache_control: None,
                });
            }
            OutputItem::Reasoning {
                summary,
                encrypted_content,
                ..
            } => {
                let text = summary
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("");

                if !text.is_empty() || encrypted_content.is_some() {
                    content.push(ContentPart::Thinking {
                        text,
                        signature: encrypted_content,
                        redacted: false,
                        cache_control: None,
                    });
                }
            }
        }
    }

    let stop_reason = if has_tool_calls {
        StopReason::ToolUse
    } else if response.status.as_deref() == Some("incomplete") {
        StopReason::MaxTokens
    } else {
        StopReason::EndTurn
    };

    UnifiedResponse {
        id: response.id,
        model: Some(response.model),
        content,
        stop_reason: Some(stop_reason),
        usage: response.usage.map(usage_to_unified),
    }
}

fn usage_to_unified(usage: ResponsesUsage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: Some(usage.total_tokens),
        thinking_tokens: usage
            .output_tokens_details
            .map(|d| d.reasoning_tokens)
            .filter(|&t| t > 0),
        cached_tokens: None,
        credits: None,
    }
}

/// Emit a unified response as a Responses API body.
pub fn transform_response(response: &UnifiedResponse, model: &str) -> Value {
    let mut output = Vec::new();
    let mut text = String::new();

    for part in &response.content {
        match part {
            ContentPart::Text { text: t, .. } => text.push_str(t),
            ContentPart::ToolCall { id, name, arguments, .. } => {
                output.push(OutputItem::FunctionCall {
                    id: None,
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.to_raw(),
                });
            }
            ContentPart::Thinking { text: t, signature, .. } => {
                output.push(OutputItem::Reasoning {
                    id: None,
                    summary: if t.is_empty() {
                        Vec::new()
                    } else {
                        vec![serde_json::json!({"type": "summary_text", "text": t})]
                    },
                    encrypted_content: signature.clone(),
                });
            }
            _ => {}
        }
    }

    if !text.is_empty() {
        output.insert(
            0,
            OutputItem::Message {
                id: None,
                role: "assistant".to_string(),
                content: vec![WirePart::OutputText { text }],
            },
        );
    }

    let body = Response {
        id: if response.id.is_empty() {
            format!("resp_{}", uuid::Uuid::new_v4().simple())
        } else {
            response.id.clone()
        },
        object: "response".to_string(),
        created_at: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        model: model.to_string(),
        status: Some("completed".to_string()),
        output,
        usage: response.usage.map(|usage| ResponsesUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
            output_tokens_details: None,
        }),
    };

    serde_json::to_value(body).unwrap_or_default()
}

/// Stateful parser for Responses API streaming events.
#[derive(Default)]
pub struct ResponsesStreamParser {
    saw_tool_call: bool,
    finished: bool,
}

impl ResponsesStreamParser {
    /// Translate one upstream frame into unified chunks.
    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedChunk>, GatewayError> {
        if frame.data.trim() == "[DONE]" {
            if self.finished {
                return Ok(Vec::new());
            }
            self.finished = true;
            return Ok(vec![UnifiedChunk::done(StopReason::EndTurn)]);
        }

        let Ok(event) = sonic_rs::from_str::<StreamEvent>(&frame.data) else {
            log::warn!("Failed to parse Responses streaming event, skipping frame");
            return Ok(Vec::new());
        };

        let chunks = match event {
            StreamEvent::Created { response } => {
                let mut chunk = UnifiedChunk {
                    kind: ChunkKind::Usage,
                    ..Default::default()
                };
                chunk.model = Some(response.model);
                vec![chunk]
            }

            StreamEvent::OutputItemAdded { output_index, item } => match item {
                OutputItem::FunctionCall { call_id, name, .. } => {
                    vec![UnifiedChunk::tool_call_start(output_index, call_id, name)]
                }
                _ => Vec::new(),
            },

            StreamEvent::OutputTextDelta { output_index, delta } => {
                vec![UnifiedChunk::content(output_index, delta)]
            }

            StreamEvent::FunctionCallArgumentsDelta { output_index, delta } => {
                vec![UnifiedChunk::tool_call_fragment(output_index, delta)]
            }

            StreamEvent::ReasoningSummaryTextDelta { output_index, delta } => {
                vec![UnifiedChunk::thinking(output_index, delta)]
            }

            StreamEvent::OutputItemDone { output_index, item } => {
                if matches!(item, OutputItem::FunctionCall { .. }) {
                    self.saw_tool_call = true;
                }
                vec![UnifiedChunk::block_stop(output_index)]
            }

            StreamEvent::Completed { response } => {
                self.finished = true;

                let has_tool_calls = self.saw_tool_call
                    || response
                        .output
                        .iter()
                        .any(|item| matches!(item, OutputItem::FunctionCall { .. }));

                let mut done = UnifiedChunk::done(if has_tool_calls {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                });
                done.usage = response.usage.map(usage_to_unified);
                vec![done]
            }

            StreamEvent::Other(_) => Vec::new(),
        };

        Ok(chunks)
    }
}

/// Stateful emitter producing Responses API streaming events.
pub struct ResponsesStreamEmitter {
    id: String,
    model: String,
    created: bool,
    finished: bool,
    saw_tool_call: bool,
    /// Unified block index → output array index.
    indices: HashMap<u32, u32>,
    next_index: u32,
}

impl ResponsesStreamEmitter {
    /// A fresh emitter for one client connection.
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: false,
            finished: false,
            saw_tool_call: false,
            indices: HashMap::new(),
            next_index: 0,
        }
    }

    /// Translate one unified chunk into Responses frames.
    pub fn emit(&mut self, chunk: &UnifiedChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        match chunk.kind {
            ChunkKind::Content => {
                self.ensure_created(&mut frames);
                let index = self.index_for(chunk.block_index.unwrap_or(0));
                frames.push(event_frame(&StreamEvent::OutputTextDelta {
                    output_index: index,
                    delta: chunk.delta.as_ref().and_then(|d| d.text.clone()).unwrap_or_default(),
                }));
            }

            ChunkKind::Thinking => {
                let Some(delta) = &chunk.delta else { return frames };
                let text = delta.text.clone().unwrap_or_default();
                if text.is_empty() {
                    return frames;
                }
                self.ensure_created(&mut frames);
                let index = self.index_for(chunk.block_index.unwrap_or(0));
                frames.push(event_frame(&StreamEvent::ReasoningSummaryTextDelta {
                    output_index: index,
                    delta: text,
                }));
            }

            ChunkKind::ToolCall => {
                let Some(delta) = &chunk.delta else { return frames };
                self.ensure_created(&mut frames);
                let index = self.index_for(chunk.block_index.unwrap_or(0));

                if let Some(id) = &delta.tool_call_id {
                    self.saw_tool_call = true;
                    frames.push(event_frame(&StreamEvent::OutputItemAdded {
                        output_index: index,
                        item: OutputItem::FunctionCall {
                            id: None,
                            call_id: id.clone(),
                            name: delta.tool_name.clone().unwrap_or_default(),
                            arguments: String::new(),
                        },
                    }));
                }

                if let Some(partial) = &delta.partial_json
                    && !partial.is_empty()
                {
                    frames.push(event_frame(&StreamEvent::FunctionCallArgumentsDelta {
                        output_index: index,
                        delta: partial.clone(),
                    }));
                }
            }

            ChunkKind::Done => {
                if self.finished {
                    return frames;
                }
                self.ensure_created(&mut frames);
                self.finished = true;

                let response = Response {
                    id: self.id.clone(),
                    object: "response".to_string(),
                    created_at: 0,
                    model: self.model.clone(),
                    status: Some("completed".to_string()),
                    output: Vec::new(),
                    usage: chunk.usage.map(|usage| ResponsesUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.total(),
                        output_tokens_details: None,
                    }),
                };

                frames.push(event_frame(&StreamEvent::Completed { response }));
            }

            ChunkKind::Error => {
                self.finished = true;
                frames.push(SseFrame::event(
                    "error",
                    serde_json::json!({
                        "type": "error",
                        "error": {"message": chunk.error.clone().unwrap_or_else(|| "stream error".to_string())}
                    })
                    .to_string(),
                ));
            }

            ChunkKind::Usage | ChunkKind::BlockStop | ChunkKind::ToolResult => {}
        }

        frames
    }

    /// Terminate the stream if the upstream never sent a done chunk.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        let stop = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        self.emit(&UnifiedChunk::done(stop))
    }

    fn ensure_created(&mut self, frames: &mut Vec<SseFrame>) {
        if self.created {
            return;
        }
        self.created = true;

        let response = Response {
            id: self.id.clone(),
            object: "response".to_string(),
            created_at: 0,
            model: self.model.clone(),
            status: Some("in_progress".to_string()),
            output: Vec::new(),
            usage: None,
        };

        frames.push(event_frame(&StreamEvent::Created { response }));
    }

    fn index_for(&mut self, block: u32) -> u32 {
        if let Some(&index) = self.indices.get(&block) {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.indices.insert(block, index);
        index
    }
}

fn event_frame(event: &StreamEvent) -> SseFrame {
    let name = match event {
        StreamEvent::Created { .. } => "response.created",
        StreamEvent::OutputItemAdded { .. } => "response.output_item.added",
        StreamEvent::OutputTextDelta { .. } => "response.output_text.delta",
        StreamEvent::FunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
        StreamEvent::ReasoningSummaryTextDelta { .. } => "response.reasoning_summary_text.delta",
        StreamEvent::OutputItemDone { .. } => "response.output_item.done",
        StreamEvent::Completed { .. } => "response.completed",
        StreamEvent::Other(_) => "message",
    };

    SseFrame::event(name, sonic_rs::to_string(event).unwrap_or_default())
}
