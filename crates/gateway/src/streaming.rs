//! Per-connection streaming pipeline.
//!
//! Upstream bytes are split into SSE frames at blank-line boundaries, parsed
//! by the source codec into unified chunks, and re-emitted by the sink
//! codec. Output frames corresponding to one upstream frame are flushed
//! before the next upstream frame is processed, so ordering within a stream
//! is preserved end to end.

use crate::{
    codec::{Format, SseFrame, StreamEmitter, StreamParser},
    error::GatewayError,
    messages::unified::{
        ChunkKind, ContentPart, StopReason, ToolArguments, UnifiedChunk, UnifiedResponse, UnifiedUsage,
    },
};

/// Splits a byte stream into SSE frames at `\n\n` boundaries.
///
/// Handles `event:`/`data:` lines, joins multi-line `data:` fields with
/// newlines, and drops comment lines (leading `:`).
#[derive(Default)]
pub struct SseFrameSplitter {
    buffer: String,
}

impl SseFrameSplitter {
    /// Feed bytes, returning every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut frames = Vec::new();

        // Frames end at a blank line; tolerate CRLF producers.
        while let Some(position) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..position + 2).collect();

            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush a trailing frame that never got its blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(&rest)
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // Comment lines (":keepalive") and unknown fields are dropped.
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Frame-by-frame translator between two streaming dialects.
pub struct StreamTranslator {
    splitter: SseFrameSplitter,
    parser: StreamParser,
    emitter: StreamEmitter,
}

impl StreamTranslator {
    /// A translator reading `source` frames and emitting `sink` frames for
    /// the given client-visible model name.
    pub fn new(source: Format, sink: Format, model: &str) -> Self {
        Self {
            splitter: SseFrameSplitter::default(),
            parser: StreamParser::new(source),
            emitter: StreamEmitter::new(sink, model),
        }
    }

    /// Translate one slice of upstream bytes into output frames.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseFrame>, GatewayError> {
        let mut out = Vec::new();

        for frame in self.splitter.push(bytes) {
            for chunk in self.parser.parse(&frame)? {
                out.extend(self.emitter.emit(&chunk));
            }
        }

        Ok(out)
    }

    /// Close the stream, emitting whatever terminal frames the sink dialect
    /// still requires.
    pub fn finish(&mut self) -> Result<Vec<SseFrame>, GatewayError> {
        let mut out = Vec::new();

        if let Some(frame) = self.splitter.finish() {
            for chunk in self.parser.parse(&frame)? {
                out.extend(self.emitter.emit(&chunk));
            }
        }

        out.extend(self.emitter.finish());
        Ok(out)
    }
}

/// Accumulates a chunk stream into one synthesized response, for clients
/// that asked for a non-streaming reply over a streaming upstream.
#[derive(Default)]
pub struct ResponseAccumulator {
    /// Blocks in arrival order: (unified block index, part under construction).
    blocks: Vec<(u32, PartialBlock)>,
    usage: Option<UnifiedUsage>,
    stop_reason: Option<StopReason>,
    model: Option<String>,
    error: Option<String>,
}

enum PartialBlock {
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
}

impl ResponseAccumulator {
    /// A fresh accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the response under construction.
    pub fn push(&mut self, chunk: &UnifiedChunk) {
        if let Some(model) = &chunk.model {
            self.model.get_or_insert_with(|| model.clone());
        }

        if let Some(usage) = chunk.usage {
            self.merge_usage(usage);
        }

        match chunk.kind {
            ChunkKind::Content => {
                let Some(text) = chunk.delta.as_ref().and_then(|d| d.text.as_deref()) else {
                    return;
                };

                match self.block_mut(chunk.block_index.unwrap_or(0), || PartialBlock::Text(String::new())) {
                    PartialBlock::Text(buffer) => buffer.push_str(text),
                    _ => log::warn!("Text delta for a non-text block, dropping"),
                }
            }

            ChunkKind::Thinking => {
                let Some(delta) = &chunk.delta else { return };

                let block = self.block_mut(chunk.block_index.unwrap_or(0), || PartialBlock::Thinking {
                    text: String::new(),
                    signature: None,
                });

                if let PartialBlock::Thinking { text, signature } = block {
                    if let Some(fragment) = &delta.text {
                        text.push_str(fragment);
                    }
                    if let Some(fragment) = &delta.signature {
                        signature.get_or_insert_with(String::new).push_str(fragment);
                    }
                }
            }

            ChunkKind::ToolCall => {
                let Some(delta) = &chunk.delta else { return };
                let index = chunk.block_index.unwrap_or(0);

                if let Some(id) = &delta.tool_call_id {
                    let id = id.clone();
                    let name = delta.tool_name.clone().unwrap_or_default();
                    let arguments = delta.partial_json.clone().unwrap_or_default();

                    self.blocks.push((index, PartialBlock::ToolCall { id, name, arguments }));
                } else if let Some(fragment) = &delta.partial_json
                    && let Some(PartialBlock::ToolCall { arguments, .. }) = self
                        .blocks
                        .iter_mut()
                        .rev()
                        .find(|(block, _)| *block == index)
                        .map(|(_, part)| part)
                {
                    arguments.push_str(fragment);
                }
            }

            ChunkKind::Done => {
                if self.stop_reason.is_none() {
                    self.stop_reason = chunk.stop_reason;
                }
            }

            ChunkKind::Error => {
                self.error = chunk.error.clone();
                self.stop_reason = Some(StopReason::Error);
            }

            ChunkKind::Usage | ChunkKind::BlockStop | ChunkKind::ToolResult => {}
        }
    }

    fn merge_usage(&mut self, usage: UnifiedUsage) {
        let merged = match self.usage {
            None => usage,
            Some(mut existing) => {
                if usage.input_tokens > 0 {
                    existing.input_tokens = usage.input_tokens;
                }
                if usage.output_tokens > 0 {
                    existing.output_tokens = usage.output_tokens;
                }
                existing.total_tokens = usage.total_tokens.or(existing.total_tokens);
                existing.thinking_tokens = usage.thinking_tokens.or(existing.thinking_tokens);
                existing.cached_tokens = usage.cached_tokens.or(existing.cached_tokens);
                existing.credits = usage.credits.or(existing.credits);
                existing
            }
        };

        self.usage = Some(merged);
    }

    fn block_mut(&mut self, index: u32, create: impl FnOnce() -> PartialBlock) -> &mut PartialBlock {
        let position = self.blocks.iter().position(|(block, _)| *block == index);

        match position {
            Some(position) => &mut self.blocks[position].1,
            None => {
                self.blocks.push((index, create()));
                &mut self.blocks.last_mut().expect("just pushed").1
            }
        }
    }

    /// The error carried by the stream, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Finalize into a unified response.
    pub fn into_response(self) -> UnifiedResponse {
        let content = self
            .blocks
            .into_iter()
            .map(|(_, block)| match block {
                PartialBlock::Text(text) => ContentPart::text(text),
                PartialBlock::Thinking { text, signature } => ContentPart::Thinking {
                    text,
                    signature,
                    redacted: false,
                    cache_control: None,
                },
                PartialBlock::ToolCall { id, name, arguments } => ContentPart::ToolCall {
                    id,
                    name,
                    arguments: ToolArguments::Raw(arguments),
                    cache_control: None,
                },
            })
            .collect();

        UnifiedResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: self.model,
            content,
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_partial_and_multi_frame_pushes() {
        let mut splitter = SseFrameSplitter::default();

        assert!(splitter.push(b"data: {\"a\"").is_empty());

        let frames = splitter.push(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn splitter_reads_event_names_and_skips_comments() {
        let mut splitter = SseFrameSplitter::default();

        let frames = splitter.push(b"event: message_start\ndata: {}\n\n:keepalive\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
    }

    #[test]
    fn splitter_joins_multiline_data() {
        let mut splitter = SseFrameSplitter::default();
        let frames = splitter.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn translator_openai_to_anthropic_tool_round_trip() {
        let mut translator = StreamTranslator::new(Format::OpenaiChat, Format::Anthropic, "claude-3-sonnet");

        let start = serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": "get_weather", "arguments": ""}}
            ]}}]
        });
        let args = serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"loc\":\"NYC\"}"}}
            ]}}]
        });
        let finish = serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 0, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]
        });

        let mut frames = Vec::new();
        for body in [start, args, finish] {
            frames.extend(translator.push(format!("data: {body}\n\n").as_bytes()).unwrap());
        }
        frames.extend(translator.push(b"data: [DONE]\n\n").unwrap());
        frames.extend(translator.finish().unwrap());

        let events: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
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

        // The message_delta carries the tool_use stop reason.
        let delta_frame = frames
            .iter()
            .find(|f| f.event.as_deref() == Some("message_delta"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&delta_frame.data).unwrap();
        assert_eq!(value["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn accumulator_reassembles_blocks() {
        let mut accumulator = ResponseAccumulator::new();

        accumulator.push(&UnifiedChunk::content(0, "Hello "));
        accumulator.push(&UnifiedChunk::content(0, "world"));
        accumulator.push(&UnifiedChunk::tool_call_start(1, "call_1", "get_weather"));
        accumulator.push(&UnifiedChunk::tool_call_fragment(1, "{\"loc\":"));
        accumulator.push(&UnifiedChunk::tool_call_fragment(1, "\"NYC\"}"));
        accumulator.push(&UnifiedChunk::usage(UnifiedUsage {
            input_tokens: 5,
            output_tokens: 7,
            ..Default::default()
        }));
        accumulator.push(&UnifiedChunk::done(StopReason::ToolUse));

        let response = accumulator.into_response();

        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage.unwrap().output_tokens, 7);
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.joined_text(), "Hello world");

        let ContentPart::ToolCall { name, arguments, .. } = &response.content[1] else {
            panic!("expected tool call");
        };
        assert_eq!(name, "get_weather");
        assert_eq!(arguments.as_json()["loc"], "NYC");
    }
}
