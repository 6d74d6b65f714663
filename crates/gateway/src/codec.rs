//! Bidirectional codecs between vendor wire formats and the unified types.
//!
//! For each supported format there are six operations: request and response
//! parse/transform pairs plus a streaming pair. Parsing the stream side is
//! done by a stateful per-connection parser (some dialects spread one logical
//! event over several frames), and emission by a stateful per-connection
//! emitter (some dialects need bookkeeping such as Anthropic's block
//! indices).
//!
//! Dispatch over formats is a closed set; the enums below are the "table of
//! function pointers".

pub mod anthropic;
pub mod detect;
pub mod gemini;
pub mod openai;
pub mod responses;

use serde_json::Value;

use crate::{
    error::GatewayError,
    messages::unified::{UnifiedChunk, UnifiedRequest, UnifiedResponse},
};

pub use detect::Format;

/// One Server-Sent-Events frame: optional `event:` name plus a `data:` line.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// The `event:` field, when the dialect uses one.
    pub event: Option<String>,
    /// The `data:` payload, normally JSON.
    pub data: String,
}

impl SseFrame {
    /// A frame with only a `data:` line.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// A frame with both `event:` and `data:` lines.
    pub fn event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Serialize to the wire form, terminated by the blank line.
    pub fn to_wire(&self) -> String {
        match &self.event {
            Some(event) => format!("event: {event}\ndata: {}\n\n", self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// Parse a request body in the given format into the unified representation.
pub fn parse_request(format: Format, bytes: &[u8]) -> Result<UnifiedRequest, GatewayError> {
    match format {
        Format::OpenaiChat => openai::parse_request(bytes),
        Format::OpenaiResponses => responses::parse_request(bytes),
        Format::Anthropic => anthropic::parse_request(bytes),
        Format::Gemini => gemini::parse_request(bytes),
    }
}

/// Emit a unified request in the given format.
pub fn transform_request(format: Format, request: &UnifiedRequest, model: &str) -> Value {
    match format {
        Format::OpenaiChat => openai::transform_request(request, model),
        Format::OpenaiResponses => responses::transform_request(request, model),
        Format::Anthropic => anthropic::transform_request(request, model),
        Format::Gemini => gemini::transform_request(request, model),
    }
}

/// Parse a non-streaming response body in the given format.
pub fn parse_response(format: Format, bytes: &[u8]) -> Result<UnifiedResponse, GatewayError> {
    match format {
        Format::OpenaiChat => openai::parse_response(bytes),
        Format::OpenaiResponses => responses::parse_response(bytes),
        Format::Anthropic => anthropic::parse_response(bytes),
        Format::Gemini => gemini::parse_response(bytes),
    }
}

/// Emit a unified response in the given format.
pub fn transform_response(format: Format, response: &UnifiedResponse, model: &str) -> Value {
    match format {
        Format::OpenaiChat => openai::transform_response(response, model),
        Format::OpenaiResponses => responses::transform_response(response, model),
        Format::Anthropic => anthropic::transform_response(response, model),
        Format::Gemini => gemini::transform_response(response, model),
    }
}

/// Stateful stream-side parser for one upstream connection.
pub enum StreamParser {
    /// OpenAI Chat Completions chunks.
    OpenaiChat(openai::OpenaiStreamParser),
    /// OpenAI Responses events.
    OpenaiResponses(responses::ResponsesStreamParser),
    /// Anthropic Messages events.
    Anthropic(anthropic::AnthropicStreamParser),
    /// Gemini streamed candidates.
    Gemini(gemini::GeminiStreamParser),
}

impl StreamParser {
    /// A fresh parser for the given source format.
    pub fn new(format: Format) -> Self {
        match format {
            Format::OpenaiChat => StreamParser::OpenaiChat(openai::OpenaiStreamParser::default()),
            Format::OpenaiResponses => StreamParser::OpenaiResponses(responses::ResponsesStreamParser::default()),
            Format::Anthropic => StreamParser::Anthropic(anthropic::AnthropicStreamParser::default()),
            Format::Gemini => StreamParser::Gemini(gemini::GeminiStreamParser::default()),
        }
    }

    /// Translate one upstream frame into zero or more unified chunks.
    /// An empty vector means the frame carried nothing translatable.
    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedChunk>, GatewayError> {
        match self {
            StreamParser::OpenaiChat(parser) => parser.parse(frame),
            StreamParser::OpenaiResponses(parser) => parser.parse(frame),
            StreamParser::Anthropic(parser) => parser.parse(frame),
            StreamParser::Gemini(parser) => parser.parse(frame),
        }
    }
}

/// Stateful stream-side emitter for one client connection.
pub enum StreamEmitter {
    /// OpenAI Chat Completions chunks.
    OpenaiChat(openai::OpenaiStreamEmitter),
    /// OpenAI Responses events.
    OpenaiResponses(responses::ResponsesStreamEmitter),
    /// Anthropic Messages events.
    Anthropic(anthropic::AnthropicStreamEmitter),
    /// Gemini streamed candidates.
    Gemini(gemini::GeminiStreamEmitter),
}

impl StreamEmitter {
    /// A fresh emitter for the given sink format.
    pub fn new(format: Format, model: &str) -> Self {
        match format {
            Format::OpenaiChat => StreamEmitter::OpenaiChat(openai::OpenaiStreamEmitter::new(model)),
            Format::OpenaiResponses => {
                StreamEmitter::OpenaiResponses(responses::ResponsesStreamEmitter::new(model))
            }
            Format::Anthropic => StreamEmitter::Anthropic(anthropic::AnthropicStreamEmitter::new(model)),
            Format::Gemini => StreamEmitter::Gemini(gemini::GeminiStreamEmitter::new(model)),
        }
    }

    /// Translate one unified chunk into zero or more client frames.
    pub fn emit(&mut self, chunk: &UnifiedChunk) -> Vec<SseFrame> {
        match self {
            StreamEmitter::OpenaiChat(emitter) => emitter.emit(chunk),
            StreamEmitter::OpenaiResponses(emitter) => emitter.emit(chunk),
            StreamEmitter::Anthropic(emitter) => emitter.emit(chunk),
            StreamEmitter::Gemini(emitter) => emitter.emit(chunk),
        }
    }

    /// Close the stream, flushing any frames the dialect requires at the end.
    /// Safe to call when the upstream already sent a terminal chunk.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        match self {
            StreamEmitter::OpenaiChat(emitter) => emitter.finish(),
            StreamEmitter::OpenaiResponses(emitter) => emitter.finish(),
            StreamEmitter::Anthropic(emitter) => emitter.finish(),
            StreamEmitter::Gemini(emitter) => emitter.finish(),
        }
    }
}
