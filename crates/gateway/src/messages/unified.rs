//! Protocol-agnostic unified message types.
//!
//! Every vendor wire format (OpenAI Chat Completions, OpenAI Responses,
//! Anthropic Messages, Google Gemini) is parsed into these types and emitted
//! back out of them. The conversion flow is always:
//!
//! ```text
//! client bytes → UnifiedRequest → upstream bytes
//! upstream chunk → UnifiedChunk → client frame
//! ```
//!
//! Requests are tree-shaped and owned by the handling request; nothing in
//! this module holds references into shared state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified chat request, the input side of the pivot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedRequest {
    /// Requested model identifier, possibly carrying a `:provider` suffix.
    pub model: String,

    /// Ordered conversation messages.
    pub messages: Vec<UnifiedMessage>,

    /// Plain system prompt. May coexist with `system_blocks` when the client
    /// sent structured system content with cache hints.
    pub system: Option<String>,

    /// Structured system blocks carrying per-block cache control.
    pub system_blocks: Option<Vec<SystemBlock>>,

    /// Tools the model may call. Names are unique within one request.
    #[serde(default)]
    pub tools: Vec<UnifiedTool>,

    /// How the model is allowed to use tools.
    pub tool_choice: Option<UnifiedToolChoice>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    pub top_p: Option<f32>,

    /// Top-k sampling.
    pub top_k: Option<u32>,

    /// Sequences that halt generation.
    pub stop_sequences: Option<Vec<String>>,

    /// Extended-thinking configuration.
    pub thinking: Option<ThinkingConfig>,

    /// Free-form request metadata (user id, session id, ...).
    pub metadata: Option<UnifiedMetadata>,

    /// Whether the client asked for a streamed response. Preserved verbatim.
    pub stream: Option<bool>,
}

/// One structured block of the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    /// Block text.
    pub text: String,
    /// Cache hint attached to this block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    /// Who authored the message.
    pub role: UnifiedRole,
    /// Ordered content parts. A `Tool` role message carries exactly one
    /// `ToolResult` part.
    pub parts: Vec<ContentPart>,
}

impl UnifiedMessage {
    /// A user message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: UnifiedRole::User,
            parts: vec![ContentPart::text(text)],
        }
    }

    /// An assistant message with a single text part.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: UnifiedRole::Assistant,
            parts: vec![ContentPart::text(text)],
        }
    }

    /// Concatenated text of all text parts.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedRole {
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// Content part, the atom of message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
        /// Cache hint for this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Image input. Exactly one of inline data or URL is set, enforced by
    /// [`ImageSource`] being a two-variant enum.
    Image {
        /// Where the image bytes come from.
        source: ImageSource,
        /// Cache hint for this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Tool invocation requested by the assistant.
    ToolCall {
        /// Correlation id, referenced by a later `ToolResult`.
        id: String,
        /// Tool name from the request's tool list.
        name: String,
        /// Arguments, structured or as a raw JSON string.
        arguments: ToolArguments,
        /// Cache hint for this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Result of a tool invocation.
    ToolResult {
        /// Id of the `ToolCall` this result answers.
        tool_call_id: String,
        /// The tool output.
        content: ToolResultContent,
        /// Whether the tool execution failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        /// Cache hint for this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Extended-thinking block. The signature is opaque and must round-trip
    /// unchanged through the gateway.
    Thinking {
        /// Thinking text, possibly empty for signature-only deltas.
        text: String,
        /// Opaque continuation token issued by the upstream.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        /// Whether the upstream redacted the thinking content.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        redacted: bool,
        /// Cache hint for this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentPart {
    /// A plain text part without cache hints.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    /// A tool call part with structured arguments.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        ContentPart::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: ToolArguments::Json(arguments),
            cache_control: None,
        }
    }

    /// The text content if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Image bytes, inline or by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// Base64-encoded inline data.
    Base64 {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64 payload without a data-URL prefix.
        data: String,
    },
    /// Publicly reachable URL.
    Url {
        /// HTTP(S) URL of the image.
        url: String,
    },
}

/// Tool-call arguments in either structured or raw-string form.
///
/// OpenAI carries arguments as a JSON string, Anthropic and Gemini as parsed
/// JSON. Keeping both representations avoids a needless parse/serialize
/// round-trip when source and sink agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    /// Parsed JSON value.
    Json(Value),
    /// Raw JSON string, possibly still accumulating during streaming.
    Raw(String),
}

impl ToolArguments {
    /// Structured view. Raw strings are parsed best-effort; anything that is
    /// not valid JSON becomes an empty object.
    pub fn as_json(&self) -> Value {
        match self {
            ToolArguments::Json(value) => value.clone(),
            ToolArguments::Raw(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
            }
        }
    }

    /// String view, serializing structured arguments on demand.
    pub fn to_raw(&self) -> String {
        match self {
            ToolArguments::Json(value) => serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
            ToolArguments::Raw(raw) => raw.clone(),
        }
    }
}

/// Tool result content: a plain string or nested parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Simple text output.
    Text(String),
    /// Structured output with multiple parts.
    Parts(Vec<ContentPart>),
}

impl ToolResultContent {
    /// Flatten to text, joining nested text parts.
    pub fn joined_text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Parts(parts) => parts
                .iter()
                .filter_map(ContentPart::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Prompt-cache hint, Anthropic style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheControl {
    /// Cache strategy. Currently always `ephemeral`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    /// The ephemeral cache hint.
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
        }
    }
}

/// A callable tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedTool {
    /// Unique tool name.
    pub name: String,
    /// What the tool does, for the model's benefit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON-Schema of the arguments.
    pub parameters: Value,
}

/// How the model may use tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedToolChoice {
    /// Model decides.
    Auto,
    /// Tools disabled for this turn.
    None,
    /// Model must call at least one tool.
    Required,
    /// Model must call this specific tool.
    Tool {
        /// Name of the forced tool.
        name: String,
    },
}

/// Extended-thinking request configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingConfig {
    /// Whether thinking is requested at all.
    pub enabled: bool,
    /// Token budget for the thinking phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<u32>,
    /// Effort level for providers that express thinking as effort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ThinkingEffort>,
    /// Keep earlier thinking context across turns (GLM `clear_thinking=false`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_context: Option<bool>,
    /// Ask the upstream to include thought summaries in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,
}

/// Reasoning effort levels, OpenAI style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingEffort {
    /// Explicitly no reasoning.
    None,
    /// Low effort.
    Low,
    /// Medium effort.
    Medium,
    /// High effort.
    High,
}

impl ThinkingEffort {
    /// Wire value for OpenAI's `reasoning_effort` field.
    pub fn as_str(self) -> &'static str {
        match self {
            ThinkingEffort::None => "none",
            ThinkingEffort::Low => "low",
            ThinkingEffort::Medium => "medium",
            ThinkingEffort::High => "high",
        }
    }
}

/// Free-form request metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedMetadata {
    /// Caller-supplied user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Caller-supplied session identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Unified non-streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedResponse {
    /// Upstream response id.
    pub id: String,
    /// Model that produced the response, when reported.
    pub model: Option<String>,
    /// Ordered content parts of the assistant turn.
    pub content: Vec<ContentPart>,
    /// Why generation stopped.
    pub stop_reason: Option<StopReason>,
    /// Token accounting, when reported.
    pub usage: Option<UnifiedUsage>,
}

impl UnifiedResponse {
    /// Concatenated text of all text parts.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect()
    }

    /// Whether the response contains at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, ContentPart::ToolCall { .. }))
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the assistant turn.
    EndTurn,
    /// Token limit reached.
    MaxTokens,
    /// The model invoked a tool.
    ToolUse,
    /// A stop sequence matched.
    StopSequence,
    /// Content was filtered.
    ContentFilter,
    /// The upstream reported an error mid-generation.
    Error,
}

/// Token accounting across providers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UnifiedUsage {
    /// Tokens in the prompt.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
    /// Total, when the upstream reports it separately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    /// Tokens spent on thinking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u64>,
    /// Tokens served from the prompt cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    /// Provider credit cost, for upstreams that bill in credits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
}

impl UnifiedUsage {
    /// Total tokens, computed when not reported.
    pub fn total(&self) -> u64 {
        self.total_tokens.unwrap_or(self.input_tokens + self.output_tokens)
    }
}

/// One unit of a streamed response, the pivot between SSE dialects.
///
/// A chunk lives for exactly one transform step: parsed from an upstream
/// frame, emitted as zero or more client frames, then dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedChunk {
    /// What this chunk carries.
    pub kind: ChunkKind,
    /// Index of the content block this chunk belongs to.
    pub block_index: Option<u32>,
    /// Kind of the block being opened, for block-start chunks.
    pub block_type: Option<BlockKind>,
    /// Incremental content.
    pub delta: Option<ChunkDelta>,
    /// Usage totals, typically on the final chunk.
    pub usage: Option<UnifiedUsage>,
    /// Stop reason, on `Done` chunks.
    pub stop_reason: Option<StopReason>,
    /// Error message, on `Error` chunks.
    pub error: Option<String>,
    /// Model name, when the upstream reports it in-stream.
    pub model: Option<String>,
}

/// Chunk discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Text delta.
    #[default]
    Content,
    /// Tool-call start or argument fragment.
    ToolCall,
    /// Tool result (rare in streams, kept for passthrough).
    ToolResult,
    /// Thinking delta or signature.
    Thinking,
    /// Usage-only update.
    Usage,
    /// A content block closed.
    BlockStop,
    /// Stream finished.
    Done,
    /// Upstream error event.
    Error,
}

/// Kind of content block opened by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Text block.
    Text,
    /// Tool-use block.
    ToolCall,
    /// Thinking block.
    Thinking,
}

/// Incremental content carried by a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Text fragment to append.
    pub text: Option<String>,
    /// Tool call id, present on the first chunk of a call.
    pub tool_call_id: Option<String>,
    /// Tool name, present on the first chunk of a call.
    pub tool_name: Option<String>,
    /// Incremental tool-argument JSON fragment. Consumers concatenate these
    /// before parsing.
    pub partial_json: Option<String>,
    /// Thinking signature fragment.
    pub signature: Option<String>,
}

impl UnifiedChunk {
    /// A text content delta for a block.
    pub fn content(block_index: u32, text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Content,
            block_index: Some(block_index),
            delta: Some(ChunkDelta {
                text: Some(text.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The first chunk of a tool call, carrying id and name.
    pub fn tool_call_start(block_index: u32, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::ToolCall,
            block_index: Some(block_index),
            block_type: Some(BlockKind::ToolCall),
            delta: Some(ChunkDelta {
                tool_call_id: Some(id.into()),
                tool_name: Some(name.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// An incremental tool-argument fragment.
    pub fn tool_call_fragment(block_index: u32, partial_json: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::ToolCall,
            block_index: Some(block_index),
            delta: Some(ChunkDelta {
                partial_json: Some(partial_json.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A thinking text delta.
    pub fn thinking(block_index: u32, text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Thinking,
            block_index: Some(block_index),
            delta: Some(ChunkDelta {
                text: Some(text.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A thinking signature delta with empty text.
    pub fn thinking_signature(block_index: u32, signature: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Thinking,
            block_index: Some(block_index),
            delta: Some(ChunkDelta {
                text: Some(String::new()),
                signature: Some(signature.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A block-stop marker.
    pub fn block_stop(block_index: u32) -> Self {
        Self {
            kind: ChunkKind::BlockStop,
            block_index: Some(block_index),
            ..Default::default()
        }
    }

    /// The terminal chunk of a stream.
    pub fn done(stop_reason: StopReason) -> Self {
        Self {
            kind: ChunkKind::Done,
            stop_reason: Some(stop_reason),
            ..Default::default()
        }
    }

    /// A usage-only update.
    pub fn usage(usage: UnifiedUsage) -> Self {
        Self {
            kind: ChunkKind::Usage,
            usage: Some(usage),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_arguments_best_effort_parse() {
        let valid = ToolArguments::Raw(r#"{"loc":"NYC"}"#.to_string());
        assert_eq!(valid.as_json()["loc"], "NYC");

        let broken = ToolArguments::Raw(r#"{"loc":"#.to_string());
        assert_eq!(broken.as_json(), serde_json::json!({}));
    }

    #[test]
    fn content_part_tagging() {
        let part = ContentPart::tool_call("call_1", "get_weather", serde_json::json!({"loc": "NYC"}));

        insta::assert_json_snapshot!(part, @r#"
        {
          "type": "tool_call",
          "id": "call_1",
          "name": "get_weather",
          "arguments": {
            "loc": "NYC"
          }
        }
        "#);
    }

    #[test]
    fn usage_total_falls_back_to_sum() {
        let usage = UnifiedUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        assert_eq!(usage.total(), 15);

        let reported = UnifiedUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: Some(20),
            ..Default::default()
        };
        assert_eq!(reported.total(), 20);
    }
}
