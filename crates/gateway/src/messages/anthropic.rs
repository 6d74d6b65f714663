//! Anthropic Messages wire types, including the SSE event vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages API request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation messages. Roles alternate between `user` and `assistant`;
    /// tool results arrive as `tool_result` blocks on user messages.
    pub messages: Vec<InputMessage>,

    /// System prompt: a plain string or structured blocks with cache hints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Required by the upstream API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Stream the response as SSE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Available tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    /// Tool usage policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Extended-thinking switch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingParam>,

    /// Request metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// System prompt: plain string or blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Plain text.
    Text(String),
    /// Structured blocks, each optionally cache-controlled.
    Blocks(Vec<SystemBlock>),
}

/// One system prompt block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    /// Always `text`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Block text.
    pub text: String,
    /// Cache hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

/// Extended-thinking request parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingParam {
    /// Thinking on, with a token budget.
    Enabled {
        /// Token budget for the thinking phase.
        budget_tokens: u32,
    },
    /// Thinking off.
    Disabled,
}

/// Request metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// End-user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// One input message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    /// `user` or `assistant`.
    pub role: Role,
    /// Plain string or content blocks.
    pub content: MessageContent,
}

/// Message roles on the Anthropic wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user input (also carries tool results).
    User,
    /// Model output.
    Assistant,
}

/// Message content: plain string or blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Typed content blocks.
    Blocks(Vec<ContentBlock>),
}

/// A content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text block.
    Text {
        /// The text.
        text: String,
        /// Cache hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    /// Image block.
    Image {
        /// Image source.
        source: ImageSource,
        /// Cache hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    /// Tool invocation by the assistant.
    ToolUse {
        /// Correlation id, `toolu_...`.
        id: String,
        /// Tool name.
        name: String,
        /// Parsed arguments.
        input: Value,
        /// Cache hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    /// Tool result on a user message.
    ToolResult {
        /// Id of the answered tool_use block.
        tool_use_id: String,
        /// Result payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        /// Whether the tool failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        /// Cache hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    /// Extended-thinking block.
    Thinking {
        /// Thinking text.
        thinking: String,
        /// Opaque continuation token. Must round-trip unchanged.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Redacted thinking block.
    RedactedThinking {
        /// Opaque encrypted payload.
        data: String,
    },
}

/// Image source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// Inline base64 data.
    Base64 {
        /// MIME type.
        media_type: String,
        /// Base64 payload.
        data: String,
    },
    /// Image by URL.
    Url {
        /// HTTP(S) URL.
        url: String,
    },
}

/// Tool result payload: string or nested blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Plain text result.
    Text(String),
    /// Structured result blocks.
    Blocks(Vec<ContentBlock>),
}

/// Tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON-Schema of the arguments.
    pub input_schema: Value,
}

/// Tool usage policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides.
    Auto,
    /// Model must call at least one tool.
    Any,
    /// Model must call this tool.
    Tool {
        /// The forced tool name.
        name: String,
    },
    /// Tools disabled.
    None,
}

/// Messages API response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Response id, `msg_...`.
    pub id: String,
    /// Always `message`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Always `assistant`.
    pub role: String,
    /// Response content blocks.
    pub content: Vec<ContentBlock>,
    /// Serving model.
    pub model: String,
    /// Why generation stopped.
    pub stop_reason: Option<StopReason>,
    /// Which stop sequence matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    /// Token accounting.
    pub usage: Usage,
}

/// Anthropic stop reasons with a forward-compatible fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn.
    EndTurn,
    /// Token limit.
    MaxTokens,
    /// A stop sequence matched.
    StopSequence,
    /// The model invoked a tool.
    ToolUse,
    /// The model refused.
    Refusal,
    /// Anything not yet known.
    #[serde(untagged)]
    Other(String),
}

/// Token usage block.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens. Omitted in streaming `message_delta` events.
    #[serde(default)]
    pub input_tokens: u64,
    /// Generated tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens read from the prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    /// Tokens written to the prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

/// Streaming event vocabulary.
///
/// Event flow for a typical response:
/// `message_start` → (`content_block_start` → `content_block_delta`* →
/// `content_block_stop`)* → `message_delta` → `message_stop`.
/// `ping` may arrive at any point and is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Initial message metadata, seeds usage.
    MessageStart {
        /// The message envelope with empty content.
        message: MessageStart,
    },
    /// A new content block begins.
    ContentBlockStart {
        /// Block index.
        index: u32,
        /// Block type and initial state.
        content_block: StreamContentBlock,
    },
    /// Incremental update to a content block.
    ContentBlockDelta {
        /// Block index.
        index: u32,
        /// The delta payload.
        delta: BlockDelta,
    },
    /// A content block closed.
    ContentBlockStop {
        /// Block index.
        index: u32,
    },
    /// Final message metadata: stop reason and output tokens.
    MessageDelta {
        /// Stop metadata.
        delta: MessageDeltaData,
        /// Usage with the final output token count.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    /// End of stream.
    MessageStop,
    /// Keep-alive, ignored.
    Ping,
    /// Stream error; the stream ends after this event.
    Error {
        /// Error payload.
        error: StreamError,
    },
}

impl StreamEvent {
    /// The SSE `event:` name for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Envelope carried by `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStart {
    /// Message id.
    pub id: String,
    /// Always `message`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Always `assistant`.
    pub role: String,
    /// Empty at start; populated through block events.
    pub content: Vec<Value>,
    /// Serving model.
    pub model: String,
    /// Always null at start.
    pub stop_reason: Option<String>,
    /// Always null at start.
    pub stop_sequence: Option<String>,
    /// Usage with the input token count.
    pub usage: Usage,
}

/// Block metadata carried by `content_block_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamContentBlock {
    /// Text block; starts empty.
    Text {
        /// Initial text, usually empty.
        text: String,
    },
    /// Tool-use block.
    ToolUse {
        /// Correlation id.
        id: String,
        /// Tool name.
        name: String,
        /// Initial arguments, usually an empty object.
        #[serde(default)]
        input: Value,
    },
    /// Thinking block; starts empty.
    Thinking {
        /// Initial thinking text, usually empty.
        thinking: String,
    },
}

/// Delta payload carried by `content_block_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    /// Text fragment.
    TextDelta {
        /// Fragment to append.
        text: String,
    },
    /// Tool-argument JSON fragment.
    InputJsonDelta {
        /// Fragment of the arguments JSON; concatenate before parsing.
        partial_json: String,
    },
    /// Thinking text fragment.
    ThinkingDelta {
        /// Fragment to append.
        thinking: String,
    },
    /// Thinking signature fragment.
    SignatureDelta {
        /// Opaque signature token.
        signature: String,
    },
}

/// Stop metadata carried by `message_delta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDeltaData {
    /// Why generation stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Which stop sequence matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// Error payload of an `error` stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamError {
    /// Error type, e.g. `overloaded_error`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Error response body, `{"type":"error","error":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `error`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The error payload.
    pub error: StreamError,
}
