//! OpenAI Responses API wire types.
//!
//! The Responses format flattens everything into a top-level `input` array:
//! messages, function calls, and function outputs are sibling items rather
//! than nested under assistant messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Responses API request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesRequest {
    /// Model identifier.
    pub model: String,

    /// Input: a bare string or an item list.
    pub input: Input,

    /// System instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stream the response as SSE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Flattened tool definitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ResponsesTool>>,

    /// Tool usage policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    /// Reasoning configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,

    /// Id of the previous response to continue from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,

    /// Truncation strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<String>,

    /// Whether the upstream should persist the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
}

/// Request input: bare string or item list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Input {
    /// Single user turn.
    Text(String),
    /// Flattened item list.
    Items(Vec<InputItem>),
}

impl Default for Input {
    fn default() -> Self {
        Input::Items(Vec::new())
    }
}

/// One item of the flattened input array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    /// A conversation message.
    Message {
        /// Author role.
        role: String,
        /// String or typed content parts.
        content: MessageContent,
    },
    /// A function call made by the assistant, flattened to the top level.
    FunctionCall {
        /// Correlation id.
        call_id: String,
        /// Function name.
        name: String,
        /// Arguments as a JSON string.
        arguments: String,
    },
    /// The output of a function call.
    FunctionCallOutput {
        /// Id of the answered call.
        call_id: String,
        /// Output as a string.
        output: String,
    },
    /// A reasoning item carried over from a previous response.
    Reasoning {
        /// Summary parts, passed through opaquely.
        #[serde(default)]
        summary: Vec<Value>,
        /// Encrypted reasoning payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted_content: Option<String>,
    },
}

/// Message content within an input item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Typed parts.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all text parts.
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::InputText { text } | ContentPart::OutputText { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Typed content part of a Responses message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// User-side text.
    InputText {
        /// The text.
        text: String,
    },
    /// Assistant-side text.
    OutputText {
        /// The text.
        text: String,
    },
    /// User-side image.
    InputImage {
        /// `https://...` or data URL.
        image_url: String,
    },
}

/// Flattened tool definition (no nested `function` object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesTool {
    /// Always `function`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Unique function name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON-Schema of the arguments.
    #[serde(default)]
    pub parameters: Value,
}

/// Reasoning configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Effort level: `none`, `low`, `medium`, `high`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    /// Summary verbosity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Responses API response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Response id, `resp_...`.
    pub id: String,
    /// Always `response`.
    pub object: String,
    /// Unix timestamp.
    pub created_at: u64,
    /// Serving model.
    pub model: String,
    /// Terminal status, e.g. `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Output items.
    #[serde(default)]
    pub output: Vec<OutputItem>,
    /// Token accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
}

/// One output item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    /// An assistant message.
    Message {
        /// Item id.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Always `assistant`.
        role: String,
        /// Typed content parts.
        content: Vec<ContentPart>,
    },
    /// A function call.
    FunctionCall {
        /// Item id.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Correlation id.
        call_id: String,
        /// Function name.
        name: String,
        /// Arguments as a JSON string.
        arguments: String,
    },
    /// A reasoning item.
    Reasoning {
        /// Item id.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Summary parts.
        #[serde(default)]
        summary: Vec<Value>,
        /// Encrypted reasoning payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted_content: Option<String>,
    },
}

/// Token accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponsesUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Generated tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Total tokens.
    #[serde(default)]
    pub total_tokens: u64,
    /// Reasoning-token detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens_details: Option<OutputTokensDetails>,
}

/// Output token details.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutputTokensDetails {
    /// Tokens spent reasoning.
    #[serde(default)]
    pub reasoning_tokens: u64,
}

/// Streaming event vocabulary. Only the events the gateway translates are
/// typed; everything else falls into `Other` and is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// Stream opened; carries the response envelope.
    #[serde(rename = "response.created")]
    Created {
        /// The in-progress response.
        response: Response,
    },
    /// A new output item appeared.
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        /// Index within the output array.
        output_index: u32,
        /// The new item, with empty content.
        item: OutputItem,
    },
    /// Text fragment for an output item.
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        /// Index within the output array.
        output_index: u32,
        /// Fragment to append.
        delta: String,
    },
    /// Argument fragment for a function-call item.
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        /// Index within the output array.
        output_index: u32,
        /// Fragment of the arguments JSON.
        delta: String,
    },
    /// Reasoning summary fragment.
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta {
        /// Index within the output array.
        output_index: u32,
        /// Fragment to append.
        delta: String,
    },
    /// An output item finished.
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        /// Index within the output array.
        output_index: u32,
        /// The completed item.
        item: OutputItem,
    },
    /// Stream finished; carries the final response with usage.
    #[serde(rename = "response.completed")]
    Completed {
        /// The completed response.
        response: Response,
    },
    /// Any event the gateway does not translate.
    #[serde(untagged)]
    Other(Value),
}
