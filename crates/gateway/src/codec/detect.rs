//! Wire-format detection for incoming payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four wire formats the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// OpenAI Chat Completions.
    #[serde(alias = "openai")]
    OpenaiChat,
    /// OpenAI Responses.
    OpenaiResponses,
    /// Anthropic Messages.
    Anthropic,
    /// Google Gemini generateContent.
    Gemini,
}

impl Format {
    /// Parse a format name as used in `/v1/proxy` query parameters.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "openai" | "openai_chat" | "openai-chat" => Some(Format::OpenaiChat),
            "openai_responses" | "openai-responses" | "responses" => Some(Format::OpenaiResponses),
            "anthropic" => Some(Format::Anthropic),
            "gemini" | "google" => Some(Format::Gemini),
            _ => None,
        }
    }

    /// Canonical name of this format.
    pub fn as_str(self) -> &'static str {
        match self {
            Format::OpenaiChat => "openai_chat",
            Format::OpenaiResponses => "openai_responses",
            Format::Anthropic => "anthropic",
            Format::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys that only appear in Responses API payloads. `input` is handled
/// separately since it only counts when `messages` is absent.
const RESPONSES_ONLY_KEYS: &[&str] = &[
    "instructions",
    "max_output_tokens",
    "previous_response_id",
    "reasoning",
    "truncation",
    "store",
];

/// Classify a JSON payload by wire format.
///
/// Pure and deterministic: the same payload always yields the same verdict.
/// Tests run in order; the first match wins:
///
/// 1. top-level `contents` array ⇒ Gemini
/// 2. top-level `input` without `messages`, or any Responses-only key ⇒ Responses
/// 3. `messages` plus top-level `system` ⇒ Anthropic
/// 4. `messages` ⇒ OpenAI Chat
/// 5. anything else ⇒ OpenAI Chat
pub fn detect_format(payload: &Value) -> Format {
    let Some(object) = payload.as_object() else {
        return Format::OpenaiChat;
    };

    if object.get("contents").is_some_and(Value::is_array) {
        return Format::Gemini;
    }

    let has_messages = object.contains_key("messages");

    if (object.contains_key("input") && !has_messages)
        || RESPONSES_ONLY_KEYS.iter().any(|key| object.contains_key(*key))
    {
        return Format::OpenaiResponses;
    }

    if has_messages && object.contains_key("system") {
        return Format::Anthropic;
    }

    Format::OpenaiChat
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn detects_gemini_by_contents() {
        let payload = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        assert_eq!(detect_format(&payload), Format::Gemini);
    }

    #[test]
    fn detects_responses_by_input() {
        let payload = json!({"model": "gpt-5", "input": "hello"});
        assert_eq!(detect_format(&payload), Format::OpenaiResponses);
    }

    #[test]
    fn detects_responses_by_marker_key() {
        let payload = json!({"model": "gpt-5", "messages": [], "store": false});
        assert_eq!(detect_format(&payload), Format::OpenaiResponses);
    }

    #[test]
    fn detects_anthropic_by_system() {
        let payload = json!({
            "model": "claude-3-sonnet",
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}]
        });
        assert_eq!(detect_format(&payload), Format::Anthropic);
    }

    #[test]
    fn detects_anthropic_with_system_blocks() {
        let payload = json!({
            "model": "claude-3-sonnet",
            "system": [{"type": "text", "text": "be brief"}],
            "messages": []
        });
        assert_eq!(detect_format(&payload), Format::Anthropic);
    }

    #[test]
    fn plain_messages_is_openai() {
        let payload = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(detect_format(&payload), Format::OpenaiChat);
    }

    #[test]
    fn unknown_shape_defaults_to_openai() {
        assert_eq!(detect_format(&json!({"prompt": "hi"})), Format::OpenaiChat);
        assert_eq!(detect_format(&json!(42)), Format::OpenaiChat);
    }

    #[test]
    fn detection_is_stable() {
        let payload = json!({"model": "gpt-5", "input": "hello", "messages": []});
        let first = detect_format(&payload);
        for _ in 0..3 {
            assert_eq!(detect_format(&payload), first);
        }
    }
}
