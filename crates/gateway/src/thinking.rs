//! Model-family fall-backs for thinking blocks in raw Gemini-wire bodies.
//!
//! The Antigravity endpoint serves both Gemini and Claude family models over
//! the Gemini wire format, and the two families disagree about thinking
//! parts: Gemini models require `thought: true` parts (and their signatures)
//! to round-trip, while Claude models reject them outright.

use serde_json::Value;

/// Model families with distinct thinking-block rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Gemini family: preserve thought parts, snake_case signatures.
    Gemini,
    /// Claude family: strip thought parts and signature fields.
    Claude,
    /// Everything else: leave the body alone.
    Other,
}

impl ModelFamily {
    /// Classify a model name.
    pub fn of(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();

        if lower.contains("claude") {
            ModelFamily::Claude
        } else if lower.contains("gemini") {
            ModelFamily::Gemini
        } else {
            ModelFamily::Other
        }
    }
}

/// Apply the family rules to every `parts` array in a Gemini-wire body.
///
/// - Gemini models: `thought: true` parts are preserved and the signature
///   field is canonicalized to snake_case `thought_signature`. Tool-use
///   parts keep their signatures too.
/// - Claude models: every `thought: true` part is removed, and residual
///   `thoughtSignature` / `thought_signature` fields are stripped from all
///   remaining parts.
pub fn ensure_thinking_signatures(body: &mut Value, model: &str) {
    let family = ModelFamily::of(model);

    if family == ModelFamily::Other {
        return;
    }

    let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
        return;
    };

    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
            continue;
        };

        match family {
            ModelFamily::Gemini => {
                for part in parts.iter_mut() {
                    canonicalize_signature(part);
                }
            }
            ModelFamily::Claude => {
                parts.retain(|part| part.get("thought").and_then(Value::as_bool) != Some(true));

                for part in parts.iter_mut() {
                    if let Some(object) = part.as_object_mut() {
                        object.remove("thoughtSignature");
                        object.remove("thought_signature");
                    }
                }
            }
            // Filtered out above.
            ModelFamily::Other => {}
        }
    }
}

/// Rewrite `thoughtSignature` to the snake_case spelling, in place.
fn canonicalize_signature(part: &mut Value) {
    let Some(object) = part.as_object_mut() else {
        return;
    };

    if let Some(signature) = object.remove("thoughtSignature") {
        object.insert("thought_signature".to_string(), signature);
    }
}

/// Collect every signature string present in a Gemini-wire body.
pub fn collect_signatures(body: &Value) -> Vec<String> {
    let mut signatures = Vec::new();

    let Some(contents) = body.get("contents").and_then(Value::as_array) else {
        return signatures;
    };

    for content in contents {
        let Some(parts) = content.get("parts").and_then(Value::as_array) else {
            continue;
        };

        for part in parts {
            for key in ["thoughtSignature", "thought_signature"] {
                if let Some(signature) = part.get(key).and_then(Value::as_str) {
                    signatures.push(signature.to_string());
                }
            }
        }
    }

    signatures
}

/// Strip every signature field from a Gemini-wire body, leaving the parts
/// themselves in place.
pub fn strip_signatures(body: &mut Value) {
    let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
        return;
    };

    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
            continue;
        };

        for part in parts {
            if let Some(object) = part.as_object_mut() {
                object.remove("thoughtSignature");
                object.remove("thought_signature");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn body() -> Value {
        json!({
            "contents": [{
                "role": "model",
                "parts": [
                    {"thought": true, "text": "T", "thoughtSignature": "S"},
                    {"text": "hi"}
                ]
            }]
        })
    }

    #[test]
    fn gemini_models_keep_and_canonicalize() {
        let mut value = body();
        ensure_thinking_signatures(&mut value, "gemini-3-pro-high");

        let parts = value["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["thought"], true);
        assert_eq!(parts[0]["text"], "T");
        assert_eq!(parts[0]["thought_signature"], "S");
        assert!(parts[0].get("thoughtSignature").is_none());
    }

    #[test]
    fn claude_models_strip_thought_parts() {
        let mut value = body();
        ensure_thinking_signatures(&mut value, "claude-opus-4-5-thinking");

        let parts = value["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "hi");
    }

    #[test]
    fn claude_models_strip_residual_signature_fields() {
        let mut value = json!({
            "contents": [{
                "role": "model",
                "parts": [
                    {"functionCall": {"name": "f", "args": {}}, "thoughtSignature": "S1"},
                    {"text": "x", "thought_signature": "S2"}
                ]
            }]
        });

        ensure_thinking_signatures(&mut value, "claude-sonnet-4");

        let parts = value["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        for part in parts {
            assert!(part.get("thoughtSignature").is_none());
            assert!(part.get("thought_signature").is_none());
        }
    }

    #[test]
    fn other_models_are_untouched() {
        let mut value = body();
        let before = value.clone();
        ensure_thinking_signatures(&mut value, "gpt-4o");
        assert_eq!(value, before);
    }

    #[test]
    fn collects_signatures_in_both_spellings() {
        let value = json!({
            "contents": [{
                "parts": [
                    {"thought": true, "thoughtSignature": "a"},
                    {"thought": true, "thought_signature": "b"}
                ]
            }]
        });

        assert_eq!(collect_signatures(&value), ["a", "b"]);
    }
}
