//! Antigravity-specific request preparation.
//!
//! The Antigravity endpoint speaks the Gemini wire format but needs a
//! `project` field, stricter tool names, and careful handling of thought
//! signatures: a signature minted under one Google Cloud project is rejected
//! when replayed under another, so requests carrying foreign signatures are
//! re-keyed to their original project or stripped.

use serde_json::Value;

use crate::{
    schema::{decode_tool_name, encode_tool_name},
    signature::{SignatureRecord, SignatureStore},
    thinking,
};

/// Endpoint rotation order when the configuration does not provide one.
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://cloudcode-pa.googleapis.com",
];

/// Project used as a last resort when a license error points at a broken
/// project binding.
pub const DEFAULT_PROJECT_ID: &str = "rising-fact-p41f";

/// Whether an error body is the Antigravity license error (`#3501`, or
/// `PERMISSION_DENIED` mentioning a license).
pub fn is_license_error(status: u16, body: &str) -> bool {
    if status != 403 && status != 400 {
        return false;
    }

    body.contains("#3501") || (body.contains("PERMISSION_DENIED") && body.to_lowercase().contains("license"))
}

/// Apply every Antigravity body fix in place.
///
/// - injects the `project` field
/// - encodes tool names to the restricted character set
/// - applies the model-family thinking rules (§ thought signatures)
/// - re-keys or strips signatures that were not issued under `project_id`
pub fn prepare_body(
    body: &mut Value,
    model: &str,
    project_id: &str,
    signatures: &SignatureStore,
) -> Option<String> {
    if let Some(object) = body.as_object_mut() {
        object.insert("project".to_string(), Value::String(project_id.to_string()));
        object.insert("model".to_string(), Value::String(model.to_string()));
    }

    encode_tool_names(body);
    thinking::ensure_thinking_signatures(body, model);

    rekey_signatures(body, project_id, signatures)
}

/// Check every signature in the body against the store.
///
/// Returns `Some(project)` when the request must be re-keyed to the project
/// that originally issued its signatures. Signatures unknown to the store
/// are stripped so the upstream does not reject the whole request.
fn rekey_signatures(body: &mut Value, project_id: &str, signatures: &SignatureStore) -> Option<String> {
    let carried = thinking::collect_signatures(body);

    if carried.is_empty() {
        return None;
    }

    let mut foreign_project = None;
    let mut any_unknown = false;

    for signature in &carried {
        match signatures.get_record(signature) {
            Ok(Some(record)) => {
                if record.project_id != project_id {
                    foreign_project.get_or_insert(record.project_id);
                }
            }
            Ok(None) => any_unknown = true,
            Err(e) => {
                log::warn!("Signature store lookup failed: {e}");
                any_unknown = true;
            }
        }
    }

    if let Some(project) = foreign_project {
        log::info!("Request carries signatures from project '{project}', re-keying");

        if let Some(object) = body.as_object_mut() {
            object.insert("project".to_string(), Value::String(project.clone()));
        }

        return Some(project);
    }

    if any_unknown {
        log::debug!("Stripping signatures of unknown origin from request");
        thinking::strip_signatures(body);
    }

    None
}

/// Record the signatures of a completed response so later round-trips can
/// be validated.
pub fn remember_signatures(
    body: &Value,
    project_id: &str,
    endpoint: &str,
    account: usize,
    signatures: &SignatureStore,
) {
    for signature in thinking::collect_signatures(body) {
        let record = SignatureRecord {
            project_id: project_id.to_string(),
            provider: "antigravity".to_string(),
            endpoint: endpoint.to_string(),
            account: account.to_string(),
        };

        if let Err(e) = signatures.save_signature(&signature, &record) {
            log::warn!("Failed to persist thought signature: {e}");
        }
    }
}

/// Encode every declared and referenced function name in a Gemini-wire body.
fn encode_tool_names(body: &mut Value) {
    if let Some(tools) = body.get_mut("tools").and_then(Value::as_array_mut) {
        for tool in tools {
            let Some(declarations) = tool.get_mut("functionDeclarations").and_then(Value::as_array_mut) else {
                continue;
            };

            for declaration in declarations {
                rewrite_name(declaration, "name", encode_tool_name);
            }
        }
    }

    for_each_part(body, |part| {
        if let Some(call) = part.get_mut("functionCall") {
            rewrite_name(call, "name", encode_tool_name);
        }
        if let Some(response) = part.get_mut("functionResponse") {
            rewrite_name(response, "name", encode_tool_name);
        }
    });

    if let Some(config) = body
        .get_mut("toolConfig")
        .and_then(|c| c.get_mut("functionCallingConfig"))
        && let Some(allowed) = config.get_mut("allowedFunctionNames").and_then(Value::as_array_mut)
    {
        for name in allowed {
            if let Some(s) = name.as_str() {
                *name = Value::String(encode_tool_name(s));
            }
        }
    }
}

/// Decode function-call names flowing back from the upstream.
pub fn decode_response_tool_names(body: &mut Value) {
    if let Some(candidates) = body.get_mut("candidates").and_then(Value::as_array_mut) {
        for candidate in candidates {
            let Some(parts) = candidate
                .get_mut("content")
                .and_then(|c| c.get_mut("parts"))
                .and_then(Value::as_array_mut)
            else {
                continue;
            };

            for part in parts {
                if let Some(call) = part.get_mut("functionCall") {
                    rewrite_name(call, "name", decode_tool_name);
                }
            }
        }
    }
}

fn rewrite_name(object: &mut Value, key: &str, rewrite: impl Fn(&str) -> String) {
    if let Some(name) = object.get(key).and_then(Value::as_str) {
        let rewritten = rewrite(name);
        if rewritten != name {
            object[key] = Value::String(rewritten);
        }
    }
}

fn for_each_part(body: &mut Value, mut visit: impl FnMut(&mut Value)) {
    let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
        return;
    };

    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
            continue;
        };

        for part in parts {
            visit(part);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn license_error_detection() {
        assert!(is_license_error(403, r#"{"error": {"message": "quota #3501 exceeded"}}"#));
        assert!(is_license_error(
            400,
            r#"{"error": {"status": "PERMISSION_DENIED", "message": "no valid License found"}}"#
        ));
        assert!(!is_license_error(403, r#"{"error": {"status": "PERMISSION_DENIED"}}"#));
        assert!(!is_license_error(500, "#3501"));
    }

    #[test]
    fn prepare_injects_project_and_encodes_tools() {
        let store = SignatureStore::in_memory().unwrap();
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "tools": [{"functionDeclarations": [{"name": "repo/read file", "parameters": {"type": "object"}}]}]
        });

        let rekey = prepare_body(&mut body, "gemini-3-pro-high", "project-a", &store);

        assert!(rekey.is_none());
        assert_eq!(body["project"], "project-a");
        assert_eq!(body["model"], "gemini-3-pro-high");
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "repo__slash__read__space__file"
        );
    }

    #[test]
    fn foreign_signature_rekeys_the_request() {
        let store = SignatureStore::in_memory().unwrap();
        store
            .save_signature(
                "sig-1",
                &SignatureRecord {
                    project_id: "project-original".to_string(),
                    provider: "antigravity".to_string(),
                    endpoint: "e".to_string(),
                    account: "0".to_string(),
                },
            )
            .unwrap();

        let mut body = json!({
            "contents": [{"role": "model", "parts": [
                {"thought": true, "text": "T", "thoughtSignature": "sig-1"}
            ]}]
        });

        let rekey = prepare_body(&mut body, "gemini-3-pro-high", "project-other", &store);

        assert_eq!(rekey.as_deref(), Some("project-original"));
        assert_eq!(body["project"], "project-original");
    }

    #[test]
    fn unknown_signatures_are_stripped() {
        let store = SignatureStore::in_memory().unwrap();

        let mut body = json!({
            "contents": [{"role": "model", "parts": [
                {"thought": true, "text": "T", "thoughtSignature": "never-seen"}
            ]}]
        });

        let rekey = prepare_body(&mut body, "gemini-3-pro-high", "project-a", &store);

        assert!(rekey.is_none());
        let part = &body["contents"][0]["parts"][0];
        assert!(part.get("thought_signature").is_none());
        assert!(part.get("thoughtSignature").is_none());
    }

    #[test]
    fn response_tool_names_are_decoded() {
        let mut body = json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"name": "repo__slash__read__space__file", "args": {}}}
            ]}}]
        });

        decode_response_tool_names(&mut body);

        assert_eq!(
            body["candidates"][0]["content"]["parts"][0]["functionCall"]["name"],
            "repo/read file"
        );
    }
}
