//! ChatGPT Codex backend request preparation.
//!
//! The web backend accepts the Responses wire format but insists on its own
//! envelope: `store` must be false, responses always stream, and the
//! `instructions` field has to carry the published template for the model
//! family (client system prompts are appended after it).

use serde_json::Value;

use crate::prompts::PromptCache;

/// Apply the Codex envelope rules in place.
pub async fn prepare_body(body: &mut Value, model: &str, prompts: &PromptCache) {
    let template = prompts.instructions_for_model(model).await;

    let Some(object) = body.as_object_mut() else {
        return;
    };

    let client_instructions = object
        .get("instructions")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let instructions = match client_instructions {
        Some(client) => format!("{template}\n\n{client}"),
        None => template,
    };

    object.insert("instructions".to_string(), Value::String(instructions));
    object.insert("store".to_string(), Value::Bool(false));
    object.insert("stream".to_string(), Value::Bool(true));

    // The backend rejects sampling knobs it does not own.
    object.remove("temperature");
    object.remove("top_p");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn offline_cache(dir: &std::path::Path) -> PromptCache {
        PromptCache::new(
            dir.to_path_buf(),
            "http://192.0.2.1:1".to_string(),
            "v1".to_string(),
            reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn envelope_forces_store_false_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        let now = jiff::Timestamp::now().as_millisecond();

        std::fs::write(dir.path().join("codex-instructions.md"), "TEMPLATE").unwrap();
        std::fs::write(
            dir.path().join("codex-meta.json"),
            format!(r#"{{"etag": null, "tag": "v1", "last_checked": {now}}}"#),
        )
        .unwrap();

        let cache = offline_cache(dir.path());

        let mut body = json!({
            "model": "codex-mini",
            "input": [],
            "instructions": "client system prompt",
            "temperature": 0.7,
            "store": true
        });

        prepare_body(&mut body, "codex-mini", &cache).await;

        assert_eq!(body["store"], false);
        assert_eq!(body["stream"], true);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["instructions"], "TEMPLATE\n\nclient system prompt");
    }
}
