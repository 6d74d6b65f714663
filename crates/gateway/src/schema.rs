//! JSON-Schema normalization for tool parameters.
//!
//! Upstreams disagree on which JSON-Schema keywords they accept; tool
//! parameters are rewritten through a pure, idempotent pass before emission.

use serde_json::{Map, Value, json};

/// Keywords kept by the normalizer; everything else is stripped.
const ALLOWED_KEYWORDS: &[&str] = &[
    "type",
    "properties",
    "required",
    "description",
    "enum",
    "items",
    "additionalProperties",
    "anyOf",
    "oneOf",
    "allOf",
];

/// Target dialect for the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    /// OpenAI-compatible and Anthropic upstreams.
    Standard,
    /// Gemini: `anyOf` is spelled `any_of`.
    Gemini,
}

/// Normalize a tool parameter schema for emission.
///
/// - keeps only the allow-listed keywords, recursively
/// - inlines `#/$defs/*` and `#/definitions/*` references (cycles unfold at
///   most once per path)
/// - rewrites `const` to a single-element `enum`
/// - replaces empty schemas with `{"type": "object"}`
/// - renames `anyOf` to `any_of` for the Gemini dialect
///
/// The pass is idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize_schema(schema: &Value, dialect: SchemaDialect) -> Value {
    let definitions = collect_definitions(schema);
    let mut seen = Vec::new();
    normalize_value(schema, &definitions, dialect, &mut seen)
}

fn collect_definitions(schema: &Value) -> Map<String, Value> {
    let mut definitions = Map::new();

    for key in ["$defs", "definitions"] {
        if let Some(Value::Object(map)) = schema.get(key) {
            for (name, def) in map {
                definitions.insert(format!("#/{key}/{name}"), def.clone());
            }
        }
    }

    definitions
}

fn normalize_value(
    value: &Value,
    definitions: &Map<String, Value>,
    dialect: SchemaDialect,
    seen: &mut Vec<String>,
) -> Value {
    let Value::Object(object) = value else {
        return value.clone();
    };

    // Inline $ref before anything else; unfold each reference at most once
    // per path so cyclic definitions terminate.
    if let Some(Value::String(reference)) = object.get("$ref") {
        if seen.iter().any(|s| s == reference) {
            return json!({"type": "object"});
        }

        if let Some(definition) = definitions.get(reference.as_str()) {
            seen.push(reference.clone());
            let inlined = normalize_value(definition, definitions, dialect, seen);
            seen.pop();
            return inlined;
        }

        log::warn!("Unresolvable $ref '{reference}' in tool schema, replacing with object");
        return json!({"type": "object"});
    }

    let mut out = Map::new();

    for (key, entry) in object {
        match key.as_str() {
            // const becomes a single-element enum.
            "const" => {
                out.insert("enum".to_string(), Value::Array(vec![entry.clone()]));
            }

            "properties" => {
                if let Value::Object(properties) = entry {
                    let rewritten: Map<String, Value> = properties
                        .iter()
                        .map(|(name, prop)| (name.clone(), normalize_value(prop, definitions, dialect, seen)))
                        .collect();
                    out.insert(key.clone(), Value::Object(rewritten));
                }
            }

            "items" => {
                out.insert(key.clone(), normalize_value(entry, definitions, dialect, seen));
            }

            "additionalProperties" => {
                // Keep booleans as-is; recurse into schema-valued forms.
                let rewritten = match entry {
                    Value::Bool(_) => entry.clone(),
                    other => normalize_value(other, definitions, dialect, seen),
                };
                out.insert(key.clone(), rewritten);
            }

            "anyOf" | "oneOf" | "allOf" => {
                if let Value::Array(alternatives) = entry {
                    let rewritten: Vec<Value> = alternatives
                        .iter()
                        .map(|alt| normalize_value(alt, definitions, dialect, seen))
                        .collect();

                    let out_key = if dialect == SchemaDialect::Gemini && key == "anyOf" {
                        "any_of".to_string()
                    } else {
                        key.clone()
                    };
                    out.insert(out_key, Value::Array(rewritten));
                }
            }

            // Already-normalized Gemini spelling stays put (idempotence).
            "any_of" if dialect == SchemaDialect::Gemini => {
                if let Value::Array(alternatives) = entry {
                    let rewritten: Vec<Value> = alternatives
                        .iter()
                        .map(|alt| normalize_value(alt, definitions, dialect, seen))
                        .collect();
                    out.insert(key.clone(), Value::Array(rewritten));
                }
            }

            other if ALLOWED_KEYWORDS.contains(&other) => {
                out.insert(key.clone(), entry.clone());
            }

            // $schema, $id, title, default, examples, format and any other
            // meta keyword are dropped.
            _ => {}
        }
    }

    if out.is_empty() {
        return json!({"type": "object"});
    }

    Value::Object(out)
}

/// Characters allowed in Gemini/Antigravity tool names.
fn is_allowed_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

/// Encode a tool name for the Antigravity endpoint.
///
/// Characters outside `[A-Za-z0-9_.:-]` are rewritten reversibly; names that
/// begin with a non-letter get an underscore prefix. `decode_tool_name`
/// inverts the transformation.
pub fn encode_tool_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());

    for c in name.chars() {
        match c {
            '/' => encoded.push_str("__slash__"),
            ' ' => encoded.push_str("__space__"),
            c if is_allowed_name_char(c) => encoded.push(c),
            c => {
                // Anything else round-trips through its code point.
                encoded.push_str(&format!("__u{:x}__", c as u32));
            }
        }
    }

    if !encoded.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        encoded.insert(0, '_');
    }

    encoded
}

/// Invert [`encode_tool_name`].
pub fn decode_tool_name(encoded: &str) -> String {
    let mut name = encoded;

    // The prefix underscore is only removable when it was added by encode:
    // an original name starting with a letter never gets one, so a leading
    // underscore followed by an encoded marker or non-letter start came
    // from us only if stripping it yields a non-letter start.
    if let Some(rest) = name.strip_prefix('_')
        && !rest.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
    {
        name = rest;
    }

    let mut decoded = String::with_capacity(name.len());
    let mut rest = name;

    while let Some(position) = rest.find("__") {
        decoded.push_str(&rest[..position]);
        let tail = &rest[position..];

        if let Some(after) = tail.strip_prefix("__slash__") {
            decoded.push('/');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("__space__") {
            decoded.push(' ');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("__u") {
            if let Some(end) = after.find("__")
                && let Ok(code) = u32::from_str_radix(&after[..end], 16)
                && let Some(c) = char::from_u32(code)
            {
                decoded.push(c);
                rest = &after[end + 2..];
            } else {
                decoded.push_str("__");
                rest = &tail[2..];
            }
        } else {
            decoded.push_str("__");
            rest = &tail[2..];
        }
    }

    decoded.push_str(rest);
    decoded
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn strips_meta_keywords() {
        let schema = json!({
            "type": "object",
            "title": "X",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "properties": {
                "age": {"type": "integer", "default": 0, "examples": [1]}
            }
        });

        let normalized = normalize_schema(&schema, SchemaDialect::Standard);

        insta::assert_json_snapshot!(normalized, @r#"
        {
          "type": "object",
          "properties": {
            "age": {
              "type": "integer"
            }
          }
        }
        "#);
    }

    #[test]
    fn const_becomes_enum() {
        let schema = json!({"type": "string", "const": "fixed"});
        let normalized = normalize_schema(&schema, SchemaDialect::Standard);

        assert_eq!(normalized["enum"], json!(["fixed"]));
        assert!(normalized.get("const").is_none());
    }

    #[test]
    fn inlines_refs_and_drops_definitions() {
        let schema = json!({
            "type": "object",
            "properties": {
                "address": {"$ref": "#/$defs/address"}
            },
            "$defs": {
                "address": {"type": "object", "properties": {"city": {"type": "string"}}}
            }
        });

        let normalized = normalize_schema(&schema, SchemaDialect::Standard);

        assert_eq!(normalized["properties"]["address"]["type"], "object");
        assert_eq!(
            normalized["properties"]["address"]["properties"]["city"]["type"],
            "string"
        );
        assert!(normalized.get("$defs").is_none());
    }

    #[test]
    fn cyclic_refs_unfold_once() {
        let schema = json!({
            "type": "object",
            "properties": {"node": {"$ref": "#/$defs/node"}},
            "$defs": {
                "node": {
                    "type": "object",
                    "properties": {"next": {"$ref": "#/$defs/node"}}
                }
            }
        });

        let normalized = normalize_schema(&schema, SchemaDialect::Standard);

        // One level of the cycle survives, the inner reference collapses.
        assert_eq!(normalized["properties"]["node"]["type"], "object");
        assert_eq!(
            normalized["properties"]["node"]["properties"]["next"],
            json!({"type": "object"})
        );
    }

    #[test]
    fn gemini_dialect_renames_any_of() {
        let schema = json!({
            "anyOf": [{"type": "string"}, {"type": "integer", "default": 3}]
        });

        let normalized = normalize_schema(&schema, SchemaDialect::Gemini);

        assert!(normalized.get("anyOf").is_none());
        assert_eq!(normalized["any_of"][0]["type"], "string");
        assert!(normalized["any_of"][1].get("default").is_none());
    }

    #[test]
    fn empty_schema_becomes_object() {
        assert_eq!(
            normalize_schema(&json!({}), SchemaDialect::Standard),
            json!({"type": "object"})
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let schemas = [
            json!({"type": "object", "title": "X", "properties": {"a": {"const": 1}}}),
            json!({"anyOf": [{"type": "string"}]}),
            json!({}),
            json!({
                "type": "object",
                "properties": {"address": {"$ref": "#/$defs/address"}},
                "$defs": {"address": {"type": "object"}}
            }),
        ];

        for dialect in [SchemaDialect::Standard, SchemaDialect::Gemini] {
            for schema in &schemas {
                let once = normalize_schema(schema, dialect);
                let twice = normalize_schema(&once, dialect);
                assert_eq!(once, twice, "not idempotent for {schema}");
            }
        }
    }

    #[test]
    fn tool_name_encoding_round_trips() {
        for name in [
            "get_weather",
            "repo/read file",
            "ns:tool.v2",
            "42start",
            "emoji☺tool",
            "_underscore",
        ] {
            let encoded = encode_tool_name(name);
            assert!(
                encoded.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_'),
                "bad first char in {encoded}"
            );
            assert!(encoded.chars().all(is_allowed_name_char), "bad chars in {encoded}");
            assert_eq!(decode_tool_name(&encoded), name, "round trip failed for {name}");
        }
    }

    #[test]
    fn encoded_names_use_documented_markers() {
        assert_eq!(encode_tool_name("repo/read file"), "repo__slash__read__space__file");
    }
}
