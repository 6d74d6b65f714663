//! Model routing and fallback configuration.

use indexmap::IndexMap;
use serde::Deserialize;

/// Model routing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RoutingConfig {
    /// Provider used for bare model names that match no mapping.
    pub default_provider: Option<String>,
    /// Static mapping from requested model name to provider and upstream model.
    pub model_mapping: IndexMap<String, ModelMappingEntry>,
    /// Ordered provider list for legacy rotation.
    pub fallback_order: Vec<String>,
    /// Enable router-driven fallback when an upstream rate-limits.
    pub rotate_on_429: bool,
    /// Upper bound on attempts within one logical request.
    pub max_retry_attempts: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            model_mapping: IndexMap::new(),
            fallback_order: Vec::new(),
            rotate_on_429: true,
            max_retry_attempts: 20,
        }
    }
}

/// One entry of the static model mapping table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelMappingEntry {
    /// Provider that serves this model.
    pub provider: String,
    /// Model name sent upstream. Defaults to the mapping key.
    #[serde(default)]
    pub upstream_model: Option<String>,
    /// Ordered fallback models, each of which must itself appear in the mapping.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl ModelMappingEntry {
    /// The model name to send upstream for a given mapping key.
    pub fn upstream_model_or<'a>(&'a self, key: &'a str) -> &'a str {
        self.upstream_model.as_deref().unwrap_or(key)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use super::RoutingConfig;

    #[test]
    fn parses_model_mapping() {
        let yaml = indoc! {r#"
            defaultProvider: openai
            rotateOn429: true
            modelMapping:
              claude-3-sonnet:
                provider: anthropic
                fallbacks: [gpt-4o]
              gpt-4o:
                provider: openai
                upstreamModel: gpt-4o-2024-08-06
        "#};

        let config: RoutingConfig = serde_yaml::from_str(yaml).unwrap();

        assert_debug_snapshot!(&config, @r#"
        RoutingConfig {
            default_provider: Some(
                "openai",
            ),
            model_mapping: {
                "claude-3-sonnet": ModelMappingEntry {
                    provider: "anthropic",
                    upstream_model: None,
                    fallbacks: [
                        "gpt-4o",
                    ],
                },
                "gpt-4o": ModelMappingEntry {
                    provider: "openai",
                    upstream_model: Some(
                        "gpt-4o-2024-08-06",
                    ),
                    fallbacks: [],
                },
            },
            fallback_order: [],
            rotate_on_429: true,
            max_retry_attempts: 20,
        }
        "#);
    }
}
