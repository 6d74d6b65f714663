//! Model routing: requested model → provider, upstream model, fallbacks.

use std::sync::Arc;

use async_trait::async_trait;
use config::RoutingConfig;

use crate::{cooldown::CooldownManager, error::GatewayError};

/// Result of splitting a `model:provider` shorthand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModelMapping {
    /// The model part, everything before the last colon.
    pub model: String,
    /// The provider part, when the shorthand carried one.
    pub provider: Option<String>,
}

/// Split on the last colon: `"glm-4.6:openai"` → model `glm-4.6`, provider
/// `openai`; `"a:b:c:d"` → model `a:b:c`, provider `d`. The provider is
/// trusted when non-empty.
pub fn parse_model_mapping(input: &str) -> ParsedModelMapping {
    match input.rsplit_once(':') {
        Some((model, provider)) if !provider.is_empty() && !model.is_empty() => ParsedModelMapping {
            model: model.to_string(),
            provider: Some(provider.to_string()),
        },
        _ => ParsedModelMapping {
            model: input.to_string(),
            provider: None,
        },
    }
}

/// Dynamic model→provider lookup, typically backed by a cached `/models`
/// registry.
#[async_trait]
pub trait ModelLookup: Send + Sync {
    /// Provider id for a model, when the registry knows it.
    async fn provider_for_model(&self, model: &str) -> Option<String>;
}

/// One fallback target in a resolved route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTarget {
    /// Provider serving the fallback model.
    pub provider: String,
    /// Upstream model name.
    pub model: String,
}

/// A fully resolved route for one requested model.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    /// Provider id.
    pub provider: String,
    /// Model name to send upstream.
    pub upstream_model: String,
    /// Validated fallback chain, in order.
    pub fallbacks: Vec<FallbackTarget>,
}

/// Resolves requested model names using, in order: the explicit
/// `model:provider` suffix, the static mapping table, the dynamic lookup,
/// and the configured default provider. No provider is a hard error.
#[derive(Clone)]
pub struct ModelRouter {
    routing: RoutingConfig,
    cooldowns: CooldownManager,
    lookup: Option<Arc<dyn ModelLookup>>,
}

impl ModelRouter {
    /// A router over the given routing table and cool-down state.
    pub fn new(routing: RoutingConfig, cooldowns: CooldownManager) -> Self {
        Self {
            routing,
            cooldowns,
            lookup: None,
        }
    }

    /// Attach a dynamic lookup consulted after the static mapping.
    pub fn with_lookup(mut self, lookup: Arc<dyn ModelLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// The static mapping table, for the `/models` listing.
    pub fn mappings(&self) -> &indexmap::IndexMap<String, config::ModelMappingEntry> {
        &self.routing.model_mapping
    }

    /// Resolve a requested model to its route.
    pub async fn resolve(&self, requested: &str) -> Result<ResolvedRoute, GatewayError> {
        let parsed = parse_model_mapping(requested);

        if let Some(provider) = parsed.provider {
            return Ok(ResolvedRoute {
                provider,
                upstream_model: parsed.model,
                fallbacks: Vec::new(),
            });
        }

        if let Some(entry) = self.routing.model_mapping.get(requested) {
            let fallbacks = self.validated_fallbacks(requested, &entry.fallbacks);

            return Ok(ResolvedRoute {
                provider: entry.provider.clone(),
                upstream_model: entry.upstream_model_or(requested).to_string(),
                fallbacks,
            });
        }

        if let Some(lookup) = &self.lookup
            && let Some(provider) = lookup.provider_for_model(requested).await
        {
            return Ok(ResolvedRoute {
                provider,
                upstream_model: requested.to_string(),
                fallbacks: Vec::new(),
            });
        }

        if let Some(provider) = &self.routing.default_provider {
            return Ok(ResolvedRoute {
                provider: provider.clone(),
                upstream_model: requested.to_string(),
                fallbacks: Vec::new(),
            });
        }

        Err(GatewayError::UnknownProvider(requested.to_string()))
    }

    /// Resolve a model, then walk the fallback chain past cooled-down
    /// entries. When every candidate is cooled down the primary is returned
    /// anyway; the caller will hit the 429 and act on it.
    pub async fn resolve_model(&self, requested: &str) -> Result<ResolvedRoute, GatewayError> {
        let route = self.resolve(requested).await?;

        if self.cooldowns.is_available(&cooldown_key(&route.provider, &route.upstream_model)) {
            return Ok(route);
        }

        for fallback in &route.fallbacks {
            if self.cooldowns.is_available(&cooldown_key(&fallback.provider, &fallback.model)) {
                log::info!(
                    "Model '{requested}' is cooling down, falling back to {}/{}",
                    fallback.provider,
                    fallback.model
                );

                return Ok(ResolvedRoute {
                    provider: fallback.provider.clone(),
                    upstream_model: fallback.model.clone(),
                    fallbacks: route.fallbacks.clone(),
                });
            }
        }

        Ok(route)
    }

    /// Mark the requested model and its mapped upstream as rate-limited.
    pub async fn handle_rate_limit(&self, requested: &str, retry_after_ms: Option<u64>) {
        let Ok(route) = self.resolve(requested).await else {
            return;
        };

        self.cooldowns
            .mark_rate_limited(&cooldown_key(&route.provider, requested), retry_after_ms);

        if route.upstream_model != requested {
            self.cooldowns
                .mark_rate_limited(&cooldown_key(&route.provider, &route.upstream_model), retry_after_ms);
        }
    }

    /// Drop fallback entries that do not themselves appear in the mapping.
    fn validated_fallbacks(&self, requested: &str, fallbacks: &[String]) -> Vec<FallbackTarget> {
        fallbacks
            .iter()
            .filter_map(|fallback| match self.routing.model_mapping.get(fallback) {
                Some(entry) => Some(FallbackTarget {
                    provider: entry.provider.clone(),
                    model: entry.upstream_model_or(fallback).to_string(),
                }),
                None => {
                    log::warn!("Fallback '{fallback}' for model '{requested}' is not in the mapping, dropping");
                    None
                }
            })
            .collect()
    }
}

/// Cool-down key for a provider/model pair.
pub fn cooldown_key(provider: &str, model: &str) -> String {
    format!("{provider}:{model}")
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn parses_model_mapping_shorthand() {
        assert_eq!(
            parse_model_mapping("glm-4.6:openai"),
            ParsedModelMapping {
                model: "glm-4.6".to_string(),
                provider: Some("openai".to_string()),
            }
        );

        assert_eq!(
            parse_model_mapping("a:b:c:d"),
            ParsedModelMapping {
                model: "a:b:c".to_string(),
                provider: Some("d".to_string()),
            }
        );

        assert_eq!(
            parse_model_mapping("gpt-4o"),
            ParsedModelMapping {
                model: "gpt-4o".to_string(),
                provider: None,
            }
        );

        // A trailing colon does not count as a provider.
        assert_eq!(
            parse_model_mapping("gpt-4o:"),
            ParsedModelMapping {
                model: "gpt-4o:".to_string(),
                provider: None,
            }
        );
    }

    fn routing(yaml: &str) -> RoutingConfig {
        serde_yaml::from_str(yaml).expect("valid routing config")
    }

    fn test_router(yaml: &str) -> (ModelRouter, CooldownManager) {
        let cooldowns = CooldownManager::new();
        (ModelRouter::new(routing(yaml), cooldowns.clone()), cooldowns)
    }

    #[tokio::test]
    async fn explicit_suffix_wins_over_mapping() {
        let (router, _) = test_router(indoc! {r#"
            modelMapping:
              gpt-4o:
                provider: openai
        "#});

        let route = router.resolve("gpt-4o:anthropic").await.unwrap();
        assert_eq!(route.provider, "anthropic");
        assert_eq!(route.upstream_model, "gpt-4o");
    }

    #[tokio::test]
    async fn static_mapping_resolves_with_rename_and_fallbacks() {
        let (router, _) = test_router(indoc! {r#"
            modelMapping:
              claude-3-sonnet:
                provider: anthropic
                upstreamModel: claude-3-sonnet-20240229
                fallbacks: [gpt-4o, missing-model]
              gpt-4o:
                provider: openai
        "#});

        let route = router.resolve("claude-3-sonnet").await.unwrap();
        assert_eq!(route.provider, "anthropic");
        assert_eq!(route.upstream_model, "claude-3-sonnet-20240229");

        // The unresolvable fallback is dropped.
        assert_eq!(
            route.fallbacks,
            [FallbackTarget {
                provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn unknown_model_without_default_is_an_error() {
        let (router, _) = test_router("{}");
        let error = router.resolve("mystery-model").await.unwrap_err();
        assert!(matches!(error, GatewayError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn default_provider_catches_bare_names() {
        let (router, _) = test_router("defaultProvider: openai");
        let route = router.resolve("some-model").await.unwrap();
        assert_eq!(route.provider, "openai");
    }

    struct StaticLookup;

    #[async_trait]
    impl ModelLookup for StaticLookup {
        async fn provider_for_model(&self, model: &str) -> Option<String> {
            model.starts_with("claude").then(|| "anthropic".to_string())
        }
    }

    #[tokio::test]
    async fn dynamic_lookup_runs_after_static_mapping() {
        let (router, _) = test_router("{}");
        let router = router.with_lookup(Arc::new(StaticLookup));

        let route = router.resolve("claude-unknown").await.unwrap();
        assert_eq!(route.provider, "anthropic");

        assert!(router.resolve("gpt-unknown").await.is_err());
    }

    #[tokio::test]
    async fn cooled_down_primary_falls_back() {
        let (router, cooldowns) = test_router(indoc! {r#"
            modelMapping:
              claude-3-sonnet:
                provider: anthropic
                fallbacks: [gpt-4o]
              gpt-4o:
                provider: openai
        "#});

        cooldowns.mark_rate_limited("anthropic:claude-3-sonnet", Some(60_000));

        let route = router.resolve_model("claude-3-sonnet").await.unwrap();
        assert_eq!(route.provider, "openai");
        assert_eq!(route.upstream_model, "gpt-4o");
    }

    #[tokio::test]
    async fn fully_cooled_chain_returns_primary() {
        let (router, cooldowns) = test_router(indoc! {r#"
            modelMapping:
              claude-3-sonnet:
                provider: anthropic
                fallbacks: [gpt-4o]
              gpt-4o:
                provider: openai
        "#});

        cooldowns.mark_rate_limited("anthropic:claude-3-sonnet", Some(60_000));
        cooldowns.mark_rate_limited("openai:gpt-4o", Some(60_000));

        let route = router.resolve_model("claude-3-sonnet").await.unwrap();
        assert_eq!(route.provider, "anthropic");
    }

    #[tokio::test]
    async fn handle_rate_limit_marks_both_keys() {
        let (router, cooldowns) = test_router(indoc! {r#"
            modelMapping:
              claude-3-sonnet:
                provider: anthropic
                upstreamModel: claude-3-sonnet-20240229
        "#});

        router.handle_rate_limit("claude-3-sonnet", Some(2000)).await;

        assert!(!cooldowns.is_available("anthropic:claude-3-sonnet"));
        assert!(!cooldowns.is_available("anthropic:claude-3-sonnet-20240229"));
        assert!(cooldowns.get_reset_time("anthropic:claude-3-sonnet") >= 1900);
    }
}
