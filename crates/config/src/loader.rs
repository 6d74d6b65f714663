use std::path::Path;

use anyhow::{Context, bail};

use crate::Config;

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse configuration from {}", path.display()))?;

    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    for (model, entry) in &config.routing.model_mapping {
        if entry.provider.is_empty() {
            bail!("Model mapping for '{model}' has an empty provider");
        }

        // Fallback entries that point outside the mapping are dropped by the
        // router at runtime with a warning; an entry pointing at itself would
        // loop forever, so reject it here.
        if entry.fallbacks.iter().any(|fallback| fallback == model) {
            bail!("Model mapping for '{model}' lists itself as a fallback");
        }
    }

    if let Some(default_provider) = &config.routing.default_provider
        && !config.providers.is_empty()
        && !config.providers.contains_key(default_provider)
    {
        bail!("routing.defaultProvider '{default_provider}' is not a configured provider");
    }

    if config.amp.enabled && config.amp.upstream_url.is_none() {
        bail!("amp.enabled requires amp.upstreamUrl to be set");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_snapshot;

    use crate::Config;

    fn parse(yaml: &str) -> anyhow::Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        super::validate(&config)?;
        Ok(config)
    }

    #[test]
    fn rejects_self_referential_fallback() {
        let result = parse(indoc! {r#"
            routing:
              modelMapping:
                gpt-4o:
                  provider: openai
                  fallbacks: [gpt-4o]
        "#});

        let error = result.unwrap_err().to_string();
        assert_snapshot!(error, @"Model mapping for 'gpt-4o' lists itself as a fallback");
    }

    #[test]
    fn rejects_unknown_default_provider() {
        let result = parse(indoc! {r#"
            routing:
              defaultProvider: nonexistent
            providers:
              openai:
                type: openai
        "#});

        let error = result.unwrap_err().to_string();
        assert_snapshot!(error, @"routing.defaultProvider 'nonexistent' is not a configured provider");
    }

    #[test]
    fn rejects_amp_without_upstream() {
        let result = parse(indoc! {r#"
            amp:
              enabled: true
        "#});

        let error = result.unwrap_err().to_string();
        assert_snapshot!(error, @"amp.enabled requires amp.upstreamUrl to be set");
    }

    #[test]
    fn accepts_full_configuration() {
        let config = parse(indoc! {r#"
            server:
              port: 4141
              hostname: 0.0.0.0
              cors: true
            routing:
              defaultProvider: openai
              maxRetryAttempts: 10
              modelMapping:
                claude-3-sonnet:
                  provider: anthropic
                  fallbacks: [gpt-4o]
                gpt-4o:
                  provider: openai
            providers:
              openai:
                type: openai
                apiKey: sk-test
              anthropic:
                type: anthropic
              antigravity:
                type: antigravity
                endpoints:
                  - https://daily.example.com
                  - https://prod.example.com
        "#})
        .unwrap();

        assert_eq!(config.server.port, 4141);
        assert_eq!(config.routing.max_retry_attempts, 10);
        assert_eq!(config.providers.len(), 3);
        assert_eq!(config.providers["antigravity"].endpoints.len(), 2);
    }
}
