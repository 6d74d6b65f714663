//! Upstream provider adapters.
//!
//! A [`Provider`] describes how to reach one upstream: which wire format it
//! speaks, where its endpoints live, how requests are authenticated, and
//! which body fixes it needs before dispatch. The request lifecycle itself
//! (retries, rotation, translation) lives in the handler.

pub mod antigravity;
pub mod openai_web;

use config::{ProviderConfig, ProviderKind};
use credentials::Credential;
use reqwest::RequestBuilder;
use secrecy::ExposeSecret;

use crate::codec::Format;

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_OPENCODE_ZEN_API_URL: &str = "https://opencode.ai/zen/v1";
const DEFAULT_OPENAI_WEB_API_URL: &str = "https://chatgpt.com/backend-api/codex";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One configured upstream provider.
#[derive(Clone)]
pub struct Provider {
    /// Provider id, the key in the config table.
    pub id: String,
    /// Static configuration.
    pub config: ProviderConfig,
}

impl Provider {
    /// Build a provider from its configuration entry.
    pub fn new(id: String, config: ProviderConfig) -> Self {
        Self { id, config }
    }

    /// The wire format this upstream speaks.
    pub fn wire_format(&self) -> Format {
        match self.config.kind {
            ProviderKind::Openai => Format::OpenaiChat,
            ProviderKind::Anthropic | ProviderKind::OpencodeZen => Format::Anthropic,
            ProviderKind::Gemini | ProviderKind::Antigravity => Format::Gemini,
            ProviderKind::OpenaiWeb => Format::OpenaiResponses,
        }
    }

    /// Ordered endpoint base URLs. Most providers have exactly one; the
    /// Antigravity rotation list comes from configuration.
    pub fn endpoints(&self) -> Vec<String> {
        if !self.config.endpoints.is_empty() {
            return self.config.endpoints.clone();
        }

        let default = match self.config.kind {
            ProviderKind::Antigravity => {
                return antigravity::DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect();
            }
            ProviderKind::Openai => DEFAULT_OPENAI_API_URL,
            ProviderKind::Anthropic => DEFAULT_ANTHROPIC_API_URL,
            ProviderKind::Gemini => DEFAULT_GEMINI_API_URL,
            ProviderKind::OpencodeZen => DEFAULT_OPENCODE_ZEN_API_URL,
            ProviderKind::OpenaiWeb => DEFAULT_OPENAI_WEB_API_URL,
        };

        vec![self.config.base_url.clone().unwrap_or_else(|| default.to_string())]
    }

    /// Request URL for one endpoint, model, and streaming mode.
    pub fn request_url(&self, endpoint: &str, model: &str, stream: bool) -> String {
        match self.config.kind {
            ProviderKind::Openai => format!("{endpoint}/chat/completions"),
            ProviderKind::Anthropic | ProviderKind::OpencodeZen => format!("{endpoint}/messages"),
            ProviderKind::Gemini => {
                if stream {
                    format!("{endpoint}/models/{model}:streamGenerateContent?alt=sse")
                } else {
                    format!("{endpoint}/models/{model}:generateContent")
                }
            }
            ProviderKind::Antigravity => {
                if stream {
                    format!("{endpoint}/v1internal:streamGenerateContent?alt=sse")
                } else {
                    format!("{endpoint}/v1internal:generateContent")
                }
            }
            ProviderKind::OpenaiWeb => format!("{endpoint}/responses"),
        }
    }

    /// Resolve the model through the provider's alias table.
    pub fn resolve_alias<'a>(&'a self, model: &'a str) -> &'a str {
        self.config.resolve_alias(model)
    }

    /// Attach authentication and protocol headers for one credential.
    pub fn apply_headers(&self, builder: RequestBuilder, credential: &Credential) -> RequestBuilder {
        let token = credential.access_token();

        let builder = match self.config.kind {
            ProviderKind::Openai => builder.bearer_auth(token.expose_secret()),

            ProviderKind::Anthropic | ProviderKind::OpencodeZen => builder
                .header("x-api-key", token.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),

            ProviderKind::Gemini => builder.header("x-goog-api-key", token.expose_secret()),

            ProviderKind::Antigravity => builder.bearer_auth(token.expose_secret()),

            ProviderKind::OpenaiWeb => {
                let builder = builder.bearer_auth(token.expose_secret());

                if let Credential::Oauth {
                    account_id: Some(account_id),
                    ..
                } = credential
                {
                    builder.header("chatgpt-account-id", account_id.clone())
                } else {
                    builder
                }
            }
        };

        builder.header(reqwest::header::CONTENT_TYPE, "application/json")
    }

    /// The credential configured statically, used when the credential store
    /// has no entry for this provider.
    pub fn static_credential(&self) -> Option<Credential> {
        self.config.api_key.as_ref().map(|key| Credential::Api {
            key: key.expose_secret().to_string(),
        })
    }

    /// Whether extended thinking is honored for this provider.
    pub fn thinking_enabled(&self) -> bool {
        self.config.thinking.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(kind: &str) -> Provider {
        let config: ProviderConfig = serde_yaml::from_str(&format!("type: {kind}")).unwrap();
        Provider::new(kind.to_string(), config)
    }

    #[test]
    fn wire_formats_per_kind() {
        assert_eq!(provider("openai").wire_format(), Format::OpenaiChat);
        assert_eq!(provider("anthropic").wire_format(), Format::Anthropic);
        assert_eq!(provider("opencode-zen").wire_format(), Format::Anthropic);
        assert_eq!(provider("gemini").wire_format(), Format::Gemini);
        assert_eq!(provider("antigravity").wire_format(), Format::Gemini);
        assert_eq!(provider("openai-web").wire_format(), Format::OpenaiResponses);
    }

    #[test]
    fn gemini_urls_carry_the_model() {
        let gemini = provider("gemini");
        let endpoint = &gemini.endpoints()[0];

        assert_eq!(
            gemini.request_url(endpoint, "gemini-2.5-pro", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert!(gemini.request_url(endpoint, "gemini-2.5-pro", true).ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn antigravity_has_an_ordered_endpoint_list() {
        let endpoints = provider("antigravity").endpoints();
        assert_eq!(endpoints.len(), 2);

        let configured: ProviderConfig = serde_yaml::from_str(
            "type: antigravity\nendpoints: [https://one.example.com, https://two.example.com, https://three.example.com]",
        )
        .unwrap();
        let endpoints = Provider::new("antigravity".to_string(), configured).endpoints();
        assert_eq!(endpoints.len(), 3);
    }

    #[test]
    fn base_url_override_wins() {
        let config: ProviderConfig =
            serde_yaml::from_str("type: openai\nbaseUrl: http://localhost:9999/v1").unwrap();
        let provider = Provider::new("openai".to_string(), config);

        assert_eq!(provider.endpoints(), ["http://localhost:9999/v1"]);
    }
}
