//! Per-provider upstream configuration.

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// The upstream protocol family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenAI Chat Completions API.
    Openai,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Gemini generateContent API.
    Gemini,
    /// Google internal Antigravity endpoint (Gemini wire format).
    Antigravity,
    /// opencode-zen aggregator (Anthropic wire format).
    OpencodeZen,
    /// ChatGPT web backend (Responses wire format).
    OpenaiWeb,
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
    /// Which wire protocol this provider speaks.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Base URL override. Each kind has a built-in default.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Static API key. Credentials from the credential store take precedence.
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Ordered endpoint list for providers with several backends (Antigravity).
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Model aliases applied before the request leaves the gateway.
    #[serde(default)]
    pub model_aliases: IndexMap<String, String>,
    /// Whether extended thinking is honored for this provider.
    /// `Some(false)` disables thinking even when the client requests it.
    #[serde(default)]
    pub thinking: Option<bool>,
    /// Google Cloud project id override (Antigravity).
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ProviderConfig {
    /// Resolve a model name through the provider's alias table.
    pub fn resolve_alias<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_aliases.get(model).map(String::as_str).unwrap_or(model)
    }
}
