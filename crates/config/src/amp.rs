//! Amp upstream-proxy mode configuration.

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;

/// Configuration for forwarding mapped models to an Amp-compatible upstream.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AmpConfig {
    /// Master switch for the proxy mode.
    pub enabled: bool,
    /// Upstream base URL requests are forwarded to.
    pub upstream_url: Option<String>,
    /// API key sent to the upstream.
    pub upstream_api_key: Option<SecretString>,
    /// Rewrites applied to the model name before forwarding.
    pub model_mappings: IndexMap<String, String>,
    /// Restrict management endpoints to loopback clients.
    pub restrict_management_to_localhost: bool,
}
