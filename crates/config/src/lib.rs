//! llmux configuration structures mapping the `~/.llmux/config.yaml` file.

#![deny(missing_docs)]

mod amp;
mod loader;
mod providers;
mod routing;
mod server;

use std::path::{Path, PathBuf};

pub use amp::AmpConfig;
pub use providers::{ProviderConfig, ProviderKind};
pub use routing::{ModelMappingEntry, RoutingConfig};
use serde::Deserialize;
pub use server::ServerConfig;

/// Main configuration structure for the llmux gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Model routing and fallback configuration.
    pub routing: RoutingConfig,
    /// Per-provider upstream configuration, keyed by provider id.
    pub providers: indexmap::IndexMap<String, ProviderConfig>,
    /// Amp upstream-proxy mode configuration.
    pub amp: AmpConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Default configuration file location, `~/.llmux/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".llmux").join("config.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                port: 8080,
                hostname: "127.0.0.1",
                cors: false,
            },
            routing: RoutingConfig {
                default_provider: None,
                model_mapping: {},
                fallback_order: [],
                rotate_on_429: true,
                max_retry_attempts: 20,
            },
            providers: {},
            amp: AmpConfig {
                enabled: false,
                upstream_url: None,
                upstream_api_key: None,
                model_mappings: {},
                restrict_management_to_localhost: false,
            },
        }
        "#);
    }
}
