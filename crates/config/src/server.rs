//! HTTP server configuration settings.

use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP port the gateway listens on.
    pub port: u16,
    /// Hostname or address to bind.
    pub hostname: String,
    /// Whether to attach a permissive CORS layer.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: "127.0.0.1".to_string(),
            cors: false,
        }
    }
}

impl ServerConfig {
    /// The `host:port` string for the listen socket.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}
