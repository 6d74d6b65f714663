use std::path::PathBuf;

use clap::Parser;

/// Multi-provider LLM gateway.
#[derive(Debug, Parser)]
#[command(name = "llmux", version, about)]
pub struct Args {
    /// Path to the configuration file (defaults to ~/.llmux/config.yaml).
    #[arg(short, long, env = "LLMUX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen port, overriding the configuration.
    #[arg(short, long, env = "LLMUX_PORT")]
    pub port: Option<u16>,

    /// Listen hostname, overriding the configuration.
    #[arg(long, env = "LLMUX_HOSTNAME")]
    pub hostname: Option<String>,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", env = "LLMUX_LOG")]
    pub log_level: log::LevelFilter,
}
