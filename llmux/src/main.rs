use args::Args;
use clap::Parser;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args);

    let mut config = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => match config::Config::default_path() {
            Some(path) if path.exists() => config::Config::load(path)?,
            _ => {
                log::warn!("No configuration file found, starting with defaults");
                config::Config::default()
            }
        },
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(hostname) = &args.hostname {
        config.server.hostname = hostname.clone();
    }

    let listen_address = config.server.listen_address();

    let gateway = gateway::build_gateway(config)?;
    let router = gateway::router(gateway);

    let listener = tokio::net::TcpListener::bind(&listen_address).await?;
    log::info!("llmux listening on http://{listen_address}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => log::error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl-C, shutting down"),
        _ = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}
