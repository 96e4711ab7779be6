//! Switchyard server binary.
//!
//! Loads options from `SWITCHYARD_*` environment variables, optionally
//! joins a Redis cluster listed in `REDIS_URLS`, and serves until ctrl-c.

use std::env;
use std::sync::Arc;

use switchyard_server::{
    RedisBrokerClient, RedisBrokerOptions, Server, ServerEvent, ServerOptions,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchyard_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = ServerOptions::from_env()?;
    let server = Server::new(options)?;

    server.on(|event| match event {
        ServerEvent::Error(e) => tracing::error!("Server error: {}", e),
        ServerEvent::Warning(e) => tracing::warn!("Server warning: {}", e),
        _ => {}
    });

    if let Ok(urls) = env::var("REDIS_URLS") {
        let urls: Vec<String> = urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();
        let broker = RedisBrokerOptions::default()
            .with_urls(urls)
            .with_node_id(server.options().id.clone());
        server.set_external_client(Arc::new(RedisBrokerClient::start(broker)?));
    }

    tracing::info!(
        "Starting Switchyard server on port {} at {:?}",
        server.options().port,
        server.options().path
    );

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received ctrl-c, shutting down");
            shutdown.terminate();
        }
    });

    server.listen().await?;
    Ok(())
}
