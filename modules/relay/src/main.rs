use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use relay::config::Config;
use relay::directory::Directory;
use relay::dispatcher;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().expect("Failed to load configuration from environment");

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .expect("Failed to bind address");

    let directory = Arc::new(Directory::new());

    tracing::info!("Relay is listening on {}:{}...", config.host, config.port);

    if let Err(error) = dispatcher::serve(listener, directory).await {
        tracing::error!(error = %error, "accept loop failed");
    }
}
