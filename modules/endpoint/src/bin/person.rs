use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use endpoint::client::{Endpoint, KeySource};
use endpoint::config::EndpointConfig;
use endpoint::person::Person;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .expect("usage: person <config.json>");
    let config = EndpointConfig::load(&config_path).expect("Failed to load configuration");
    let actions = config
        .parsed_actions()
        .expect("Invalid action in configuration");

    let person = Endpoint::connect(&config, KeySource::Relay)
        .await
        .expect("Failed to connect to relay");

    if let Err(error) = person.run(Arc::new(Person), actions).await {
        tracing::error!(error = %error, "Client closed.");
        std::process::exit(1);
    }
}
