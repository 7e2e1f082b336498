use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use endpoint::bank::Bank;
use endpoint::client::{Endpoint, KeySource};
use endpoint::config::{BankConfig, EndpointConfig};
use endpoint::ledger::Ledger;

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
        .expect("usage: bank <config.json> [permissions.json]");
    let permissions_path = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "configs/bank_permissions.json".to_string());

    let config = EndpointConfig::load(&config_path).expect("Failed to load configuration");
    let actions = config
        .parsed_actions()
        .expect("Invalid action in configuration");
    let database = BankConfig::load(&permissions_path).expect("Failed to load permission file");

    let ledger = Ledger::open(&database.accounts_db)
        .await
        .expect("Failed to open accounts database");

    let endpoint = Endpoint::connect(&config, KeySource::Local(database.public_keys()))
        .await
        .expect("Failed to connect to relay");

    let bank = Bank::new(Arc::clone(&endpoint), database, ledger);

    if let Err(error) = endpoint.run(Arc::new(bank), actions).await {
        tracing::error!(error = %error, "Client closed.");
        std::process::exit(1);
    }
}
