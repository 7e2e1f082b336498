use std::env;

/// Relay configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let host = env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port: u16 = env::var("RELAY_PORT")
            .unwrap_or_else(|_| "8765".to_string())
            .parse()
            .map_err(|_| "RELAY_PORT must be a valid u16".to_string())?;

        Ok(Config { host, port })
    }
}
