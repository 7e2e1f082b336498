//! # Endpoint configuration
//!
//! Endpoints are configured through JSON files: identity and key material,
//! session parameters, the relay address, and the list of outbound actions
//! to execute at startup. The bank additionally loads a permission file
//! describing persons, organizations, and the path to the accounts
//! database.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed action string: {0}")]
    MalformedAction(String),

    #[error("malformed name (expected \"last,first\"): {0}")]
    MalformedName(String),
}

/// Top-level endpoint configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub person: PersonSection,
    pub general: GeneralSection,
    pub server: ServerSection,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonSection {
    pub id: String,
    /// Stored as `"last,first"`.
    pub name: String,
    pub keys: KeyPair,
}

/// Base64 bodies of PKCS#1 PEM documents; the armor is added at import.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyPair {
    pub public: String,
    pub private: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralSection {
    /// Session lifetime in seconds; the whole task group is cancelled when
    /// it elapses.
    pub duration: u64,
    /// Total attempts for retried requests.
    pub retries: u32,
    /// Backoff between attempts, in seconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub ip: String,
    pub port: u16,
}

/// One outbound action parsed from a `SEND [<recipient>] <message>` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAction {
    pub recipient_id: String,
    pub message: String,
}

impl EndpointConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// Split `person.name` into `(first_name, last_name)`.
    pub fn split_name(&self) -> Result<(String, String), ConfigError> {
        let (last, first) = self
            .person
            .name
            .split_once(',')
            .ok_or_else(|| ConfigError::MalformedName(self.person.name.clone()))?;
        Ok((first.trim().to_string(), last.trim().to_string()))
    }

    /// Parse the configured action strings into `(recipient, message)`
    /// pairs. A string that does not match the `SEND` grammar is a
    /// configuration error.
    pub fn parsed_actions(&self) -> Result<Vec<OutboundAction>, ConfigError> {
        let pattern =
            Regex::new(r"^SEND \[(?P<recipient>.*?)] (?P<message>.*)$").expect("invalid pattern");
        self.actions
            .iter()
            .map(|action| {
                let captures = pattern
                    .captures(action)
                    .ok_or_else(|| ConfigError::MalformedAction(action.clone()))?;
                Ok(OutboundAction {
                    recipient_id: captures["recipient"].to_string(),
                    message: captures["message"].to_string(),
                })
            })
            .collect()
    }
}

/// The bank's permission file: who owns which account, which organizations
/// exist, and which employees may operate on an organization's account.
#[derive(Debug, Clone, Deserialize)]
pub struct BankConfig {
    pub persons: HashMap<String, PersonRecord>,
    #[serde(default)]
    pub organizations: HashMap<String, Organization>,
    /// Path to the single-file accounts database.
    pub accounts_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonRecord {
    pub account: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    pub account: String,
    #[serde(default)]
    pub employees: HashMap<String, Employee>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Employee {
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// An operation an employee may be granted on an organization account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Permission {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "SUB")]
    Sub,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Add => write!(f, "ADD"),
            Permission::Sub => write!(f, "SUB"),
        }
    }
}

impl BankConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// id → public key table used to encrypt for known persons without
    /// consulting the relay.
    pub fn public_keys(&self) -> HashMap<String, String> {
        self.persons
            .iter()
            .map(|(id, person)| (id.clone(), person.public_key.clone()))
            .collect()
    }
}

fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let display = path.as_ref().display().to_string();
    let raw = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}
