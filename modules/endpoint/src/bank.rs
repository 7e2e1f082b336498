//! # Bank endpoint
//!
//! The bank serves permission-gated banking commands sent as encrypted
//! messages:
//!
//! - `ADD [from_account] [to_account] [amount]` for a transfer
//! - `SUB [from_account] [amount]` for a withdrawal
//!
//! Before acting on a command the bank authenticates the requester with a
//! fresh challenge: a high-entropy token sent as `AUTH <token>`, which a
//! legitimate peer re-encrypts under the bank's key. Authorization then
//! checks the permission file: a person may always operate on their
//! personal account; an organization account requires employment with the
//! matching `ADD`/`SUB` permission. Granted commands commit through the
//! ledger; denials and ledger rejections surface their message back to
//! the sender.
//!
//! The bank resolves person public keys from its permission file, never
//! from the relay.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::client::{Endpoint, EndpointError, Handler, AUTH_PREFIX};
use crate::config::{BankConfig, Permission};
use crate::crypto::challenge_token;
use crate::ledger::Ledger;

pub struct Bank {
    endpoint: Arc<Endpoint>,
    engine: CommandEngine,
}

impl Bank {
    pub fn new(endpoint: Arc<Endpoint>, database: BankConfig, ledger: Ledger) -> Self {
        Self {
            endpoint,
            engine: CommandEngine::new(database, ledger),
        }
    }

    /// Challenge-response authentication of a claimed identity.
    ///
    /// Sends a fresh single-use token as `AUTH <token>`; only the holder
    /// of the claimed person's private key can read it, and only a reply
    /// that decrypts to exactly the token authenticates. A failed
    /// delivery counts as a failed authentication, not an error.
    async fn authenticate(&self, person_id: &str) -> bool {
        info!("Requesting authentication from {person_id}");
        let secret = challenge_token();

        let reply = match self
            .endpoint
            .send_message(person_id, &format!("{AUTH_PREFIX}{secret}"))
            .await
        {
            Ok(reply) => reply,
            Err(error) => {
                warn!(person_id = %person_id, error = %error, "challenge delivery failed");
                return false;
            }
        };

        let authenticated = reply.as_deref() == Some(secret.as_str());
        if authenticated {
            info!("Authenticated: {person_id}");
        } else {
            warn!("Invalid secret received from {person_id}!");
        }
        authenticated
    }
}

#[async_trait]
impl Handler for Bank {
    async fn receive_message(
        &self,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<String>, EndpointError> {
        info!("From {sender_id} received message: {message}");
        if !self.authenticate(sender_id).await {
            return Ok(Some("Authentication failed!".to_string()));
        }
        self.engine.execute(sender_id, message).await?;
        Ok(None)
    }
}

/// Command parsing, authorization, and ledger mutation, independent of the
/// transport.
struct CommandEngine {
    database: BankConfig,
    ledger: Ledger,
    transfer_pattern: Regex,
    withdraw_pattern: Regex,
}

impl CommandEngine {
    fn new(database: BankConfig, ledger: Ledger) -> Self {
        Self {
            database,
            ledger,
            transfer_pattern: Regex::new(r"^ADD \[(?P<from>.*?)] \[(?P<to>.*?)] \[(?P<amount>\d+)]$")
                .expect("invalid pattern"),
            withdraw_pattern: Regex::new(r"^SUB \[(?P<from>.*?)] \[(?P<amount>\d+)]$")
                .expect("invalid pattern"),
        }
    }

    /// Parse and run one command from an authenticated sender. A message
    /// matching neither grammar is logged and ignored.
    async fn execute(&self, sender_id: &str, command: &str) -> Result<(), EndpointError> {
        if let Some(captures) = self.transfer_pattern.captures(command) {
            let from = &captures["from"];
            let to = &captures["to"];
            let amount = parse_amount(&captures["amount"])?;
            self.authorize(sender_id, from, Permission::Add)?;
            self.ledger.transfer(from, to, amount).await?;
            info!("Transferred {amount} from {from} to {to} on behalf of {sender_id}");
            return Ok(());
        }

        if let Some(captures) = self.withdraw_pattern.captures(command) {
            let from = &captures["from"];
            let amount = parse_amount(&captures["amount"])?;
            self.authorize(sender_id, from, Permission::Sub)?;
            self.ledger.withdraw(from, amount).await?;
            info!("Withdrew {amount} from {from} on behalf of {sender_id}");
            return Ok(());
        }

        debug!("Ignoring unrecognized command from {sender_id}: {command}");
        Ok(())
    }

    /// A person is implicitly authorized for their personal account;
    /// otherwise the account must belong to an organization that employs
    /// them and grants the specific permission.
    fn authorize(
        &self,
        person_id: &str,
        account: &str,
        operation: Permission,
    ) -> Result<(), EndpointError> {
        if let Some(person) = self.database.persons.get(person_id) {
            if person.account == account {
                return Ok(());
            }
        }

        let granted = self
            .database
            .organizations
            .values()
            .find(|organization| organization.account == account)
            .and_then(|organization| organization.employees.get(person_id))
            .map(|employee| employee.permissions.contains(&operation))
            .unwrap_or(false);

        if granted {
            Ok(())
        } else {
            Err(EndpointError::Rejected(format!(
                "Unauthorized {operation} operation by {person_id} on account {account}!"
            )))
        }
    }
}

fn parse_amount(raw: &str) -> Result<i64, EndpointError> {
    raw.parse()
        .map_err(|_| EndpointError::Rejected(format!("Amount {raw} is out of range.")))
}
