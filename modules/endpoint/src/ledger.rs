//! # Account ledger
//!
//! A single-file SQLite store of account balances. All mutations run
//! inside one transaction: either the whole withdrawal or transfer
//! applies, or none of it. Concurrent writers (including other bank
//! processes on the same file) are serialized through the engine's lock
//! with a busy timeout.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::debug;

const CREATE_ACCOUNTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL CHECK (balance >= 0)
)";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Only positive amount of money can be {operation} while requested {amount}.")]
    NegativeAmount {
        operation: &'static str,
        amount: i64,
    },

    #[error("Account {account} has only {balance} deposited, while requested to {operation} {amount}!")]
    InsufficientFunds {
        account: String,
        balance: i64,
        operation: &'static str,
        amount: i64,
    },

    #[error("Account {0} does not exist!")]
    UnknownAccount(String),

    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// The accounts store.
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open the single-file store, creating the file and schema if
    /// missing. Concurrent processes on the same file wait up to the busy
    /// timeout for the engine's lock.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(3));
        Self::with_options(options).await
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        Self::with_options(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, LedgerError> {
        // A single pooled connection keeps in-process callers serialized
        // and an in-memory database alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_ACCOUNTS_TABLE).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create_account(&self, account: &str, balance: i64) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO accounts (id, balance) VALUES (?1, ?2)")
            .bind(account)
            .bind(balance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn balance(&self, account: &str) -> Result<i64, LedgerError> {
        sqlx::query_scalar("SELECT balance FROM accounts WHERE id = ?1")
            .bind(account)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::UnknownAccount(account.to_string()))
    }

    pub async fn deposit(&self, account: &str, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount {
                operation: "deposited",
                amount,
            });
        }
        let mut tx = self.pool.begin().await?;
        adjust_balance(&mut tx, account, amount).await?;
        tx.commit().await?;
        debug!("Deposited {amount} to {account}");
        Ok(())
    }

    /// Debit `amount` from an account. Fails without mutation when the
    /// amount is negative or exceeds the balance.
    pub async fn withdraw(&self, account: &str, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount {
                operation: "withdrawn",
                amount,
            });
        }
        let mut tx = self.pool.begin().await?;
        let balance = balance_in(&mut tx, account).await?;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: account.to_string(),
                balance,
                operation: "withdraw",
                amount,
            });
        }
        adjust_balance(&mut tx, account, -amount).await?;
        tx.commit().await?;
        debug!("Withdrew {amount} from {account}");
        Ok(())
    }

    /// Move `amount` between accounts atomically: the debit and the credit
    /// commit together or not at all, so the total of balances is
    /// preserved.
    pub async fn transfer(&self, from: &str, to: &str, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount {
                operation: "transferred",
                amount,
            });
        }
        let mut tx = self.pool.begin().await?;
        let balance = balance_in(&mut tx, from).await?;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: from.to_string(),
                balance,
                operation: "transfer",
                amount,
            });
        }
        adjust_balance(&mut tx, from, -amount).await?;
        adjust_balance(&mut tx, to, amount).await?;
        tx.commit().await?;
        debug!("Transferred {amount} from {from} to {to}");
        Ok(())
    }
}

async fn balance_in(tx: &mut Transaction<'_, Sqlite>, account: &str) -> Result<i64, LedgerError> {
    sqlx::query_scalar("SELECT balance FROM accounts WHERE id = ?1")
        .bind(account)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::UnknownAccount(account.to_string()))
}

async fn adjust_balance(
    tx: &mut Transaction<'_, Sqlite>,
    account: &str,
    change: i64,
) -> Result<(), LedgerError> {
    let result = sqlx::query("UPDATE accounts SET balance = balance + ?1 WHERE id = ?2")
        .bind(change)
        .bind(account)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(LedgerError::UnknownAccount(account.to_string()));
    }
    Ok(())
}
