//! Persistence contracts used by the reconciler and the credential cache.
//!
//! Every mutation is keyed by `account_number` and applied as a single
//! conditional update, so a callback landing while the waiter re-reads the
//! row never observes a half-written transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::Result;
use crate::models::access_token::AccessToken;
use crate::models::transaction::{ApplyOutcome, PaymentApplication, Transaction};

pub mod connection;
pub mod memory;
pub mod mongo;

pub use memory::{InMemoryAuditLog, InMemoryTokenStore, InMemoryTransactionStore};
pub use mongo::{MongoAuditLog, MongoTokenStore, MongoTransactionStore};

pub(crate) fn amount_overflow(account_number: &str, amount: i64) -> String {
    format!("payment of {} would overflow amount_paid of {}", amount, account_number)
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fails with `DuplicateKey` when the account number is taken.
    async fn insert(&self, transaction: &Transaction) -> Result<()>;

    /// Atomic get-or-create. Returns `true` when a row was created.
    async fn insert_if_absent(&self, transaction: &Transaction) -> Result<bool>;

    async fn find_by_account(&self, account_number: &str) -> Result<Option<Transaction>>;

    /// Sets the gateway correlation ids once; a second call is `AlreadyInitiated`.
    async fn record_initiation(
        &self,
        account_number: &str,
        merchant_id: &str,
        checkout_request_id: &str,
    ) -> Result<Transaction>;

    async fn mark_pending(
        &self,
        account_number: &str,
        error_message: &str,
        instruction: &str,
    ) -> Result<Transaction>;

    async fn set_instruction(&self, account_number: &str, instruction: &str) -> Result<Transaction>;

    /// Like `set_instruction`, but leaves a `Successful` row untouched.
    /// Returns the row as stored either way.
    async fn set_instruction_unless_paid(
        &self,
        account_number: &str,
        instruction: &str,
    ) -> Result<Transaction>;

    /// Credits a settling event unless its receipt was already applied.
    /// An event that would overflow `amount_paid` is refused unapplied.
    async fn apply_payment(
        &self,
        account_number: &str,
        payment: &PaymentApplication,
    ) -> Result<ApplyOutcome>;

    /// Marks the transaction failed unless it already succeeded.
    async fn apply_failure(&self, account_number: &str, error_message: &str) -> Result<ApplyOutcome>;

    async fn ping(&self) -> Result<()>;
}

/// Append-only sink for raw inbound gateway payloads.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, payload: &Value) -> Result<()>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, code: &str) -> Result<Option<AccessToken>>;
    async fn save(&self, code: &str, token: &str, expires_at: DateTime<Utc>) -> Result<()>;
}
