use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{amount_overflow, AuditLog, TokenStore, TransactionStore};
use crate::errors::{AppError, Result};
use crate::models::access_token::AccessToken;
use crate::models::transaction::{
    ApplyOutcome, PaymentApplication, Transaction, TransactionLog, TransactionStatus,
};

/// A thread-safe in-memory transaction store keyed by account number.
///
/// Each operation holds the write lock for its whole read-modify-write, which
/// gives the same per-row atomicity as the MongoDB conditional updates.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<String, Transaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transactions.read().await.is_empty()
    }

    async fn update<F>(&self, account_number: &str, apply: F) -> Result<Transaction>
    where
        F: FnOnce(&mut Transaction) -> Result<()> + Send,
    {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(account_number)
            .ok_or_else(AppError::invalid_transaction)?;
        apply(transaction)?;
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, transaction: &Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&transaction.account_number) {
            return Err(AppError::DuplicateKey);
        }
        transactions.insert(transaction.account_number.clone(), transaction.clone());
        Ok(())
    }

    async fn insert_if_absent(&self, transaction: &Transaction) -> Result<bool> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&transaction.account_number) {
            return Ok(false);
        }
        transactions.insert(transaction.account_number.clone(), transaction.clone());
        Ok(true)
    }

    async fn find_by_account(&self, account_number: &str) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(account_number).cloned())
    }

    async fn record_initiation(
        &self,
        account_number: &str,
        merchant_id: &str,
        checkout_request_id: &str,
    ) -> Result<Transaction> {
        self.update(account_number, |tx| {
            if tx.checkout_request_id.is_some() {
                return Err(AppError::AlreadyInitiated(tx.account_number.clone()));
            }
            tx.merchant_id = Some(merchant_id.to_string());
            tx.checkout_request_id = Some(checkout_request_id.to_string());
            Ok(())
        })
        .await
    }

    async fn mark_pending(
        &self,
        account_number: &str,
        error_message: &str,
        instruction: &str,
    ) -> Result<Transaction> {
        self.update(account_number, |tx| {
            tx.status = TransactionStatus::Pending;
            tx.error_message = error_message.to_string();
            tx.instruction_to_customer = instruction.to_string();
            Ok(())
        })
        .await
    }

    async fn set_instruction(&self, account_number: &str, instruction: &str) -> Result<Transaction> {
        self.update(account_number, |tx| {
            tx.instruction_to_customer = instruction.to_string();
            Ok(())
        })
        .await
    }

    async fn set_instruction_unless_paid(
        &self,
        account_number: &str,
        instruction: &str,
    ) -> Result<Transaction> {
        self.update(account_number, |tx| {
            if !tx.is_successful() {
                tx.instruction_to_customer = instruction.to_string();
            }
            Ok(())
        })
        .await
    }

    async fn apply_payment(
        &self,
        account_number: &str,
        payment: &PaymentApplication,
    ) -> Result<ApplyOutcome> {
        let mut transactions = self.transactions.write().await;
        let Some(tx) = transactions.get_mut(account_number) else {
            return Ok(ApplyOutcome::NotFound);
        };

        if let Some(receipt) = &payment.receipt {
            if tx.applied_receipts.contains(receipt) {
                return Ok(ApplyOutcome::Ignored(tx.clone()));
            }
        }

        let amount_paid = tx
            .amount_paid
            .checked_add(payment.amount)
            .ok_or_else(|| AppError::malformed(amount_overflow(account_number, payment.amount)))?;

        if let Some(receipt) = &payment.receipt {
            tx.applied_receipts.push(receipt.clone());
            tx.provider_reference = Some(receipt.clone());
        }
        tx.status = TransactionStatus::Successful;
        tx.amount_paid = amount_paid;
        tx.last_payment = payment.amount;
        tx.error_message = payment.error_message.clone();
        tx.instruction_to_customer = payment.instruction.clone();
        if tx.phone_number.is_none() {
            tx.phone_number = payment.phone_number.clone();
        }
        if tx.first_name.is_none() {
            tx.first_name = payment.first_name.clone();
        }
        tx.updated_at = Utc::now();

        Ok(ApplyOutcome::Applied(tx.clone()))
    }

    async fn apply_failure(&self, account_number: &str, error_message: &str) -> Result<ApplyOutcome> {
        let mut transactions = self.transactions.write().await;
        let Some(tx) = transactions.get_mut(account_number) else {
            return Ok(ApplyOutcome::NotFound);
        };

        if tx.is_successful() {
            return Ok(ApplyOutcome::Ignored(tx.clone()));
        }

        tx.status = TransactionStatus::Failed;
        tx.error_message = error_message.to_string();
        tx.updated_at = Utc::now();

        Ok(ApplyOutcome::Applied(tx.clone()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAuditLog {
    entries: Arc<RwLock<Vec<TransactionLog>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<TransactionLog> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, payload: &Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        let sequence = entries.len() as u64 + 1;
        entries.push(TransactionLog {
            id: None,
            sequence,
            json_data: payload.clone(),
            received_at: Utc::now(),
        });
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryTokenStore {
    tokens: Arc<RwLock<HashMap<String, AccessToken>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, code: &str) -> Result<Option<AccessToken>> {
        Ok(self.tokens.read().await.get(code).cloned())
    }

    async fn save(&self, code: &str, token: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        let entry = tokens.entry(code.to_string()).or_insert_with(|| AccessToken {
            id: None,
            code: code.to_string(),
            token: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        });
        entry.token = Some(token.to_string());
        entry.expires_at = Some(expires_at);
        entry.updated_at = now;
        Ok(())
    }
}
