use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, to_bson, to_document, Bson, Document};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};
use serde_json::Value;
use tracing::debug;

use super::{amount_overflow, AuditLog, TokenStore, TransactionStore};
use crate::errors::{AppError, Result};
use crate::models::access_token::AccessToken;
use crate::models::transaction::{
    ApplyOutcome, PaymentApplication, Transaction, TransactionLog, TransactionStatus,
};

pub const TRANSACTIONS: &str = "transactions";
pub const TRANSACTION_LOGS: &str = "transaction_logs";
pub const ACCESS_TOKENS: &str = "access_tokens";
const COUNTERS: &str = "counters";

fn now_bson() -> Result<Bson> {
    Ok(to_bson(&Utc::now())?)
}

#[derive(Clone)]
pub struct MongoTransactionStore {
    db: Database,
    transactions: Collection<Transaction>,
}

impl MongoTransactionStore {
    pub fn new(db: &Database) -> Self {
        MongoTransactionStore {
            db: db.clone(),
            transactions: db.collection(TRANSACTIONS),
        }
    }

    async fn update_existing(&self, account_number: &str, update: Document) -> Result<Transaction> {
        self.transactions
            .find_one_and_update(doc! { "account_number": account_number }, update)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(AppError::invalid_transaction)
    }

    async fn ignored_or_missing(&self, account_number: &str) -> Result<ApplyOutcome> {
        Ok(match self.find_by_account(account_number).await? {
            Some(existing) => ApplyOutcome::Ignored(existing),
            None => ApplyOutcome::NotFound,
        })
    }
}

#[async_trait]
impl TransactionStore for MongoTransactionStore {
    async fn insert(&self, transaction: &Transaction) -> Result<()> {
        match self.transactions.insert_one(transaction).await {
            Ok(_) => Ok(()),
            Err(e) if AppError::is_duplicate_key(&e) => Err(AppError::DuplicateKey),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_if_absent(&self, transaction: &Transaction) -> Result<bool> {
        let existing = self
            .transactions
            .find_one_and_update(
                doc! { "account_number": &transaction.account_number },
                doc! { "$setOnInsert": to_document(transaction)? },
            )
            .upsert(true)
            .return_document(ReturnDocument::Before)
            .await?;
        Ok(existing.is_none())
    }

    async fn find_by_account(&self, account_number: &str) -> Result<Option<Transaction>> {
        Ok(self
            .transactions
            .find_one(doc! { "account_number": account_number })
            .await?)
    }

    async fn record_initiation(
        &self,
        account_number: &str,
        merchant_id: &str,
        checkout_request_id: &str,
    ) -> Result<Transaction> {
        let updated = self
            .transactions
            .find_one_and_update(
                doc! { "account_number": account_number, "checkout_request_id": Bson::Null },
                doc! { "$set": {
                    "merchant_id": merchant_id,
                    "checkout_request_id": checkout_request_id,
                    "updated_at": now_bson()?,
                }},
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(transaction) => Ok(transaction),
            None => match self.find_by_account(account_number).await? {
                Some(_) => Err(AppError::AlreadyInitiated(account_number.to_string())),
                None => Err(AppError::invalid_transaction()),
            },
        }
    }

    async fn mark_pending(
        &self,
        account_number: &str,
        error_message: &str,
        instruction: &str,
    ) -> Result<Transaction> {
        self.update_existing(
            account_number,
            doc! { "$set": {
                "status": TransactionStatus::Pending.as_str(),
                "error_message": error_message,
                "instruction_to_customer": instruction,
                "updated_at": now_bson()?,
            }},
        )
        .await
    }

    async fn set_instruction(&self, account_number: &str, instruction: &str) -> Result<Transaction> {
        self.update_existing(
            account_number,
            doc! { "$set": {
                "instruction_to_customer": instruction,
                "updated_at": now_bson()?,
            }},
        )
        .await
    }

    async fn set_instruction_unless_paid(
        &self,
        account_number: &str,
        instruction: &str,
    ) -> Result<Transaction> {
        let updated = self
            .transactions
            .find_one_and_update(
                doc! {
                    "account_number": account_number,
                    "status": { "$ne": TransactionStatus::Successful.as_str() },
                },
                doc! { "$set": {
                    "instruction_to_customer": instruction,
                    "updated_at": now_bson()?,
                }},
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(transaction) => Ok(transaction),
            None => self
                .find_by_account(account_number)
                .await?
                .ok_or_else(AppError::invalid_transaction),
        }
    }

    async fn apply_payment(
        &self,
        account_number: &str,
        payment: &PaymentApplication,
    ) -> Result<ApplyOutcome> {
        // Rows whose total cannot absorb the amount are left alone.
        let mut filter = doc! {
            "account_number": account_number,
            "amount_paid": { "$lte": i64::MAX.saturating_sub(payment.amount) },
        };

        // Pipeline update: values are wrapped in $literal so a leading '$'
        // in gateway data is never read as a field path.
        let mut set = doc! {
            "status": TransactionStatus::Successful.as_str(),
            "amount_paid": { "$add": ["$amount_paid", payment.amount] },
            "last_payment": payment.amount,
            "error_message": { "$literal": payment.error_message.as_str() },
            "instruction_to_customer": { "$literal": payment.instruction.as_str() },
            "updated_at": now_bson()?,
        };

        if let Some(receipt) = &payment.receipt {
            filter.insert("applied_receipts", doc! { "$ne": receipt.as_str() });
            set.insert("provider_reference", doc! { "$literal": receipt.as_str() });
            set.insert(
                "applied_receipts",
                doc! { "$concatArrays": [
                    { "$ifNull": ["$applied_receipts", []] },
                    [{ "$literal": receipt.as_str() }]
                ]},
            );
        }
        if let Some(phone) = &payment.phone_number {
            set.insert(
                "phone_number",
                doc! { "$ifNull": ["$phone_number", { "$literal": phone.as_str() }] },
            );
        }
        if let Some(first_name) = &payment.first_name {
            set.insert(
                "first_name",
                doc! { "$ifNull": ["$first_name", { "$literal": first_name.as_str() }] },
            );
        }

        let updated = self
            .transactions
            .find_one_and_update(filter, vec![doc! { "$set": set }])
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(transaction) => Ok(ApplyOutcome::Applied(transaction)),
            None => {
                debug!(account_number, "Payment not applied, checking for replay");
                match self.find_by_account(account_number).await? {
                    Some(existing)
                        if !payment
                            .receipt
                            .as_ref()
                            .is_some_and(|receipt| existing.applied_receipts.contains(receipt))
                            && existing.amount_paid.checked_add(payment.amount).is_none() =>
                    {
                        Err(AppError::malformed(amount_overflow(account_number, payment.amount)))
                    }
                    Some(existing) => Ok(ApplyOutcome::Ignored(existing)),
                    None => Ok(ApplyOutcome::NotFound),
                }
            }
        }
    }

    async fn apply_failure(&self, account_number: &str, error_message: &str) -> Result<ApplyOutcome> {
        let updated = self
            .transactions
            .find_one_and_update(
                doc! {
                    "account_number": account_number,
                    "status": { "$ne": TransactionStatus::Successful.as_str() },
                },
                doc! { "$set": {
                    "status": TransactionStatus::Failed.as_str(),
                    "error_message": error_message,
                    "updated_at": now_bson()?,
                }},
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(transaction) => Ok(ApplyOutcome::Applied(transaction)),
            None => self.ignored_or_missing(account_number).await,
        }
    }

    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct MongoAuditLog {
    logs: Collection<TransactionLog>,
    counters: Collection<Document>,
}

impl MongoAuditLog {
    pub fn new(db: &Database) -> Self {
        MongoAuditLog {
            logs: db.collection(TRANSACTION_LOGS),
            counters: db.collection(COUNTERS),
        }
    }

    async fn next_sequence(&self) -> Result<u64> {
        let counter = self
            .counters
            .find_one_and_update(
                doc! { "_id": TRANSACTION_LOGS },
                doc! { "$inc": { "seq": 1_i64 } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| AppError::Store("sequence counter missing".to_string()))?;

        counter
            .get_i64("seq")
            .map(|seq| seq as u64)
            .map_err(|e| AppError::Store(e.to_string()))
    }
}

#[async_trait]
impl AuditLog for MongoAuditLog {
    async fn append(&self, payload: &Value) -> Result<()> {
        let entry = TransactionLog {
            id: None,
            sequence: self.next_sequence().await?,
            json_data: payload.clone(),
            received_at: Utc::now(),
        };
        self.logs.insert_one(entry).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct MongoTokenStore {
    tokens: Collection<AccessToken>,
}

impl MongoTokenStore {
    pub fn new(db: &Database) -> Self {
        MongoTokenStore {
            tokens: db.collection(ACCESS_TOKENS),
        }
    }
}

#[async_trait]
impl TokenStore for MongoTokenStore {
    async fn get(&self, code: &str) -> Result<Option<AccessToken>> {
        Ok(self.tokens.find_one(doc! { "code": code }).await?)
    }

    async fn save(&self, code: &str, token: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let now = now_bson()?;
        self.tokens
            .update_one(
                doc! { "code": code },
                doc! {
                    "$set": {
                        "token": token,
                        "expires_at": to_bson(&expires_at)?,
                        "updated_at": now.clone(),
                    },
                    "$setOnInsert": { "created_at": now },
                },
            )
            .upsert(true)
            .await?;
        Ok(())
    }
}
