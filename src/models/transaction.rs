// models/transaction.rs
use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Initiated,
    Pending,
    Failed,
    Successful,
    Cancelled,
    Reversed,
    #[serde(rename = "Failed Completely")]
    FailedCompletely,
    Retrying,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "Initiated",
            TransactionStatus::Pending => "Pending",
            TransactionStatus::Failed => "Failed",
            TransactionStatus::Successful => "Successful",
            TransactionStatus::Cancelled => "Cancelled",
            TransactionStatus::Reversed => "Reversed",
            TransactionStatus::FailedCompletely => "Failed Completely",
            TransactionStatus::Retrying => "Retrying",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub account_number: String,
    pub transaction_ref: String,

    // Gateway correlation, set once on a successful initiation
    pub merchant_id: Option<String>,
    pub checkout_request_id: Option<String>,

    pub amount: i64,
    pub amount_paid: i64,
    pub last_payment: i64,
    pub currency: String,

    pub status: TransactionStatus,
    pub error_message: String,
    pub instruction_to_customer: String,

    pub narration: String,
    pub payment_method_name: String,
    pub phone_number: Option<String>,
    pub first_name: Option<String>,
    pub provider_reference: Option<String>,

    /// Receipt numbers already credited to `amount_paid`.
    #[serde(default)]
    pub applied_receipts: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_number: String,
    pub amount: i64,
    pub phone_number: Option<String>,
    pub narration: Option<String>,
    pub payment_method_name: String,
}

impl Transaction {
    /// Builds a fresh `Initiated` transaction. The reference is generated
    /// here and never rewritten by any store operation.
    pub fn new(new: NewTransaction) -> Self {
        let now = Utc::now();
        let narration = new
            .narration
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| format!("Payment for {}", new.account_number));

        Transaction {
            id: None,
            transaction_ref: generate_transaction_ref(),
            account_number: new.account_number,
            merchant_id: None,
            checkout_request_id: None,
            amount: new.amount,
            amount_paid: 0,
            last_payment: 0,
            currency: "KES".to_string(),
            status: TransactionStatus::Initiated,
            error_message: String::new(),
            instruction_to_customer: String::new(),
            narration,
            payment_method_name: new.payment_method_name,
            phone_number: new.phone_number,
            first_name: None,
            provider_reference: None,
            applied_receipts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == TransactionStatus::Successful
    }

    pub fn checkout_request_id(&self) -> Option<&str> {
        self.checkout_request_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }
}

pub fn generate_transaction_ref() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Six random digits, the externally visible correlation key for STK payments.
pub fn generate_account_number() -> String {
    format!("{:06}", uuid::Uuid::new_v4().as_u128() % 1_000_000)
}

/// Raw gateway payload kept for audit only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLog {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub sequence: u64,
    pub json_data: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// A settling event applied by the callback or confirmation path.
#[derive(Debug, Clone)]
pub struct PaymentApplication {
    pub amount: i64,
    /// Dedup key; `None` applies unconditionally.
    pub receipt: Option<String>,
    pub error_message: String,
    /// Replaces `instruction_to_customer` on the settled row.
    pub instruction: String,
    pub phone_number: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(Transaction),
    /// The event was already applied or the transition is not allowed.
    Ignored(Transaction),
    NotFound,
}

/// Fire-and-forget summary handed to the notification sink.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub account_number: String,
    pub transaction_ref: String,
    pub status: TransactionStatus,
    pub amount: i64,
    pub amount_paid: i64,
    pub provider_reference: Option<String>,
}

impl From<&Transaction> for TransactionSummary {
    fn from(transaction: &Transaction) -> Self {
        TransactionSummary {
            account_number: transaction.account_number.clone(),
            transaction_ref: transaction.transaction_ref.clone(),
            status: transaction.status,
            amount: transaction.amount,
            amount_paid: transaction.amount_paid,
            provider_reference: transaction.provider_reference.clone(),
        }
    }
}
