//! Transaction reconciliation.
//!
//! Three sources report on a payment: the synchronous STK push response, the
//! asynchronous gateway callback and the STK query endpoint. Only the callback
//! and C2B confirmation paths may move money fields or set `Successful`; the
//! query path reports what the gateway says and leaves stored state alone.
//!
//! The waiter and the callback handler never share a lock. The handler writes
//! through one conditional store update and then publishes the account number
//! on [`SettlementSignals`]; the waiter wakes on that signal or on its timer
//! and re-reads the row, which stays the source of truth.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::database::{AuditLog, TransactionStore};
use crate::errors::{AppError, Result};
use crate::models::callback::{value_as_string, C2bNotification, PaymentMetadata, StkCallbackEnvelope};
use crate::models::transaction::{
    generate_account_number, ApplyOutcome, NewTransaction, PaymentApplication, Transaction,
    TransactionStatus, TransactionSummary,
};
use crate::services::daraja_client::{
    GatewayResponse, LipaAttempt, MpesaApi, RegisterUrlsRequest, Shortcode, StkPushRequest,
    StkQueryRequest,
};
use crate::services::notifier::{TracingNotifier, TransactionNotifier};
use crate::services::phone::{msisdn, KenyanPhoneValidator, PhoneValidator};

pub const INITIATION_FAILED_MESSAGE: &str = "Failed to initiate stk push!";
pub const PAYMENT_RECEIVED_INSTRUCTION: &str = "Thank you. Payment received";
pub const PAYMENT_FAILED_INSTRUCTION: &str = "Payment failed. Try again";
const NOT_ACKNOWLEDGED_MESSAGE: &str = "Transaction has not been acknowledged by M-Pesa";
const ACCOUNT_NUMBER_ATTEMPTS: usize = 10;

/// Wakes waiters as soon as a settling event lands for their account.
#[derive(Clone)]
pub struct SettlementSignals {
    sender: broadcast::Sender<String>,
}

impl SettlementSignals {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        SettlementSignals { sender }
    }

    pub fn publish(&self, account_number: &str) {
        // No receivers simply means nobody is waiting.
        let _ = self.sender.send(account_number.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for SettlementSignals {
    fn default() -> Self {
        Self::new(256)
    }
}

async fn signalled(receiver: &mut broadcast::Receiver<String>, account_number: &str) {
    loop {
        match receiver.recv().await {
            Ok(account) if account == account_number => return,
            Ok(_) => continue,
            // Missed messages may include ours; a store re-read settles it.
            Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// A validated pay request.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount: i64,
    /// E.164 form.
    pub phone_number: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub enum InitiationOutcome {
    /// Gateway acknowledged the push; correlation ids are stored.
    Accepted(Transaction),
    /// Push could not be sent; the customer was told to pay manually.
    Deferred(Transaction),
}

#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub transaction: Transaction,
    pub attempts: u32,
    pub elapsed: Duration,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusQueryReport {
    /// 200 from the gateway, reported verbatim.
    Gateway {
        result_code: Option<String>,
        result_desc: String,
    },
    Error { message: String },
}

impl StatusQueryReport {
    pub fn message(&self) -> &str {
        match self {
            StatusQueryReport::Gateway { result_desc, .. } => result_desc,
            StatusQueryReport::Error { message } => message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub transaction: Transaction,
    pub wait: WaitOutcome,
    pub query: Option<StatusQueryReport>,
}

#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    Deferred(Transaction),
    Settled(SettlementReport),
}

#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    Applied(Transaction),
    /// Replay of an event that was already applied, or a failure report for a
    /// transaction that already succeeded.
    Ignored(Transaction),
}

/// Answer to the customer-facing status poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub message: String,
    pub amount: i64,
}

pub struct Reconciler {
    config: Arc<AppConfig>,
    shortcode: Shortcode,
    store: Arc<dyn TransactionStore>,
    gateway: Arc<dyn MpesaApi>,
    audit: Arc<dyn AuditLog>,
    notifier: Arc<dyn TransactionNotifier>,
    phone_validator: Arc<dyn PhoneValidator>,
    signals: SettlementSignals,
}

impl Reconciler {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn TransactionStore>,
        gateway: Arc<dyn MpesaApi>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Reconciler {
            shortcode: Shortcode::from_config(&config),
            config,
            store,
            gateway,
            audit,
            notifier: Arc::new(TracingNotifier),
            phone_validator: Arc::new(KenyanPhoneValidator),
            signals: SettlementSignals::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TransactionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_phone_validator(mut self, phone_validator: Arc<dyn PhoneValidator>) -> Self {
        self.phone_validator = phone_validator;
        self
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn phone_validator(&self) -> &Arc<dyn PhoneValidator> {
        &self.phone_validator
    }

    pub async fn create_transaction(&self, payment: NewPayment) -> Result<Transaction> {
        for _ in 0..ACCOUNT_NUMBER_ATTEMPTS {
            let transaction = Transaction::new(NewTransaction {
                account_number: generate_account_number(),
                amount: payment.amount,
                phone_number: Some(payment.phone_number.clone()),
                narration: payment.description.clone(),
                payment_method_name: self.config.payment_method_name.clone(),
            });

            match self.store.insert(&transaction).await {
                Ok(()) => {
                    info!(
                        account_number = %transaction.account_number,
                        transaction_ref = %transaction.transaction_ref,
                        amount = transaction.amount,
                        "Transaction created"
                    );
                    return Ok(transaction);
                }
                Err(AppError::DuplicateKey) => {
                    warn!("{} not unique account number generated", transaction.account_number);
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Internal(
            "could not allocate a unique account number".to_string(),
        ))
    }

    pub async fn initiate(
        &self,
        transaction: &Transaction,
        attempt: &LipaAttempt,
    ) -> Result<InitiationOutcome> {
        let account_number = &transaction.account_number;
        let phone = transaction
            .phone_number
            .as_deref()
            .map(msisdn)
            .ok_or_else(|| AppError::invalid_data("transaction has no payer phone number"))?;

        let request = StkPushRequest::new(
            &self.shortcode,
            attempt,
            transaction.amount,
            &phone,
            self.config.stk_callback_url(account_number),
            account_number,
            &transaction.narration,
        );

        let sent = self
            .gateway
            .initiate_payment(&request)
            .await
            .and_then(GatewayResponse::error_for_status);
        let response = match sent {
            Ok(response) => response,
            Err(e @ (AppError::GatewayHttp { .. } | AppError::GatewayUnavailable(_))) => {
                warn!(%account_number, "STK push not delivered: {}", e);
                return self.defer(account_number).await;
            }
            Err(e) => return Err(e),
        };

        let merchant_id = required_field(&response, "MerchantRequestID")?;
        let checkout_request_id = required_field(&response, "CheckoutRequestID")?;

        let transaction = self
            .store
            .record_initiation(account_number, merchant_id, checkout_request_id)
            .await?;

        info!(%account_number, %checkout_request_id, "STK push accepted");
        Ok(InitiationOutcome::Accepted(transaction))
    }

    async fn defer(&self, account_number: &str) -> Result<InitiationOutcome> {
        let instruction = self.config.manual_payment_instruction(account_number);
        let transaction = self
            .store
            .mark_pending(account_number, INITIATION_FAILED_MESSAGE, &instruction)
            .await?;
        Ok(InitiationOutcome::Deferred(transaction))
    }

    /// Holds the caller until the transaction leaves `Initiated`, the time
    /// budget runs out, or `cancel` fires. Sleeps grow 2, 4, 6, ... units.
    pub async fn wait_for_callback(
        &self,
        account_number: &str,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let settlement = &self.config.settlement;
        let budget = settlement.budget();
        let mut receiver = self.signals.subscribe();
        let started = Instant::now();
        let mut interval = settlement.initial_interval;
        let mut attempts = 0;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                break;
            }

            let pause = (settlement.wait_unit * interval).min(budget - elapsed);
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(pause) => false,
                _ = signalled(&mut receiver, account_number) => false,
            };

            let transaction = self.load(account_number).await?;
            if cancelled {
                info!(%account_number, "Settlement wait cancelled");
                return Ok(WaitOutcome {
                    transaction,
                    attempts,
                    elapsed: started.elapsed(),
                    cancelled: true,
                });
            }

            attempts += 1;
            if transaction.status != TransactionStatus::Initiated {
                return Ok(WaitOutcome {
                    transaction,
                    attempts,
                    elapsed: started.elapsed(),
                    cancelled: false,
                });
            }
            interval += settlement.interval_step;
        }

        info!(%account_number, attempts, "Settlement wait timed out");
        Ok(WaitOutcome {
            transaction: self.load(account_number).await?,
            attempts,
            elapsed: started.elapsed(),
            cancelled: false,
        })
    }

    /// Wait, then fall back to a read-only status query when no success was seen.
    pub async fn settle(
        &self,
        account_number: &str,
        attempt: &LipaAttempt,
        cancel: &CancellationToken,
    ) -> Result<SettlementReport> {
        let wait = self.wait_for_callback(account_number, cancel).await?;
        if wait.cancelled {
            return Ok(SettlementReport {
                transaction: wait.transaction.clone(),
                wait,
                query: None,
            });
        }

        let transaction = self.load(account_number).await?;
        if transaction.is_successful() {
            let transaction = self
                .store
                .set_instruction(account_number, PAYMENT_RECEIVED_INSTRUCTION)
                .await?;
            return Ok(SettlementReport {
                transaction,
                wait,
                query: None,
            });
        }

        let query = self.query_gateway(&transaction, attempt).await?;
        info!(%account_number, status = %transaction.status, report = query.message(), "Fallback status query");

        // A callback may have landed during the query.
        let transaction = self
            .store
            .set_instruction_unless_paid(account_number, PAYMENT_FAILED_INSTRUCTION)
            .await?;
        Ok(SettlementReport {
            transaction,
            wait,
            query: Some(query),
        })
    }

    /// Create, initiate and settle in one call.
    pub async fn process_payment(
        &self,
        payment: NewPayment,
        cancel: &CancellationToken,
    ) -> Result<PaymentOutcome> {
        let transaction = self.create_transaction(payment).await?;
        let attempt = LipaAttempt::now();

        match self.initiate(&transaction, &attempt).await? {
            InitiationOutcome::Deferred(transaction) => Ok(PaymentOutcome::Deferred(transaction)),
            InitiationOutcome::Accepted(transaction) => {
                let report = self
                    .settle(&transaction.account_number, &attempt, cancel)
                    .await?;
                Ok(PaymentOutcome::Settled(report))
            }
        }
    }

    /// Runs [`Reconciler::settle`] on its own task so request handling is not held.
    pub fn spawn_settlement(
        self: &Arc<Self>,
        account_number: String,
        attempt: LipaAttempt,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<SettlementReport>> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let report = reconciler.settle(&account_number, &attempt, &cancel).await;
            if let Err(e) = &report {
                error!(%account_number, "Settlement failed: {}", e);
            }
            report
        })
    }

    /// Read-only STK query. Never touches status or amounts.
    pub async fn query_gateway(
        &self,
        transaction: &Transaction,
        attempt: &LipaAttempt,
    ) -> Result<StatusQueryReport> {
        let Some(checkout_request_id) = transaction.checkout_request_id() else {
            return Ok(StatusQueryReport::Error {
                message: NOT_ACKNOWLEDGED_MESSAGE.to_string(),
            });
        };

        let request = StkQueryRequest::new(&self.shortcode, attempt, checkout_request_id);
        let answered = self
            .gateway
            .query_status(&request)
            .await
            .and_then(GatewayResponse::error_for_status);
        let response = match answered {
            Ok(response) => response,
            Err(AppError::GatewayHttp { message, .. }) | Err(AppError::GatewayUnavailable(message)) => {
                return Ok(StatusQueryReport::Error { message })
            }
            Err(e) => return Err(e),
        };

        let result_desc = required_field(&response, "ResultDesc")?.to_string();
        let result_code = response.body.get("ResultCode").and_then(value_as_string);
        Ok(StatusQueryReport::Gateway {
            result_code,
            result_desc,
        })
    }

    pub async fn status_report(&self, account_number: &str) -> Result<StatusReport> {
        let Some(transaction) = self.store.find_by_account(account_number).await? else {
            return Ok(StatusReport {
                message: "Invalid Transaction".to_string(),
                amount: 0,
            });
        };

        match transaction.status {
            TransactionStatus::Successful => Ok(StatusReport {
                message: "Transaction successful".to_string(),
                amount: transaction.amount_paid,
            }),
            TransactionStatus::Initiated => {
                let report = self.query_gateway(&transaction, &LipaAttempt::now()).await?;
                let amount = match report {
                    StatusQueryReport::Gateway { .. } => transaction.amount_paid,
                    StatusQueryReport::Error { .. } => 0,
                };
                Ok(StatusReport {
                    message: report.message().to_string(),
                    amount,
                })
            }
            _ => {
                let message = if transaction.error_message.is_empty() {
                    "Transaction Failed!!".to_string()
                } else {
                    transaction.error_message.clone()
                };
                Ok(StatusReport {
                    message,
                    amount: transaction.amount_paid,
                })
            }
        }
    }

    pub async fn handle_stk_callback(
        &self,
        account_number: &str,
        payload: &Value,
    ) -> Result<CallbackOutcome> {
        self.audit.append(payload).await?;

        if self.store.find_by_account(account_number).await?.is_none() {
            warn!(%account_number, "Callback for unknown transaction");
            return Err(AppError::invalid_transaction());
        }

        let envelope = StkCallbackEnvelope::parse(payload)?;
        let outcome = match envelope.body.stk_callback {
            Some(callback) if callback.is_success() => {
                let metadata = callback
                    .callback_metadata
                    .as_ref()
                    .ok_or_else(|| AppError::malformed("successful callback has no CallbackMetadata"))
                    .and_then(PaymentMetadata::try_from)?;

                let payment = PaymentApplication {
                    amount: metadata.amount,
                    receipt: Some(metadata.receipt_number),
                    error_message: callback.result_desc(),
                    instruction: PAYMENT_RECEIVED_INSTRUCTION.to_string(),
                    phone_number: metadata
                        .phone_number
                        .as_deref()
                        .and_then(|phone| self.phone_validator.validate(phone)),
                    first_name: None,
                };
                self.store.apply_payment(account_number, &payment).await?
            }
            Some(callback) => {
                self.store
                    .apply_failure(account_number, &callback.result_desc())
                    .await?
            }
            None => self.store.apply_failure(account_number, "").await?,
        };

        self.settled(account_number, outcome)
    }

    pub async fn register_c2b_urls(&self) -> Result<GatewayResponse> {
        let request = RegisterUrlsRequest::new(
            &self.config.mpesa_c2b_short_code,
            self.config.c2b_confirmation_url(),
            self.config.c2b_validation_url(),
        );
        self.gateway.register_callback_urls(&request).await
    }

    /// Creates the transaction for an external reference if none exists.
    /// Returns whether one was created.
    pub async fn validate_c2b(&self, payload: &Value) -> Result<bool> {
        let notification = C2bNotification::parse(payload)?;
        let created = self.ensure_c2b_transaction(&notification).await?;
        if created {
            info!(account_number = %notification.bill_ref_number, "C2B transaction created on validation");
        }
        Ok(created)
    }

    /// Confirmation is authoritative: the paid amount is always applied.
    pub async fn confirm_c2b(&self, payload: &Value) -> Result<CallbackOutcome> {
        self.audit.append(payload).await?;

        let notification = C2bNotification::parse(payload)?;
        self.ensure_c2b_transaction(&notification).await?;

        let payment = PaymentApplication {
            amount: notification.trans_amount,
            receipt: notification.trans_id.clone(),
            error_message: String::new(),
            instruction: PAYMENT_RECEIVED_INSTRUCTION.to_string(),
            phone_number: notification
                .msisdn
                .as_deref()
                .and_then(|phone| self.phone_validator.validate(phone)),
            first_name: notification.first_name.clone(),
        };

        let outcome = self
            .store
            .apply_payment(&notification.bill_ref_number, &payment)
            .await?;
        self.settled(&notification.bill_ref_number, outcome)
    }

    async fn ensure_c2b_transaction(&self, notification: &C2bNotification) -> Result<bool> {
        let transaction = Transaction::new(NewTransaction {
            account_number: notification.bill_ref_number.clone(),
            amount: notification.trans_amount,
            phone_number: None,
            narration: None,
            payment_method_name: self.config.payment_method_name.clone(),
        });
        self.store.insert_if_absent(&transaction).await
    }

    fn settled(&self, account_number: &str, outcome: ApplyOutcome) -> Result<CallbackOutcome> {
        match outcome {
            ApplyOutcome::Applied(transaction) => {
                self.signals.publish(account_number);
                self.notifier.notify(TransactionSummary::from(&transaction));
                Ok(CallbackOutcome::Applied(transaction))
            }
            ApplyOutcome::Ignored(transaction) => {
                info!(%account_number, status = %transaction.status, "Settling event ignored");
                Ok(CallbackOutcome::Ignored(transaction))
            }
            ApplyOutcome::NotFound => Err(AppError::invalid_transaction()),
        }
    }

    async fn load(&self, account_number: &str) -> Result<Transaction> {
        self.store
            .find_by_account(account_number)
            .await?
            .ok_or_else(AppError::invalid_transaction)
    }
}

fn required_field<'a>(response: &'a GatewayResponse, key: &str) -> Result<&'a str> {
    response
        .str_field(key)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::malformed(format!("gateway response is missing {}", key)))
}
