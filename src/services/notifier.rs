// services/notifier.rs
use tracing::info;

use crate::models::transaction::TransactionSummary;

/// Fire-and-forget sink for settled transaction summaries. Implementations
/// must not block the caller.
pub trait TransactionNotifier: Send + Sync {
    fn notify(&self, summary: TransactionSummary);
}

#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl TransactionNotifier for TracingNotifier {
    fn notify(&self, summary: TransactionSummary) {
        info!(
            account_number = %summary.account_number,
            transaction_ref = %summary.transaction_ref,
            status = %summary.status,
            amount = summary.amount,
            amount_paid = summary.amount_paid,
            provider_reference = ?summary.provider_reference,
            "Transaction updated"
        );
    }
}
