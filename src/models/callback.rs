// models/callback.rs
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{AppError, Result};

#[derive(Debug, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback", default)]
    pub stk_callback: Option<StkCallback>,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,

    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,

    #[serde(rename = "ResultCode", default)]
    pub result_code: Value,

    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value", default)]
    pub value: Value,
}

impl StkCallbackEnvelope {
    pub fn parse(raw: &Value) -> Result<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| AppError::malformed(format!("STK callback: {}", e)))
    }
}

impl StkCallback {
    pub fn is_success(&self) -> bool {
        value_as_i64(&self.result_code) == Some(0)
    }

    pub fn result_desc(&self) -> String {
        self.result_desc.clone().unwrap_or_default()
    }
}

/// Typed view over the loosely-typed `{Name, Value}` metadata list.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentMetadata {
    pub amount: i64,
    pub receipt_number: String,
    pub phone_number: Option<String>,
    pub transaction_date: Option<String>,
}

impl TryFrom<&CallbackMetadata> for PaymentMetadata {
    type Error = AppError;

    fn try_from(metadata: &CallbackMetadata) -> Result<Self> {
        let mut amount = None;
        let mut receipt_number = None;
        let mut phone_number = None;
        let mut transaction_date = None;

        for item in &metadata.items {
            match item.name.as_str() {
                "Amount" => amount = Some(value_as_amount(&item.value)?),
                "MpesaReceiptNumber" => receipt_number = value_as_string(&item.value),
                "PhoneNumber" => phone_number = value_as_string(&item.value),
                "TransactionDate" => transaction_date = value_as_string(&item.value),
                _ => continue,
            }
        }

        Ok(PaymentMetadata {
            amount: amount
                .ok_or_else(|| AppError::malformed("callback metadata is missing Amount"))?,
            receipt_number: receipt_number.ok_or_else(|| {
                AppError::malformed("callback metadata is missing MpesaReceiptNumber")
            })?,
            phone_number,
            transaction_date,
        })
    }
}

/// C2B validation/confirmation notification.
#[derive(Debug, Clone, PartialEq)]
pub struct C2bNotification {
    pub bill_ref_number: String,
    pub trans_amount: i64,
    pub msisdn: Option<String>,
    pub first_name: Option<String>,
    pub trans_id: Option<String>,
}

impl C2bNotification {
    pub fn parse(raw: &Value) -> Result<Self> {
        let field = |name: &str| raw.get(name).and_then(value_as_string);

        let bill_ref_number = field("BillRefNumber")
            .ok_or_else(|| AppError::malformed("C2B payload is missing BillRefNumber"))?;
        let trans_amount = raw
            .get("TransAmount")
            .ok_or_else(|| AppError::malformed("C2B payload is missing TransAmount"))
            .and_then(value_as_amount)?;

        Ok(C2bNotification {
            bill_ref_number,
            trans_amount,
            msisdn: field("MSISDN"),
            first_name: field("FirstName"),
            trans_id: field("TransID"),
        })
    }
}

/// Non-empty string form of a scalar JSON value.
pub fn value_as_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Whole-shilling amount; fractional parts are truncated. Negative,
/// non-numeric and out-of-range values are malformed.
pub fn value_as_amount(value: &Value) -> Result<i64> {
    let amount = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match amount {
        // 2^63 is the smallest f64 that no longer fits an i64.
        Some(amount) if amount.is_finite() && amount >= 0.0 && amount < i64::MAX as f64 => {
            Ok(amount.trunc() as i64)
        }
        _ => Err(AppError::malformed(format!("{} is not a valid amount", value))),
    }
}
