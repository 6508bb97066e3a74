use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct InitiateStkPushRequest {
    #[validate(range(min = 1, message = "Amount must be at least 1"))]
    pub amount: i64,

    #[validate(length(min = 1, message = "Kindly add a valid phone number"))]
    pub phone_number: String,

    #[validate(length(max = 100, message = "Description must be at most 100 characters"))]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitiateStkPushResponse {
    pub status: String,
    pub message: String,
    pub query_status_url: String,
    pub account_number: String,
    pub transaction_ref: String,
}

/// Acknowledgement body the gateway expects from our webhooks.
#[derive(Debug, Serialize)]
pub struct GatewayAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl GatewayAck {
    pub fn accepted() -> Self {
        GatewayAck {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        GatewayAck {
            result_code: 1,
            result_desc: reason.into(),
        }
    }
}
