// services/daraja_client.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{header, Client};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::{AppConfig, DarajaUrls};
use crate::database::TokenStore;
use crate::errors::{AppError, Result};
use crate::services::credential_cache::{CredentialCache, ProviderCredentials};

/// East Africa Time, the zone Daraja expects timestamps in.
const EAT_OFFSET_HOURS: i64 = 3;

/// One logical payment attempt. The timestamp is captured once so every
/// gateway call of the attempt presents the same password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LipaAttempt {
    timestamp: String,
}

impl LipaAttempt {
    pub fn now() -> Self {
        let eat = Utc::now() + ChronoDuration::hours(EAT_OFFSET_HOURS);
        LipaAttempt {
            timestamp: eat.format("%Y%m%d%H%M%S").to_string(),
        }
    }

    pub fn at(timestamp: impl Into<String>) -> Self {
        LipaAttempt {
            timestamp: timestamp.into(),
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// base64(shortcode + passkey + timestamp)
    pub fn password(&self, shortcode: &Shortcode) -> String {
        base64.encode(format!(
            "{}{}{}",
            shortcode.short_code, shortcode.passkey, self.timestamp
        ))
    }
}

#[derive(Debug, Clone)]
pub struct Shortcode {
    pub short_code: String,
    pub passkey: String,
}

impl Shortcode {
    pub fn from_config(config: &AppConfig) -> Self {
        Shortcode {
            short_code: config.mpesa_short_code.clone(),
            passkey: config.mpesa_passkey.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: i64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

impl StkPushRequest {
    pub fn new(
        shortcode: &Shortcode,
        attempt: &LipaAttempt,
        amount: i64,
        payer_phone: &str,
        callback_url: String,
        account_reference: &str,
        description: &str,
    ) -> Self {
        StkPushRequest {
            business_short_code: shortcode.short_code.clone(),
            password: attempt.password(shortcode),
            timestamp: attempt.timestamp().to_string(),
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: payer_phone.to_string(),
            party_b: shortcode.short_code.clone(),
            phone_number: payer_phone.to_string(),
            callback_url,
            account_reference: account_reference.to_string(),
            transaction_desc: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

impl StkQueryRequest {
    pub fn new(shortcode: &Shortcode, attempt: &LipaAttempt, checkout_request_id: &str) -> Self {
        StkQueryRequest {
            business_short_code: shortcode.short_code.clone(),
            password: attempt.password(shortcode),
            timestamp: attempt.timestamp().to_string(),
            checkout_request_id: checkout_request_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterUrlsRequest {
    #[serde(rename = "ShortCode")]
    pub short_code: String,
    /// `Completed` or `Cancelled`: what the gateway does when validation is unreachable.
    #[serde(rename = "ResponseType")]
    pub response_type: String,
    #[serde(rename = "ConfirmationURL")]
    pub confirmation_url: String,
    #[serde(rename = "ValidationURL")]
    pub validation_url: String,
}

impl RegisterUrlsRequest {
    pub fn new(short_code: &str, confirmation_url: String, validation_url: String) -> Self {
        RegisterUrlsRequest {
            short_code: short_code.to_string(),
            response_type: "Completed".to_string(),
            confirmation_url,
            validation_url,
        }
    }
}

/// Raw gateway answer; business meaning is left to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Value,
}

impl GatewayResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Non-200 answers become `GatewayHttp`, carrying the gateway's own
    /// message when it sent one.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }

        let message = self
            .str_field("errorMessage")
            .or_else(|| self.str_field("ResponseDescription"))
            .map(str::to_string)
            .unwrap_or_else(|| match &self.body {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            });

        Err(AppError::GatewayHttp {
            status: self.status,
            message,
        })
    }
}

#[async_trait]
pub trait MpesaApi: Send + Sync {
    async fn initiate_payment(&self, request: &StkPushRequest) -> Result<GatewayResponse>;
    async fn query_status(&self, request: &StkQueryRequest) -> Result<GatewayResponse>;
    async fn register_callback_urls(&self, request: &RegisterUrlsRequest) -> Result<GatewayResponse>;
}

pub struct DarajaClient {
    client: Client,
    urls: DarajaUrls,
    credentials: ProviderCredentials,
    cache: CredentialCache,
}

impl DarajaClient {
    pub fn new(config: &AppConfig, token_store: Arc<dyn TokenStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(DarajaClient {
            cache: CredentialCache::new(client.clone(), token_store),
            client,
            urls: config.get_mpesa_urls(),
            credentials: ProviderCredentials::from_config(config),
        })
    }

    pub async fn access_token(&self) -> Result<String> {
        self.cache.get_token(&self.credentials).await
    }

    async fn post<T: Serialize + Sync>(&self, url: &str, payload: &T) -> Result<GatewayResponse> {
        let access_token = self.access_token().await?;

        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .json(payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if status != 200 {
            error!("M-Pesa request to {} failed: {} - {}", url, status, body);
        }

        Ok(GatewayResponse { status, body })
    }
}

#[async_trait]
impl MpesaApi for DarajaClient {
    async fn initiate_payment(&self, request: &StkPushRequest) -> Result<GatewayResponse> {
        info!(
            account_reference = %request.account_reference,
            amount = request.amount,
            "STK push"
        );
        self.post(&self.urls.stk_push_url, request).await
    }

    async fn query_status(&self, request: &StkQueryRequest) -> Result<GatewayResponse> {
        info!(checkout_request_id = %request.checkout_request_id, "STK query");
        self.post(&self.urls.stk_query_url, request).await
    }

    async fn register_callback_urls(&self, request: &RegisterUrlsRequest) -> Result<GatewayResponse> {
        info!(
            short_code = %request.short_code,
            confirmation_url = %request.confirmation_url,
            validation_url = %request.validation_url,
            "C2B register URLs"
        );
        self.post(&self.urls.c2b_register_url, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shortcode() -> Shortcode {
        Shortcode {
            short_code: "174379".to_string(),
            passkey: "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919".to_string(),
        }
    }

    #[test]
    fn test_password_is_base64_of_concatenation() {
        let attempt = LipaAttempt::at("20220407155444");
        let expected = base64.encode(
            "174379bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c91920220407155444",
        );
        assert_eq!(attempt.password(&shortcode()), expected);
    }

    #[test]
    fn test_timestamp_format() {
        let attempt = LipaAttempt::now();
        assert_eq!(attempt.timestamp().len(), 14);
        assert!(attempt.timestamp().chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_attempt_requests_share_password() {
        let attempt = LipaAttempt::at("20240101120000");
        let push = StkPushRequest::new(
            &shortcode(),
            &attempt,
            10,
            "254712345678",
            "https://example.com/cb".to_string(),
            "123456",
            "Payment for 123456",
        );
        let query = StkQueryRequest::new(&shortcode(), &attempt, "ws_CO_1");
        assert_eq!(push.password, query.password);
        assert_eq!(push.timestamp, query.timestamp);
    }

    #[test]
    fn test_stk_push_wire_names() {
        let push = StkPushRequest::new(
            &shortcode(),
            &LipaAttempt::at("20240101120000"),
            10,
            "254712345678",
            "https://example.com/cb".to_string(),
            "123456",
            "desc",
        );
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["BusinessShortCode"], "174379");
        assert_eq!(json["TransactionType"], "CustomerPayBillOnline");
        assert_eq!(json["Amount"], 10);
        assert_eq!(json["PartyB"], "174379");
        assert_eq!(json["CallBackURL"], "https://example.com/cb");
    }

    #[test]
    fn test_error_for_status_keeps_gateway_message() {
        let ok = GatewayResponse {
            status: 200,
            body: serde_json::json!({ "ResponseCode": "0" }),
        };
        assert!(ok.error_for_status().is_ok());

        let rejected = GatewayResponse {
            status: 400,
            body: serde_json::json!({ "errorMessage": "Bad Request - Invalid PhoneNumber" }),
        };
        match rejected.error_for_status() {
            Err(AppError::GatewayHttp { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Bad Request - Invalid PhoneNumber");
            }
            other => panic!("expected GatewayHttp, got {:?}", other),
        }

        let text = GatewayResponse {
            status: 503,
            body: Value::String("upstream connect error".to_string()),
        };
        assert!(matches!(
            text.error_for_status(),
            Err(AppError::GatewayHttp { message, .. }) if message == "upstream connect error"
        ));
    }

    #[test]
    fn test_register_defaults_to_completed() {
        let request = RegisterUrlsRequest::new("600996", "c".to_string(), "v".to_string());
        assert_eq!(request.response_type, "Completed");
    }
}
