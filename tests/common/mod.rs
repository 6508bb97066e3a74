#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use daraja_payments::config::{AppConfig, SettlementConfig};
use daraja_payments::database::{InMemoryAuditLog, InMemoryTransactionStore};
use daraja_payments::errors::Result;
use daraja_payments::middleware::auth::Claims;
use daraja_payments::services::daraja_client::{
    GatewayResponse, MpesaApi, RegisterUrlsRequest, StkPushRequest, StkQueryRequest,
};
use daraja_payments::services::reconciler::Reconciler;

pub const JWT_SECRET: &str = "test-secret";

pub fn test_config() -> AppConfig {
    AppConfig {
        mpesa_consumer_key: "consumer-key".to_string(),
        mpesa_consumer_secret: "consumer-secret".to_string(),
        mpesa_short_code: "174379".to_string(),
        mpesa_c2b_short_code: "600996".to_string(),
        mpesa_passkey: "passkey".to_string(),
        mpesa_environment: "sandbox".to_string(),
        mpesa_base_url: None,
        api_host: "https://pay.example.com".to_string(),
        paybill_number: "888880".to_string(),
        payment_method_name: "M-Pesa".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        database_url: "mongodb://localhost:27017".to_string(),
        database_name: "payments_test".to_string(),
        port: 0,
        host: "127.0.0.1".to_string(),
        settlement: SettlementConfig::default(),
    }
}

/// Same budget shape with millisecond units, for tests on real time.
pub fn fast_config() -> AppConfig {
    let mut config = test_config();
    config.settlement.wait_unit = Duration::from_millis(1);
    config
}

pub fn respond(status: u16, body: Value) -> Result<GatewayResponse> {
    Ok(GatewayResponse { status, body })
}

pub fn push_accepted() -> Result<GatewayResponse> {
    respond(
        200,
        json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        }),
    )
}

/// Scripted gateway. Queued responses are served in order; an empty queue
/// falls back to a successful answer.
#[derive(Default)]
pub struct FakeGateway {
    pub push_responses: Mutex<VecDeque<Result<GatewayResponse>>>,
    pub query_responses: Mutex<VecDeque<Result<GatewayResponse>>>,
    pub pushes: Mutex<Vec<StkPushRequest>>,
    pub queries: Mutex<Vec<StkQueryRequest>>,
    pub registrations: Mutex<Vec<RegisterUrlsRequest>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_push(&self, response: Result<GatewayResponse>) {
        self.push_responses.lock().unwrap().push_back(response);
    }

    pub fn queue_query(&self, response: Result<GatewayResponse>) {
        self.query_responses.lock().unwrap().push_back(response);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

#[async_trait]
impl MpesaApi for FakeGateway {
    async fn initiate_payment(&self, request: &StkPushRequest) -> Result<GatewayResponse> {
        self.pushes.lock().unwrap().push(request.clone());
        let queued = self.push_responses.lock().unwrap().pop_front();
        queued.unwrap_or_else(push_accepted)
    }

    async fn query_status(&self, request: &StkQueryRequest) -> Result<GatewayResponse> {
        self.queries.lock().unwrap().push(request.clone());
        let queued = self.query_responses.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            respond(
                200,
                json!({
                    "ResponseCode": "0",
                    "ResultCode": "1032",
                    "ResultDesc": "Request cancelled by user"
                }),
            )
        })
    }

    async fn register_callback_urls(&self, request: &RegisterUrlsRequest) -> Result<GatewayResponse> {
        self.registrations.lock().unwrap().push(request.clone());
        respond(
            200,
            json!({
                "OriginatorCoversationID": "7619-37765134-1",
                "ResponseCode": "0",
                "ResponseDescription": "success"
            }),
        )
    }
}

pub struct Harness {
    pub reconciler: Arc<Reconciler>,
    pub store: InMemoryTransactionStore,
    pub audit: InMemoryAuditLog,
    pub gateway: Arc<FakeGateway>,
    pub config: Arc<AppConfig>,
}

pub fn harness(config: AppConfig) -> Harness {
    let config = Arc::new(config);
    let store = InMemoryTransactionStore::new();
    let audit = InMemoryAuditLog::new();
    let gateway = FakeGateway::new();

    let reconciler = Reconciler::new(
        config.clone(),
        Arc::new(store.clone()),
        gateway.clone(),
        Arc::new(audit.clone()),
    );

    Harness {
        reconciler: Arc::new(reconciler),
        store,
        audit,
        gateway,
        config,
    }
}

pub fn success_callback(amount: i64, receipt: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": amount },
                        { "Name": "MpesaReceiptNumber", "Value": receipt },
                        { "Name": "Balance" },
                        { "Name": "TransactionDate", "Value": 20191219102115u64 },
                        { "Name": "PhoneNumber", "Value": 254712345678u64 }
                    ]
                }
            }
        }
    })
}

pub fn failed_callback(code: i64, description: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": code,
                "ResultDesc": description
            }
        }
    })
}

pub fn bearer_token() -> String {
    let claims = Claims {
        sub: "customer-1".to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}
