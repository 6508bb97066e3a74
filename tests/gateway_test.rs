mod common;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::test_config;
use daraja_payments::config::ACCESS_TOKEN_CODE;
use daraja_payments::database::{InMemoryTokenStore, TokenStore};
use daraja_payments::errors::AppError;
use daraja_payments::services::daraja_client::{
    DarajaClient, LipaAttempt, MpesaApi, RegisterUrlsRequest, Shortcode, StkPushRequest,
    StkQueryRequest,
};

/// Local stand-in for the Daraja endpoints.
struct FakeDaraja {
    auth_hits: AtomicUsize,
    auth_response: Mutex<(u16, String)>,
    push_status: AtomicU16,
    authorizations: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
}

impl FakeDaraja {
    fn new() -> Arc<Self> {
        Arc::new(FakeDaraja {
            auth_hits: AtomicUsize::new(0),
            auth_response: Mutex::new((
                200,
                r#"{"access_token":"tok-1","expires_in":"3599"}"#.to_string(),
            )),
            push_status: AtomicU16::new(200),
            authorizations: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
        })
    }

    fn set_auth_response(&self, status: u16, body: &str) {
        *self.auth_response.lock().unwrap() = (status, body.to_string());
    }

    fn record(&self, headers: &HeaderMap, body: Value) {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.authorizations.lock().unwrap().push(authorization);
        self.bodies.lock().unwrap().push(body);
    }
}

async fn oauth(State(fake): State<Arc<FakeDaraja>>, headers: HeaderMap) -> Response {
    fake.auth_hits.fetch_add(1, Ordering::SeqCst);

    let expected = format!("Basic {}", base64.encode("consumer-key:consumer-secret"));
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if presented != Some(expected.as_str()) {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }

    let (status, body) = fake.auth_response.lock().unwrap().clone();
    (
        StatusCode::from_u16(status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

async fn stk_push(
    State(fake): State<Arc<FakeDaraja>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    fake.record(&headers, body);

    let status = fake.push_status.load(Ordering::SeqCst);
    if status == 200 {
        Json(json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing"
        }))
        .into_response()
    } else {
        (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({
                "requestId": "11728-2929992-1",
                "errorCode": "400.002.02",
                "errorMessage": "Bad Request - Invalid PhoneNumber"
            })),
        )
            .into_response()
    }
}

async fn stk_query(
    State(fake): State<Arc<FakeDaraja>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    fake.record(&headers, body);
    Json(json!({
        "ResponseCode": "0",
        "ResultCode": "1032",
        "ResultDesc": "Request cancelled by user"
    }))
}

async fn register_urls(
    State(fake): State<Arc<FakeDaraja>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, &'static str) {
    fake.record(&headers, body);
    (StatusCode::SERVICE_UNAVAILABLE, "upstream connect error")
}

async fn start(fake: Arc<FakeDaraja>) -> String {
    let app = Router::new()
        .route("/oauth/v1/generate", get(oauth))
        .route("/mpesa/stkpush/v1/processrequest", post(stk_push))
        .route("/mpesa/stkpushquery/v1/query", post(stk_query))
        .route("/mpesa/c2b/v1/registerurl", post(register_urls))
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

fn client(base_url: &str, store: &InMemoryTokenStore) -> DarajaClient {
    let mut config = test_config();
    config.mpesa_base_url = Some(base_url.to_string());
    DarajaClient::new(&config, Arc::new(store.clone())).unwrap()
}

fn shortcode() -> Shortcode {
    Shortcode::from_config(&test_config())
}

fn push_request() -> StkPushRequest {
    StkPushRequest::new(
        &shortcode(),
        &LipaAttempt::at("20240101120000"),
        10,
        "254712345678",
        "https://pay.example.com/api/daraja/stkpush/123456/callback".to_string(),
        "123456",
        "Payment for 123456",
    )
}

#[tokio::test]
async fn test_token_is_cached_between_calls() {
    let fake = FakeDaraja::new();
    let base_url = start(fake.clone()).await;
    let store = InMemoryTokenStore::new();
    let client = client(&base_url, &store);

    client.initiate_payment(&push_request()).await.unwrap();
    client.initiate_payment(&push_request()).await.unwrap();

    assert_eq!(fake.auth_hits.load(Ordering::SeqCst), 1);
    let authorizations = fake.authorizations.lock().unwrap().clone();
    assert_eq!(authorizations, vec!["Bearer tok-1", "Bearer tok-1"]);

    let stored = store.get(ACCESS_TOKEN_CODE).await.unwrap().unwrap();
    assert_eq!(stored.token.as_deref(), Some("tok-1"));
    let expires_at = stored.expires_at.unwrap();
    assert!(expires_at > Utc::now() + Duration::seconds(3500));
}

#[tokio::test]
async fn test_valid_stored_token_skips_exchange() {
    let fake = FakeDaraja::new();
    let base_url = start(fake.clone()).await;
    let store = InMemoryTokenStore::new();
    store
        .save(ACCESS_TOKEN_CODE, "tok-stored", Utc::now() + Duration::minutes(30))
        .await
        .unwrap();

    let token = client(&base_url, &store).access_token().await.unwrap();

    assert_eq!(token, "tok-stored");
    assert_eq!(fake.auth_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_expired_token_is_refreshed() {
    let fake = FakeDaraja::new();
    let base_url = start(fake.clone()).await;
    let store = InMemoryTokenStore::new();
    store
        .save(ACCESS_TOKEN_CODE, "tok-stale", Utc::now() - Duration::minutes(1))
        .await
        .unwrap();

    let token = client(&base_url, &store).access_token().await.unwrap();

    assert_eq!(token, "tok-1");
    assert_eq!(fake.auth_hits.load(Ordering::SeqCst), 1);
    let stored = store.get(ACCESS_TOKEN_CODE).await.unwrap().unwrap();
    assert_eq!(stored.token.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_exchange() {
    let fake = FakeDaraja::new();
    let base_url = start(fake.clone()).await;
    let store = InMemoryTokenStore::new();
    let client = client(&base_url, &store);

    let (first, second) = tokio::join!(client.access_token(), client.access_token());

    assert_eq!(first.unwrap(), "tok-1");
    assert_eq!(second.unwrap(), "tok-1");
    assert_eq!(fake.auth_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_numeric_expiry_is_accepted() {
    let fake = FakeDaraja::new();
    fake.set_auth_response(200, r#"{"access_token":"tok-2","expires_in":3599}"#);
    let base_url = start(fake.clone()).await;

    let token = client(&base_url, &InMemoryTokenStore::new())
        .access_token()
        .await
        .unwrap();
    assert_eq!(token, "tok-2");
}

#[tokio::test]
async fn test_malformed_auth_response_is_an_auth_error() {
    let fake = FakeDaraja::new();
    fake.set_auth_response(200, r#"{"errorMessage":"Invalid grant type"}"#);
    let base_url = start(fake.clone()).await;
    let store = InMemoryTokenStore::new();

    let err = client(&base_url, &store).access_token().await.unwrap_err();

    assert!(matches!(err, AppError::Auth(_)));
    assert!(store.get(ACCESS_TOKEN_CODE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_positive_expiry_is_an_auth_error() {
    for body in [
        r#"{"access_token":"tok-3","expires_in":"0"}"#,
        r#"{"access_token":"tok-3","expires_in":-60}"#,
    ] {
        let fake = FakeDaraja::new();
        fake.set_auth_response(200, body);
        let base_url = start(fake.clone()).await;
        let store = InMemoryTokenStore::new();

        let err = client(&base_url, &store).access_token().await.unwrap_err();

        assert!(matches!(err, AppError::Auth(_)), "{}", body);
        assert!(store.get(ACCESS_TOKEN_CODE).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_out_of_range_expiry_is_an_auth_error() {
    let fake = FakeDaraja::new();
    fake.set_auth_response(200, r#"{"access_token":"tok-4","expires_in":"99999999999999999"}"#);
    let base_url = start(fake.clone()).await;
    let store = InMemoryTokenStore::new();

    let err = client(&base_url, &store).access_token().await.unwrap_err();

    assert!(matches!(err, AppError::Auth(_)));
    assert!(store.get(ACCESS_TOKEN_CODE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_auth_fails_gateway_call() {
    let fake = FakeDaraja::new();
    fake.set_auth_response(400, r#"{"errorMessage":"Invalid Credentials"}"#);
    let base_url = start(fake.clone()).await;

    let err = client(&base_url, &InMemoryTokenStore::new())
        .initiate_payment(&push_request())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Auth(_)));
    assert!(fake.bodies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_push_body_uses_gateway_field_names() {
    let fake = FakeDaraja::new();
    let base_url = start(fake.clone()).await;

    let response = client(&base_url, &InMemoryTokenStore::new())
        .initiate_payment(&push_request())
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(response.str_field("CheckoutRequestID"), Some("ws_CO_191220191020363925"));

    let body = fake.bodies.lock().unwrap()[0].clone();
    assert_eq!(body["BusinessShortCode"], "174379");
    assert_eq!(body["Password"], base64.encode("174379passkey20240101120000"));
    assert_eq!(body["Timestamp"], "20240101120000");
    assert_eq!(body["TransactionType"], "CustomerPayBillOnline");
    assert_eq!(body["Amount"], 10);
    assert_eq!(body["PartyA"], "254712345678");
    assert_eq!(body["PartyB"], "174379");
    assert_eq!(body["PhoneNumber"], "254712345678");
    assert_eq!(body["AccountReference"], "123456");
    assert_eq!(
        body["CallBackURL"],
        "https://pay.example.com/api/daraja/stkpush/123456/callback"
    );
}

#[tokio::test]
async fn test_non_200_push_is_returned_raw() {
    let fake = FakeDaraja::new();
    fake.push_status.store(400, Ordering::SeqCst);
    let base_url = start(fake.clone()).await;

    let response = client(&base_url, &InMemoryTokenStore::new())
        .initiate_payment(&push_request())
        .await
        .unwrap();

    assert_eq!(response.status, 400);
    assert!(!response.is_ok());
    assert_eq!(
        response.str_field("errorMessage"),
        Some("Bad Request - Invalid PhoneNumber")
    );
}

#[tokio::test]
async fn test_query_sends_checkout_id() {
    let fake = FakeDaraja::new();
    let base_url = start(fake.clone()).await;

    let request = StkQueryRequest::new(
        &shortcode(),
        &LipaAttempt::at("20240101120000"),
        "ws_CO_191220191020363925",
    );
    let response = client(&base_url, &InMemoryTokenStore::new())
        .query_status(&request)
        .await
        .unwrap();

    assert_eq!(response.str_field("ResultDesc"), Some("Request cancelled by user"));
    let body = fake.bodies.lock().unwrap()[0].clone();
    assert_eq!(body["CheckoutRequestID"], "ws_CO_191220191020363925");
    assert_eq!(body["Password"], base64.encode("174379passkey20240101120000"));
}

#[tokio::test]
async fn test_non_json_body_is_kept_as_text() {
    let fake = FakeDaraja::new();
    let base_url = start(fake.clone()).await;

    let request = RegisterUrlsRequest::new(
        "600996",
        "https://pay.example.com/api/daraja/c2b-confirmation-url".to_string(),
        "https://pay.example.com/api/daraja/c2b-validation-url".to_string(),
    );
    let response = client(&base_url, &InMemoryTokenStore::new())
        .register_callback_urls(&request)
        .await
        .unwrap();

    assert_eq!(response.status, 503);
    assert_eq!(response.body, Value::String("upstream connect error".to_string()));

    let body = fake.bodies.lock().unwrap()[0].clone();
    assert_eq!(body["ShortCode"], "600996");
    assert_eq!(body["ResponseType"], "Completed");
}

#[tokio::test]
async fn test_unreachable_gateway_is_reported() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let store = InMemoryTokenStore::new();
    store
        .save(ACCESS_TOKEN_CODE, "tok-stored", Utc::now() + Duration::minutes(30))
        .await
        .unwrap();

    let err = client(&base_url, &store)
        .initiate_payment(&push_request())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::GatewayUnavailable(_)));
}
