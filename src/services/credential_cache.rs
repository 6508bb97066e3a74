// services/credential_cache.rs
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{Duration, Utc};
use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::{AppConfig, ACCESS_TOKEN_CODE};
use crate::database::TokenStore;
use crate::errors::{AppError, Result};
use crate::models::callback::value_as_i64;

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: Option<String>,
    /// Daraja sends seconds as a string ("3599"); numbers are accepted too.
    expires_in: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub code: String,
    pub auth_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
}

impl ProviderCredentials {
    pub fn from_config(config: &AppConfig) -> Self {
        ProviderCredentials {
            code: ACCESS_TOKEN_CODE.to_string(),
            auth_url: config.get_mpesa_urls().auth_url,
            consumer_key: config.mpesa_consumer_key.clone(),
            consumer_secret: config.mpesa_consumer_secret.clone(),
        }
    }
}

/// Stored bearer credential, refreshed from the auth endpoint only once
/// expired. Refreshes are serialized per provider code.
pub struct CredentialCache {
    client: Client,
    store: Arc<dyn TokenStore>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialCache {
    pub fn new(client: Client, store: Arc<dyn TokenStore>) -> Self {
        CredentialCache {
            client,
            store,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_token(&self, credentials: &ProviderCredentials) -> Result<String> {
        if let Some(token) = self.cached(&credentials.code).await? {
            return Ok(token);
        }

        let lock = self.refresh_lock(&credentials.code).await;
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = self.cached(&credentials.code).await? {
            return Ok(token);
        }

        info!(code = %credentials.code, "Requesting new access token");
        let (token, expires_in) = self.exchange(credentials).await?;
        let expires_at = Duration::try_seconds(expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| AppError::auth(format!("expires_in {} is out of range", expires_in)))?;
        self.store
            .save(&credentials.code, &token, expires_at)
            .await?;

        info!(code = %credentials.code, expires_in, "Access token obtained");
        Ok(token)
    }

    async fn cached(&self, code: &str) -> Result<Option<String>> {
        let row = self.store.get(code).await?;
        Ok(row.and_then(|row| row.valid_at(Utc::now()).map(str::to_string)))
    }

    async fn refresh_lock(&self, code: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks.entry(code.to_string()).or_default().clone()
    }

    async fn exchange(&self, credentials: &ProviderCredentials) -> Result<(String, i64)> {
        let encoded_auth = base64.encode(format!(
            "{}:{}",
            credentials.consumer_key, credentials.consumer_secret
        ));

        let response = self
            .client
            .get(&credentials.auth_url)
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await
            .map_err(|e| AppError::auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::auth(format!("token response unreadable: {}", e)))?;

        if !status.is_success() {
            error!("Failed to get access token: {} - {}", status, body);
            return Err(AppError::auth(format!("M-Pesa auth failed: {}", status)));
        }

        let parsed = serde_json::from_str::<AuthResponse>(&body).ok().and_then(|auth| {
            let token = auth.access_token.filter(|token| !token.is_empty())?;
            let expires_in = auth
                .expires_in
                .as_ref()
                .and_then(value_as_i64)
                .filter(|seconds| *seconds > 0)?;
            Some((token, expires_in))
        });

        parsed.ok_or_else(|| {
            error!("response --> {}", body);
            AppError::auth("access token response has no access_token or a non-positive expires_in")
        })
    }
}
