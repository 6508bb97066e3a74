// config.rs
use std::env;
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::routes::API_PREFIX;

pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
pub const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

/// Single cached-credential row per provider.
pub const ACCESS_TOKEN_CODE: &str = "DARAJA_ACCESS_TOKEN";

/// Bounded wait for the STK callback, in abstract time units.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Length of one time unit.
    pub wait_unit: Duration,
    pub initial_interval: u32,
    pub interval_step: u32,
    /// Total units after which the waiter gives up.
    pub wait_budget: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            wait_unit: Duration::from_secs(1),
            initial_interval: 2,
            interval_step: 2,
            wait_budget: 20,
        }
    }
}

impl SettlementConfig {
    pub fn budget(&self) -> Duration {
        self.wait_unit * self.wait_budget
    }
}

#[derive(Debug, Clone)]
pub struct DarajaUrls {
    pub auth_url: String,
    pub stk_push_url: String,
    pub stk_query_url: String,
    pub c2b_register_url: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mpesa_consumer_key: String,
    pub mpesa_consumer_secret: String,
    pub mpesa_short_code: String,
    pub mpesa_c2b_short_code: String,
    pub mpesa_passkey: String,
    pub mpesa_environment: String,
    /// Overrides the sandbox/production host, e.g. for a local stub.
    pub mpesa_base_url: Option<String>,
    /// Public base URL the gateway uses to reach this service.
    pub api_host: String,
    pub paybill_number: String,
    pub payment_method_name: String,
    pub jwt_secret: String,
    pub database_url: String,
    pub database_name: String,
    pub port: u16,
    pub host: String,
    pub settlement: SettlementConfig,
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| AppError::configuration(format!("{} must be set", key)))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match optional(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::configuration(format!("{} must be a number", key))),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mpesa_environment =
            optional("MPESA_ENVIRONMENT").unwrap_or_else(|| "sandbox".to_string());
        let mpesa_short_code = required("MPESA_SHORT_CODE")?;

        let defaults = SettlementConfig::default();
        let settlement = SettlementConfig {
            wait_unit: Duration::from_millis(parsed("SETTLEMENT_WAIT_UNIT_MS", 1000u64)?),
            wait_budget: parsed("SETTLEMENT_WAIT_BUDGET", defaults.wait_budget)?,
            ..defaults
        };

        let config = AppConfig {
            mpesa_consumer_key: required("MPESA_CONSUMER_KEY")?,
            mpesa_consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            mpesa_c2b_short_code: optional("MPESA_C2B_SHORT_CODE")
                .unwrap_or_else(|| mpesa_short_code.clone()),
            mpesa_short_code,
            mpesa_passkey: required("MPESA_PASSKEY")?,
            mpesa_environment,
            mpesa_base_url: optional("MPESA_BASE_URL"),
            api_host: required("API_HOST_NAME")?,
            paybill_number: required("PAYBILL_NUMBER")?,
            payment_method_name: optional("PAYMENT_METHOD_NAME")
                .unwrap_or_else(|| "M-Pesa".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            database_url: required("DATABASE_URL")?,
            database_name: optional("DATABASE_NAME").unwrap_or_else(|| "payments".to_string()),
            port: parsed("PORT", 3000u16)?,
            host: optional("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            settlement,
        };

        tracing::info!(
            environment = %config.mpesa_environment,
            short_code = %config.mpesa_short_code,
            base_url = %config.base_url(),
            "Loaded M-Pesa configuration"
        );

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.mpesa_environment == "production"
    }

    pub fn base_url(&self) -> String {
        match &self.mpesa_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.is_production() => PRODUCTION_BASE_URL.to_string(),
            None => SANDBOX_BASE_URL.to_string(),
        }
    }

    pub fn get_mpesa_urls(&self) -> DarajaUrls {
        let base_url = self.base_url();
        DarajaUrls {
            auth_url: format!("{}/oauth/v1/generate?grant_type=client_credentials", base_url),
            stk_push_url: format!("{}/mpesa/stkpush/v1/processrequest", base_url),
            stk_query_url: format!("{}/mpesa/stkpushquery/v1/query", base_url),
            c2b_register_url: format!("{}/mpesa/c2b/v1/registerurl", base_url),
        }
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}{}{}", self.api_host.trim_end_matches('/'), API_PREFIX, path)
    }

    pub fn stk_callback_url(&self, account_number: &str) -> String {
        self.public_url(&format!("/stkpush/{}/callback", account_number))
    }

    pub fn c2b_validation_url(&self) -> String {
        self.public_url("/c2b-validation-url")
    }

    pub fn c2b_confirmation_url(&self) -> String {
        self.public_url("/c2b-confirmation-url")
    }

    /// Instruction shown when the STK prompt could not be sent.
    pub fn manual_payment_instruction(&self, account_number: &str) -> String {
        format!(
            "Payment Initiated. Please pay via {} to paybill number {} account number {}",
            self.payment_method_name, self.paybill_number, account_number
        )
    }
}
