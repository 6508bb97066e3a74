// handlers/stkpush_handlers.rs
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use tracing::{error, info};
use validator::Validate;

use crate::dtos::payment_dtos::{GatewayAck, InitiateStkPushRequest, InitiateStkPushResponse};
use crate::errors::{AppError, Result};
use crate::services::daraja_client::LipaAttempt;
use crate::services::reconciler::{InitiationOutcome, NewPayment, StatusReport};
use crate::state::AppState;

const STK_SENT_MESSAGE: &str = "STK push sent. Enter your M-Pesa PIN to complete the payment";

pub async fn initiate_stk_push(
    State(state): State<AppState>,
    payload: std::result::Result<Json<InitiateStkPushRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(request) = payload.map_err(|e| AppError::invalid_data(e.body_text()))?;
    request.validate()?;

    let phone_number = state
        .reconciler
        .phone_validator()
        .validate(&request.phone_number)
        .ok_or_else(|| AppError::invalid_data("Kindly add a valid phone number"))?;

    let transaction = state
        .reconciler
        .create_transaction(NewPayment {
            amount: request.amount,
            phone_number,
            description: request.description,
        })
        .await?;

    let attempt = LipaAttempt::now();
    let outcome = state.reconciler.initiate(&transaction, &attempt).await?;

    let (transaction, message) = match outcome {
        InitiationOutcome::Accepted(transaction) => {
            // The waiter outlives this request; its handle is not awaited.
            state.reconciler.spawn_settlement(
                transaction.account_number.clone(),
                attempt,
                state.shutdown.child_token(),
            );
            (transaction, STK_SENT_MESSAGE.to_string())
        }
        InitiationOutcome::Deferred(transaction) => {
            let message = transaction.instruction_to_customer.clone();
            (transaction, message)
        }
    };

    let response = InitiateStkPushResponse {
        status: transaction.status.to_string(),
        message,
        query_status_url: state.config.stk_callback_url(&transaction.account_number),
        account_number: transaction.account_number,
        transaction_ref: transaction.transaction_ref,
    };

    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn stk_push_callback(
    State(state): State<AppState>,
    Path(account_number): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<GatewayAck>> {
    info!(%account_number, "Received M-Pesa callback: {}", payload);

    match state
        .reconciler
        .handle_stk_callback(&account_number, &payload)
        .await
    {
        Ok(_) => Ok(Json(GatewayAck::accepted())),
        Err(AppError::InvalidTransaction(reason)) => Ok(Json(GatewayAck::rejected(reason))),
        Err(e) => {
            error!(%account_number, "Failed to process callback: {}", e);
            Err(e)
        }
    }
}

pub async fn check_transaction_status(
    State(state): State<AppState>,
    Path(account_number): Path<String>,
) -> Result<Json<StatusReport>> {
    let report = state.reconciler.status_report(&account_number).await?;
    Ok(Json(report))
}
