// handlers/c2b_handlers.rs
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use tracing::{error, info, warn};

use super::extract::RawPayload;
use crate::dtos::payment_dtos::GatewayAck;
use crate::errors::Result;
use crate::state::AppState;

pub async fn register_c2b_urls(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let response = state.reconciler.register_c2b_urls().await?;
    info!(status = response.status, "C2B register URLs response: {}", response.body);

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(response.body)))
}

/// Always accepts; a transaction is opened for unseen references.
pub async fn c2b_validation(
    State(state): State<AppState>,
    RawPayload(payload): RawPayload,
) -> Json<GatewayAck> {
    info!("Received C2B validation: {}", payload);

    if let Err(e) = state.reconciler.validate_c2b(&payload).await {
        warn!("C2B validation could not open a transaction: {}", e);
    }

    Json(GatewayAck::accepted())
}

pub async fn c2b_confirmation(
    State(state): State<AppState>,
    RawPayload(payload): RawPayload,
) -> Result<Json<GatewayAck>> {
    info!("Received C2B confirmation: {}", payload);

    state.reconciler.confirm_c2b(&payload).await.map_err(|e| {
        error!("Failed to apply C2B confirmation: {}", e);
        e
    })?;

    Ok(Json(GatewayAck::accepted()))
}
