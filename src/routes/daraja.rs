use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::handlers::{c2b_handlers, stkpush_handlers};
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn daraja_routes(state: AppState) -> Router<AppState> {
    let auth = || from_fn_with_state(state.clone(), auth_middleware);

    Router::new()
        // Customer facing
        .route(
            "/initiate-stkpush",
            post(stkpush_handlers::initiate_stk_push).route_layer(auth()),
        )
        .route(
            "/c2b-register-urls",
            post(c2b_handlers::register_c2b_urls).route_layer(auth()),
        )
        // GET polls status (authenticated), POST is the gateway webhook
        .route(
            "/stkpush/:account_number/callback",
            get(stkpush_handlers::check_transaction_status)
                .route_layer(auth())
                .post(stkpush_handlers::stk_push_callback),
        )
        // Gateway webhooks
        .route("/c2b-validation-url", post(c2b_handlers::c2b_validation))
        .route("/c2b-confirmation-url", post(c2b_handlers::c2b_confirmation))
}
