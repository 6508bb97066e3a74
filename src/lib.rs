//! M-Pesa (Daraja) STK push and C2B reconciliation service.

pub mod config;
pub mod database;
pub mod dtos;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use routes::create_router;
pub use state::AppState;
