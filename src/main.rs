use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use daraja_payments::config::AppConfig;
use daraja_payments::database::{
    connection::get_db_client, MongoAuditLog, MongoTokenStore, MongoTransactionStore,
};
use daraja_payments::services::daraja_client::DarajaClient;
use daraja_payments::services::reconciler::Reconciler;
use daraja_payments::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(AppConfig::from_env().context("Failed to load configuration")?);
    let db = get_db_client(&config)
        .await
        .context("Failed to connect to MongoDB")?;

    let gateway = DarajaClient::new(&config, Arc::new(MongoTokenStore::new(&db)))?;
    match gateway.access_token().await {
        Ok(_) => tracing::info!("M-Pesa access token obtained"),
        Err(e) => tracing::warn!("M-Pesa credentials not verified at startup: {}", e),
    }

    let reconciler = Reconciler::new(
        config.clone(),
        Arc::new(MongoTransactionStore::new(&db)),
        Arc::new(gateway),
        Arc::new(MongoAuditLog::new(&db)),
    );

    let shutdown = CancellationToken::new();
    let state = AppState::new(config.clone(), Arc::new(reconciler)).with_shutdown(shutdown.clone());
    let app = create_router(state);

    let host: std::net::IpAddr = config.host.parse().context("HOST must be an IP address")?;
    let addr = SocketAddr::from((host, config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("Server starting on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down, cancelling settlement waits");
    shutdown.cancel();
}
