use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};
use tracing::{info, warn};

use super::mongo::{ACCESS_TOKENS, TRANSACTIONS, TRANSACTION_LOGS};
use crate::config::AppConfig;
use crate::errors::Result;

pub async fn get_db_client(config: &AppConfig) -> Result<Database> {
    let client = Client::with_uri_str(&config.database_url).await?;
    let db = client.database(&config.database_name);

    match db.run_command(doc! { "ping": 1 }).await {
        Ok(_) => info!("Connected to database: {}", config.database_name),
        Err(e) => warn!("Database '{}' is not reachable yet: {}", config.database_name, e),
    }

    ensure_indexes(&db).await?;
    Ok(db)
}

async fn ensure_indexes(db: &Database) -> Result<()> {
    let unique = || IndexOptions::builder().unique(true).build();

    db.collection::<mongodb::bson::Document>(TRANSACTIONS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "account_number": 1 })
                .options(unique())
                .build(),
        )
        .await?;

    db.collection::<mongodb::bson::Document>(TRANSACTIONS)
        .create_index(IndexModel::builder().keys(doc! { "transaction_ref": 1 }).build())
        .await?;

    db.collection::<mongodb::bson::Document>(ACCESS_TOKENS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "code": 1 })
                .options(unique())
                .build(),
        )
        .await?;

    db.collection::<mongodb::bson::Document>(TRANSACTION_LOGS)
        .create_index(IndexModel::builder().keys(doc! { "sequence": 1 }).build())
        .await?;

    info!("Database indexes ensured");
    Ok(())
}
