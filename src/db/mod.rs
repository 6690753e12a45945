pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

use crate::config::DatabaseConfig;
use crate::error::AppResult;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

pub use store::{ContextStore, LockStore};

pub async fn create_pool(config: &DatabaseConfig) -> AppResult<MySqlPool> {
    use std::time::Duration;

    let url = config.url();
    tracing::info!("Connecting to database at {}:{}/{}", config.host, config.port, config.name);

    let pool = MySqlPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&url)
        .await
        .map_err(|e| crate::error::AppError::DatabaseError(format!("Failed to connect to database: {}", e)))?;

    tracing::info!("Database connection pool created successfully (max: {}, min: 2)", config.max_connections);
    Ok(pool)
}

pub async fn run_migrations(pool: &MySqlPool) -> AppResult<()> {
    // Create tables if they don't exist
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS utxo_locks (
            outpoint VARCHAR(80) PRIMARY KEY,
            owner_address VARCHAR(64) NOT NULL,
            attempt_id VARCHAR(64) NOT NULL,
            acquired_at TIMESTAMP(6) NOT NULL,
            INDEX idx_acquired_at (acquired_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inscription_contexts (
            attempt_id VARCHAR(64) PRIMARY KEY,
            kind VARCHAR(16) NOT NULL,
            status VARCHAR(16) NOT NULL,
            owner_address VARCHAR(64) NOT NULL,
            payload JSON NOT NULL,
            created_at TIMESTAMP(6) NOT NULL,
            updated_at TIMESTAMP(6) NOT NULL,
            INDEX idx_owner_status (owner_address, status)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inscriptions (
            inscription_id VARCHAR(80) PRIMARY KEY,
            commit_txid CHAR(64) NOT NULL,
            reveal_txid CHAR(64) NOT NULL,
            owner_address VARCHAR(64) NOT NULL,
            content_type VARCHAR(255) NOT NULL,
            content_length BIGINT UNSIGNED NOT NULL,
            ticker VARCHAR(32),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            INDEX idx_owner (owner_address)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed");
    Ok(())
}
