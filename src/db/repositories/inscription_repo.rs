use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::blockchain::traits::{InscriptionRecord, InscriptionRecorder};
use crate::error::AppResult;

pub struct InscriptionRepository {
    pool: MySqlPool,
}

impl InscriptionRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InscriptionRecorder for InscriptionRepository {
    async fn record(&self, record: &InscriptionRecord) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO inscriptions
            (inscription_id, commit_txid, reveal_txid, owner_address, content_type, content_length, ticker)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE inscription_id = inscription_id"#,
        )
        .bind(&record.inscription_id)
        .bind(record.commit_txid.to_string())
        .bind(record.reveal_txid.to_string())
        .bind(&record.owner_address)
        .bind(&record.content_type)
        .bind(record.content_length)
        .bind(&record.ticker)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            "Recorded inscription {} for {}",
            record.inscription_id,
            record.owner_address
        );
        Ok(())
    }
}
