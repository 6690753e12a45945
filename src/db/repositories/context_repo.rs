use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::db::models::{ContextStatus, TransactionContext};
use crate::db::store::ContextStore;
use crate::error::AppResult;

/// Contexts are stored as a JSON payload next to the columns the state
/// machine compares on
pub struct ContextRepository {
    pool: MySqlPool,
}

impl ContextRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContextStore for ContextRepository {
    async fn insert(&self, context: &TransactionContext) -> AppResult<()> {
        let payload = serde_json::to_string(context)?;

        sqlx::query(
            r#"INSERT INTO inscription_contexts
            (attempt_id, kind, status, owner_address, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&context.attempt_id)
        .bind(context.kind)
        .bind(context.status)
        .bind(&context.owner_address)
        .bind(payload)
        .bind(context.created_at)
        .bind(context.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, attempt_id: &str) -> AppResult<Option<TransactionContext>> {
        let payload: Option<(String,)> = sqlx::query_as(
            "SELECT CAST(payload AS CHAR) FROM inscription_contexts WHERE attempt_id = ?",
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        payload
            .map(|(json,)| serde_json::from_str(&json).map_err(Into::into))
            .transpose()
    }

    async fn transition(
        &self,
        expected: ContextStatus,
        context: &TransactionContext,
    ) -> AppResult<bool> {
        let payload = serde_json::to_string(context)?;

        let result = sqlx::query(
            r#"UPDATE inscription_contexts
            SET status = ?, payload = ?, updated_at = ?
            WHERE attempt_id = ? AND status = ?"#,
        )
        .bind(context.status)
        .bind(payload)
        .bind(context.updated_at)
        .bind(&context.attempt_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
