use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, MySqlPool};

use crate::blockchain::traits::Outpoint;
use crate::db::models::{LockOutcome, UtxoLock};
use crate::db::store::LockStore;
use crate::error::{AppError, AppResult};

#[derive(Debug, FromRow)]
struct LockRow {
    outpoint: String,
    owner_address: String,
    attempt_id: String,
    acquired_at: DateTime<Utc>,
}

impl TryFrom<LockRow> for UtxoLock {
    type Error = AppError;

    fn try_from(row: LockRow) -> AppResult<Self> {
        Ok(UtxoLock {
            outpoint: row.outpoint.parse()?,
            owner_address: row.owner_address,
            attempt_id: row.attempt_id,
            acquired_at: row.acquired_at,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// InnoDB reports gap-lock deadlocks between concurrent first-time inserts
/// with SQLSTATE 40001; the loser simply did not get the lock.
fn is_deadlock(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("40001"))
}

pub struct LockRepository {
    pool: MySqlPool,
}

impl LockRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn lock_in_transaction(
        &self,
        outpoints: &[Outpoint],
        owner_address: &str,
        attempt_id: &str,
    ) -> Result<LockOutcome, sqlx::Error> {
        let keys: Vec<String> = outpoints.iter().map(|o| o.to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT outpoint, owner_address, attempt_id, acquired_at FROM utxo_locks WHERE outpoint IN ({}) FOR UPDATE",
            placeholders(keys.len())
        );
        let mut query = sqlx::query_as::<_, LockRow>(&sql);
        for key in &keys {
            query = query.bind(key);
        }
        let held = query.fetch_all(&mut *tx).await?;

        if let Some(row) = held
            .into_iter()
            .find(|row| row.owner_address != owner_address || row.attempt_id != attempt_id)
        {
            tx.rollback().await?;
            let lock = UtxoLock::try_from(row)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            return Ok(LockOutcome::Conflict(lock));
        }

        let now = Utc::now();
        for key in &keys {
            sqlx::query(
                r#"INSERT INTO utxo_locks (outpoint, owner_address, attempt_id, acquired_at)
                VALUES (?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE acquired_at = VALUES(acquired_at)"#,
            )
            .bind(key)
            .bind(owner_address)
            .bind(attempt_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(LockOutcome::Acquired)
    }
}

#[async_trait]
impl LockStore for LockRepository {
    async fn try_lock_all(
        &self,
        outpoints: &[Outpoint],
        owner_address: &str,
        attempt_id: &str,
    ) -> AppResult<LockOutcome> {
        if outpoints.is_empty() {
            return Ok(LockOutcome::Acquired);
        }

        match self.lock_in_transaction(outpoints, owner_address, attempt_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_deadlock(&e) => {
                tracing::warn!("Lock attempt {} lost a deadlock race", attempt_id);
                Err(AppError::LockConflict(format!(
                    "inputs of attempt {} are being locked concurrently",
                    attempt_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, outpoints: &[Outpoint], attempt_id: &str) -> AppResult<u64> {
        if outpoints.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM utxo_locks WHERE attempt_id = ? AND outpoint IN ({})",
            placeholders(outpoints.len())
        );
        let mut query = sqlx::query(&sql).bind(attempt_id);
        for outpoint in outpoints {
            query = query.bind(outpoint.to_string());
        }
        let result = query.execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM utxo_locks WHERE acquired_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn holders(&self, outpoints: &[Outpoint]) -> AppResult<Vec<UtxoLock>> {
        if outpoints.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT outpoint, owner_address, attempt_id, acquired_at FROM utxo_locks WHERE outpoint IN ({})",
            placeholders(outpoints.len())
        );
        let mut query = sqlx::query_as::<_, LockRow>(&sql);
        for outpoint in outpoints {
            query = query.bind(outpoint.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(UtxoLock::try_from).collect()
    }
}
