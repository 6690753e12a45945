use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::blockchain::traits::Outpoint;
use crate::db::models::{ContextStatus, LockOutcome, TransactionContext, UtxoLock};
use crate::error::AppResult;

/// Lock table keyed by outpoint
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Lock every outpoint for the attempt, or none of them if any is held
    /// by another attempt, including another attempt of the same owner.
    /// Re-locking by the holding attempt refreshes `acquired_at`.
    async fn try_lock_all(
        &self,
        outpoints: &[Outpoint],
        owner_address: &str,
        attempt_id: &str,
    ) -> AppResult<LockOutcome>;

    /// Delete the attempt's locks on these outpoints; returns how many existed
    async fn release(&self, outpoints: &[Outpoint], attempt_id: &str) -> AppResult<u64>;

    /// Delete every lock acquired before `cutoff`
    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Current locks among these outpoints
    async fn holders(&self, outpoints: &[Outpoint]) -> AppResult<Vec<UtxoLock>>;
}

/// Transaction contexts keyed by attempt id
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn insert(&self, context: &TransactionContext) -> AppResult<()>;

    async fn get(&self, attempt_id: &str) -> AppResult<Option<TransactionContext>>;

    /// Replace the stored context only while its status is still
    /// `expected`. Returns false when another writer got there first.
    async fn transition(
        &self,
        expected: ContextStatus,
        context: &TransactionContext,
    ) -> AppResult<bool>;
}
