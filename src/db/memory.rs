//! Process-local stores used when no database is configured and in tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::blockchain::traits::{InscriptionRecord, InscriptionRecorder, Outpoint};
use crate::db::models::{ContextStatus, LockOutcome, TransactionContext, UtxoLock};
use crate::db::store::{ContextStore, LockStore};
use crate::error::{AppError, AppResult};

#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<Outpoint, UtxoLock>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_lock_all(
        &self,
        outpoints: &[Outpoint],
        owner_address: &str,
        attempt_id: &str,
    ) -> AppResult<LockOutcome> {
        let mut locks = self.locks.lock().await;

        if let Some(held) = outpoints
            .iter()
            .filter_map(|outpoint| locks.get(outpoint))
            .find(|lock| !lock.is_held_by(owner_address, attempt_id))
        {
            return Ok(LockOutcome::Conflict(held.clone()));
        }

        let now = Utc::now();
        for outpoint in outpoints {
            locks.insert(
                *outpoint,
                UtxoLock {
                    outpoint: *outpoint,
                    owner_address: owner_address.to_string(),
                    attempt_id: attempt_id.to_string(),
                    acquired_at: now,
                },
            );
        }
        Ok(LockOutcome::Acquired)
    }

    async fn release(&self, outpoints: &[Outpoint], attempt_id: &str) -> AppResult<u64> {
        let mut locks = self.locks.lock().await;
        let mut released = 0;
        for outpoint in outpoints {
            if locks
                .get(outpoint)
                .is_some_and(|lock| lock.attempt_id == attempt_id)
            {
                locks.remove(outpoint);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| lock.acquired_at >= cutoff);
        Ok((before - locks.len()) as u64)
    }

    async fn holders(&self, outpoints: &[Outpoint]) -> AppResult<Vec<UtxoLock>> {
        let locks = self.locks.lock().await;
        Ok(outpoints
            .iter()
            .filter_map(|outpoint| locks.get(outpoint).cloned())
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryContextStore {
    contexts: Mutex<HashMap<String, TransactionContext>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn insert(&self, context: &TransactionContext) -> AppResult<()> {
        let mut contexts = self.contexts.lock().await;
        if contexts.contains_key(&context.attempt_id) {
            return Err(AppError::InternalError(format!(
                "Context {} already exists",
                context.attempt_id
            )));
        }
        contexts.insert(context.attempt_id.clone(), context.clone());
        Ok(())
    }

    async fn get(&self, attempt_id: &str) -> AppResult<Option<TransactionContext>> {
        Ok(self.contexts.lock().await.get(attempt_id).cloned())
    }

    async fn transition(
        &self,
        expected: ContextStatus,
        context: &TransactionContext,
    ) -> AppResult<bool> {
        let mut contexts = self.contexts.lock().await;
        match contexts.get_mut(&context.attempt_id) {
            Some(stored) if stored.status == expected => {
                *stored = context.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct MemoryInscriptionRecorder {
    records: Mutex<Vec<InscriptionRecord>>,
}

impl MemoryInscriptionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<InscriptionRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl InscriptionRecorder for MemoryInscriptionRecorder {
    async fn record(&self, record: &InscriptionRecord) -> AppResult<()> {
        let mut records = self.records.lock().await;
        if !records.iter().any(|r| r.inscription_id == record.inscription_id) {
            records.push(record.clone());
        }
        Ok(())
    }
}
