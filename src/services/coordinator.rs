use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::blockchain::registry::ProviderChain;
use crate::blockchain::traits::{FundingInput, InscriptionIndex, Outpoint, UtxoSource};
use crate::db::models::LockOutcome;
use crate::db::store::LockStore;
use crate::error::{AppError, AppResult};

/// Selects funding inputs and owns the lock table
pub struct UtxoCoordinator {
    utxo_sources: ProviderChain<dyn UtxoSource>,
    inscription_index: ProviderChain<dyn InscriptionIndex>,
    locks: Arc<dyn LockStore>,
    lock_ttl: chrono::Duration,
}

impl UtxoCoordinator {
    pub fn new(
        utxo_sources: ProviderChain<dyn UtxoSource>,
        inscription_index: ProviderChain<dyn InscriptionIndex>,
        locks: Arc<dyn LockStore>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            utxo_sources,
            inscription_index,
            locks,
            lock_ttl: chrono::Duration::seconds(lock_ttl.as_secs() as i64),
        }
    }

    /// Inputs at `address` that pay to `script_pubkey`, are not locked and
    /// carry no inscription. An index failure excludes the output.
    pub async fn eligible_inputs(
        &self,
        address: &str,
        script_pubkey: &[u8],
    ) -> AppResult<Vec<FundingInput>> {
        let fetched = self
            .utxo_sources
            .call("fetch_spendable_inputs", |source| async move {
                source.fetch_spendable_inputs(address).await
            })
            .await
            .map_err(|failures| {
                tracing::error!("{}", failures.summary());
                AppError::BlockchainError(format!(
                    "No UTXO source reachable: {}",
                    failures.messages().join("; ")
                ))
            })?;

        let candidates: Vec<FundingInput> = fetched
            .into_iter()
            .filter(|input| {
                let matches = input.script_pubkey == script_pubkey;
                if !matches {
                    tracing::debug!("Skipping {}: not spendable by this key", input.outpoint);
                }
                matches
            })
            .collect();

        let outpoints: Vec<Outpoint> = candidates.iter().map(|input| input.outpoint).collect();
        let locked: HashSet<Outpoint> = self
            .locks
            .holders(&outpoints)
            .await?
            .into_iter()
            .map(|lock| lock.outpoint)
            .collect();

        let unlocked: Vec<FundingInput> = candidates
            .into_iter()
            .filter(|input| !locked.contains(&input.outpoint))
            .collect();

        let checks = join_all(unlocked.iter().map(|input| self.is_inscribed(&input.outpoint))).await;

        Ok(unlocked
            .into_iter()
            .zip(checks)
            .filter_map(|(input, inscribed)| (!inscribed).then_some(input))
            .collect())
    }

    /// Fail closed: an output whose status cannot be established counts as
    /// inscribed
    async fn is_inscribed(&self, outpoint: &Outpoint) -> bool {
        match self
            .inscription_index
            .call("is_output_inscribed", |index| async move {
                index.is_output_inscribed(outpoint).await
            })
            .await
        {
            Ok(inscribed) => {
                if inscribed {
                    tracing::debug!("Excluding inscribed output {}", outpoint);
                }
                inscribed
            }
            Err(failures) => {
                tracing::warn!(
                    "Excluding {}: inscription status unknown ({})",
                    outpoint,
                    failures.summary()
                );
                true
            }
        }
    }

    /// Select and lock inputs covering `required(input_count)` zatoshis
    pub async fn acquire(
        &self,
        owner_address: &str,
        attempt_id: &str,
        script_pubkey: &[u8],
        required: impl Fn(usize) -> u64,
    ) -> AppResult<Vec<FundingInput>> {
        let eligible = self.eligible_inputs(owner_address, script_pubkey).await?;
        let selected = select_inputs(eligible, &required)?;
        let outpoints: Vec<Outpoint> = selected.iter().map(|input| input.outpoint).collect();

        self.lock(&outpoints, owner_address, attempt_id).await?;

        tracing::info!(
            "Attempt {} locked {} input(s) worth {} zatoshis",
            attempt_id,
            selected.len(),
            selected.iter().map(|input| input.value).sum::<u64>()
        );
        Ok(selected)
    }

    /// Lock outpoints all-or-nothing for one attempt; re-locking by the same
    /// attempt refreshes, any other attempt conflicts
    pub async fn lock(
        &self,
        outpoints: &[Outpoint],
        owner_address: &str,
        attempt_id: &str,
    ) -> AppResult<()> {
        match self.locks.try_lock_all(outpoints, owner_address, attempt_id).await? {
            LockOutcome::Acquired => Ok(()),
            LockOutcome::Conflict(held) => {
                tracing::warn!(
                    "Attempt {} lost {} to attempt {}",
                    attempt_id,
                    held.outpoint,
                    held.attempt_id
                );
                Err(AppError::LockConflict(format!(
                    "{} is locked by another attempt since {}",
                    held.outpoint,
                    held.acquired_at.to_rfc3339()
                )))
            }
        }
    }

    pub async fn release(&self, outpoints: &[Outpoint], attempt_id: &str) -> AppResult<u64> {
        let released = self.locks.release(outpoints, attempt_id).await?;
        tracing::debug!("Released {} lock(s) of attempt {}", released, attempt_id);
        Ok(released)
    }

    /// Delete locks older than the TTL
    pub async fn sweep_stale(&self) -> AppResult<u64> {
        let cutoff = Utc::now() - self.lock_ttl;
        let swept = self.locks.sweep_stale(cutoff).await?;
        if swept > 0 {
            tracing::info!("Swept {} stale lock(s) acquired before {}", swept, cutoff.to_rfc3339());
        }
        Ok(swept)
    }

    /// Run the staleness sweep every `interval` until the runtime stops
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_stale().await {
                    tracing::error!("Lock sweep failed: {}", e);
                }
            }
        })
    }
}

/// Smallest single input that covers the requirement, otherwise the fewest
/// inputs taken largest first
fn select_inputs(
    mut eligible: Vec<FundingInput>,
    required: &impl Fn(usize) -> u64,
) -> AppResult<Vec<FundingInput>> {
    eligible.sort_by(|a, b| a.value.cmp(&b.value).then(a.outpoint.cmp(&b.outpoint)));

    let single_required = required(1);
    if let Some(pos) = eligible.iter().position(|input| input.value >= single_required) {
        return Ok(vec![eligible.swap_remove(pos)]);
    }

    let available: u64 = eligible.iter().map(|input| input.value).sum();
    let count = eligible.len();
    let mut selected = Vec::new();
    let mut total = 0u64;
    for input in eligible.into_iter().rev() {
        total += input.value;
        selected.push(input);
        if total >= required(selected.len()) {
            return Ok(selected);
        }
    }

    Err(AppError::InputUnavailable(format!(
        "required {} zatoshis, {} available across {} eligible input(s)",
        required(count.max(1)),
        available,
        count
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::traits::Txid;
    use crate::db::memory::MemoryLockStore;
    use crate::services::test_support::FakeChain;

    const SCRIPT: &[u8] = &[0x76, 0xa9];

    fn input(n: u8, value: u64) -> FundingInput {
        FundingInput {
            outpoint: Outpoint::new(Txid([n; 32]), 0),
            value,
            address: "t1owner".to_string(),
            script_pubkey: SCRIPT.to_vec(),
        }
    }

    fn coordinator(chain: &Arc<FakeChain>) -> UtxoCoordinator {
        UtxoCoordinator::new(
            ProviderChain::<dyn UtxoSource>::new(Duration::from_secs(1))
                .with(chain.clone() as Arc<dyn UtxoSource>),
            ProviderChain::<dyn InscriptionIndex>::new(Duration::from_secs(1))
                .with(chain.clone() as Arc<dyn InscriptionIndex>),
            Arc::new(MemoryLockStore::new()),
            Duration::from_secs(900),
        )
    }

    #[test]
    fn test_select_smallest_sufficient_single() {
        let picked = select_inputs(
            vec![input(1, 5_000), input(2, 90_000), input(3, 40_000)],
            &|_| 30_000,
        )
        .unwrap();
        assert_eq!(picked, vec![input(3, 40_000)]);
    }

    #[test]
    fn test_select_largest_first_set() {
        let picked = select_inputs(
            vec![input(1, 5_000), input(2, 20_000), input(3, 15_000)],
            &|n| 25_000 + n as u64 * 1_000,
        )
        .unwrap();
        assert_eq!(picked, vec![input(2, 20_000), input(3, 15_000)]);
    }

    #[test]
    fn test_select_reports_shortfall() {
        let err = select_inputs(vec![input(1, 5_000)], &|_| 70_000).unwrap_err();
        match err {
            AppError::InputUnavailable(msg) => {
                assert!(msg.contains("70000"));
                assert!(msg.contains("5000 available across 1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(select_inputs(vec![], &|_| 1).is_err());
    }

    #[tokio::test]
    async fn test_excludes_inscribed_and_unknown_outputs() {
        let chain = FakeChain::new(0xc8e7_1055);
        chain
            .fund("t1owner", vec![input(1, 50_000), input(2, 60_000), input(3, 70_000)])
            .await;
        chain.mark_inscribed(Outpoint::new(Txid([2; 32]), 0)).await;
        chain.fail_index_for(Outpoint::new(Txid([3; 32]), 0)).await;

        let eligible = coordinator(&chain)
            .eligible_inputs("t1owner", SCRIPT)
            .await
            .unwrap();
        assert_eq!(eligible, vec![input(1, 50_000)]);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_is_exclusive() {
        let chain = FakeChain::new(0xc8e7_1055);
        chain.fund("t1owner", vec![input(1, 100_000)]).await;
        chain.fund("t1other", vec![FundingInput { address: "t1other".into(), ..input(1, 100_000) }]).await;
        let coordinator = Arc::new(coordinator(&chain));

        let a = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.acquire("t1owner", "a", SCRIPT, |_| 10_000).await })
        };
        let b = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.acquire("t1other", "b", SCRIPT, |_| 10_000).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(AppError::LockConflict(_)) | Err(AppError::InputUnavailable(_))
        )));
    }

    #[tokio::test]
    async fn test_same_owner_attempts_cannot_share_input() {
        let chain = FakeChain::new(0xc8e7_1055);
        chain.fund("t1owner", vec![input(1, 100_000)]).await;
        let coordinator = coordinator(&chain);

        // both attempts select before either locks
        let first = select_inputs(
            coordinator.eligible_inputs("t1owner", SCRIPT).await.unwrap(),
            &|_| 10_000,
        )
        .unwrap();
        let second = select_inputs(
            coordinator.eligible_inputs("t1owner", SCRIPT).await.unwrap(),
            &|_| 10_000,
        )
        .unwrap();
        assert_eq!(first, second);
        let outpoints = [first[0].outpoint];

        coordinator.lock(&outpoints, "t1owner", "attempt-a").await.unwrap();
        let err = coordinator
            .lock(&outpoints, "t1owner", "attempt-b")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LockConflict(_)));

        // the loser cannot free the winner's lock
        assert_eq!(coordinator.release(&outpoints, "attempt-b").await.unwrap(), 0);
        assert!(coordinator.eligible_inputs("t1owner", SCRIPT).await.unwrap().is_empty());

        coordinator.lock(&outpoints, "t1owner", "attempt-a").await.unwrap();
        assert_eq!(coordinator.release(&outpoints, "attempt-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_locked_inputs_not_offered_and_swept() {
        let chain = FakeChain::new(0xc8e7_1055);
        chain.fund("t1owner", vec![input(1, 100_000)]).await;
        let coordinator = UtxoCoordinator {
            lock_ttl: chrono::Duration::zero(),
            ..coordinator(&chain)
        };

        coordinator.acquire("t1owner", "a", SCRIPT, |_| 10_000).await.unwrap();
        assert!(coordinator.eligible_inputs("t1owner", SCRIPT).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(coordinator.sweep_stale().await.unwrap(), 1);
        assert_eq!(coordinator.eligible_inputs("t1owner", SCRIPT).await.unwrap().len(), 1);
    }
}
