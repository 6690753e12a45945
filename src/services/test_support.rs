//! In-memory collaborators for service tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::blockchain::registry::ProviderChain;
use crate::blockchain::traits::{
    Broadcaster, EpochSource, FundingInput, InscriptionIndex, NamedProvider, Outpoint, Txid,
    UtxoSource,
};
use crate::blockchain::zcash::epoch::EpochCache;
use crate::blockchain::zcash::transaction::txid_of;
use crate::db::memory::{MemoryContextStore, MemoryInscriptionRecorder, MemoryLockStore};
use crate::error::{AppError, AppResult};
use crate::services::coordinator::UtxoCoordinator;
use crate::services::inscription_service::{InscriptionService, ServiceSettings};

#[derive(Default)]
struct ChainState {
    utxos: HashMap<String, Vec<FundingInput>>,
    inscribed: HashSet<Outpoint>,
    index_down_for: HashSet<Outpoint>,
    reject_broadcasts: Option<String>,
    /// Accept this many broadcasts, then reject the rest
    reject_after: Option<(usize, String)>,
    broadcast_delay: Option<Duration>,
    broadcasts: Vec<Vec<u8>>,
}

/// UTXO set, inscription index, epoch source and broadcaster in one
pub struct FakeChain {
    epoch_id: u32,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(epoch_id: u32) -> Arc<Self> {
        Arc::new(Self {
            epoch_id,
            state: Mutex::new(ChainState::default()),
        })
    }

    pub async fn fund(&self, address: &str, inputs: Vec<FundingInput>) {
        self.state
            .lock()
            .await
            .utxos
            .entry(address.to_string())
            .or_default()
            .extend(inputs);
    }

    pub async fn mark_inscribed(&self, outpoint: Outpoint) {
        self.state.lock().await.inscribed.insert(outpoint);
    }

    pub async fn fail_index_for(&self, outpoint: Outpoint) {
        self.state.lock().await.index_down_for.insert(outpoint);
    }

    pub async fn reject_broadcasts(&self, reason: Option<&str>) {
        self.state.lock().await.reject_broadcasts = reason.map(str::to_string);
    }

    pub async fn reject_after(&self, accepted: usize, reason: &str) {
        self.state.lock().await.reject_after = Some((accepted, reason.to_string()));
    }

    /// Stall every broadcast, e.g. past the provider timeout
    pub async fn slow_broadcasts(&self, delay: Option<Duration>) {
        self.state.lock().await.broadcast_delay = delay;
    }

    pub async fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.broadcasts.clone()
    }
}

impl NamedProvider for FakeChain {
    fn name(&self) -> &str {
        "fake"
    }
}

#[async_trait]
impl UtxoSource for FakeChain {
    async fn fetch_spendable_inputs(&self, address: &str) -> AppResult<Vec<FundingInput>> {
        Ok(self
            .state
            .lock()
            .await
            .utxos
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl InscriptionIndex for FakeChain {
    async fn is_output_inscribed(&self, outpoint: &Outpoint) -> AppResult<bool> {
        let state = self.state.lock().await;
        if state.index_down_for.contains(outpoint) {
            return Err(AppError::BlockchainError("indexer unreachable".to_string()));
        }
        Ok(state.inscribed.contains(outpoint))
    }
}

#[async_trait]
impl EpochSource for FakeChain {
    async fn current_epoch_id(&self) -> AppResult<u32> {
        Ok(self.epoch_id)
    }
}

#[async_trait]
impl Broadcaster for FakeChain {
    async fn broadcast(&self, tx_bytes: &[u8]) -> AppResult<Txid> {
        let delay = self.state.lock().await.broadcast_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let rejection = match &state.reject_after {
            Some((accepted, reason)) if state.broadcasts.len() >= *accepted => Some(reason.clone()),
            _ => state.reject_broadcasts.clone(),
        };
        if let Some(reason) = rejection {
            return Err(AppError::BroadcastRejected(format!(
                "{} (via http://fake-node.internal:8232/)",
                reason
            )));
        }
        state.broadcasts.push(tx_bytes.to_vec());
        Ok(txid_of(tx_bytes))
    }
}

pub struct TestHarness {
    pub chain: Arc<FakeChain>,
    pub service: InscriptionService,
    pub recorder: Arc<MemoryInscriptionRecorder>,
    pub locks: Arc<MemoryLockStore>,
}

pub fn harness(settings: ServiceSettings) -> TestHarness {
    let chain = FakeChain::new(0xc8e7_1055);
    let timeout = Duration::from_secs(1);
    let locks = Arc::new(MemoryLockStore::new());
    let recorder = Arc::new(MemoryInscriptionRecorder::new());

    let coordinator = UtxoCoordinator::new(
        ProviderChain::<dyn UtxoSource>::new(timeout).with(chain.clone() as Arc<dyn UtxoSource>),
        ProviderChain::<dyn InscriptionIndex>::new(timeout)
            .with(chain.clone() as Arc<dyn InscriptionIndex>),
        locks.clone(),
        Duration::from_secs(900),
    );
    let epochs = EpochCache::new(
        ProviderChain::<dyn EpochSource>::new(timeout).with(chain.clone() as Arc<dyn EpochSource>),
        Duration::from_secs(60),
        None,
    );
    let broadcasters =
        ProviderChain::<dyn Broadcaster>::new(timeout).with(chain.clone() as Arc<dyn Broadcaster>);

    let service = InscriptionService::new(
        Arc::new(coordinator),
        Arc::new(MemoryContextStore::new()),
        Arc::new(epochs),
        broadcasters,
        recorder.clone(),
        settings,
    );

    TestHarness {
        chain,
        service,
        recorder,
        locks,
    }
}
