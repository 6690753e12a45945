use chrono::Utc;
use secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::blockchain::registry::ProviderChain;
use crate::blockchain::traits::{
    hex_bytes, Broadcaster, FundingInput, InscriptionRecord, InscriptionRecorder, Outpoint, Txid,
};
use crate::blockchain::zcash::epoch::EpochCache;
use crate::blockchain::zcash::fee::FeePolicy;
use crate::blockchain::zcash::script::{
    build_redeem_script, max_reveal_script_sig_len, p2pkh_script_sig, p2sh_script_pubkey,
    reveal_script_sig, Envelope,
};
use crate::blockchain::zcash::sighash::{
    encode_signature, parse_signature, signature_hash, signature_hashes, verify_signature,
};
use crate::blockchain::zcash::transaction::{
    serialize_transaction, txid_of, SkeletonInput, TransactionSkeleton, TxKind, TxOutput,
    MAX_SCRIPT_SIZE, SEQUENCE_FINAL,
};
use crate::config::InscriptionConfig;
use crate::crypto::zcash::{parse_public_key, LocalSigner, TransparentAddress};
use crate::db::models::{
    new_attempt_id, ContextKind, ContextStatus, InscriptionPlan, TransactionContext,
};
use crate::db::store::ContextStore;
use crate::error::{AppError, AppResult};
use crate::services::coordinator::UtxoCoordinator;

const MAX_SPLIT_OUTPUTS: usize = 100;
const MAX_TICKER_LEN: usize = 32;

/// Fixed fee paid to the platform on every commit and split
#[derive(Debug, Clone)]
pub struct PlatformFee {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub policy: FeePolicy,
    pub default_inscription_value: u64,
    pub platform_fee: Option<PlatformFee>,
    pub max_body_size: usize,
}

impl ServiceSettings {
    pub fn from_config(config: &InscriptionConfig) -> AppResult<Self> {
        let platform_fee = match (&config.platform_fee_address, config.platform_fee) {
            (Some(address), value) if value > 0 => Some(PlatformFee {
                value,
                script_pubkey: TransparentAddress::parse(address)?.script_pubkey(),
            }),
            _ => None,
        };

        Ok(Self {
            policy: FeePolicy::from_config(config),
            default_inscription_value: config.default_inscription_value,
            platform_fee,
            max_body_size: config.max_body_size,
        })
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            policy: FeePolicy::default(),
            default_inscription_value: 60_000,
            platform_fee: None,
            max_body_size: 9_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InscriptionRequest {
    /// Compressed secp256k1 public key (hex) of the funding address
    pub public_key: String,
    pub content_type: String,
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    pub ticker: Option<String>,
    pub inscription_value: Option<u64>,
    /// Receiver of the inscribed output; the owner when absent
    pub destination_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitRequest {
    pub public_key: String,
    pub split_count: usize,
    pub split_value: u64,
}

/// What a caller sees of an attempt, including the digests it must sign next
#[derive(Debug, Clone, Serialize)]
pub struct AttemptView {
    pub attempt_id: String,
    pub kind: ContextKind,
    pub status: ContextStatus,
    pub owner_address: String,
    pub inputs: Vec<Outpoint>,
    pub sighashes: Vec<String>,
    pub funding_fee: u64,
    pub platform_fee: u64,
    pub inscription_value: Option<u64>,
    pub reveal_fee: Option<u64>,
    pub commit_address: Option<String>,
    pub funding_txid: Option<Txid>,
    pub reveal_txid: Option<Txid>,
    pub inscription_id: Option<String>,
    pub error: Option<String>,
}

impl AttemptView {
    fn from_context(context: &TransactionContext) -> AppResult<Self> {
        let sighashes = match context.status {
            ContextStatus::Prepared => signature_hashes(&context.funding_tx)?,
            ContextStatus::Broadcast => match &context.reveal_tx {
                Some(reveal_tx) => vec![signature_hash(reveal_tx, 0)?],
                None => Vec::new(),
            },
            ContextStatus::Completed | ContextStatus::Failed => Vec::new(),
        };

        let plan = context.inscription.as_ref();
        Ok(Self {
            attempt_id: context.attempt_id.clone(),
            kind: context.kind,
            status: context.status,
            owner_address: context.owner_address.clone(),
            inputs: context.outpoints(),
            sighashes: sighashes.iter().map(hex::encode).collect(),
            funding_fee: context.funding_tx.fee(),
            platform_fee: context.platform_fee,
            inscription_value: plan.map(|p| p.inscription_value),
            reveal_fee: plan.map(|p| p.reveal_fee),
            commit_address: plan
                .map(|p| TransparentAddress::from_redeem_script(&p.redeem_script).to_string()),
            funding_txid: context.funding_txid,
            reveal_txid: context.reveal_txid,
            inscription_id: context.inscription_id.clone(),
            error: context.error.clone(),
        })
    }
}

/// Marks an attempt as being worked on until dropped
struct InFlight<'a> {
    attempts: &'a Mutex<HashSet<String>>,
    attempt_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.attempt_id);
    }
}

/// Commit/reveal and split state machine
///
/// `prepared -> broadcast -> completed` for inscriptions,
/// `prepared -> completed` for splits, and `failed` from any live state.
/// Every transition is a compare-and-set on the stored status.
pub struct InscriptionService {
    coordinator: Arc<UtxoCoordinator>,
    contexts: Arc<dyn ContextStore>,
    epochs: Arc<EpochCache>,
    broadcasters: ProviderChain<dyn Broadcaster>,
    recorder: Arc<dyn InscriptionRecorder>,
    settings: ServiceSettings,
    secp: Secp256k1<VerifyOnly>,
    in_flight: Mutex<HashSet<String>>,
}

impl InscriptionService {
    pub fn new(
        coordinator: Arc<UtxoCoordinator>,
        contexts: Arc<dyn ContextStore>,
        epochs: Arc<EpochCache>,
        broadcasters: ProviderChain<dyn Broadcaster>,
        recorder: Arc<dyn InscriptionRecorder>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            coordinator,
            contexts,
            epochs,
            broadcasters,
            recorder,
            settings,
            secp: Secp256k1::verification_only(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Select and lock funding, build the commit transaction and return
    /// its digests
    pub async fn prepare_inscription(&self, request: InscriptionRequest) -> AppResult<AttemptView> {
        let public_key = parse_public_key(&request.public_key)?;
        let pubkey_bytes = public_key.serialize();
        let owner = TransparentAddress::from_public_key(&public_key);
        let owner_address = owner.to_string();
        let owner_script = owner.script_pubkey();

        if request.content_type.trim().is_empty() {
            return Err(AppError::ValidationError("Content type is required".to_string()));
        }
        if request.body.len() > self.settings.max_body_size {
            return Err(AppError::ValidationError(format!(
                "Body of {} bytes exceeds the {} byte limit",
                request.body.len(),
                self.settings.max_body_size
            )));
        }
        if let Some(ticker) = &request.ticker {
            if ticker.is_empty() || ticker.len() > MAX_TICKER_LEN {
                return Err(AppError::ValidationError(format!(
                    "Ticker must be 1 to {} bytes",
                    MAX_TICKER_LEN
                )));
            }
        }
        let destination = match &request.destination_address {
            Some(address) => TransparentAddress::parse(address)?,
            None => owner,
        };

        let envelope = Envelope::new(request.content_type.clone(), request.body.clone());
        let redeem_script = build_redeem_script(&pubkey_bytes, &envelope)?;
        // the reveal must be buildable before any funds are committed
        let reveal_len = max_reveal_script_sig_len(&envelope, &redeem_script)?;
        if reveal_len > MAX_SCRIPT_SIZE {
            return Err(AppError::ValidationError(format!(
                "Reveal script of {} bytes would exceed the {} byte limit",
                reveal_len, MAX_SCRIPT_SIZE
            )));
        }

        let policy = self.settings.policy;
        let reveal_fee = policy.min_fee(1, 1);
        let inscription_value = policy.adjust_inscription_value(
            request
                .inscription_value
                .unwrap_or(self.settings.default_inscription_value),
            reveal_fee,
        );

        let epoch_id = self.epochs.current().await?;
        let attempt_id = new_attempt_id();
        let primary = vec![TxOutput {
            value: inscription_value,
            script_pubkey: p2sh_script_pubkey(&redeem_script),
        }];
        let platform_output = self.platform_output();

        let inputs = self
            .coordinator
            .acquire(&owner_address, &attempt_id, &owner_script, |count| {
                policy.required_funding(count, &primary, platform_output.as_ref())
            })
            .await?;

        let funding_tx = match self.build_funding_tx(
            TxKind::Commit,
            epoch_id,
            &inputs,
            primary,
            platform_output,
            owner_script,
        ) {
            Ok(tx) => tx,
            Err(e) => {
                self.release_inputs(&inputs, &attempt_id).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let context = TransactionContext {
            attempt_id,
            kind: ContextKind::Inscription,
            status: ContextStatus::Prepared,
            owner_address,
            public_key: hex::encode(pubkey_bytes),
            funding_inputs: inputs,
            inscription: Some(InscriptionPlan {
                content_type: request.content_type,
                body: request.body,
                ticker: request.ticker,
                redeem_script,
                inscription_value,
                reveal_fee,
                destination_address: destination.to_string(),
            }),
            platform_fee: self.platform_fee_value(),
            funding_tx,
            funding_txid: None,
            reveal_tx: None,
            reveal_txid: None,
            inscription_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.insert_context(&context).await?;

        tracing::info!(
            "Prepared inscription {} for {}: {} byte body, value {}, commit fee {}",
            context.attempt_id,
            context.owner_address,
            envelope.body().len(),
            inscription_value,
            context.funding_tx.fee()
        );
        AttemptView::from_context(&context)
    }

    /// Assemble and broadcast the commit, then hand back the reveal digest
    pub async fn submit_commit_signatures(
        &self,
        attempt_id: &str,
        signatures: &[String],
    ) -> AppResult<AttemptView> {
        let _in_flight = self.begin(attempt_id)?;
        let context = self.load(attempt_id).await?;
        expect_kind(&context, ContextKind::Inscription)?;
        expect_status(&context, ContextStatus::Prepared)?;

        let script_sigs = self.funding_script_sigs(&context, signatures)?;

        let (commit_txid, reveal_tx) = match self.broadcast_commit(&context, &script_sigs).await {
            Ok(result) => result,
            Err(e) => {
                self.fail(context, ContextStatus::Prepared, e.message().to_string()).await;
                return Err(e);
            }
        };

        let mut next = context;
        next.status = ContextStatus::Broadcast;
        next.funding_txid = Some(commit_txid);
        next.reveal_tx = Some(reveal_tx);
        next.touch();
        self.transition(ContextStatus::Prepared, &next).await?;

        tracing::info!("Attempt {} committed in {}", attempt_id, commit_txid);
        AttemptView::from_context(&next)
    }

    /// Assemble and broadcast the reveal, record the inscription and
    /// complete the attempt
    pub async fn submit_reveal_signature(
        &self,
        attempt_id: &str,
        signature: &str,
    ) -> AppResult<AttemptView> {
        let _in_flight = self.begin(attempt_id)?;
        let context = self.load(attempt_id).await?;
        expect_kind(&context, ContextKind::Inscription)?;
        expect_status(&context, ContextStatus::Broadcast)?;

        let (plan, reveal_tx, commit_txid) =
            match (&context.inscription, &context.reveal_tx, context.funding_txid) {
                (Some(plan), Some(reveal_tx), Some(txid)) => (plan, reveal_tx, txid),
                _ => {
                    return Err(AppError::InternalError(format!(
                        "Attempt {} is broadcast without a reveal transaction",
                        attempt_id
                    )))
                }
            };

        let public_key = parse_public_key(&context.public_key)?;
        let digest = signature_hash(reveal_tx, 0)?;
        let signature = self.checked_signature(signature, &digest, &public_key)?;

        let reveal_txid = match self
            .broadcast_reveal(plan, reveal_tx, &public_key, &signature)
            .await
        {
            Ok(txid) => txid,
            Err(e) => {
                self.fail(context, ContextStatus::Broadcast, e.message().to_string()).await;
                return Err(e);
            }
        };

        let inscription_id = format!("{}i0", reveal_txid);
        let record = InscriptionRecord {
            inscription_id: inscription_id.clone(),
            commit_txid,
            reveal_txid,
            owner_address: context.owner_address.clone(),
            content_type: plan.content_type.clone(),
            content_length: plan.body.len() as u64,
            ticker: plan.ticker.clone(),
        };
        if let Err(e) = self.recorder.record(&record).await {
            tracing::error!("Failed to record inscription {}: {}", inscription_id, e);
        }

        let mut next = context;
        next.status = ContextStatus::Completed;
        next.reveal_txid = Some(reveal_txid);
        next.inscription_id = Some(inscription_id);
        next.touch();
        self.transition(ContextStatus::Broadcast, &next).await?;
        self.release_locks(&next).await;

        tracing::info!(
            "Attempt {} completed: inscription {}",
            attempt_id,
            next.inscription_id.as_deref().unwrap_or_default()
        );
        AttemptView::from_context(&next)
    }

    /// Lock funding and build a transaction splitting it into equal outputs
    pub async fn prepare_split(&self, request: SplitRequest) -> AppResult<AttemptView> {
        let public_key = parse_public_key(&request.public_key)?;
        let owner = TransparentAddress::from_public_key(&public_key);
        let owner_address = owner.to_string();
        let owner_script = owner.script_pubkey();
        let policy = self.settings.policy;

        if request.split_count == 0 || request.split_count > MAX_SPLIT_OUTPUTS {
            return Err(AppError::ValidationError(format!(
                "Split count must be 1 to {}",
                MAX_SPLIT_OUTPUTS
            )));
        }
        if policy.is_dust(request.split_value) {
            return Err(AppError::ValidationError(format!(
                "Split value {} is at or below the dust limit {}",
                request.split_value, policy.dust_limit
            )));
        }

        let epoch_id = self.epochs.current().await?;
        let attempt_id = new_attempt_id();
        let primary: Vec<TxOutput> = (0..request.split_count)
            .map(|_| TxOutput {
                value: request.split_value,
                script_pubkey: owner_script.clone(),
            })
            .collect();
        let platform_output = self.platform_output();

        let inputs = self
            .coordinator
            .acquire(&owner_address, &attempt_id, &owner_script, |count| {
                policy.required_funding(count, &primary, platform_output.as_ref())
            })
            .await?;

        let funding_tx = match self.build_funding_tx(
            TxKind::Split,
            epoch_id,
            &inputs,
            primary,
            platform_output,
            owner_script,
        ) {
            Ok(tx) => tx,
            Err(e) => {
                self.release_inputs(&inputs, &attempt_id).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let context = TransactionContext {
            attempt_id,
            kind: ContextKind::Split,
            status: ContextStatus::Prepared,
            owner_address,
            public_key: hex::encode(public_key.serialize()),
            funding_inputs: inputs,
            inscription: None,
            platform_fee: self.platform_fee_value(),
            funding_tx,
            funding_txid: None,
            reveal_tx: None,
            reveal_txid: None,
            inscription_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.insert_context(&context).await?;

        tracing::info!(
            "Prepared split {} for {}: {} x {}",
            context.attempt_id,
            context.owner_address,
            request.split_count,
            request.split_value
        );
        AttemptView::from_context(&context)
    }

    pub async fn submit_split_signatures(
        &self,
        attempt_id: &str,
        signatures: &[String],
    ) -> AppResult<AttemptView> {
        let _in_flight = self.begin(attempt_id)?;
        let context = self.load(attempt_id).await?;
        expect_kind(&context, ContextKind::Split)?;
        expect_status(&context, ContextStatus::Prepared)?;

        let script_sigs = self.funding_script_sigs(&context, signatures)?;

        let split_txid = match self.broadcast_funding(&context, &script_sigs).await {
            Ok(txid) => txid,
            Err(e) => {
                self.fail(context, ContextStatus::Prepared, e.message().to_string()).await;
                return Err(e);
            }
        };

        let mut next = context;
        next.status = ContextStatus::Completed;
        next.funding_txid = Some(split_txid);
        next.touch();
        self.transition(ContextStatus::Prepared, &next).await?;
        self.release_locks(&next).await;

        tracing::info!("Split {} completed in {}", attempt_id, split_txid);
        AttemptView::from_context(&next)
    }

    /// Abandon a live attempt and free its inputs
    pub async fn mark_failed(&self, attempt_id: &str, reason: Option<String>) -> AppResult<AttemptView> {
        let _in_flight = self.begin(attempt_id)?;
        let context = self.load(attempt_id).await?;
        if context.status.is_terminal() {
            return Err(AppError::InvalidContextState(format!(
                "Attempt {} is already {}",
                attempt_id, context.status
            )));
        }

        let expected = context.status;
        let failed = self
            .fail(
                context,
                expected,
                reason.unwrap_or_else(|| "cancelled by caller".to_string()),
            )
            .await;
        AttemptView::from_context(&failed)
    }

    pub async fn get_context(&self, attempt_id: &str) -> AppResult<AttemptView> {
        AttemptView::from_context(&self.load(attempt_id).await?)
    }

    /// Run the whole commit/reveal flow with a server-held key
    pub async fn inscribe_with_key(
        &self,
        signer: &LocalSigner,
        content_type: &str,
        body: Vec<u8>,
        ticker: Option<String>,
    ) -> AppResult<AttemptView> {
        let prepared = self
            .prepare_inscription(InscriptionRequest {
                public_key: signer.public_key_hex(),
                content_type: content_type.to_string(),
                body,
                ticker,
                inscription_value: None,
                destination_address: None,
            })
            .await?;
        let attempt_id = prepared.attempt_id;

        let commit_signatures = sign_all(signer, &prepared.sighashes)?;
        let committed = match self.submit_commit_signatures(&attempt_id, &commit_signatures).await {
            Ok(view) => view,
            Err(e) => {
                // free the inputs if the attempt is still live
                if let Err(mark_err) = self.mark_failed(&attempt_id, Some(e.message().to_string())).await {
                    tracing::debug!("Attempt {} not marked failed: {}", attempt_id, mark_err);
                }
                return Err(e);
            }
        };

        let reveal_signature = sign_all(signer, &committed.sighashes)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::InternalError("No reveal digest to sign".to_string()))?;
        self.submit_reveal_signature(&attempt_id, &reveal_signature).await
    }

    fn begin(&self, attempt_id: &str) -> AppResult<InFlight<'_>> {
        let mut attempts = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !attempts.insert(attempt_id.to_string()) {
            return Err(AppError::InvalidContextState(format!(
                "Attempt {} is already being processed",
                attempt_id
            )));
        }
        Ok(InFlight {
            attempts: &self.in_flight,
            attempt_id: attempt_id.to_string(),
        })
    }

    async fn load(&self, attempt_id: &str) -> AppResult<TransactionContext> {
        self.contexts
            .get(attempt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Attempt {} not found", attempt_id)))
    }

    async fn insert_context(&self, context: &TransactionContext) -> AppResult<()> {
        if let Err(e) = self.contexts.insert(context).await {
            self.release_locks(context).await;
            return Err(e);
        }
        Ok(())
    }

    async fn transition(&self, expected: ContextStatus, context: &TransactionContext) -> AppResult<()> {
        if !self.contexts.transition(expected, context).await? {
            return Err(AppError::InvalidContextState(format!(
                "Attempt {} left {} before it could move to {}",
                context.attempt_id, expected, context.status
            )));
        }
        Ok(())
    }

    /// Move to `failed` and free the inputs. Neither step may mask the
    /// error that caused the failure.
    async fn fail(
        &self,
        mut context: TransactionContext,
        expected: ContextStatus,
        reason: String,
    ) -> TransactionContext {
        tracing::warn!("Attempt {} failed while {}: {}", context.attempt_id, expected, reason);
        context.status = ContextStatus::Failed;
        context.error = Some(reason);
        context.touch();

        match self.contexts.transition(expected, &context).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "Attempt {} changed state before it could be marked failed",
                context.attempt_id
            ),
            Err(e) => tracing::error!(
                "Failed to persist failure of attempt {}: {}",
                context.attempt_id,
                e
            ),
        }
        self.release_locks(&context).await;
        context
    }

    async fn release_locks(&self, context: &TransactionContext) {
        self.release_inputs(&context.funding_inputs, &context.attempt_id)
            .await;
    }

    async fn release_inputs(&self, inputs: &[FundingInput], attempt_id: &str) {
        let outpoints: Vec<Outpoint> = inputs.iter().map(|input| input.outpoint).collect();
        if let Err(e) = self.coordinator.release(&outpoints, attempt_id).await {
            tracing::error!("Failed to release locks of attempt {}: {}", attempt_id, e);
        }
    }

    fn platform_output(&self) -> Option<TxOutput> {
        self.settings.platform_fee.as_ref().map(|fee| TxOutput {
            value: fee.value,
            script_pubkey: fee.script_pubkey.clone(),
        })
    }

    fn platform_fee_value(&self) -> u64 {
        self.settings.platform_fee.as_ref().map(|fee| fee.value).unwrap_or(0)
    }

    fn build_funding_tx(
        &self,
        kind: TxKind,
        epoch_id: u32,
        inputs: &[FundingInput],
        primary: Vec<TxOutput>,
        platform_output: Option<TxOutput>,
        change_script: Vec<u8>,
    ) -> AppResult<TransactionSkeleton> {
        let funding_total: u64 = inputs.iter().map(|input| input.value).sum();
        let plan = self.settings.policy.plan_outputs(
            funding_total,
            inputs.len(),
            primary,
            platform_output,
            change_script,
        )?;

        let skeleton_inputs = inputs
            .iter()
            .map(|input| SkeletonInput {
                outpoint: input.outpoint,
                sequence: SEQUENCE_FINAL,
                value: input.value,
                script_code: input.script_pubkey.clone(),
            })
            .collect();

        TransactionSkeleton::new(kind, epoch_id, 0, skeleton_inputs, plan.outputs)
    }

    /// Verify one signature per funding input and wrap them as P2PKH
    /// scriptSigs. A bad signature leaves the attempt untouched.
    fn funding_script_sigs(
        &self,
        context: &TransactionContext,
        signatures: &[String],
    ) -> AppResult<Vec<Vec<u8>>> {
        if signatures.len() != context.funding_inputs.len() {
            return Err(AppError::ValidationError(format!(
                "Expected {} signature(s), got {}",
                context.funding_inputs.len(),
                signatures.len()
            )));
        }

        let public_key = parse_public_key(&context.public_key)?;
        let pubkey_bytes = public_key.serialize();
        let digests = signature_hashes(&context.funding_tx)?;

        digests
            .iter()
            .zip(signatures)
            .enumerate()
            .map(|(index, (digest, signature))| -> AppResult<Vec<u8>> {
                let signature = self
                    .checked_signature(signature, digest, &public_key)
                    .map_err(|e| {
                        AppError::ValidationError(format!("Input {}: {}", index, e.message()))
                    })?;
                Ok(p2pkh_script_sig(&signature, &pubkey_bytes)?)
            })
            .collect()
    }

    fn checked_signature(
        &self,
        signature_hex: &str,
        digest: &[u8; 32],
        public_key: &PublicKey,
    ) -> AppResult<Vec<u8>> {
        let raw = hex::decode(signature_hex.trim())
            .map_err(|e| AppError::ValidationError(format!("Invalid signature hex: {}", e)))?;
        let signature = parse_signature(&raw)?;
        verify_signature(&self.secp, digest, &signature, public_key)?;
        Ok(encode_signature(&signature))
    }

    /// Re-validate the locks, then serialize and broadcast the commit or split
    async fn broadcast_funding(
        &self,
        context: &TransactionContext,
        script_sigs: &[Vec<u8>],
    ) -> AppResult<Txid> {
        self.coordinator
            .lock(&context.outpoints(), &context.owner_address, &context.attempt_id)
            .await?;
        let tx_bytes = serialize_transaction(&context.funding_tx, script_sigs)?;
        self.broadcast(&tx_bytes).await
    }

    async fn broadcast_commit(
        &self,
        context: &TransactionContext,
        script_sigs: &[Vec<u8>],
    ) -> AppResult<(Txid, TransactionSkeleton)> {
        let commit_txid = self.broadcast_funding(context, script_sigs).await?;
        let reveal_tx = self.build_reveal_tx(context, commit_txid).await?;
        Ok((commit_txid, reveal_tx))
    }

    /// Spend output 0 of the commit to the destination, minus the reveal fee
    async fn build_reveal_tx(
        &self,
        context: &TransactionContext,
        commit_txid: Txid,
    ) -> AppResult<TransactionSkeleton> {
        let plan = context.inscription.as_ref().ok_or_else(|| {
            AppError::InternalError(format!("Attempt {} has no inscription plan", context.attempt_id))
        })?;

        let epoch_id = match self.epochs.current().await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    "{}; reveal of {} reuses the commit branch id 0x{:08x}",
                    e,
                    context.attempt_id,
                    context.funding_tx.epoch_id()
                );
                context.funding_tx.epoch_id()
            }
        };

        let destination = TransparentAddress::parse(&plan.destination_address)?;
        TransactionSkeleton::new(
            TxKind::Reveal,
            epoch_id,
            0,
            vec![SkeletonInput {
                outpoint: Outpoint::new(commit_txid, 0),
                sequence: SEQUENCE_FINAL,
                value: plan.inscription_value,
                script_code: plan.redeem_script.clone(),
            }],
            vec![TxOutput {
                value: plan.inscription_value - plan.reveal_fee,
                script_pubkey: destination.script_pubkey(),
            }],
        )
    }

    async fn broadcast_reveal(
        &self,
        plan: &InscriptionPlan,
        reveal_tx: &TransactionSkeleton,
        public_key: &PublicKey,
        signature: &[u8],
    ) -> AppResult<Txid> {
        let envelope = Envelope::new(plan.content_type.clone(), plan.body.clone());
        // the reveal must reproduce the script the commit paid to
        if build_redeem_script(&public_key.serialize(), &envelope)? != plan.redeem_script {
            return Err(AppError::InternalError(
                "Rebuilt redeem script differs from the committed one".to_string(),
            ));
        }

        let script_sig = reveal_script_sig(&envelope, signature, &plan.redeem_script)?;
        let tx_bytes = serialize_transaction(reveal_tx, &[script_sig])?;
        self.broadcast(&tx_bytes).await
    }

    /// Broadcast through the provider chain. The locally computed txid is
    /// authoritative; provider failures are reported without endpoints.
    async fn broadcast(&self, tx_bytes: &[u8]) -> AppResult<Txid> {
        let local = txid_of(tx_bytes);
        match self
            .broadcasters
            .call("broadcast", |broadcaster| async move {
                broadcaster.broadcast(tx_bytes).await
            })
            .await
        {
            Ok(reported) => {
                if reported != local {
                    tracing::warn!("Broadcaster reported {} for transaction {}", reported, local);
                }
                Ok(local)
            }
            Err(failures) => {
                tracing::error!("{}", failures.summary());
                let messages = failures.messages();
                let detail = if messages.is_empty() {
                    "no broadcaster configured".to_string()
                } else {
                    messages.join("; ")
                };
                Err(AppError::BroadcastRejected(strip_endpoints(&detail)))
            }
        }
    }
}

fn expect_kind(context: &TransactionContext, kind: ContextKind) -> AppResult<()> {
    if context.kind != kind {
        return Err(AppError::InvalidContextState(format!(
            "Attempt {} is not a{} attempt",
            context.attempt_id,
            match kind {
                ContextKind::Inscription => "n inscription",
                ContextKind::Split => " split",
            }
        )));
    }
    Ok(())
}

fn expect_status(context: &TransactionContext, expected: ContextStatus) -> AppResult<()> {
    if context.status != expected {
        return Err(AppError::InvalidContextState(format!(
            "Attempt {} is {}, expected {}",
            context.attempt_id, context.status, expected
        )));
    }
    Ok(())
}

/// Replace URLs in provider text so callers never see internal endpoints
fn strip_endpoints(message: &str) -> String {
    message
        .split_whitespace()
        .map(|word| if word.contains("://") { "[provider]" } else { word })
        .collect::<Vec<_>>()
        .join(" ")
}

fn sign_all(signer: &LocalSigner, digests: &[String]) -> AppResult<Vec<String>> {
    digests
        .iter()
        .map(|digest_hex| -> AppResult<String> {
            let digest: [u8; 32] = hex::decode(digest_hex)
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| AppError::InternalError(format!("Invalid digest {}", digest_hex)))?;
            Ok(hex::encode(signer.sign_digest(&digest)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::zcash::script::parse_reveal_script_sig;
    use crate::blockchain::zcash::transaction::RawTransaction;
    use crate::db::store::LockStore;
    use crate::services::test_support::{harness, TestHarness};
    use secp256k1::SecretKey;
    use std::time::Duration;

    fn signer(seed: u8) -> LocalSigner {
        LocalSigner::new(SecretKey::from_slice(&[seed; 32]).unwrap())
    }

    fn funding(signer: &LocalSigner, n: u8, value: u64) -> FundingInput {
        FundingInput {
            outpoint: Outpoint::new(Txid([n; 32]), 1),
            value,
            address: signer.address().to_string(),
            script_pubkey: signer.address().script_pubkey(),
        }
    }

    fn request(signer: &LocalSigner, value: Option<u64>) -> InscriptionRequest {
        InscriptionRequest {
            public_key: signer.public_key_hex(),
            content_type: "text/plain;charset=utf-8".to_string(),
            body: b"hello zcash".to_vec(),
            ticker: Some("ZORD".to_string()),
            inscription_value: value,
            destination_address: None,
        }
    }

    async fn funded(signer: &LocalSigner, value: u64) -> TestHarness {
        let h = harness(ServiceSettings::default());
        h.chain
            .fund(&signer.address().to_string(), vec![funding(signer, 7, value)])
            .await;
        h
    }

    async fn held_locks(h: &TestHarness, view: &AttemptView) -> usize {
        h.locks.holders(&view.inputs).await.unwrap().len()
    }

    #[tokio::test]
    async fn test_commit_reveal_end_to_end() {
        let key = signer(0x42);
        let inscription_value = 60_000;
        let fee = 10_000;
        let h = funded(&key, inscription_value + fee + 1_000).await;

        let prepared = h
            .service
            .prepare_inscription(request(&key, Some(inscription_value)))
            .await
            .unwrap();
        assert_eq!(prepared.status, ContextStatus::Prepared);
        assert_eq!(prepared.sighashes.len(), 1);
        assert_eq!(prepared.funding_fee, fee);
        assert_eq!(held_locks(&h, &prepared).await, 1);

        let signatures = sign_all(&key, &prepared.sighashes).unwrap();
        let committed = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &signatures)
            .await
            .unwrap();
        assert_eq!(committed.status, ContextStatus::Broadcast);
        assert_eq!(committed.sighashes.len(), 1);

        let broadcasts = h.chain.broadcasts().await;
        let commit = RawTransaction::deserialize(&broadcasts[0]).unwrap();
        let values: Vec<u64> = commit.outputs.iter().map(|o| o.value).collect();
        assert_eq!(values, vec![inscription_value, 1_000]);
        assert_eq!(commit.outputs[1].script_pubkey, key.address().script_pubkey());
        assert_eq!(committed.funding_txid, Some(commit.txid().unwrap()));

        let reveal_signature = sign_all(&key, &committed.sighashes).unwrap().remove(0);
        let completed = h
            .service
            .submit_reveal_signature(&prepared.attempt_id, &reveal_signature)
            .await
            .unwrap();
        assert_eq!(completed.status, ContextStatus::Completed);

        let broadcasts = h.chain.broadcasts().await;
        let reveal = RawTransaction::deserialize(&broadcasts[1]).unwrap();
        assert_eq!(reveal.inputs.len(), 1);
        assert_eq!(reveal.inputs[0].outpoint, Outpoint::new(commit.txid().unwrap(), 0));
        assert_eq!(reveal.outputs.len(), 1);
        assert_eq!(reveal.outputs[0].value, inscription_value - fee);

        let parts = parse_reveal_script_sig(&reveal.inputs[0].script_sig).unwrap();
        assert_eq!(parts.envelope.content_type, "text/plain;charset=utf-8");
        assert_eq!(parts.envelope.body, b"hello zcash");
        assert_eq!(
            p2sh_script_pubkey(&parts.redeem_script),
            commit.outputs[0].script_pubkey
        );

        let reveal_txid = reveal.txid().unwrap();
        assert_eq!(completed.inscription_id, Some(format!("{}i0", reveal_txid)));
        let records = h.recorder.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ticker.as_deref(), Some("ZORD"));
        assert_eq!(records[0].content_length, 11);
        assert_eq!(held_locks(&h, &prepared).await, 0);
    }

    #[tokio::test]
    async fn test_invalid_signature_leaves_context_unchanged() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();

        let wrong = sign_all(&signer(0x43), &prepared.sighashes).unwrap();
        let err = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        let err = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        let view = h.service.get_context(&prepared.attempt_id).await.unwrap();
        assert_eq!(view.status, ContextStatus::Prepared);
        assert_eq!(held_locks(&h, &view).await, 1);
        assert!(h.chain.broadcasts().await.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_and_terminal_calls_rejected() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();

        // reveal before the commit was broadcast
        let digest_signature = sign_all(&key, &prepared.sighashes).unwrap().remove(0);
        let err = h
            .service
            .submit_reveal_signature(&prepared.attempt_id, &digest_signature)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidContextState(_)));

        let err = h
            .service
            .submit_split_signatures(&prepared.attempt_id, &[digest_signature.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidContextState(_)));

        let failed = h.service.mark_failed(&prepared.attempt_id, None).await.unwrap();
        assert_eq!(failed.status, ContextStatus::Failed);
        assert_eq!(held_locks(&h, &failed).await, 0);

        let err = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &[digest_signature])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidContextState(_)));
        let err = h.service.mark_failed(&prepared.attempt_id, None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidContextState(_)));
    }

    #[tokio::test]
    async fn test_broadcast_rejection_fails_and_unlocks() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();
        h.chain.reject_broadcasts(Some("min relay fee not met")).await;

        let signatures = sign_all(&key, &prepared.sighashes).unwrap();
        let err = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &signatures)
            .await
            .unwrap_err();
        match &err {
            AppError::BroadcastRejected(msg) => {
                assert!(msg.contains("min relay fee not met"));
                assert!(!msg.contains("fake-node"));
                assert!(!msg.contains("fake:"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let view = h.service.get_context(&prepared.attempt_id).await.unwrap();
        assert_eq!(view.status, ContextStatus::Failed);
        assert_eq!(held_locks(&h, &view).await, 0);

        // the input is eligible for a new attempt
        h.chain.reject_broadcasts(None).await;
        let retry = h.service.prepare_inscription(request(&key, None)).await.unwrap();
        assert_eq!(retry.inputs, prepared.inputs);
    }

    #[tokio::test]
    async fn test_reveal_rejection_fails_and_unlocks() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        h.chain.reject_after(1, "bad-txns-inputs-missingorspent").await;

        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();
        let signatures = sign_all(&key, &prepared.sighashes).unwrap();
        let committed = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &signatures)
            .await
            .unwrap();
        assert_eq!(committed.status, ContextStatus::Broadcast);
        assert_eq!(held_locks(&h, &committed).await, 1);

        let reveal_signature = sign_all(&key, &committed.sighashes).unwrap().remove(0);
        let err = h
            .service
            .submit_reveal_signature(&prepared.attempt_id, &reveal_signature)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BroadcastRejected(_)));

        let view = h.service.get_context(&prepared.attempt_id).await.unwrap();
        assert_eq!(view.status, ContextStatus::Failed);
        assert!(view.error.as_deref().unwrap_or_default().contains("missingorspent"));
        assert_eq!(view.funding_txid, committed.funding_txid);
        assert_eq!(held_locks(&h, &view).await, 0);
        assert_eq!(h.chain.broadcasts().await.len(), 1);
        assert!(h.recorder.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_timeout_fails_and_unlocks() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();
        h.chain.slow_broadcasts(Some(Duration::from_secs(3))).await;

        let signatures = sign_all(&key, &prepared.sighashes).unwrap();
        let err = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &signatures)
            .await
            .unwrap_err();
        match &err {
            AppError::BroadcastRejected(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected {:?}", other),
        }

        let view = h.service.get_context(&prepared.attempt_id).await.unwrap();
        assert_eq!(view.status, ContextStatus::Failed);
        assert_eq!(view.funding_txid, None);
        assert_eq!(held_locks(&h, &view).await, 0);
    }

    #[tokio::test]
    async fn test_commit_rejected_when_lock_taken_after_sweep() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();

        // the sweeper expires the lock and another owner takes the input
        let swept = h
            .locks
            .sweep_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        h.locks
            .try_lock_all(&prepared.inputs, "t1other", "other-attempt")
            .await
            .unwrap();

        let signatures = sign_all(&key, &prepared.sighashes).unwrap();
        let err = h
            .service
            .submit_commit_signatures(&prepared.attempt_id, &signatures)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LockConflict(_)));
        assert!(h.chain.broadcasts().await.is_empty());

        let view = h.service.get_context(&prepared.attempt_id).await.unwrap();
        assert_eq!(view.status, ContextStatus::Failed);
        let holders = h.locks.holders(&prepared.inputs).await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].attempt_id, "other-attempt");
    }

    #[tokio::test]
    async fn test_oversized_reveal_rejected_before_commit() {
        let key = signer(0x42);
        let h = harness(ServiceSettings {
            max_body_size: 20_000,
            ..ServiceSettings::default()
        });
        h.chain
            .fund(&key.address().to_string(), vec![funding(&key, 7, 100_000)])
            .await;

        let mut oversized = request(&key, None);
        oversized.body = vec![0xab; 12_000];
        let err = h.service.prepare_inscription(oversized).await.unwrap_err();
        match &err {
            AppError::ValidationError(msg) => assert!(msg.contains("Reveal script")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.chain.broadcasts().await.is_empty());
        assert!(h
            .locks
            .holders(&[Outpoint::new(Txid([7; 32]), 1)])
            .await
            .unwrap()
            .is_empty());

        let err = h
            .service
            .inscribe_with_key(&key, "application/octet-stream", vec![0xab; 12_000], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert!(h.chain.broadcasts().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_attempt_cannot_reuse_locked_input() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        h.service.prepare_inscription(request(&key, None)).await.unwrap();

        let err = h.service.prepare_inscription(request(&key, None)).await.unwrap_err();
        assert!(matches!(err, AppError::InputUnavailable(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_inscription_value_raised_to_minimum() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let view = h
            .service
            .prepare_inscription(request(&key, Some(1_000)))
            .await
            .unwrap();
        assert_eq!(view.inscription_value, Some(10_000 + 546 + 1));
        assert_eq!(view.reveal_fee, Some(10_000));
        assert!(view.commit_address.unwrap().starts_with("t3"));
    }

    #[tokio::test]
    async fn test_platform_fee_is_second_commit_output() {
        let key = signer(0x42);
        let platform = signer(0x50);
        let settings = ServiceSettings {
            platform_fee: Some(PlatformFee {
                value: 20_000,
                script_pubkey: platform.address().script_pubkey(),
            }),
            ..ServiceSettings::default()
        };
        let h = harness(settings);
        h.chain
            .fund(&key.address().to_string(), vec![funding(&key, 7, 200_000)])
            .await;

        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();
        assert_eq!(prepared.platform_fee, 20_000);
        assert_eq!(prepared.funding_fee, 15_000);

        let signatures = sign_all(&key, &prepared.sighashes).unwrap();
        h.service
            .submit_commit_signatures(&prepared.attempt_id, &signatures)
            .await
            .unwrap();
        let commit = RawTransaction::deserialize(&h.chain.broadcasts().await[0]).unwrap();
        let values: Vec<u64> = commit.outputs.iter().map(|o| o.value).collect();
        assert_eq!(values, vec![60_000, 20_000, 105_000]);
        assert_eq!(commit.outputs[1].script_pubkey, platform.address().script_pubkey());
    }

    #[tokio::test]
    async fn test_split_flow() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;

        let prepared = h
            .service
            .prepare_split(SplitRequest {
                public_key: key.public_key_hex(),
                split_count: 3,
                split_value: 20_000,
            })
            .await
            .unwrap();
        assert_eq!(prepared.kind, ContextKind::Split);
        assert_eq!(prepared.funding_fee, 20_000);

        let signatures = sign_all(&key, &prepared.sighashes).unwrap();
        let done = h
            .service
            .submit_split_signatures(&prepared.attempt_id, &signatures)
            .await
            .unwrap();
        assert_eq!(done.status, ContextStatus::Completed);
        assert!(done.sighashes.is_empty());

        let split = RawTransaction::deserialize(&h.chain.broadcasts().await[0]).unwrap();
        let values: Vec<u64> = split.outputs.iter().map(|o| o.value).collect();
        assert_eq!(values, vec![20_000, 20_000, 20_000, 20_000]);
        assert_eq!(held_locks(&h, &done).await, 0);

        let err = h
            .service
            .prepare_split(SplitRequest {
                public_key: key.public_key_hex(),
                split_count: 2,
                split_value: 546,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_inscribe_with_key() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let view = h
            .service
            .inscribe_with_key(&key, "image/png", vec![0x89, 0x50, 0x4e, 0x47], None)
            .await
            .unwrap();
        assert_eq!(view.status, ContextStatus::Completed);
        assert!(view.inscription_id.unwrap().ends_with("i0"));
        assert_eq!(h.chain.broadcasts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_attempt_rejected() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;
        let prepared = h.service.prepare_inscription(request(&key, None)).await.unwrap();

        let guard = h.service.begin(&prepared.attempt_id).unwrap();
        let err = h
            .service
            .mark_failed(&prepared.attempt_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidContextState(_)));
        drop(guard);

        assert!(h.service.mark_failed(&prepared.attempt_id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_request_validation() {
        let key = signer(0x42);
        let h = funded(&key, 100_000).await;

        let mut bad = request(&key, None);
        bad.content_type = "  ".to_string();
        assert!(h.service.prepare_inscription(bad).await.is_err());

        let mut bad = request(&key, None);
        bad.body = vec![0u8; 9_001];
        assert!(h.service.prepare_inscription(bad).await.is_err());

        let mut bad = request(&key, None);
        bad.public_key = "02abcd".to_string();
        assert!(h.service.prepare_inscription(bad).await.is_err());

        // nothing stayed locked
        assert_eq!(
            h.locks
                .holders(&[Outpoint::new(Txid([7; 32]), 1)])
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn test_strip_endpoints() {
        assert_eq!(
            strip_endpoints("error sending request for url (http://10.0.0.1:8232/): refused"),
            "error sending request for url [provider] refused"
        );
        assert_eq!(strip_endpoints("insufficient fee"), "insufficient fee");
    }
}
