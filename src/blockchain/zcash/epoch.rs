//! Consensus branch id lookup with a TTL cache and an operator override

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::blockchain::registry::ProviderChain;
use crate::blockchain::traits::EpochSource;
use crate::error::{AppError, AppResult};

/// Parse a branch id written as hex, with or without a `0x` prefix
pub fn parse_epoch_id(hex_id: &str) -> AppResult<u32> {
    let hex_id = hex_id.trim();
    u32::from_str_radix(hex_id.trim_start_matches("0x"), 16)
        .map_err(|e| AppError::ValidationError(format!("Invalid branch id '{}': {}", hex_id, e)))
}

/// Consensus branch id cache
///
/// An override always wins. Otherwise a cached value is served until its
/// expiry, then refetched through the provider chain. An expired value is
/// never served when every provider fails.
pub struct EpochCache {
    sources: ProviderChain<dyn EpochSource>,
    ttl: Duration,
    override_id: RwLock<Option<u32>>,
    cached: RwLock<Option<(u32, Instant)>>,
}

impl EpochCache {
    pub fn new(sources: ProviderChain<dyn EpochSource>, ttl: Duration, override_id: Option<u32>) -> Self {
        if let Some(id) = override_id {
            tracing::warn!("Consensus branch id pinned to 0x{:08x} by override", id);
        }
        Self {
            sources,
            ttl,
            override_id: RwLock::new(override_id),
            cached: RwLock::new(None),
        }
    }

    pub async fn current(&self) -> AppResult<u32> {
        if let Some(id) = *self.override_id.read().await {
            return Ok(id);
        }

        if let Some((id, expires_at)) = *self.cached.read().await {
            if Instant::now() < expires_at {
                return Ok(id);
            }
        }

        let mut cached = self.cached.write().await;
        // another caller may have refreshed while we waited for the lock
        if let Some((id, expires_at)) = *cached {
            if Instant::now() < expires_at {
                return Ok(id);
            }
        }

        match self
            .sources
            .call("current_epoch_id", |source| async move {
                source.current_epoch_id().await
            })
            .await
        {
            Ok(id) => {
                if (*cached).map(|(old, _)| old) != Some(id) {
                    tracing::info!("Consensus branch id is now 0x{:08x}", id);
                }
                *cached = Some((id, Instant::now() + self.ttl));
                Ok(id)
            }
            Err(failures) => {
                tracing::error!("{}", failures.summary());
                *cached = None;
                Err(AppError::EpochUnavailable(format!(
                    "no provider returned a consensus branch id: {}",
                    failures.messages().join("; ")
                )))
            }
        }
    }

    pub async fn override_id(&self) -> Option<u32> {
        *self.override_id.read().await
    }

    /// Pin or unpin the branch id during a provider outage. Unpinning drops
    /// the cached value so the next lookup asks the providers.
    pub async fn set_override(&self, override_id: Option<u32>) {
        match override_id {
            Some(id) => tracing::warn!("Consensus branch id override set to 0x{:08x}", id),
            None => {
                tracing::info!("Consensus branch id override cleared");
                *self.cached.write().await = None;
            }
        }
        *self.override_id.write().await = override_id;
    }
}
