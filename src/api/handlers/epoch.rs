use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::blockchain::zcash::epoch::{parse_epoch_id, EpochCache};
use crate::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct EpochOverrideRequest {
    /// Hex branch id; null clears the override
    pub epoch_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EpochStatus {
    pub epoch_id: String,
    pub overridden: bool,
}

pub async fn get_epoch(epochs: web::Data<Arc<EpochCache>>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(epoch_status(&epochs).await?))
}

/// Pin the branch id while the nodes are unreachable, or unpin it
pub async fn set_epoch_override(
    epochs: web::Data<Arc<EpochCache>>,
    request: web::Json<EpochOverrideRequest>,
) -> AppResult<HttpResponse> {
    apply_override(&epochs, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(epoch_status(&epochs).await?))
}

async fn apply_override(epochs: &EpochCache, request: EpochOverrideRequest) -> AppResult<()> {
    let override_id = match request.epoch_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(hex_id) => Some(parse_epoch_id(hex_id)?),
    };
    epochs.set_override(override_id).await;
    Ok(())
}

async fn epoch_status(epochs: &EpochCache) -> AppResult<EpochStatus> {
    let overridden = epochs.override_id().await.is_some();
    let epoch_id = epochs.current().await?;
    Ok(EpochStatus {
        epoch_id: format!("0x{:08x}", epoch_id),
        overridden,
    })
}
