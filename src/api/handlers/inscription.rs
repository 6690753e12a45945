use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::blockchain::traits::hex_bytes;
use crate::blockchain::zcash::script::{parse_envelope, parse_reveal_script_sig};
use crate::crypto::zcash::LocalSigner;
use crate::error::{AppError, AppResult};
use crate::services::inscription_service::{
    AttemptView, InscriptionRequest, InscriptionService, SplitRequest,
};

#[derive(Debug, Deserialize)]
pub struct SignaturesRequest {
    pub signatures: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevealRequest {
    pub signature: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FailRequest {
    pub reason: Option<String>,
}

/// Inscription funded and signed by the server's own key
#[derive(Debug, Deserialize)]
pub struct SignedInscriptionRequest {
    pub content_type: String,
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    pub ticker: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ParseEnvelopeRequest {
    /// Hex of a reveal scriptSig or of a bare envelope script
    pub script: String,
}

#[derive(Debug, Serialize)]
pub struct ParsedEnvelopeResponse {
    pub content_type: String,
    pub body: String,
    pub content_length: usize,
    pub public_key: Option<String>,
}

pub async fn create_inscription(
    service: web::Data<Arc<InscriptionService>>,
    request: web::Json<InscriptionRequest>,
) -> AppResult<HttpResponse> {
    let attempt = service.prepare_inscription(request.into_inner()).await?;
    Ok(HttpResponse::Created().json(attempt))
}

pub async fn create_signed_inscription(
    service: web::Data<Arc<InscriptionService>>,
    signer: web::Data<Option<Arc<LocalSigner>>>,
    request: web::Json<SignedInscriptionRequest>,
) -> AppResult<HttpResponse> {
    let attempt = inscribe_signed(&service, signer.get_ref().as_deref(), request.into_inner()).await?;
    Ok(HttpResponse::Created().json(attempt))
}

async fn inscribe_signed(
    service: &InscriptionService,
    signer: Option<&LocalSigner>,
    request: SignedInscriptionRequest,
) -> AppResult<AttemptView> {
    let signer = signer.ok_or_else(|| {
        AppError::NotFound("Server-side signing is not configured".to_string())
    })?;
    service
        .inscribe_with_key(signer, &request.content_type, request.body, request.ticker)
        .await
}

pub async fn submit_commit(
    service: web::Data<Arc<InscriptionService>>,
    path: web::Path<String>,
    request: web::Json<SignaturesRequest>,
) -> AppResult<HttpResponse> {
    let attempt = service
        .submit_commit_signatures(&path.into_inner(), &request.signatures)
        .await?;
    Ok(HttpResponse::Ok().json(attempt))
}

pub async fn submit_reveal(
    service: web::Data<Arc<InscriptionService>>,
    path: web::Path<String>,
    request: web::Json<RevealRequest>,
) -> AppResult<HttpResponse> {
    let attempt = service
        .submit_reveal_signature(&path.into_inner(), &request.signature)
        .await?;
    Ok(HttpResponse::Ok().json(attempt))
}

pub async fn fail_attempt(
    service: web::Data<Arc<InscriptionService>>,
    path: web::Path<String>,
    request: Option<web::Json<FailRequest>>,
) -> AppResult<HttpResponse> {
    let reason = request.and_then(|r| r.into_inner().reason);
    let attempt = service.mark_failed(&path.into_inner(), reason).await?;
    Ok(HttpResponse::Ok().json(attempt))
}

pub async fn get_attempt(
    service: web::Data<Arc<InscriptionService>>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let attempt = service.get_context(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(attempt))
}

pub async fn create_split(
    service: web::Data<Arc<InscriptionService>>,
    request: web::Json<SplitRequest>,
) -> AppResult<HttpResponse> {
    let attempt = service.prepare_split(request.into_inner()).await?;
    Ok(HttpResponse::Created().json(attempt))
}

pub async fn submit_split(
    service: web::Data<Arc<InscriptionService>>,
    path: web::Path<String>,
    request: web::Json<SignaturesRequest>,
) -> AppResult<HttpResponse> {
    let attempt = service
        .submit_split_signatures(&path.into_inner(), &request.signatures)
        .await?;
    Ok(HttpResponse::Ok().json(attempt))
}

pub async fn parse_envelope_script(
    request: web::Json<ParseEnvelopeRequest>,
) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(decode_envelope(&request.script)?))
}

fn decode_envelope(script_hex: &str) -> AppResult<ParsedEnvelopeResponse> {
    let script = hex::decode(script_hex.trim())
        .map_err(|e| AppError::ValidationError(format!("Invalid script hex: {}", e)))?;

    let (envelope, public_key) = match parse_reveal_script_sig(&script) {
        Ok(parts) => (parts.envelope, Some(hex::encode(parts.public_key))),
        Err(_) => (parse_envelope(&script)?, None),
    };

    Ok(ParsedEnvelopeResponse {
        content_type: envelope.content_type,
        content_length: envelope.body.len(),
        body: hex::encode(envelope.body),
        public_key,
    })
}
