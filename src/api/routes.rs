use actix_web::web;

use super::handlers;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health_check))
            // Commit/reveal
            .route("/inscriptions", web::post().to(handlers::create_inscription))
            .route("/inscriptions/signed", web::post().to(handlers::create_signed_inscription))
            .route("/inscriptions/{id}", web::get().to(handlers::get_attempt))
            .route("/inscriptions/{id}/commit", web::post().to(handlers::submit_commit))
            .route("/inscriptions/{id}/reveal", web::post().to(handlers::submit_reveal))
            .route("/inscriptions/{id}/fail", web::post().to(handlers::fail_attempt))
            // Splits share the attempt store with inscriptions
            .route("/splits", web::post().to(handlers::create_split))
            .route("/splits/{id}", web::get().to(handlers::get_attempt))
            .route("/splits/{id}/sign", web::post().to(handlers::submit_split))
            .route("/splits/{id}/fail", web::post().to(handlers::fail_attempt))
            .route("/envelopes/parse", web::post().to(handlers::parse_envelope_script))
            // Operator controls
            .route("/epoch", web::get().to(handlers::get_epoch))
            .route("/epoch/override", web::put().to(handlers::set_epoch_override)),
    );
}

async fn health_check() -> actix_web::HttpResponse {
    actix_web::HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
