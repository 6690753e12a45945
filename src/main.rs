use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zinscribe_service::api;
use zinscribe_service::blockchain::indexer::IndexerClient;
use zinscribe_service::blockchain::traits::{
    Broadcaster, EpochSource, InscriptionIndex, InscriptionRecorder, UtxoSource,
};
use zinscribe_service::blockchain::zcash::{EpochCache, ZcashClient};
use zinscribe_service::blockchain::ProviderChain;
use zinscribe_service::config::AppConfig;
use zinscribe_service::crypto::zcash::LocalSigner;
use zinscribe_service::db::{self, memory, repositories, ContextStore, LockStore};
use zinscribe_service::services::{InscriptionService, ServiceSettings, UtxoCoordinator};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging with console and file output
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".into());
    std::fs::create_dir_all(&log_dir).expect("Failed to create log directory");

    // File appender - rotates when > 500MB, keeps 10 backup files
    let log_path = std::path::Path::new(&log_dir).join("zinscribe.log");
    let file_appender = rolling_file::RollingFileAppender::new(
        log_path,
        rolling_file::RollingConditionBasic::new().max_size(500 * 1024 * 1024),
        10,
    )
    .expect("Failed to create log file appender");

    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sqlx=warn".into()),
    );

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    tracing::info!("Starting inscription service");

    let config = AppConfig::load().expect("Failed to load configuration");
    tracing::info!("Configuration loaded successfully");

    // Persistence: MySQL when enabled, in-memory otherwise
    let (locks, contexts, recorder): (
        Arc<dyn LockStore>,
        Arc<dyn ContextStore>,
        Arc<dyn InscriptionRecorder>,
    ) = if config.database.enabled {
        tracing::info!(
            "Database: {}:{}/{}",
            config.database.host,
            config.database.port,
            config.database.name
        );
        let pool = db::create_pool(&config.database)
            .await
            .expect("Failed to create database pool");
        db::run_migrations(&pool)
            .await
            .expect("Failed to run database migrations");
        (
            Arc::new(repositories::LockRepository::new(pool.clone())),
            Arc::new(repositories::ContextRepository::new(pool.clone())),
            Arc::new(repositories::InscriptionRepository::new(pool)),
        )
    } else {
        tracing::warn!("Database disabled, locks and attempts are kept in memory");
        (
            Arc::new(memory::MemoryLockStore::new()),
            Arc::new(memory::MemoryContextStore::new()),
            Arc::new(memory::MemoryInscriptionRecorder::new()),
        )
    };

    // Providers, tried in configuration order
    let rpc_timeout = Duration::from_secs(config.zcash.request_timeout_secs);
    let mut utxo_sources = ProviderChain::<dyn UtxoSource>::new(rpc_timeout);
    let mut epoch_sources = ProviderChain::<dyn EpochSource>::new(rpc_timeout);
    let mut broadcasters = ProviderChain::<dyn Broadcaster>::new(rpc_timeout);
    for client in ZcashClient::from_config(&config.zcash).expect("Failed to create Zcash client") {
        let client = Arc::new(client);
        utxo_sources.register(client.clone());
        epoch_sources.register(client.clone());
        broadcasters.register(client);
    }

    let mut inscription_index = ProviderChain::<dyn InscriptionIndex>::new(Duration::from_secs(
        config.indexer.request_timeout_secs,
    ));
    for client in IndexerClient::from_config(&config.indexer).expect("Failed to create indexer client") {
        inscription_index.register(Arc::new(client));
    }

    tracing::info!(
        "Zcash providers: {:?}, indexers: {:?}",
        broadcasters.provider_names(),
        inscription_index.provider_names()
    );

    let epoch_override = config
        .zcash
        .epoch_override_id()
        .expect("Invalid epoch override");
    let epochs = Arc::new(EpochCache::new(
        epoch_sources,
        Duration::from_secs(config.zcash.epoch_cache_ttl_secs),
        epoch_override,
    ));

    let coordinator = Arc::new(UtxoCoordinator::new(
        utxo_sources,
        inscription_index,
        locks,
        Duration::from_secs(config.inscription.lock_ttl_secs),
    ));
    let _sweeper = coordinator
        .clone()
        .spawn_sweeper(Duration::from_secs(config.inscription.sweep_interval_secs));

    let settings = ServiceSettings::from_config(&config.inscription)
        .expect("Invalid inscription settings");
    let signer: Option<Arc<LocalSigner>> = config.inscription.signer_key.as_deref().map(|key| {
        let signer = LocalSigner::from_private_key(key).expect("Invalid signer key");
        tracing::info!("Server-side signing enabled for {}", signer.address());
        Arc::new(signer)
    });

    let service = Arc::new(InscriptionService::new(
        coordinator,
        contexts,
        epochs.clone(),
        broadcasters,
        recorder,
        settings,
    ));

    let server_host = config.server.host.clone();
    let server_port = config.server.port;
    tracing::info!("Starting HTTP server at {}:{}", server_host, server_port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(actix_web::middleware::from_fn(api::middleware::request_logger))
            .app_data(web::Data::new(service.clone()))
            .app_data(web::Data::new(epochs.clone()))
            .app_data(web::Data::new(signer.clone()))
            .configure(api::configure_routes)
    })
    .bind((server_host, server_port))?
    .run()
    .await
}
