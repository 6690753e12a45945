use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::blockchain::zcash::epoch::parse_epoch_id;
use crate::blockchain::zcash::script::MAX_ENVELOPE_BODY_SIZE;
use crate::crypto::zcash::{LocalSigner, TransparentAddress};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// When false, locks and contexts live in process memory
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZcashConfig {
    pub rpc_url: String,
    pub fallback_rpcs: Vec<String>,
    /// HTTP/HTTPS/SOCKS5 proxy for RPC requests
    pub rpc_proxy: Option<String>,
    /// RPC username for authentication
    pub rpc_user: Option<String>,
    /// RPC password for authentication
    pub rpc_password: Option<String>,
    pub request_timeout_secs: u64,
    pub epoch_cache_ttl_secs: u64,
    /// Consensus branch id (hex) to use while the nodes are unreachable
    pub epoch_override: Option<String>,
}

impl ZcashConfig {
    pub fn epoch_override_id(&self) -> Result<Option<u32>, ConfigError> {
        match self.epoch_override.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(hex_id) => parse_epoch_id(hex_id)
                .map(Some)
                .map_err(|e| ConfigError::Message(format!("Invalid zcash.epoch_override: {}", e))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub url: String,
    pub fallback_urls: Vec<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InscriptionConfig {
    pub per_action_fee: u64,
    pub fee_floor: u64,
    pub dust_limit: u64,
    pub default_inscription_value: u64,
    /// Zero disables the platform fee output
    pub platform_fee: u64,
    pub platform_fee_address: Option<String>,
    pub lock_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_body_size: usize,
    /// Hex or WIF key for server-side signing; the signing route is off
    /// when unset
    pub signer_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub zcash: ZcashConfig,
    pub indexer: IndexerConfig,
    pub inscription: InscriptionConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let config = Config::builder()
            // Server defaults
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            // Database defaults
            .set_default("database.enabled", false)?
            .set_default("database.host", "localhost")?
            .set_default("database.port", 3306)?
            .set_default("database.user", "root")?
            .set_default("database.password", "")?
            .set_default("database.name", "zinscribe")?
            .set_default("database.max_connections", 20)?
            // Zcash defaults
            .set_default("zcash.rpc_url", "http://127.0.0.1:8232")?
            .set_default("zcash.fallback_rpcs", Vec::<String>::new())?
            .set_default("zcash.rpc_proxy", Option::<String>::None)?
            .set_default("zcash.rpc_user", Option::<String>::None)?
            .set_default("zcash.rpc_password", Option::<String>::None)?
            .set_default("zcash.request_timeout_secs", 30)?
            .set_default("zcash.epoch_cache_ttl_secs", 600)?
            .set_default("zcash.epoch_override", Option::<String>::None)?
            // Indexer defaults
            .set_default("indexer.url", "http://127.0.0.1:3000")?
            .set_default("indexer.fallback_urls", Vec::<String>::new())?
            .set_default("indexer.request_timeout_secs", 10)?
            // Inscription policy defaults (zatoshis)
            .set_default("inscription.per_action_fee", 5_000)?
            .set_default("inscription.fee_floor", 10_000)?
            .set_default("inscription.dust_limit", 546)?
            .set_default("inscription.default_inscription_value", 60_000)?
            .set_default("inscription.platform_fee", 0)?
            .set_default("inscription.platform_fee_address", Option::<String>::None)?
            .set_default("inscription.lock_ttl_secs", 900)?
            .set_default("inscription.sweep_interval_secs", 60)?
            .set_default("inscription.max_body_size", 9_000)?
            .set_default("inscription.signer_key", Option::<String>::None)?
            // Load from config.toml if exists
            .add_source(File::with_name("config").required(false))
            // Override with environment variables (prefix: INSCRIBE_)
            // Use __ as separator so INSCRIBE_ZCASH__RPC_URL -> zcash.rpc_url
            .add_source(
                Environment::with_prefix("INSCRIBE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.zcash.rpc_url)
            .map_err(|e| ConfigError::Message(format!("Invalid zcash.rpc_url: {}", e)))?;
        for rpc in &self.zcash.fallback_rpcs {
            url::Url::parse(rpc)
                .map_err(|e| ConfigError::Message(format!("Invalid fallback RPC '{}': {}", rpc, e)))?;
        }
        url::Url::parse(&self.indexer.url)
            .map_err(|e| ConfigError::Message(format!("Invalid indexer.url: {}", e)))?;

        self.zcash.epoch_override_id()?;

        let policy = &self.inscription;
        if policy.per_action_fee == 0 || policy.fee_floor == 0 {
            return Err(ConfigError::Message(
                "Fee constants must be positive".to_string(),
            ));
        }
        if policy.max_body_size == 0 || policy.max_body_size > MAX_ENVELOPE_BODY_SIZE {
            return Err(ConfigError::Message(format!(
                "inscription.max_body_size must be 1 to {} bytes",
                MAX_ENVELOPE_BODY_SIZE
            )));
        }
        if let Some(key) = &policy.signer_key {
            LocalSigner::from_private_key(key)
                .map_err(|e| ConfigError::Message(format!("Invalid inscription.signer_key: {}", e)))?;
        }
        if policy.lock_ttl_secs == 0 {
            return Err(ConfigError::Message(
                "Lock TTL must be positive".to_string(),
            ));
        }

        if policy.platform_fee > 0 {
            let address = policy.platform_fee_address.as_deref().ok_or_else(|| {
                ConfigError::Message("platform_fee requires platform_fee_address".to_string())
            })?;
            TransparentAddress::parse(address)
                .map_err(|e| ConfigError::Message(format!("Invalid platform fee address: {}", e)))?;
            if policy.platform_fee <= policy.dust_limit {
                return Err(ConfigError::Message(
                    "Platform fee must exceed the dust limit".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                enabled: false,
                host: "localhost".to_string(),
                port: 3306,
                user: "root".to_string(),
                password: "".to_string(),
                name: "zinscribe".to_string(),
                max_connections: 20,
            },
            zcash: ZcashConfig {
                rpc_url: "http://127.0.0.1:8232".to_string(),
                fallback_rpcs: vec![],
                rpc_proxy: None,
                rpc_user: None,
                rpc_password: None,
                request_timeout_secs: 30,
                epoch_cache_ttl_secs: 600,
                epoch_override: None,
            },
            indexer: IndexerConfig {
                url: "http://127.0.0.1:3000".to_string(),
                fallback_urls: vec![],
                request_timeout_secs: 10,
            },
            inscription: InscriptionConfig {
                per_action_fee: 5_000,
                fee_floor: 10_000,
                dust_limit: 546,
                default_inscription_value: 60_000,
                platform_fee: 0,
                platform_fee_address: None,
                lock_ttl_secs: 900,
                sweep_interval_secs: 60,
                max_body_size: 9_000,
                signer_key: None,
            },
        }
    }
}
