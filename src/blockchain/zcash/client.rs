use async_trait::async_trait;
use reqwest::Proxy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::blockchain::traits::{
    Broadcaster, EpochSource, FundingInput, NamedProvider, Outpoint, Txid, UtxoSource,
};
use crate::blockchain::zcash::transaction::txid_of;
use crate::config::ZcashConfig;
use crate::error::{AppError, AppResult};

/// Connection settings for one JSON-RPC endpoint
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub url: String,
    pub rpc_proxy: Option<String>,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub request_timeout: Duration,
}

/// JSON-RPC client for one zcashd / Zebra node
pub struct ZcashClient {
    name: String,
    settings: RpcSettings,
    http: reqwest::Client,
}

// JSON-RPC request/response types
#[derive(Debug, Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: T,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// UTXO from getaddressutxos RPC (Zebra compatible)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressUtxo {
    address: String,
    txid: String,
    output_index: u32,
    script: String,
    satoshis: u64,
}

/// Blockchain info from getblockchaininfo RPC
#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    consensus: ConsensusInfo,
}

/// Consensus info containing the current branch ID
#[derive(Debug, Deserialize)]
struct ConsensusInfo {
    /// Current chain tip consensus branch ID (hex string like "c8e71055")
    chaintip: String,
}

impl ZcashClient {
    /// Create a reqwest client with optional proxy support
    fn create_http_client(settings: &RpcSettings) -> AppResult<reqwest::Client> {
        let mut client_builder = reqwest::Client::builder().timeout(settings.request_timeout);

        if let Some(proxy) = &settings.rpc_proxy {
            if !proxy.is_empty() {
                let proxy = Proxy::all(proxy)
                    .map_err(|e| AppError::BlockchainError(format!("Invalid proxy URL: {}", e)))?;
                client_builder = client_builder.proxy(proxy);
                tracing::debug!("Zcash RPC proxy configured");
            }
        }

        client_builder
            .build()
            .map_err(|e| AppError::BlockchainError(format!("Failed to create HTTP client: {}", e)))
    }

    pub fn new(name: impl Into<String>, settings: RpcSettings) -> AppResult<Self> {
        let http = Self::create_http_client(&settings)?;
        Ok(Self {
            name: name.into(),
            settings,
            http,
        })
    }

    /// One client per configured endpoint, primary first
    pub fn from_config(config: &ZcashConfig) -> AppResult<Vec<Self>> {
        tracing::info!("Initializing Zcash client with RPC: {}", config.rpc_url);

        if config.rpc_proxy.is_some() {
            tracing::info!("Zcash RPC proxy enabled");
        }

        std::iter::once(&config.rpc_url)
            .chain(config.fallback_rpcs.iter())
            .enumerate()
            .map(|(i, url)| {
                let name = if i == 0 {
                    "zcash-rpc".to_string()
                } else {
                    format!("zcash-rpc-fallback-{}", i)
                };
                Self::new(
                    name,
                    RpcSettings {
                        url: url.clone(),
                        rpc_proxy: config.rpc_proxy.clone(),
                        rpc_user: config.rpc_user.clone(),
                        rpc_password: config.rpc_password.clone(),
                        request_timeout: Duration::from_secs(config.request_timeout_secs),
                    },
                )
            })
            .collect()
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let mut request_builder = self.http.post(&self.settings.url);

        // Add basic auth if configured
        if let (Some(user), Some(pass)) = (&self.settings.rpc_user, &self.settings.rpc_password) {
            request_builder = request_builder.basic_auth(user, Some(pass));
        }
        request_builder
    }

    async fn rpc_call<T: serde::de::DeserializeOwned, P: Serialize>(
        &self,
        method: &'static str,
        params: P,
    ) -> AppResult<T> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .request()
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::BlockchainError(format!("RPC request failed: {}", e)))?;

        let rpc_response: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|e| AppError::BlockchainError(format!("Failed to parse RPC response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(AppError::BlockchainError(format!(
                "RPC error {}: {}",
                error.code, error.message
            )));
        }

        rpc_response
            .result
            .ok_or_else(|| AppError::BlockchainError("Empty RPC response".to_string()))
    }

    /// Get UTXOs for an address using getaddressutxos RPC (Zebra compatible)
    async fn get_address_utxos(&self, address: &str) -> AppResult<Vec<AddressUtxo>> {
        let utxos: Vec<AddressUtxo> = self
            .rpc_call("getaddressutxos", (serde_json::json!({"addresses": [address]}),))
            .await?;

        tracing::debug!("Found {} UTXOs for address {}", utxos.len(), address);
        Ok(utxos)
    }

    /// Get blockchain info including the consensus branch ID
    async fn get_blockchain_info(&self) -> AppResult<BlockchainInfo> {
        // Use empty array for params, not ()
        let empty_params: [(); 0] = [];
        self.rpc_call("getblockchaininfo", empty_params).await
    }

    /// sendrawtransaction, reading the body by hand so an unexpected
    /// success shape still yields a txid
    async fn send_raw_transaction(&self, tx_bytes: &[u8]) -> AppResult<Txid> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: 1,
            method: "sendrawtransaction",
            params: (hex::encode(tx_bytes),),
        };

        let response = self
            .request()
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::BlockchainError(format!("RPC request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::BlockchainError(format!("Failed to read RPC response: {}", e)))?;

        if let Some(message) = rejection_message(&body) {
            return Err(AppError::BroadcastRejected(message));
        }
        if !status.is_success() {
            return Err(AppError::BroadcastRejected(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let local = txid_of(tx_bytes);
        match extract_txid(&body) {
            Some(txid) => {
                if txid != local {
                    tracing::warn!(
                        "Node reported txid {} but the transaction hashes to {}",
                        txid,
                        local
                    );
                }
                Ok(txid)
            }
            None => {
                tracing::warn!(
                    "Could not read a txid from broadcast response, using local txid {}",
                    local
                );
                Ok(local)
            }
        }
    }
}

/// JSON-RPC error object in a broadcast response, if any
fn rejection_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(message)
}

/// Pull a txid out of the many shapes nodes and relays answer with: a bare
/// JSON string, `result` as a string, `result.txid`, top-level `txid` or
/// `hash`, or a raw 64-character hex body
pub fn extract_txid(body: &str) -> Option<Txid> {
    let body = body.trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.as_str(),
            value.get("result").and_then(|r| r.as_str()),
            value
                .get("result")
                .and_then(|r| r.get("txid"))
                .and_then(|t| t.as_str()),
            value.get("txid").and_then(|t| t.as_str()),
            value.get("hash").and_then(|t| t.as_str()),
        ];
        return candidates
            .into_iter()
            .flatten()
            .find_map(|candidate| candidate.parse::<Txid>().ok());
    }

    body.trim_matches('"').parse::<Txid>().ok()
}

impl NamedProvider for ZcashClient {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl UtxoSource for ZcashClient {
    async fn fetch_spendable_inputs(&self, address: &str) -> AppResult<Vec<FundingInput>> {
        self.get_address_utxos(address)
            .await?
            .into_iter()
            .map(|utxo| {
                let script_pubkey = hex::decode(&utxo.script).map_err(|e| {
                    AppError::BlockchainError(format!("Invalid script hex in UTXO: {}", e))
                })?;
                Ok(FundingInput {
                    outpoint: Outpoint::new(utxo.txid.parse()?, utxo.output_index),
                    value: utxo.satoshis,
                    address: utxo.address,
                    script_pubkey,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EpochSource for ZcashClient {
    async fn current_epoch_id(&self) -> AppResult<u32> {
        let info = self.get_blockchain_info().await?;
        let chaintip = info.consensus.chaintip.trim_start_matches("0x");
        let branch_id = u32::from_str_radix(chaintip, 16).map_err(|e| {
            AppError::BlockchainError(format!(
                "Invalid consensus branch ID '{}': {}",
                info.consensus.chaintip, e
            ))
        })?;

        tracing::debug!("Consensus branch ID from {}: 0x{:08x}", self.name, branch_id);
        Ok(branch_id)
    }
}

#[async_trait]
impl Broadcaster for ZcashClient {
    async fn broadcast(&self, tx_bytes: &[u8]) -> AppResult<Txid> {
        tracing::info!("Broadcasting {} byte transaction via {}", tx_bytes.len(), self.name);
        self.send_raw_transaction(tx_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    #[test]
    fn test_extract_txid_shapes() {
        let expected: Txid = TXID.parse().unwrap();
        let bodies = [
            format!("\"{}\"", TXID),
            format!("{{\"result\":\"{}\",\"error\":null,\"id\":1}}", TXID),
            format!("{{\"result\":{{\"txid\":\"{}\"}}}}", TXID),
            format!("{{\"txid\":\"{}\"}}", TXID),
            format!("{{\"hash\":\"{}\"}}", TXID),
            format!("{}\n", TXID),
        ];
        for body in &bodies {
            assert_eq!(extract_txid(body), Some(expected), "{}", body);
        }
    }

    #[test]
    fn test_extract_txid_unknown_shape() {
        assert_eq!(extract_txid("{\"result\":true}"), None);
        assert_eq!(extract_txid("ok"), None);
        assert_eq!(extract_txid(""), None);
    }

    #[test]
    fn test_rejection_message() {
        let body = r#"{"result":null,"error":{"code":-26,"message":"min relay fee not met"},"id":1}"#;
        assert_eq!(rejection_message(body).as_deref(), Some("min relay fee not met"));
        assert_eq!(rejection_message(&format!("{{\"result\":\"{}\",\"error\":null}}", TXID)), None);
        assert_eq!(rejection_message(TXID), None);
    }

    #[test]
    fn test_clients_from_config() {
        let mut config = crate::config::AppConfig::default().zcash;
        config.fallback_rpcs = vec!["http://10.0.0.2:8232".to_string()];
        let clients = ZcashClient::from_config(&config).unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].name(), "zcash-rpc");
        assert_eq!(clients[1].name(), "zcash-rpc-fallback-1");
    }
}
