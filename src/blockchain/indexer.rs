use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::blockchain::traits::{InscriptionIndex, NamedProvider, Outpoint};
use crate::config::IndexerConfig;
use crate::error::{AppError, AppResult};

/// HTTP client for an ord-style inscription indexer
pub struct IndexerClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
}

/// Response of `GET /output/{outpoint}`
#[derive(Debug, Default, Deserialize)]
struct OutputInfo {
    #[serde(default)]
    inscriptions: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    inscribed: Option<bool>,
}

impl OutputInfo {
    fn is_inscribed(&self) -> AppResult<bool> {
        match (&self.inscriptions, self.inscribed) {
            (Some(list), _) => Ok(!list.is_empty()),
            (None, Some(flag)) => Ok(flag),
            (None, None) => Err(AppError::BlockchainError(
                "Indexer response has neither inscriptions nor inscribed".to_string(),
            )),
        }
    }
}

impl IndexerClient {
    pub fn new(name: impl Into<String>, base_url: &str, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::BlockchainError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_config(config: &IndexerConfig) -> AppResult<Vec<Self>> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        std::iter::once(&config.url)
            .chain(config.fallback_urls.iter())
            .enumerate()
            .map(|(i, url)| {
                let name = if i == 0 {
                    "indexer".to_string()
                } else {
                    format!("indexer-fallback-{}", i)
                };
                Self::new(name, url, timeout)
            })
            .collect()
    }

    fn output_url(&self, outpoint: &Outpoint) -> String {
        format!("{}/output/{}", self.base_url, outpoint)
    }
}

impl NamedProvider for IndexerClient {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl InscriptionIndex for IndexerClient {
    async fn is_output_inscribed(&self, outpoint: &Outpoint) -> AppResult<bool> {
        let response = self
            .http
            .get(self.output_url(outpoint))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AppError::BlockchainError(format!("Indexer request failed: {}", e)))?;

        // an output the indexer has never seen carries nothing
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(AppError::BlockchainError(format!(
                "Indexer returned HTTP {} for {}",
                response.status().as_u16(),
                outpoint
            )));
        }

        let info: OutputInfo = response
            .json()
            .await
            .map_err(|e| AppError::BlockchainError(format!("Failed to parse indexer response: {}", e)))?;
        info.is_inscribed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> AppResult<bool> {
        serde_json::from_str::<OutputInfo>(body).unwrap().is_inscribed()
    }

    #[test]
    fn test_response_shapes() {
        assert!(parse(r#"{"inscriptions":["abci0"],"value":10000}"#).unwrap());
        assert!(!parse(r#"{"inscriptions":[],"value":10000}"#).unwrap());
        assert!(parse(r#"{"inscribed":true}"#).unwrap());
        assert!(!parse(r#"{"inscribed":false}"#).unwrap());
        assert!(parse(r#"{"value":10000}"#).is_err());
    }

    #[test]
    fn test_output_url() {
        let client = IndexerClient::new("indexer", "http://idx.local/", Duration::from_secs(1)).unwrap();
        let outpoint: Outpoint =
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b:3".parse().unwrap();
        assert_eq!(
            client.output_url(&outpoint),
            "http://idx.local/output/4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b:3"
        );
    }
}
