use crate::rate_limiter::RateLimiter;
use crate::{classify_market_error, MarketClientError, Result};
use async_trait::async_trait;
use retry_guard::{guarded, CircuitBreaker, GuardError, RetryPolicy};
use reqwest::Client;
use scan_core::{ScanError, TokenInfo, TokenMetadataSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCatalogClientConfig {
    /// Endpoint returning the full tradable-token catalog
    pub catalog_url: String,
    /// Mints resolved per batch
    pub batch_size: usize,
    /// Fixed delay between batches in milliseconds
    pub batch_delay_ms: u64,
    /// Request timeout in seconds
    pub request_timeout_seconds: u64,
    /// Rolling-window request limit per second
    pub max_requests_per_second: usize,
}

impl Default for TokenCatalogClientConfig {
    fn default() -> Self {
        Self {
            catalog_url: "https://tokens.jup.ag/tokens?tags=verified".to_string(),
            batch_size: 50,
            batch_delay_ms: 250,
            request_timeout_seconds: 30,
            max_requests_per_second: 10,
        }
    }
}

/// One catalog row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogTokenEntry {
    pub address: String,
    pub name: String,
    pub symbol: String,
    #[serde(rename = "logoURI")]
    pub logo_uri: Option<String>,
    pub decimals: Option<u8>,
}

/// Batched, rate-limited token metadata loader with a process-lifetime cache.
/// Mints the catalog does not know resolve to placeholder descriptors; a
/// failed batch degrades to placeholders without aborting the rest.
pub struct TokenCatalogClient {
    config: TokenCatalogClientConfig,
    http_client: Client,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    cache: Arc<RwLock<HashMap<String, TokenInfo>>>,
}

impl TokenCatalogClient {
    pub fn new(
        config: TokenCatalogClientConfig,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
            limiter,
            breaker,
            policy,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Resolve every requested mint, loading uncached ones in batches
    pub async fn ensure_tokens(&self, mints: &[String]) -> Result<HashMap<String, TokenInfo>> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();

        {
            let cache = self.cache.read().expect("metadata cache poisoned");
            for mint in mints {
                match cache.get(mint) {
                    Some(info) => {
                        resolved.insert(mint.clone(), info.clone());
                    }
                    None => missing.push(mint.clone()),
                }
            }
        }

        if missing.is_empty() {
            return Ok(resolved);
        }

        debug!(
            "Token metadata: {} cached, {} to fetch in batches of {}",
            resolved.len(),
            missing.len(),
            self.config.batch_size
        );

        let batch_count = missing.chunks(self.config.batch_size).count();
        for (index, chunk) in missing.chunks(self.config.batch_size).enumerate() {
            let infos = match self.fetch_catalog().await {
                Ok(catalog) => resolve_batch(chunk, &catalog),
                Err(e) => {
                    warn!(
                        "Metadata batch {}/{} failed ({}), using placeholders",
                        index + 1,
                        batch_count,
                        e
                    );
                    chunk.iter().map(|m| TokenInfo::placeholder(m)).collect()
                }
            };

            {
                let mut cache = self.cache.write().expect("metadata cache poisoned");
                for info in &infos {
                    cache.insert(info.mint.clone(), info.clone());
                }
            }
            for info in infos {
                resolved.insert(info.mint.clone(), info);
            }

            if index + 1 < batch_count {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
        }

        info!("Resolved metadata for {} tokens", resolved.len());
        Ok(resolved)
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogTokenEntry>> {
        self.limiter.acquire().await;

        let result = guarded(
            &self.breaker,
            &self.policy,
            || async {
                let response = self
                    .http_client
                    .get(&self.config.catalog_url)
                    .send()
                    .await?;

                if !response.status().is_success() {
                    return Err(MarketClientError::Status(response.status().as_u16()));
                }

                let catalog: Vec<CatalogTokenEntry> = response.json().await?;
                Ok(catalog)
            },
            classify_market_error,
        )
        .await;

        match result {
            Ok(catalog) => Ok(catalog),
            Err(GuardError::Open { retry_in }) => Err(MarketClientError::Api(format!(
                "circuit open, retry in {}s",
                retry_in.as_secs()
            ))),
            Err(GuardError::Inner(e)) => Err(e),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.write().expect("metadata cache poisoned").clear();
        debug!("Token metadata cache cleared");
    }

    pub fn cache_size(&self) -> usize {
        self.cache.read().expect("metadata cache poisoned").len()
    }
}

/// Pick each requested mint out of the catalog, placeholder when absent
fn resolve_batch(chunk: &[String], catalog: &[CatalogTokenEntry]) -> Vec<TokenInfo> {
    chunk
        .iter()
        .map(|mint| {
            catalog
                .iter()
                .find(|entry| &entry.address == mint)
                .map(|entry| TokenInfo {
                    mint: entry.address.clone(),
                    name: entry.name.clone(),
                    symbol: entry.symbol.clone(),
                    logo_uri: entry.logo_uri.clone(),
                })
                .unwrap_or_else(|| TokenInfo::placeholder(mint))
        })
        .collect()
}

#[async_trait]
impl TokenMetadataSource for TokenCatalogClient {
    async fn ensure_tokens(
        &self,
        mints: &[String],
    ) -> scan_core::Result<HashMap<String, TokenInfo>> {
        TokenCatalogClient::ensure_tokens(self, mints)
            .await
            .map_err(|e| ScanError::Metadata(e.to_string()))
    }

    fn clear_cache(&self) {
        TokenCatalogClient::clear_cache(self)
    }
}

impl Clone for TokenCatalogClient {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            http_client: self.http_client.clone(),
            limiter: self.limiter.clone(),
            breaker: self.breaker.clone(),
            policy: self.policy.clone(),
            cache: self.cache.clone(),
        }
    }
}
