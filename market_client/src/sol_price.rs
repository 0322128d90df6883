use crate::{classify_market_error, MarketClientError, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use retry_guard::{guarded, CircuitBreaker, GuardError, RetryPolicy};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use scan_core::NativePriceSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolPriceClientConfig {
    /// Market-data API base URL
    pub api_base_url: String,
    /// Request timeout in seconds
    pub request_timeout_seconds: u64,
    /// Price returned and cached when the market-data call fails
    pub fallback_price_usd: f64,
    /// Ceiling on the lookback window requested from the series endpoint
    pub max_lookback_days: i64,
}

impl Default for SolPriceClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.coingecko.com/api/v3".to_string(),
            request_timeout_seconds: 30,
            fallback_price_usd: 150.0,
            max_lookback_days: 365,
        }
    }
}

/// Daily price series: (millisecond timestamp, price) pairs
#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    prices: Vec<(f64, f64)>,
}

/// Historical SOL/USD resolver with a per-date cache. Failures resolve to a
/// fixed fallback that is cached too, so one bad day is fetched at most once
/// per session.
pub struct SolPriceClient {
    config: SolPriceClientConfig,
    http_client: Client,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    cache: Arc<RwLock<HashMap<NaiveDate, Decimal>>>,
}

impl SolPriceClient {
    pub fn new(
        config: SolPriceClientConfig,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
            breaker,
            policy,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// SOL/USD price for the given calendar date
    pub async fn sol_price_on(&self, date: NaiveDate) -> Decimal {
        if let Some(price) = self
            .cache
            .read()
            .expect("price cache poisoned")
            .get(&date)
            .copied()
        {
            debug!("Price cache hit for {}: {}", date, price);
            return price;
        }

        let price = match self.fetch_price_for_date(date).await {
            Ok(price) => price,
            Err(e) => {
                let fallback = Decimal::from_f64(self.config.fallback_price_usd)
                    .unwrap_or_else(|| Decimal::from(150));
                warn!(
                    "Historical price lookup failed for {} ({}), using fallback {}",
                    date, e, fallback
                );
                fallback
            }
        };

        self.cache
            .write()
            .expect("price cache poisoned")
            .insert(date, price);
        price
    }

    async fn fetch_price_for_date(&self, date: NaiveDate) -> Result<Decimal> {
        let today = Utc::now().date_naive();
        let days_ago = (today - date).num_days().clamp(1, self.config.max_lookback_days);

        let url = format!(
            "{}/coins/solana/market_chart?vs_currency=usd&days={}&interval=daily",
            self.config.api_base_url, days_ago
        );

        let result = guarded(
            &self.breaker,
            &self.policy,
            || async {
                let response = self.http_client.get(&url).send().await?;

                if !response.status().is_success() {
                    return Err(MarketClientError::Status(response.status().as_u16()));
                }

                let chart: MarketChartResponse = response.json().await?;
                Ok(chart)
            },
            classify_market_error,
        )
        .await;

        let chart = match result {
            Ok(chart) => chart,
            Err(GuardError::Open { retry_in }) => {
                return Err(MarketClientError::Api(format!(
                    "circuit open, retry in {}s",
                    retry_in.as_secs()
                )))
            }
            Err(GuardError::Inner(e)) => return Err(e),
        };

        let target_ms = date
            .and_hms_opt(12, 0, 0)
            .expect("valid time")
            .and_utc()
            .timestamp_millis() as f64;

        let price =
            nearest_price(&chart.prices, target_ms).ok_or(MarketClientError::NoPriceData)?;

        debug!("Resolved SOL/USD for {}: {}", date, price);
        Decimal::from_f64(price).ok_or(MarketClientError::NoPriceData)
    }

    pub fn clear_cache(&self) {
        self.cache.write().expect("price cache poisoned").clear();
        debug!("Price cache cleared");
    }

    #[cfg(test)]
    fn cached(&self, date: NaiveDate) -> Option<Decimal> {
        self.cache
            .read()
            .expect("price cache poisoned")
            .get(&date)
            .copied()
    }
}

/// Series point with minimum time distance to the target
fn nearest_price(series: &[(f64, f64)], target_ms: f64) -> Option<f64> {
    series
        .iter()
        .min_by(|a, b| {
            (a.0 - target_ms)
                .abs()
                .partial_cmp(&(b.0 - target_ms).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|point| point.1)
}

#[async_trait]
impl NativePriceSource for SolPriceClient {
    async fn sol_price_on(&self, date: NaiveDate) -> scan_core::Result<Decimal> {
        Ok(SolPriceClient::sol_price_on(self, date).await)
    }

    fn clear_cache(&self) {
        SolPriceClient::clear_cache(self)
    }
}

impl Clone for SolPriceClient {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            http_client: self.http_client.clone(),
            breaker: self.breaker.clone(),
            policy: self.policy.clone(),
            cache: self.cache.clone(),
        }
    }
}
