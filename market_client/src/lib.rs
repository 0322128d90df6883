pub mod rate_limiter;
pub mod sol_price;
pub mod token_catalog;

pub use rate_limiter::RateLimiter;
pub use sol_price::{SolPriceClient, SolPriceClientConfig};
pub use token_catalog::{CatalogTokenEntry, TokenCatalogClient, TokenCatalogClientConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketClientError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("No price data in response")]
    NoPriceData,
}

pub type Result<T> = std::result::Result<T, MarketClientError>;

pub(crate) fn classify_market_error(e: &MarketClientError) -> retry_guard::FailureKind {
    match e {
        MarketClientError::Http(err) => {
            if err.is_timeout() {
                retry_guard::FailureKind::Timeout
            } else if err.is_connect() {
                retry_guard::FailureKind::Connect
            } else if let Some(status) = err.status() {
                retry_guard::classify_status(status.as_u16())
            } else {
                retry_guard::FailureKind::Connect
            }
        }
        MarketClientError::Status(code) => retry_guard::classify_status(*code),
        _ => retry_guard::FailureKind::Fatal,
    }
}
