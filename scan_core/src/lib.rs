pub mod classifier;
pub mod transaction;
pub mod types;

pub use classifier::{classify_transaction, ClassifierConfig, TradeObservation};
pub use transaction::{
    AccountKey, RawTransaction, TokenBalance, TransactionBody, TransactionMessage,
    TransactionMeta, UiTokenAmount,
};
pub use types::{
    AnalysisResult, ScanStatus, SignatureRecord, TokenDelta, TokenInfo, TradeKind, TradeRecord,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

/// Wrapped SOL mint; wrap/unwrap movements are not trades
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// SPL token program
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

/// System program
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Base58 wallet address format check, applied before any network call
pub fn is_valid_wallet_address(address: &str) -> bool {
    regex::Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$")
        .expect("static pattern")
        .is_match(address)
}

#[derive(Error, Debug, Clone)]
pub enum ScanError {
    #[error("Invalid wallet address: {0}")]
    InvalidWallet(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Token metadata error: {0}")]
    Metadata(String),
    #[error("Price lookup error: {0}")]
    Price(String),
    #[error("Persistence error: {0}")]
    Store(String),
    #[error("Service temporarily unavailable, retry in {0}s")]
    Unavailable(u64),
    #[error("Scan cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Upstream chain access the pipeline depends on
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// All token-holding accounts transitively associated with the wallet
    async fn discover_token_accounts(&self, wallet: &str) -> Result<Vec<String>>;

    /// Every signature for the account at or after the cutoff (0 = no cutoff),
    /// newest first. Non-root accounts are pre-filtered to trade candidates.
    async fn collect_signatures(
        &self,
        account: &str,
        cutoff_unix: i64,
        is_root: bool,
    ) -> Result<Vec<SignatureRecord>>;

    /// Full parsed transaction, or None when unavailable upstream
    async fn fetch_transaction(&self, signature: &str) -> Result<Option<RawTransaction>>;
}

/// Best-effort token descriptor resolution with a process-lifetime cache
#[async_trait]
pub trait TokenMetadataSource: Send + Sync {
    /// Resolve every mint to a TokenInfo, synthesizing placeholders for
    /// mints the catalog does not know
    async fn ensure_tokens(&self, mints: &[String]) -> Result<HashMap<String, TokenInfo>>;

    fn clear_cache(&self);
}

/// Historical native-currency price lookup
#[async_trait]
pub trait NativePriceSource: Send + Sync {
    /// SOL/USD close for the given calendar date; falls back to a fixed
    /// price (cached) when the market-data call fails
    async fn sol_price_on(&self, date: NaiveDate) -> Result<Decimal>;

    fn clear_cache(&self);
}

/// Durable trade storage
#[async_trait]
pub trait TradeSink: Send + Sync {
    /// Insert one trade; returns false when the (signature, wallet) row
    /// already exists
    async fn store_trade(&self, user_id: &str, trade: &TradeRecord) -> Result<bool>;

    /// Insert a batch, skipping duplicates and per-record failures; returns
    /// the number of rows actually written
    async fn store_all_trades(&self, user_id: &str, trades: &[TradeRecord]) -> Result<u32>;

    async fn mark_scan_complete(&self, wallet: &str, user_id: &str) -> Result<()>;

    async fn record_scan_error(&self, wallet: &str, message: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_base58_addresses() {
        assert!(is_valid_wallet_address(WRAPPED_SOL_MINT));
        assert!(is_valid_wallet_address(SYSTEM_PROGRAM_ID));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(!is_valid_wallet_address(""));
        assert!(!is_valid_wallet_address("too-short"));
        // 0, O, I and l are not in the base58 alphabet
        assert!(!is_valid_wallet_address("0OIl111111111111111111111111111111111111"));
        assert!(!is_valid_wallet_address(&"A".repeat(45)));
    }
}
