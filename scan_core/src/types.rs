use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Direction of a classified trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeKind {
    /// SOL left the wallet in exchange for the token
    Buy,
    /// SOL entered the wallet in exchange for the token
    Sell,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "buy",
            TradeKind::Sell => "sell",
        }
    }
}

/// One signed token balance change observed in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDelta {
    /// Account index within the transaction's account keys
    pub account_index: usize,

    /// Token mint address
    pub mint: String,

    /// Owner of the token account, when the RPC reports it
    pub owner: Option<String>,

    /// Signed ui-amount change (post - pre)
    pub delta: f64,
}

/// One classified economic event for a wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Transaction signature (unique per wallet in the store)
    pub signature: String,

    /// Wallet under analysis
    pub wallet_address: String,

    /// Block time of the transaction
    pub timestamp: DateTime<Utc>,

    pub kind: TradeKind,

    /// Mint of the primary token change
    pub token_mint: String,

    /// Resolved display symbol (placeholder when the catalog misses)
    pub token_symbol: String,

    /// Resolved display name
    pub token_name: String,

    /// Logo URI when known
    pub token_logo: Option<String>,

    /// Signed quantity change of the primary token
    pub token_delta: Decimal,

    /// Absolute SOL moved, net of fee
    pub sol_amount: Decimal,

    /// USD value of the SOL moved, at the historical price for the trade date
    pub usd_value: Decimal,

    /// Transaction fee in SOL
    pub fee_sol: Decimal,

    /// Every qualifying token delta observed in the transaction; the primary
    /// one is duplicated here so multi-leg swaps remain inspectable
    pub token_deltas: Vec<TokenDelta>,
}

/// Aggregate of one wallet scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub wallet_address: String,

    /// Classified trades, newest first
    pub trades: Vec<TradeRecord>,

    /// Trades grouped by token mint
    pub trades_by_token: HashMap<String, Vec<TradeRecord>>,

    pub trade_count: u32,

    /// Sum of usd_value across all trades
    pub total_volume_usd: Decimal,

    /// Distinct token mints encountered
    pub unique_tokens: HashSet<String>,

    pub generated_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Build the aggregate from classified trades (any order; sorted newest
    /// first here)
    pub fn from_trades(wallet_address: &str, mut trades: Vec<TradeRecord>) -> Self {
        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut trades_by_token: HashMap<String, Vec<TradeRecord>> = HashMap::new();
        let mut unique_tokens = HashSet::new();
        let mut total_volume_usd = Decimal::ZERO;

        for trade in &trades {
            total_volume_usd += trade.usd_value;
            unique_tokens.insert(trade.token_mint.clone());
            trades_by_token
                .entry(trade.token_mint.clone())
                .or_default()
                .push(trade.clone());
        }

        Self {
            wallet_address: wallet_address.to_string(),
            trade_count: trades.len() as u32,
            trades,
            trades_by_token,
            total_volume_usd,
            unique_tokens,
            generated_at: Utc::now(),
        }
    }
}

/// Descriptor for a token mint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub mint: String,
    pub name: String,
    pub symbol: String,
    pub logo_uri: Option<String>,
}

impl TokenInfo {
    /// Synthesized descriptor for mints absent from the catalog: symbol is
    /// the first 8 characters of the mint followed by "...", no logo
    pub fn placeholder(mint: &str) -> Self {
        let head: String = mint.chars().take(8).collect();
        Self {
            mint: mint.to_string(),
            name: format!("Unknown Token ({})", head),
            symbol: format!("{}...", head),
            logo_uri: None,
        }
    }
}

/// Progress descriptor for one in-flight scan, pushed on every update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub wallet_address: String,
    pub total_signatures: usize,
    pub processed_signatures: usize,
    pub unique_tokens: usize,
    pub trades_found: usize,
    pub current_step: String,
    pub completed: bool,
}

impl ScanStatus {
    pub fn new(wallet_address: &str) -> Self {
        Self {
            wallet_address: wallet_address.to_string(),
            total_signatures: 0,
            processed_signatures: 0,
            unique_tokens: 0,
            trades_found: 0,
            current_step: "Starting scan".to_string(),
            completed: false,
        }
    }
}

/// One entry from the signature listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub signature: String,
    pub block_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn trade(signature: &str, mint: &str, usd: f64, ts_secs: i64) -> TradeRecord {
        TradeRecord {
            signature: signature.to_string(),
            wallet_address: "wallet".to_string(),
            timestamp: DateTime::from_timestamp(ts_secs, 0).unwrap(),
            kind: TradeKind::Buy,
            token_mint: mint.to_string(),
            token_symbol: "TOK".to_string(),
            token_name: "Token".to_string(),
            token_logo: None,
            token_delta: Decimal::ONE,
            sol_amount: Decimal::ONE,
            usd_value: Decimal::from_f64(usd).unwrap(),
            fee_sol: Decimal::ZERO,
            token_deltas: vec![],
        }
    }

    #[test]
    fn aggregate_counts_volume_and_tokens() {
        let result = AnalysisResult::from_trades(
            "wallet",
            vec![
                trade("sig1", "mintA", 10.0, 100),
                trade("sig2", "mintB", 5.0, 200),
                trade("sig3", "mintA", 2.5, 300),
            ],
        );

        assert_eq!(result.trade_count, 3);
        assert_eq!(result.unique_tokens.len(), 2);
        assert_eq!(result.total_volume_usd, Decimal::from_f64(17.5).unwrap());
        assert_eq!(result.trades_by_token["mintA"].len(), 2);
        // Newest first
        assert_eq!(result.trades[0].signature, "sig3");
    }

    #[test]
    fn placeholder_symbol_is_truncated_mint() {
        let info = TokenInfo::placeholder("AbCdEfGhIjKlMnOp");
        assert_eq!(info.symbol, "AbCdEfGh...");
        assert!(info.logo_uri.is_none());
    }
}
