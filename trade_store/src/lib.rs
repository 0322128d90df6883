use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use scan_core::{ScanError, TokenDelta, TradeKind, TradeRecord, TradeSink};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Postgres-backed trade storage. The UNIQUE (signature, wallet_address)
/// constraint with insert-or-ignore is the correctness mechanism against
/// re-processing and concurrent double-submission; the duplicate pre-check
/// only saves round-trips.
#[derive(Debug, Clone)]
pub struct TradeStore {
    pool: PgPool,
}

impl TradeStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!("Trade store initialized");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id BIGSERIAL PRIMARY KEY,
                signature TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                token_mint TEXT NOT NULL,
                token_symbol TEXT NOT NULL,
                token_name TEXT NOT NULL,
                token_logo TEXT,
                token_delta DOUBLE PRECISION NOT NULL,
                sol_amount DOUBLE PRECISION NOT NULL,
                usd_value DOUBLE PRECISION NOT NULL,
                fee_sol DOUBLE PRECISION NOT NULL,
                block_time TIMESTAMPTZ NOT NULL,
                token_deltas TEXT,
                starred BOOLEAN NOT NULL DEFAULT FALSE,
                notes TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (signature, wallet_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_wallet ON trades (wallet_address)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_signature ON trades (signature)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_scans (
                wallet_address TEXT PRIMARY KEY,
                user_id TEXT,
                scan_completed BOOLEAN NOT NULL DEFAULT FALSE,
                last_error TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Duplicate lookup, signature-only and wallet-scoped
    pub async fn is_duplicate(&self, signature: &str, wallet_address: &str) -> Result<bool> {
        let global: Option<(i64,)> =
            sqlx::query_as("SELECT 1::BIGINT FROM trades WHERE signature = $1 LIMIT 1")
                .bind(signature)
                .fetch_optional(&self.pool)
                .await?;

        if global.is_some() {
            return Ok(true);
        }

        let scoped: Option<(i64,)> = sqlx::query_as(
            "SELECT 1::BIGINT FROM trades WHERE signature = $1 AND wallet_address = $2 LIMIT 1",
        )
        .bind(signature)
        .bind(wallet_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(scoped.is_some())
    }

    /// Insert one trade; returns false when the row already exists
    pub async fn store_trade(&self, user_id: &str, trade: &TradeRecord) -> Result<bool> {
        if self.is_duplicate(&trade.signature, &trade.wallet_address).await? {
            debug!(
                "Trade {} for wallet {} already stored, skipping",
                trade.signature, trade.wallet_address
            );
            return Ok(false);
        }

        let token_deltas_json = serde_json::to_string(&trade.token_deltas)?;

        let result = sqlx::query(
            r#"
            INSERT INTO trades
            (signature, wallet_address, user_id, kind, token_mint, token_symbol, token_name,
             token_logo, token_delta, sol_amount, usd_value, fee_sol, block_time, token_deltas)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (signature, wallet_address) DO NOTHING
            "#,
        )
        .bind(&trade.signature)
        .bind(&trade.wallet_address)
        .bind(user_id)
        .bind(trade.kind.as_str())
        .bind(&trade.token_mint)
        .bind(&trade.token_symbol)
        .bind(&trade.token_name)
        .bind(&trade.token_logo)
        .bind(decimal_to_f64(trade.token_delta))
        .bind(decimal_to_f64(trade.sol_amount))
        .bind(decimal_to_f64(trade.usd_value))
        .bind(decimal_to_f64(trade.fee_sol))
        .bind(trade.timestamp)
        .bind(token_deltas_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert a batch; duplicates and per-record failures are skipped so one
    /// bad row cannot sink the rest
    pub async fn store_all_trades(&self, user_id: &str, trades: &[TradeRecord]) -> Result<u32> {
        let mut inserted = 0u32;

        for trade in trades {
            match self.store_trade(user_id, trade).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Failed to store trade {} for wallet {}: {}",
                        trade.signature, trade.wallet_address, e
                    );
                }
            }
        }

        info!(
            "Stored {}/{} trades for user {}",
            inserted,
            trades.len(),
            user_id
        );
        Ok(inserted)
    }

    /// Starred trades for a wallet, newest first
    pub async fn get_starred_trades(&self, wallet_address: &str) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT signature, wallet_address, kind, token_mint, token_symbol, token_name,
                   token_logo, token_delta, sol_amount, usd_value, fee_sol, block_time,
                   token_deltas
            FROM trades
            WHERE wallet_address = $1 AND starred = TRUE
            ORDER BY block_time DESC
            "#,
        )
        .bind(wallet_address)
        .fetch_all(&self.pool)
        .await?;

        let mut trades = Vec::new();
        for row in rows {
            match row_to_trade(&row) {
                Ok(trade) => trades.push(trade),
                Err(e) => warn!("Skipping undecodable trade row: {}", e),
            }
        }

        Ok(trades)
    }

    pub async fn count_trades_for_wallet(&self, wallet_address: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM trades WHERE wallet_address = $1")
            .bind(wallet_address)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("count"))
    }

    pub async fn mark_scan_complete(&self, wallet_address: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_scans (wallet_address, user_id, scan_completed, last_error, updated_at)
            VALUES ($1, $2, TRUE, NULL, NOW())
            ON CONFLICT (wallet_address)
            DO UPDATE SET user_id = $2, scan_completed = TRUE, last_error = NULL, updated_at = NOW()
            "#,
        )
        .bind(wallet_address)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        debug!("Marked scan complete for wallet {}", wallet_address);
        Ok(())
    }

    pub async fn record_scan_error(&self, wallet_address: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_scans (wallet_address, scan_completed, last_error, updated_at)
            VALUES ($1, FALSE, $2, NOW())
            ON CONFLICT (wallet_address)
            DO UPDATE SET scan_completed = FALSE, last_error = $2, updated_at = NOW()
            "#,
        )
        .bind(wallet_address)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(0.0)
}

fn kind_from_str(kind: &str) -> TradeKind {
    match kind {
        "sell" => TradeKind::Sell,
        _ => TradeKind::Buy,
    }
}

fn row_to_trade(row: &sqlx::postgres::PgRow) -> Result<TradeRecord> {
    let kind: String = row.get("kind");
    let token_delta: f64 = row.get("token_delta");
    let sol_amount: f64 = row.get("sol_amount");
    let usd_value: f64 = row.get("usd_value");
    let fee_sol: f64 = row.get("fee_sol");
    let block_time: DateTime<Utc> = row.get("block_time");
    let token_deltas_json: Option<String> = row.get("token_deltas");

    let token_deltas: Vec<TokenDelta> = match token_deltas_json {
        Some(json) => serde_json::from_str(&json)?,
        None => vec![],
    };

    Ok(TradeRecord {
        signature: row.get("signature"),
        wallet_address: row.get("wallet_address"),
        timestamp: block_time,
        kind: kind_from_str(&kind),
        token_mint: row.get("token_mint"),
        token_symbol: row.get("token_symbol"),
        token_name: row.get("token_name"),
        token_logo: row.get("token_logo"),
        token_delta: Decimal::from_f64(token_delta).unwrap_or_default(),
        sol_amount: Decimal::from_f64(sol_amount).unwrap_or_default(),
        usd_value: Decimal::from_f64(usd_value).unwrap_or_default(),
        fee_sol: Decimal::from_f64(fee_sol).unwrap_or_default(),
        token_deltas,
    })
}

#[async_trait]
impl TradeSink for TradeStore {
    async fn store_trade(&self, user_id: &str, trade: &TradeRecord) -> scan_core::Result<bool> {
        TradeStore::store_trade(self, user_id, trade)
            .await
            .map_err(|e| ScanError::Store(e.to_string()))
    }

    async fn store_all_trades(
        &self,
        user_id: &str,
        trades: &[TradeRecord],
    ) -> scan_core::Result<u32> {
        TradeStore::store_all_trades(self, user_id, trades)
            .await
            .map_err(|e| ScanError::Store(e.to_string()))
    }

    async fn mark_scan_complete(&self, wallet: &str, user_id: &str) -> scan_core::Result<()> {
        TradeStore::mark_scan_complete(self, wallet, user_id)
            .await
            .map_err(|e| ScanError::Store(e.to_string()))
    }

    async fn record_scan_error(&self, wallet: &str, message: &str) -> scan_core::Result<()> {
        TradeStore::record_scan_error(self, wallet, message)
            .await
            .map_err(|e| ScanError::Store(e.to_string()))
    }
}
