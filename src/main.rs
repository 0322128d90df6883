use anyhow::{Context, Result};
use market_client::{
    RateLimiter, SolPriceClient, SolPriceClientConfig, TokenCatalogClient,
    TokenCatalogClientConfig,
};
use retry_guard::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use rpc_client::{RpcClient, RpcClientConfig};
use scan_config::SystemConfig;
use scan_orchestrator::{ScannerConfig, WalletScanner};
use std::sync::Arc;
use std::time::Duration;
use trade_store::TradeStore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let wallet = std::env::args()
        .nth(1)
        .context("usage: trade_tracker <wallet-address>")?;

    let config = SystemConfig::load()?;
    info!("Configuration loaded");

    // One breaker and one limiter shared by every upstream client
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: config.reliability.failure_threshold,
        cooldown: Duration::from_secs(config.reliability.cooldown_seconds),
    }));
    let policy = RetryPolicy {
        max_attempts: config.reliability.max_attempts,
        base_delay: Duration::from_millis(config.reliability.base_delay_ms),
        network_base_delay: Duration::from_millis(config.reliability.network_base_delay_ms),
        max_delay: Duration::from_millis(config.reliability.max_delay_ms),
    };
    let limiter = Arc::new(RateLimiter::new(
        config.tokens.max_requests_per_second,
        Duration::from_secs(1),
    ));

    let rpc = RpcClient::new(
        RpcClientConfig {
            endpoints: config.rpc.endpoints.clone(),
            request_timeout_seconds: config.rpc.request_timeout_seconds,
            signature_page_size: config.rpc.signature_page_size,
            page_delay_ms: config.rpc.page_delay_ms,
            max_supported_transaction_version: config.rpc.max_supported_transaction_version,
            min_native_move_sol: config.scanner.min_native_move_sol,
        },
        breaker.clone(),
        policy.clone(),
    )?;

    let catalog = TokenCatalogClient::new(
        TokenCatalogClientConfig {
            catalog_url: config.tokens.catalog_url.clone(),
            batch_size: config.tokens.batch_size,
            batch_delay_ms: config.tokens.batch_delay_ms,
            request_timeout_seconds: config.tokens.request_timeout_seconds,
            max_requests_per_second: config.tokens.max_requests_per_second,
        },
        limiter,
        breaker.clone(),
        policy.clone(),
    )?;

    let price = SolPriceClient::new(
        SolPriceClientConfig {
            api_base_url: config.price.api_base_url.clone(),
            request_timeout_seconds: config.price.request_timeout_seconds,
            fallback_price_usd: config.price.fallback_price_usd,
            max_lookback_days: config.price.max_lookback_days,
        },
        breaker.clone(),
        policy,
    )?;

    let store = if config.database.enabled {
        Some(TradeStore::new(&config.database.postgres_url).await?)
    } else {
        info!("Database disabled, trades will not be persisted");
        None
    };

    let scanner = WalletScanner::new(
        ScannerConfig {
            dust_threshold: config.scanner.dust_threshold,
            min_native_move_sol: config.scanner.min_native_move_sol,
            session_cache_ttl_minutes: config.scanner.session_cache_ttl_minutes,
            inter_item_delay_ms: config.scanner.inter_item_delay_ms,
            cutoff_unix: 0,
        },
        rpc,
        catalog,
        price,
        store,
    );

    let mut progress = scanner.subscribe_progress();
    tokio::spawn(async move {
        while let Ok(status) = progress.recv().await {
            info!(
                "[{}] {} ({}/{} signatures, {} trades)",
                status.wallet_address,
                status.current_step,
                status.processed_signatures,
                status.total_signatures,
                status.trades_found
            );
        }
    });

    let user_id = std::env::var("TRACKER_USER_ID").ok();
    let result = scanner
        .analyze_wallet_trades(&wallet, user_id.as_deref())
        .await?;

    println!();
    println!("Wallet {}", result.wallet_address);
    println!(
        "{} trades across {} tokens, {:.2} USD total volume",
        result.trade_count,
        result.unique_tokens.len(),
        result.total_volume_usd
    );
    println!();

    for trade in result.trades.iter().take(25) {
        println!(
            "{}  {:<4} {:>14.6} {:<12} {:>10.2} USD  {}",
            trade.timestamp.format("%Y-%m-%d %H:%M:%S"),
            trade.kind.as_str(),
            trade.token_delta,
            trade.token_symbol,
            trade.usd_value,
            trade.signature
        );
    }
    if result.trades.len() > 25 {
        println!("... and {} more", result.trades.len() - 25);
    }

    Ok(())
}
