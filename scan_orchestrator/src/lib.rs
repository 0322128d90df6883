use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use scan_core::{
    classify_transaction, is_valid_wallet_address, AnalysisResult, ChainSource, ClassifierConfig,
    NativePriceSource, Result, ScanError, ScanStatus, SignatureRecord, TokenInfo,
    TokenMetadataSource, TradeRecord, TradeSink,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Minimum absolute token delta treated as significant
    pub dust_threshold: f64,

    /// Minimum absolute SOL movement for a buy/sell decision
    pub min_native_move_sol: f64,

    /// Session result cache time-to-live in minutes
    pub session_cache_ttl_minutes: i64,

    /// Delay between per-signature fetches in milliseconds
    pub inter_item_delay_ms: u64,

    /// Signature cutoff as epoch seconds; 0 means no cutoff
    pub cutoff_unix: i64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            dust_threshold: 0.001,
            min_native_move_sol: 0.0001,
            session_cache_ttl_minutes: 30,
            inter_item_delay_ms: 120,
            cutoff_unix: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedAnalysis {
    result: AnalysisResult,
    stored_at: DateTime<Utc>,
}

/// The wallet scan pipeline: discover accounts, collect signatures, fetch
/// and classify transactions, resolve metadata and prices, aggregate, and
/// optionally persist. Generic over its upstream seams; every cache and the
/// breaker are owned or injected, nothing is process-global.
pub struct WalletScanner<C, M, P, S> {
    config: ScannerConfig,
    classifier_config: ClassifierConfig,
    chain: C,
    metadata: M,
    price: P,
    store: Option<S>,
    session_cache: Mutex<HashMap<String, CachedAnalysis>>,
    active_scans: Mutex<HashMap<String, watch::Sender<bool>>>,
    progress_tx: broadcast::Sender<ScanStatus>,
}

impl<C, M, P, S> WalletScanner<C, M, P, S>
where
    C: ChainSource,
    M: TokenMetadataSource,
    P: NativePriceSource,
    S: TradeSink,
{
    pub fn new(config: ScannerConfig, chain: C, metadata: M, price: P, store: Option<S>) -> Self {
        let classifier_config = ClassifierConfig {
            dust_threshold: config.dust_threshold,
            min_native_move_sol: config.min_native_move_sol,
        };
        let (progress_tx, _) = broadcast::channel(64);

        Self {
            config,
            classifier_config,
            chain,
            metadata,
            price,
            store,
            session_cache: Mutex::new(HashMap::new()),
            active_scans: Mutex::new(HashMap::new()),
            progress_tx,
        }
    }

    /// Subscribe to scan progress updates; statuses carry the wallet address
    /// so one receiver can watch several scans
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ScanStatus> {
        self.progress_tx.subscribe()
    }

    /// Request cancellation of an in-flight scan; checked at every
    /// suspension point
    pub async fn cancel_scan(&self, wallet_address: &str) {
        let scans = self.active_scans.lock().await;
        if let Some(flag) = scans.get(wallet_address) {
            info!("Cancellation requested for wallet {}", wallet_address);
            let _ = flag.send(true);
        }
    }

    /// Most recent non-expired result for the wallet
    pub async fn get_cached_analysis_result(&self, wallet_address: &str) -> Option<AnalysisResult> {
        let cache = self.session_cache.lock().await;
        cache.get(wallet_address).and_then(|cached| {
            if self.is_fresh(cached) {
                Some(cached.result.clone())
            } else {
                None
            }
        })
    }

    pub async fn clear_wallet_cache(&self, wallet_address: &str) {
        self.session_cache.lock().await.remove(wallet_address);
        debug!("Session cache cleared for wallet {}", wallet_address);
    }

    /// Drop the session cache plus the metadata and price caches
    pub async fn clear_all_caches(&self) {
        self.session_cache.lock().await.clear();
        self.metadata.clear_cache();
        self.price.clear_cache();
        info!("All caches cleared");
    }

    fn is_fresh(&self, cached: &CachedAnalysis) -> bool {
        let ttl = ChronoDuration::minutes(self.config.session_cache_ttl_minutes);
        Utc::now() - cached.stored_at < ttl
    }

    /// Pipeline entry point. Returns the cached result when still valid,
    /// otherwise runs the full scan and caches it; with a user id, the
    /// discovered trades are also persisted.
    pub async fn analyze_wallet_trades(
        &self,
        wallet_address: &str,
        user_id: Option<&str>,
    ) -> Result<AnalysisResult> {
        if !is_valid_wallet_address(wallet_address) {
            return Err(ScanError::InvalidWallet(wallet_address.to_string()));
        }

        if let Some(result) = self.get_cached_analysis_result(wallet_address).await {
            info!("Returning cached analysis for wallet {}", wallet_address);
            return Ok(result);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active_scans
            .lock()
            .await
            .insert(wallet_address.to_string(), cancel_tx);

        let mut status = ScanStatus::new(wallet_address);
        let outcome = self
            .run_scan(wallet_address, user_id, &cancel_rx, &mut status)
            .await;

        self.active_scans.lock().await.remove(wallet_address);

        match outcome {
            Ok(result) => {
                status.current_step = "Scan complete".to_string();
                status.completed = true;
                self.publish(&status);

                if let (Some(user_id), Some(store)) = (user_id, &self.store) {
                    if let Err(e) = store.mark_scan_complete(wallet_address, user_id).await {
                        warn!(
                            "Failed to record scan completion for {}: {}",
                            wallet_address, e
                        );
                    }
                }

                self.session_cache.lock().await.insert(
                    wallet_address.to_string(),
                    CachedAnalysis {
                        result: result.clone(),
                        stored_at: Utc::now(),
                    },
                );

                Ok(result)
            }
            Err(e) => {
                status.current_step = format!("Scan failed: {}", e);
                status.completed = true;
                self.publish(&status);

                if let Some(store) = &self.store {
                    if let Err(store_err) = store
                        .record_scan_error(wallet_address, &e.to_string())
                        .await
                    {
                        warn!(
                            "Failed to record scan error for {}: {}",
                            wallet_address, store_err
                        );
                    }
                }

                Err(e)
            }
        }
    }

    async fn run_scan(
        &self,
        wallet_address: &str,
        user_id: Option<&str>,
        cancel: &watch::Receiver<bool>,
        status: &mut ScanStatus,
    ) -> Result<AnalysisResult> {
        info!("Starting scan for wallet {}", wallet_address);

        self.step(status, "Discovering token accounts");
        let accounts = self.chain.discover_token_accounts(wallet_address).await?;
        self.check_cancelled(cancel)?;

        self.step(status, "Collecting signatures");
        let records = self
            .collect_all_signatures(wallet_address, &accounts, cancel)
            .await?;
        status.total_signatures = records.len();
        self.publish(status);

        self.step(status, "Classifying transactions");
        let observations = self
            .classify_signatures(wallet_address, &records, cancel, status)
            .await?;

        self.step(status, "Resolving token metadata");
        let mints: Vec<String> = {
            let mut seen = HashSet::new();
            observations
                .iter()
                .filter(|obs| seen.insert(obs.token_mint.clone()))
                .map(|obs| obs.token_mint.clone())
                .collect()
        };
        status.unique_tokens = mints.len();
        self.publish(status);

        let token_infos = self.metadata.ensure_tokens(&mints).await?;
        self.check_cancelled(cancel)?;

        self.step(status, "Valuing trades");
        let mut trades = Vec::with_capacity(observations.len());
        for observation in observations {
            let date = DateTime::from_timestamp(observation.block_time, 0)
                .unwrap_or_else(Utc::now)
                .date_naive();
            let price = self.price.sol_price_on(date).await?;

            let sol_amount =
                Decimal::from_f64(observation.sol_delta.abs()).unwrap_or_default();
            let info = token_infos
                .get(&observation.token_mint)
                .cloned()
                .unwrap_or_else(|| TokenInfo::placeholder(&observation.token_mint));

            trades.push(TradeRecord {
                signature: observation.signature,
                wallet_address: wallet_address.to_string(),
                timestamp: DateTime::from_timestamp(observation.block_time, 0)
                    .unwrap_or_else(Utc::now),
                kind: observation.kind,
                token_mint: observation.token_mint,
                token_symbol: info.symbol,
                token_name: info.name,
                token_logo: info.logo_uri,
                token_delta: Decimal::from_f64(observation.token_delta).unwrap_or_default(),
                sol_amount,
                usd_value: price * sol_amount,
                fee_sol: Decimal::from_f64(observation.fee_sol).unwrap_or_default(),
                token_deltas: observation.token_deltas,
            });
        }

        let result = AnalysisResult::from_trades(wallet_address, trades);
        info!(
            "Scan finished for wallet {}: {} trades across {} tokens, {} USD volume",
            wallet_address,
            result.trade_count,
            result.unique_tokens.len(),
            result.total_volume_usd
        );

        if let (Some(user_id), Some(store)) = (user_id, &self.store) {
            self.step(status, "Storing trades");
            match store.store_all_trades(user_id, &result.trades).await {
                Ok(inserted) => {
                    debug!(
                        "Persisted {} new trades for wallet {}",
                        inserted, wallet_address
                    );
                }
                Err(e) => {
                    // Persistence failures do not invalidate the analysis
                    warn!("Trade persistence failed for {}: {}", wallet_address, e);
                }
            }
        }

        Ok(result)
    }

    /// Root wallet first (unfiltered), then every discovered account
    /// (candidate-filtered), deduplicated by signature in arrival order
    async fn collect_all_signatures(
        &self,
        wallet_address: &str,
        accounts: &[String],
        cancel: &watch::Receiver<bool>,
    ) -> Result<Vec<SignatureRecord>> {
        let cutoff = self.config.cutoff_unix;
        let mut seen: HashSet<String> = HashSet::new();
        let mut records: Vec<SignatureRecord> = Vec::new();

        let root_records = self
            .chain
            .collect_signatures(wallet_address, cutoff, true)
            .await?;
        for record in root_records {
            if seen.insert(record.signature.clone()) {
                records.push(record);
            }
        }

        for account in accounts {
            self.check_cancelled(cancel)?;

            match self.chain.collect_signatures(account, cutoff, false).await {
                Ok(account_records) => {
                    for record in account_records {
                        if seen.insert(record.signature.clone()) {
                            records.push(record);
                        }
                    }
                }
                Err(e @ ScanError::Unavailable(_)) => return Err(e),
                Err(e) => {
                    warn!("Signature collection failed for account {}: {}", account, e);
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.inter_item_delay_ms)).await;
        }

        Ok(records)
    }

    async fn classify_signatures(
        &self,
        wallet_address: &str,
        records: &[SignatureRecord],
        cancel: &watch::Receiver<bool>,
        status: &mut ScanStatus,
    ) -> Result<Vec<scan_core::TradeObservation>> {
        let mut observations = Vec::new();

        for record in records {
            self.check_cancelled(cancel)?;

            let tx = match self.chain.fetch_transaction(&record.signature).await {
                Ok(Some(tx)) => Some(tx),
                Ok(None) => None,
                Err(e @ ScanError::Unavailable(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "Transaction fetch failed for {}: {}, skipping",
                        record.signature, e
                    );
                    None
                }
            };

            if let Some(tx) = tx {
                if let Some(mut observation) =
                    classify_transaction(&tx, wallet_address, &self.classifier_config)
                {
                    if observation.signature.is_empty() {
                        observation.signature = record.signature.clone();
                    }
                    if observation.block_time == 0 {
                        observation.block_time = record.block_time.unwrap_or_default();
                    }
                    observations.push(observation);
                    status.trades_found = observations.len();
                }
            }

            status.processed_signatures += 1;
            self.publish(status);

            tokio::time::sleep(Duration::from_millis(self.config.inter_item_delay_ms)).await;
        }

        Ok(observations)
    }

    fn step(&self, status: &mut ScanStatus, step: &str) {
        status.current_step = step.to_string();
        self.publish(status);
    }

    fn publish(&self, status: &ScanStatus) {
        // No receivers is fine; progress is best-effort
        let _ = self.progress_tx.send(status.clone());
    }

    fn check_cancelled(&self, cancel: &watch::Receiver<bool>) -> Result<()> {
        if *cancel.borrow() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scan_core::transaction::{
        AccountKey, RawTransaction, TokenBalance, TransactionBody, TransactionMessage,
        TransactionMeta, UiTokenAmount,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    const WALLET: &str = "Wa11etAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const MINT: &str = "MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    fn fast_config() -> ScannerConfig {
        ScannerConfig {
            inter_item_delay_ms: 0,
            ..ScannerConfig::default()
        }
    }

    fn buy_transaction(signature: &str) -> RawTransaction {
        RawTransaction {
            block_time: Some(1_700_000_000),
            slot: Some(1),
            meta: Some(TransactionMeta {
                err: None,
                fee: 5_000,
                pre_balances: vec![2_000_000_000, 2_039_280],
                post_balances: vec![1_000_000_000, 2_039_280],
                pre_token_balances: Some(vec![TokenBalance {
                    account_index: 1,
                    mint: MINT.to_string(),
                    owner: Some(WALLET.to_string()),
                    ui_token_amount: UiTokenAmount {
                        ui_amount: Some(0.0),
                        decimals: 6,
                        amount: String::new(),
                    },
                }]),
                post_token_balances: Some(vec![TokenBalance {
                    account_index: 1,
                    mint: MINT.to_string(),
                    owner: Some(WALLET.to_string()),
                    ui_token_amount: UiTokenAmount {
                        ui_amount: Some(100.0),
                        decimals: 6,
                        amount: String::new(),
                    },
                }]),
            }),
            transaction: Some(TransactionBody {
                signatures: vec![signature.to_string()],
                message: Some(TransactionMessage {
                    account_keys: vec![
                        AccountKey::Plain(WALLET.to_string()),
                        AccountKey::Plain("TokenAcct".to_string()),
                    ],
                }),
            }),
        }
    }

    struct MockChain {
        accounts: Vec<String>,
        signatures: Vec<SignatureRecord>,
        transactions: HashMap<String, RawTransaction>,
        discover_calls: AtomicUsize,
    }

    impl MockChain {
        fn empty() -> Self {
            Self {
                accounts: vec![],
                signatures: vec![],
                transactions: HashMap::new(),
                discover_calls: AtomicUsize::new(0),
            }
        }

        fn with_trade(signature: &str) -> Self {
            let tx = buy_transaction(signature);
            Self {
                accounts: vec!["TokenAcct".to_string()],
                signatures: vec![SignatureRecord {
                    signature: signature.to_string(),
                    block_time: Some(1_700_000_000),
                }],
                transactions: HashMap::from([(signature.to_string(), tx)]),
                discover_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainSource for MockChain {
        async fn discover_token_accounts(&self, _wallet: &str) -> Result<Vec<String>> {
            self.discover_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.accounts.clone())
        }

        async fn collect_signatures(
            &self,
            _account: &str,
            _cutoff_unix: i64,
            is_root: bool,
        ) -> Result<Vec<SignatureRecord>> {
            if is_root {
                Ok(self.signatures.clone())
            } else {
                Ok(vec![])
            }
        }

        async fn fetch_transaction(&self, signature: &str) -> Result<Option<RawTransaction>> {
            Ok(self.transactions.get(signature).cloned())
        }
    }

    struct MockMetadata;

    #[async_trait]
    impl TokenMetadataSource for MockMetadata {
        async fn ensure_tokens(&self, mints: &[String]) -> Result<HashMap<String, TokenInfo>> {
            Ok(mints
                .iter()
                .map(|m| (m.clone(), TokenInfo::placeholder(m)))
                .collect())
        }

        fn clear_cache(&self) {}
    }

    struct MockPrice;

    #[async_trait]
    impl NativePriceSource for MockPrice {
        async fn sol_price_on(&self, _date: chrono::NaiveDate) -> Result<Decimal> {
            Ok(Decimal::from(100))
        }

        fn clear_cache(&self) {}
    }

    /// In-memory sink enforcing the (signature, wallet) uniqueness the real
    /// store gets from its constraint
    #[derive(Default)]
    struct MockSink {
        rows: Arc<StdMutex<HashSet<(String, String)>>>,
        completions: Arc<StdMutex<Vec<String>>>,
        errors: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl TradeSink for MockSink {
        async fn store_trade(&self, _user_id: &str, trade: &TradeRecord) -> Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            Ok(rows.insert((trade.signature.clone(), trade.wallet_address.clone())))
        }

        async fn store_all_trades(&self, user_id: &str, trades: &[TradeRecord]) -> Result<u32> {
            let mut inserted = 0;
            for trade in trades {
                if self.store_trade(user_id, trade).await? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        }

        async fn mark_scan_complete(&self, wallet: &str, _user_id: &str) -> Result<()> {
            self.completions.lock().unwrap().push(wallet.to_string());
            Ok(())
        }

        async fn record_scan_error(&self, _wallet: &str, message: &str) -> Result<()> {
            self.errors.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn scanner(
        chain: MockChain,
        store: Option<MockSink>,
    ) -> WalletScanner<MockChain, MockMetadata, MockPrice, MockSink> {
        WalletScanner::new(fast_config(), chain, MockMetadata, MockPrice, store)
    }

    #[tokio::test]
    async fn invalid_wallet_is_rejected_before_any_call() {
        let scanner = scanner(MockChain::empty(), None);

        let result = scanner.analyze_wallet_trades("not-a-wallet", None).await;
        assert!(matches!(result, Err(ScanError::InvalidWallet(_))));
        assert_eq!(scanner.chain.discover_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_wallet_yields_empty_result() {
        let scanner = scanner(MockChain::empty(), None);

        let result = scanner.analyze_wallet_trades(WALLET, None).await.unwrap();
        assert_eq!(result.trade_count, 0);
        assert_eq!(result.total_volume_usd, Decimal::ZERO);
        assert!(result.unique_tokens.is_empty());
        assert!(result.trades.is_empty());
    }

    #[tokio::test]
    async fn scan_classifies_values_and_persists_a_trade() {
        let sink = MockSink::default();
        let rows = sink.rows.clone();
        let completions = sink.completions.clone();
        let scanner = scanner(MockChain::with_trade("sig1"), Some(sink));

        let result = scanner
            .analyze_wallet_trades(WALLET, Some("user-1"))
            .await
            .unwrap();

        assert_eq!(result.trade_count, 1);
        let trade = &result.trades[0];
        assert_eq!(trade.kind, scan_core::TradeKind::Buy);
        assert_eq!(trade.token_mint, MINT);
        // Placeholder metadata: first 8 chars + "..."
        assert_eq!(trade.token_symbol, "MintAAAA...");
        // ~1 SOL moved (0.999995 net of fee) at 100 USD
        let expected_sol = Decimal::from_f64(0.999995).unwrap();
        assert_eq!(trade.sol_amount, expected_sol);
        assert_eq!(trade.usd_value, Decimal::from(100) * expected_sol);

        assert_eq!(rows.lock().unwrap().len(), 1);
        assert_eq!(completions.lock().unwrap().as_slice(), [WALLET.to_string()]);
    }

    #[tokio::test]
    async fn repeated_persistence_is_idempotent() {
        let sink = MockSink::default();
        let rows = sink.rows.clone();
        let scanner = scanner(MockChain::with_trade("sig1"), Some(sink));

        scanner
            .analyze_wallet_trades(WALLET, Some("user-1"))
            .await
            .unwrap();
        scanner.clear_wallet_cache(WALLET).await;
        scanner
            .analyze_wallet_trades(WALLET, Some("user-1"))
            .await
            .unwrap();

        // Two full scans, still exactly one stored row per signature
        assert_eq!(rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cache_round_trip_and_invalidation() {
        let scanner = scanner(MockChain::with_trade("sig1"), None);

        assert!(scanner.get_cached_analysis_result(WALLET).await.is_none());

        let result = scanner.analyze_wallet_trades(WALLET, None).await.unwrap();
        assert_eq!(scanner.chain.discover_calls.load(Ordering::SeqCst), 1);

        let cached = scanner.get_cached_analysis_result(WALLET).await.unwrap();
        assert_eq!(cached.trade_count, result.trade_count);
        assert_eq!(cached.total_volume_usd, result.total_volume_usd);

        // A second analyze is served from the cache, no new discovery
        scanner.analyze_wallet_trades(WALLET, None).await.unwrap();
        assert_eq!(scanner.chain.discover_calls.load(Ordering::SeqCst), 1);

        scanner.clear_wallet_cache(WALLET).await;
        assert!(scanner.get_cached_analysis_result(WALLET).await.is_none());

        // And the next analyze hits the chain again
        scanner.analyze_wallet_trades(WALLET, None).await.unwrap();
        assert_eq!(scanner.chain.discover_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn progress_reports_terminal_completed_status() {
        let scanner = scanner(MockChain::with_trade("sig1"), None);
        let mut progress = scanner.subscribe_progress();

        scanner.analyze_wallet_trades(WALLET, None).await.unwrap();

        let mut last = None;
        while let Ok(status) = progress.try_recv() {
            last = Some(status);
        }

        let last = last.expect("at least one status update");
        assert!(last.completed);
        assert_eq!(last.current_step, "Scan complete");
        assert_eq!(last.trades_found, 1);
        assert_eq!(last.wallet_address, WALLET);
    }

    #[tokio::test]
    async fn cancel_flag_aborts_a_registered_scan() {
        let scanner = scanner(MockChain::empty(), None);

        // A cancel for an idle wallet is a no-op
        scanner.cancel_scan(WALLET).await;
        assert!(scanner.analyze_wallet_trades(WALLET, None).await.is_ok());

        // A pre-flipped flag aborts the pipeline at the first checkpoint
        let (tx, rx) = watch::channel(true);
        drop(tx);
        assert!(matches!(
            scanner.check_cancelled(&rx),
            Err(ScanError::Cancelled)
        ));
    }
}
