use async_trait::async_trait;
use retry_guard::{classify_status, guarded, CircuitBreaker, FailureKind, GuardError, RetryPolicy};
use reqwest::Client;
use scan_core::{ChainSource, RawTransaction, ScanError, SignatureRecord, LAMPORTS_PER_SOL};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RpcClientError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Service temporarily unavailable, retry in {0}s")]
    Unavailable(u64),
}

pub type Result<T> = std::result::Result<T, RpcClientError>;

/// RPC internal error that warrants one retry with the fallback encoding
const ENCODING_RETRY_CODE: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcClientConfig {
    /// Endpoint URLs, rotated round-robin on persistent failure
    pub endpoints: Vec<String>,
    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,
    /// Signatures per page (RPC maximum 1000)
    pub signature_page_size: u32,
    /// Delay between paginated requests in milliseconds
    pub page_delay_ms: u64,
    /// maxSupportedTransactionVersion for getTransaction
    pub max_supported_transaction_version: u32,
    /// Native-move floor used by the candidate pre-filter
    pub min_native_move_sol: f64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["https://api.mainnet-beta.solana.com".to_string()],
            request_timeout_seconds: 30,
            signature_page_size: 1000,
            page_delay_ms: 120,
            max_supported_transaction_version: 0,
            min_native_move_sol: 0.0001,
        }
    }
}

/// JSON-RPC envelope
#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignatureInfo {
    pub signature: String,
    #[serde(rename = "blockTime")]
    pub block_time: Option<i64>,
    pub err: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TokenAccountsResult {
    #[serde(default)]
    value: Vec<TokenAccountEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenAccountEntry {
    pubkey: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfoResult {
    value: Option<Value>,
}

/// JSON-RPC client for the chain endpoints, with every call routed through
/// the shared breaker and retry policy
pub struct RpcClient {
    config: RpcClientConfig,
    http_client: Client,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    endpoint_index: AtomicUsize,
    request_id_counter: AtomicU64,
}

fn classify_rpc_error(e: &RpcClientError) -> FailureKind {
    match e {
        RpcClientError::Http(err) => {
            if err.is_timeout() {
                FailureKind::Timeout
            } else if err.is_connect() {
                FailureKind::Connect
            } else if let Some(status) = err.status() {
                classify_status(status.as_u16())
            } else {
                FailureKind::Connect
            }
        }
        RpcClientError::Status(code) => classify_status(*code),
        _ => FailureKind::Fatal,
    }
}

impl RpcClient {
    pub fn new(
        config: RpcClientConfig,
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
            endpoint_index: AtomicUsize::new(0),
            request_id_counter: AtomicU64::new(1),
        })
    }

    fn current_endpoint(&self) -> &str {
        let index = self.endpoint_index.load(Ordering::Relaxed) % self.config.endpoints.len();
        &self.config.endpoints[index]
    }

    fn rotate_endpoint(&self) {
        if self.config.endpoints.len() > 1 {
            let index = self.endpoint_index.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Rotating RPC endpoint: {} -> {}",
                self.config.endpoints[index % self.config.endpoints.len()],
                self.config.endpoints[(index + 1) % self.config.endpoints.len()]
            );
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn rpc_request(&self, method: &str, params: &Value) -> Result<RpcResponse<Value>> {
        let request_body = json!({
            "jsonrpc": "2.0",
            "id": self.next_request_id(),
            "method": method,
            "params": params
        });

        let response = self
            .http_client
            .post(self.current_endpoint())
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RpcClientError::Status(response.status().as_u16()));
        }

        let rpc_response: RpcResponse<Value> = response.json().await?;
        Ok(rpc_response)
    }

    /// One guarded RPC call; the envelope's business error is surfaced after
    /// the transport-level retries
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let result = guarded(
            &self.breaker,
            &self.policy,
            || self.rpc_request(method, &params),
            classify_rpc_error,
        )
        .await;

        let response = match result {
            Ok(response) => response,
            Err(GuardError::Open { retry_in }) => {
                return Err(RpcClientError::Unavailable(retry_in.as_secs()))
            }
            Err(GuardError::Inner(e)) => {
                if classify_rpc_error(&e).is_retryable() {
                    self.rotate_endpoint();
                }
                return Err(e);
            }
        };

        if let Some(error) = response.error {
            return Err(RpcClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// getAccountInfo; None when the account does not exist
    pub async fn get_account_info(&self, address: &str) -> Result<Option<Value>> {
        let params = json!([address, {"encoding": "jsonParsed"}]);
        let result = self.call("getAccountInfo", params).await?;

        let info: AccountInfoResult = serde_json::from_value(result)?;
        Ok(info.value.filter(|v| !v.is_null()))
    }

    /// getTokenAccountsByOwner, jsonParsed, SPL token program
    pub async fn get_token_accounts_by_owner(&self, owner: &str) -> Result<Vec<String>> {
        let params = json!([
            owner,
            {"programId": scan_core::TOKEN_PROGRAM_ID},
            {"encoding": "jsonParsed"}
        ]);
        let result = self.call("getTokenAccountsByOwner", params).await?;

        let accounts: TokenAccountsResult = serde_json::from_value(result)?;
        Ok(accounts.value.into_iter().map(|a| a.pubkey).collect())
    }

    /// getSignaturesForAddress with before/limit paging parameters
    pub async fn get_signatures_for_address(
        &self,
        address: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SignatureInfo>> {
        let mut options = serde_json::Map::new();
        options.insert("limit".to_string(), json!(limit));
        options.insert("commitment".to_string(), json!("confirmed"));
        if let Some(before_sig) = before {
            options.insert("before".to_string(), json!(before_sig));
        }

        let result = self
            .call("getSignaturesForAddress", json!([address, options]))
            .await?;

        if result.is_null() {
            return Ok(vec![]);
        }

        let infos: Vec<SignatureInfo> = serde_json::from_value(result)?;
        Ok(infos)
    }

    /// getTransaction with the primary encoding, falling back once to plain
    /// json on the RPC internal-error code. Known free-tier timeouts are
    /// demoted to None so a single heavy transaction cannot sink a scan.
    pub async fn get_transaction(&self, signature: &str) -> Result<Option<RawTransaction>> {
        match self.get_transaction_encoded(signature, "jsonParsed").await {
            Ok(tx) => Ok(tx),
            Err(RpcClientError::Rpc { code, message }) if code == ENCODING_RETRY_CODE => {
                debug!(
                    "getTransaction {} failed with {} ({}), retrying with json encoding",
                    signature, code, message
                );
                self.get_transaction_encoded(signature, "json").await
            }
            Err(RpcClientError::Rpc { code, message }) if is_soft_timeout(&message) => {
                warn!(
                    "Transaction {} unavailable upstream ({}: {}), skipping",
                    signature, code, message
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_transaction_encoded(
        &self,
        signature: &str,
        encoding: &str,
    ) -> Result<Option<RawTransaction>> {
        let params = json!([
            signature,
            {
                "encoding": encoding,
                "commitment": "confirmed",
                "maxSupportedTransactionVersion": self.config.max_supported_transaction_version
            }
        ]);

        let result = self.call("getTransaction", params).await?;
        if result.is_null() {
            return Ok(None);
        }

        let tx: RawTransaction = serde_json::from_value(result)?;
        Ok(Some(tx))
    }

    /// Breadth-first traversal of token-holding accounts associated with the
    /// wallet. Each discovered account is queried in turn until the frontier
    /// empties; a failing account is logged once and skipped.
    pub async fn discover_token_accounts(&self, wallet: &str) -> Result<Vec<String>> {
        match self.get_account_info(wallet).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!("Wallet account {} not found on chain", wallet),
            Err(e @ RpcClientError::Unavailable(_)) => return Err(e),
            Err(e) => warn!("Account lookup failed for {}: {}", wallet, e),
        }

        let mut discovered = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([wallet.to_string()]);
        let mut logged_errors: HashSet<String> = HashSet::new();

        while let Some(owner) = queue.pop_front() {
            if !visited.insert(owner.clone()) {
                continue;
            }

            let accounts = match self.get_token_accounts_by_owner(&owner).await {
                Ok(accounts) => accounts,
                Err(e @ RpcClientError::Unavailable(_)) => return Err(e),
                Err(e) => {
                    let message = e.to_string();
                    if logged_errors.insert(message.clone()) {
                        warn!("Skipping account {} during discovery: {}", owner, message);
                    }
                    continue;
                }
            };

            for account in accounts {
                if !visited.contains(&account) && !discovered.contains(&account) {
                    discovered.push(account.clone());
                    queue.push_back(account);
                }
            }
        }

        info!(
            "Discovered {} token accounts for wallet {}",
            discovered.len(),
            wallet
        );
        Ok(discovered)
    }

    /// Every signature for the account at or after the cutoff, paginated
    /// newest first. Non-root accounts are pre-filtered down to trade
    /// candidates; the root wallet keeps everything for discovery
    /// bookkeeping.
    pub async fn collect_signatures(
        &self,
        account: &str,
        cutoff_unix: i64,
        is_root: bool,
    ) -> Result<Vec<SignatureRecord>> {
        let page_size = self.config.signature_page_size;
        let mut results: Vec<SignatureRecord> = Vec::new();
        let mut before: Option<String> = None;

        loop {
            let page = self
                .get_signatures_for_address(account, before.as_deref(), page_size)
                .await?;

            if page.is_empty() {
                break;
            }

            let mut reached_cutoff = false;
            for info in &page {
                if cutoff_unix > 0 {
                    if let Some(block_time) = info.block_time {
                        if block_time < cutoff_unix {
                            // Pages are newest first; everything beyond is older
                            reached_cutoff = true;
                            break;
                        }
                    }
                }

                results.push(SignatureRecord {
                    signature: info.signature.clone(),
                    block_time: info.block_time,
                });
            }

            if reached_cutoff || page.len() < page_size as usize {
                break;
            }

            before = Some(page.last().expect("non-empty page").signature.clone());
            tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
        }

        debug!(
            "Collected {} signatures for account {} (root: {})",
            results.len(),
            account,
            is_root
        );

        if is_root {
            return Ok(results);
        }

        self.filter_trade_candidates(account, results).await
    }

    /// Drop signatures whose transactions cannot be trades: no token balance
    /// change, or native movement below the floor. Saves the classifier from
    /// chewing through pure transfers on discovered token accounts.
    async fn filter_trade_candidates(
        &self,
        account: &str,
        records: Vec<SignatureRecord>,
    ) -> Result<Vec<SignatureRecord>> {
        let total = records.len();
        let mut candidates = Vec::new();

        for record in records {
            let tx = match self.get_transaction(&record.signature).await {
                Ok(Some(tx)) => tx,
                Ok(None) => continue,
                Err(e @ RpcClientError::Unavailable(_)) => return Err(e),
                Err(e) => {
                    debug!(
                        "Candidate check failed for {}: {}, dropping",
                        record.signature, e
                    );
                    continue;
                }
            };

            if is_trade_candidate(&tx, self.config.min_native_move_sol) {
                candidates.push(record);
            }

            tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
        }

        debug!(
            "Account {}: {}/{} signatures survive the candidate pre-filter",
            account,
            candidates.len(),
            total
        );
        Ok(candidates)
    }
}

/// Upstream responses that mean "this transaction is too heavy for the
/// current tier" rather than a real failure
fn is_soft_timeout(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("timed out") || lowered.contains("timeout")
}

/// Candidate check: some token balance moved and the native move clears the
/// floor
fn is_trade_candidate(tx: &RawTransaction, min_native_move_sol: f64) -> bool {
    let meta = match &tx.meta {
        Some(meta) => meta,
        None => return false,
    };

    let pre = match &meta.pre_token_balances {
        Some(pre) => pre,
        None => return false,
    };
    let post = match &meta.post_token_balances {
        Some(post) => post,
        None => return false,
    };

    let token_moved = pre.len() != post.len()
        || post.iter().any(|post_balance| {
            let pre_amount = pre
                .iter()
                .find(|p| {
                    p.account_index == post_balance.account_index
                        && p.mint == post_balance.mint
                })
                .and_then(|p| p.ui_token_amount.ui_amount)
                .unwrap_or(0.0);
            let post_amount = post_balance.ui_token_amount.ui_amount.unwrap_or(0.0);
            (post_amount - pre_amount).abs() > 0.0
        });

    if !token_moved {
        return false;
    }

    meta.pre_balances
        .iter()
        .zip(meta.post_balances.iter())
        .any(|(pre_lamports, post_lamports)| {
            let delta = (*post_lamports as i128 - *pre_lamports as i128) as f64 / LAMPORTS_PER_SOL;
            delta.abs() > min_native_move_sol
        })
}

#[async_trait]
impl ChainSource for RpcClient {
    async fn discover_token_accounts(&self, wallet: &str) -> scan_core::Result<Vec<String>> {
        RpcClient::discover_token_accounts(self, wallet)
            .await
            .map_err(into_scan_error)
    }

    async fn collect_signatures(
        &self,
        account: &str,
        cutoff_unix: i64,
        is_root: bool,
    ) -> scan_core::Result<Vec<SignatureRecord>> {
        RpcClient::collect_signatures(self, account, cutoff_unix, is_root)
            .await
            .map_err(into_scan_error)
    }

    async fn fetch_transaction(&self, signature: &str) -> scan_core::Result<Option<RawTransaction>> {
        RpcClient::get_transaction(self, signature)
            .await
            .map_err(into_scan_error)
    }
}

fn into_scan_error(e: RpcClientError) -> ScanError {
    match e {
        RpcClientError::Unavailable(secs) => ScanError::Unavailable(secs),
        other => ScanError::Rpc(other.to_string()),
    }
}
