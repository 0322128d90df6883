use crate::transaction::{RawTransaction, TokenBalance};
use crate::types::{TokenDelta, TradeKind};
use crate::{LAMPORTS_PER_SOL, SYSTEM_PROGRAM_ID, TOKEN_PROGRAM_ID, WRAPPED_SOL_MINT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Thresholds for the balance-delta classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Minimum absolute token delta treated as significant
    pub dust_threshold: f64,

    /// Minimum absolute SOL movement for a buy/sell decision
    pub min_native_move_sol: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            dust_threshold: 0.001,
            min_native_move_sol: 0.0001,
        }
    }
}

/// Raw classification outcome, before token metadata and USD valuation
#[derive(Debug, Clone, PartialEq)]
pub struct TradeObservation {
    pub signature: String,
    pub block_time: i64,
    pub kind: TradeKind,

    /// Mint of the primary (largest-magnitude) token change
    pub token_mint: String,

    /// Signed ui-amount change of the primary token
    pub token_delta: f64,

    /// Signed SOL change for the wallet, net of fee
    pub sol_delta: f64,

    pub fee_sol: f64,

    /// All qualifying deltas, primary included
    pub token_deltas: Vec<TokenDelta>,
}

/// Decide whether a transaction is a qualifying trade for the wallet.
///
/// Returns None for anything that is not a trade: missing balance snapshots,
/// wrap/unwrap-only movement, dust, or SOL movement below the floor.
pub fn classify_transaction(
    tx: &RawTransaction,
    wallet: &str,
    config: &ClassifierConfig,
) -> Option<TradeObservation> {
    let meta = tx.meta.as_ref()?;

    // Both snapshots are required; a missing side means the deltas cannot
    // be trusted
    let pre = meta.pre_token_balances.as_ref()?;
    let post = meta.post_token_balances.as_ref()?;

    let deltas = compute_token_deltas(pre, post, config.dust_threshold);
    if deltas.is_empty() {
        return None;
    }

    let primary = deltas
        .iter()
        .max_by(|a, b| {
            a.delta
                .abs()
                .partial_cmp(&b.delta.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?
        .clone();

    let wallet_index = tx.account_index_of(wallet)?;
    let pre_lamports = *meta.pre_balances.get(wallet_index)? as i128;
    let post_lamports = *meta.post_balances.get(wallet_index)? as i128;

    // The first account pays the fee; add it back so a pure fee payment
    // nets to zero
    let fee_adjustment = if wallet_index == 0 { meta.fee as i128 } else { 0 };
    let sol_delta = (post_lamports - pre_lamports + fee_adjustment) as f64 / LAMPORTS_PER_SOL;

    if sol_delta.abs() < config.min_native_move_sol {
        debug!(
            "SOL move {:.9} below floor for wallet {}, not a trade",
            sol_delta, wallet
        );
        return None;
    }

    let kind = if sol_delta < 0.0 {
        TradeKind::Buy
    } else {
        TradeKind::Sell
    };

    let signature = tx.signature().unwrap_or_default().to_string();
    let block_time = tx.block_time.unwrap_or_default();
    let fee_sol = meta.fee as f64 / LAMPORTS_PER_SOL;

    debug!(
        "Classified {} as {:?}: primary token {} delta {:.6}, SOL delta {:.6}",
        signature, kind, primary.mint, primary.delta, sol_delta
    );

    Some(TradeObservation {
        signature,
        block_time,
        kind,
        token_mint: primary.mint,
        token_delta: primary.delta,
        sol_delta,
        fee_sol,
        token_deltas: deltas,
    })
}

/// Signed per-(account, mint) changes between the two snapshots, with dust,
/// wrapped SOL, and program-owned entries dropped
fn compute_token_deltas(
    pre: &[TokenBalance],
    post: &[TokenBalance],
    dust_threshold: f64,
) -> Vec<TokenDelta> {
    let mut pairs: HashMap<(usize, String), (f64, f64, Option<String>)> = HashMap::new();

    for balance in pre {
        let entry = pairs
            .entry((balance.account_index, balance.mint.clone()))
            .or_insert((0.0, 0.0, balance.owner.clone()));
        entry.0 = balance.ui_token_amount.ui_amount.unwrap_or(0.0);
    }

    for balance in post {
        let entry = pairs
            .entry((balance.account_index, balance.mint.clone()))
            .or_insert((0.0, 0.0, balance.owner.clone()));
        entry.1 = balance.ui_token_amount.ui_amount.unwrap_or(0.0);
        if entry.2.is_none() {
            entry.2 = balance.owner.clone();
        }
    }

    let mut deltas: Vec<TokenDelta> = pairs
        .into_iter()
        .filter_map(|((account_index, mint), (pre_amount, post_amount, owner))| {
            let delta = post_amount - pre_amount;

            if delta.abs() < dust_threshold {
                return None;
            }
            if mint == WRAPPED_SOL_MINT {
                return None;
            }
            if let Some(ref owner) = owner {
                if owner == TOKEN_PROGRAM_ID || owner == SYSTEM_PROGRAM_ID {
                    return None;
                }
            }

            Some(TokenDelta {
                account_index,
                mint,
                owner,
                delta,
            })
        })
        .collect();

    deltas.sort_by(|a, b| a.account_index.cmp(&b.account_index).then(a.mint.cmp(&b.mint)));
    deltas
}
