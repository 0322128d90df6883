use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parsed transaction as returned by getTransaction with jsonParsed encoding.
/// Only the fields the classifier consumes are modeled; everything else is
/// dropped during deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTransaction {
    #[serde(rename = "blockTime")]
    pub block_time: Option<i64>,

    pub slot: Option<u64>,

    pub meta: Option<TransactionMeta>,

    pub transaction: Option<TransactionBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionMeta {
    /// Non-null when the transaction failed on chain
    pub err: Option<Value>,

    /// Fee in lamports
    #[serde(default)]
    pub fee: u64,

    /// Lamport balances per account index before execution
    #[serde(rename = "preBalances", default)]
    pub pre_balances: Vec<u64>,

    /// Lamport balances per account index after execution
    #[serde(rename = "postBalances", default)]
    pub post_balances: Vec<u64>,

    #[serde(rename = "preTokenBalances")]
    pub pre_token_balances: Option<Vec<TokenBalance>>,

    #[serde(rename = "postTokenBalances")]
    pub post_token_balances: Option<Vec<TokenBalance>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalance {
    #[serde(rename = "accountIndex")]
    pub account_index: usize,

    pub mint: String,

    /// Owner of the token account; absent on some older transactions
    pub owner: Option<String>,

    #[serde(rename = "uiTokenAmount")]
    pub ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiTokenAmount {
    /// Human-scaled amount; null for zero balances on some providers
    #[serde(rename = "uiAmount")]
    pub ui_amount: Option<f64>,

    pub decimals: u8,

    /// Raw integer amount as a string
    #[serde(default)]
    pub amount: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionBody {
    #[serde(default)]
    pub signatures: Vec<String>,

    pub message: Option<TransactionMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionMessage {
    #[serde(rename = "accountKeys", default)]
    pub account_keys: Vec<AccountKey>,
}

/// Account key entry; jsonParsed encodes these as objects, plain json as
/// bare strings, so both shapes are accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Parsed {
        pubkey: String,
        #[serde(default)]
        signer: bool,
        #[serde(default)]
        writable: bool,
    },
    Plain(String),
}

impl AccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            AccountKey::Parsed { pubkey, .. } => pubkey,
            AccountKey::Plain(pubkey) => pubkey,
        }
    }
}

impl RawTransaction {
    /// First signature of the transaction, when present
    pub fn signature(&self) -> Option<&str> {
        self.transaction
            .as_ref()
            .and_then(|body| body.signatures.first())
            .map(|s| s.as_str())
    }

    /// Index of the wallet within the account keys
    pub fn account_index_of(&self, wallet: &str) -> Option<usize> {
        self.transaction
            .as_ref()
            .and_then(|body| body.message.as_ref())
            .and_then(|message| {
                message
                    .account_keys
                    .iter()
                    .position(|key| key.pubkey() == wallet)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_json_parsed_payload() {
        let payload = serde_json::json!({
            "blockTime": 1700000000,
            "slot": 250000000,
            "meta": {
                "err": null,
                "fee": 5000,
                "preBalances": [2000000000u64, 0],
                "postBalances": [1500000000u64, 0],
                "preTokenBalances": [
                    {
                        "accountIndex": 1,
                        "mint": "MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                        "owner": "WalletAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                        "uiTokenAmount": {"uiAmount": null, "decimals": 6, "amount": "0"}
                    }
                ],
                "postTokenBalances": [
                    {
                        "accountIndex": 1,
                        "mint": "MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                        "owner": "WalletAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                        "uiTokenAmount": {"uiAmount": 12.5, "decimals": 6, "amount": "12500000"}
                    }
                ]
            },
            "transaction": {
                "signatures": ["sig1"],
                "message": {
                    "accountKeys": [
                        {"pubkey": "WalletAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", "signer": true, "writable": true},
                        {"pubkey": "TokenAcctAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", "signer": false, "writable": true}
                    ]
                }
            }
        });

        let tx: RawTransaction = serde_json::from_value(payload).unwrap();
        assert_eq!(tx.signature(), Some("sig1"));
        assert_eq!(
            tx.account_index_of("WalletAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            Some(0)
        );

        let meta = tx.meta.unwrap();
        assert_eq!(meta.fee, 5000);
        let post = meta.post_token_balances.unwrap();
        assert_eq!(post[0].ui_token_amount.ui_amount, Some(12.5));
    }

    #[test]
    fn accepts_plain_string_account_keys() {
        let payload = serde_json::json!({
            "transaction": {
                "signatures": ["sig2"],
                "message": {"accountKeys": ["WalletB", "Other"]}
            }
        });

        let tx: RawTransaction = serde_json::from_value(payload).unwrap();
        assert_eq!(tx.account_index_of("Other"), Some(1));
    }
}
