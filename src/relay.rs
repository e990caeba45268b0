//! Block-engine bundle relay client.
//!
//! Bundles pair a tip transfer with the swap so the relay has an incentive
//! to include it. The same swap bytes also go out over plain RPC; the
//! chain deduplicates on signature, so at most one copy lands.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use jito_sdk_rust::JitoJsonRpcSDK;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde_json::json;
use solana_sdk::{
    hash::Hash,
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    signer::{keypair::Keypair, Signer},
    system_instruction,
    transaction::VersionedTransaction,
};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

const INIT_ATTEMPTS: u32 = 3;
const INIT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Well-known public tip accounts, used when the relay's own list cannot
/// be parsed.
const FALLBACK_TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay initialization failed: {0}")]
    Init(String),
    #[error("no tip accounts available")]
    NoTipAccounts,
    #[error("bundle construction failed: {0}")]
    BundleConstruction(String),
    #[error("bundle submission failed: {0}")]
    Submission(String),
}

pub struct BundleRelay {
    sdk: JitoJsonRpcSDK,
    tip_accounts: Vec<Pubkey>,
}

impl BundleRelay {
    /// Connect and fetch tip accounts, retrying with exponential backoff.
    /// Returns `None` after the final attempt; callers degrade to RPC-only.
    pub async fn connect_with_retry(endpoint: &str) -> Option<Self> {
        let mut backoff = INIT_BACKOFF_BASE;
        for attempt in 1..=INIT_ATTEMPTS {
            match Self::connect(endpoint).await {
                Ok(relay) => {
                    info!(
                        "bundle relay ready at {} with {} tip accounts",
                        endpoint,
                        relay.tip_accounts.len()
                    );
                    return Some(relay);
                }
                Err(err) => {
                    warn!(
                        "bundle relay init attempt {attempt}/{INIT_ATTEMPTS} failed: {err}"
                    );
                    if attempt < INIT_ATTEMPTS {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        warn!("bundle relay unavailable; submissions degrade to RPC only");
        None
    }

    async fn connect(endpoint: &str) -> Result<Self, RelayError> {
        let sdk = JitoJsonRpcSDK::new(endpoint, None);
        let response = sdk
            .get_tip_accounts()
            .await
            .map_err(|e| RelayError::Init(e.to_string()))?;

        let tip_accounts = parse_tip_accounts(&response).unwrap_or_else(|| {
            warn!("could not parse relay tip accounts; using well-known list");
            FALLBACK_TIP_ACCOUNTS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect()
        });
        if tip_accounts.is_empty() {
            return Err(RelayError::NoTipAccounts);
        }

        Ok(Self { sdk, tip_accounts })
    }

    pub fn random_tip_account(&self) -> Result<Pubkey, RelayError> {
        self.tip_accounts
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(RelayError::NoTipAccounts)
    }

    /// Submit `[tip transfer, swap]` as one bundle. The tip reuses the
    /// swap's blockhash, so no extra RPC round trip sits on the hot path.
    pub async fn submit(
        &self,
        operator: &Keypair,
        tip_lamports: u64,
        swap_tx: &VersionedTransaction,
    ) -> Result<String, RelayError> {
        let tip_account = self.random_tip_account()?;
        let blockhash = *swap_tx.message.recent_blockhash();
        let tip_tx = build_tip_transaction(operator, &tip_account, tip_lamports, blockhash)
            .map_err(|e| RelayError::BundleConstruction(e.to_string()))?;

        let encoded: Vec<String> = [&tip_tx, swap_tx]
            .iter()
            .map(|tx| {
                bincode::serialize(tx)
                    .map(|bytes| BASE64.encode(bytes))
                    .map_err(|e| RelayError::BundleConstruction(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let params = json!([encoded, { "encoding": "base64" }]);
        let response = self
            .sdk
            .send_bundle(Some(params), None)
            .await
            .map_err(|e| RelayError::Submission(e.to_string()))?;

        if let Some(error) = response.get("error") {
            return Err(RelayError::Submission(error.to_string()));
        }
        let bundle_id = response
            .get("result")
            .and_then(|result| {
                result
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| result.get("uuid")?.as_str().map(str::to_string))
                    .or_else(|| result.get("bundleId")?.as_str().map(str::to_string))
            })
            .ok_or_else(|| {
                RelayError::Submission(format!("no bundle id in response: {response}"))
            })?;

        debug!("bundle {bundle_id} accepted (tip {tip_lamports} lamports to {tip_account})");
        Ok(bundle_id)
    }
}

fn parse_tip_accounts(response: &serde_json::Value) -> Option<Vec<Pubkey>> {
    let accounts: Vec<Pubkey> = response
        .get("result")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .filter_map(|s| s.parse().ok())
        .collect();
    (!accounts.is_empty()).then_some(accounts)
}

fn build_tip_transaction(
    operator: &Keypair,
    tip_account: &Pubkey,
    lamports: u64,
    blockhash: Hash,
) -> Result<VersionedTransaction, solana_sdk::signer::SignerError> {
    let instruction = system_instruction::transfer(&operator.pubkey(), tip_account, lamports);
    let mut message = Message::new(&[instruction], Some(&operator.pubkey()));
    message.recent_blockhash = blockhash;
    VersionedTransaction::try_new(VersionedMessage::Legacy(message), &[operator])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tip_accounts_from_result_array() {
        let expected: Vec<Pubkey> = FALLBACK_TIP_ACCOUNTS
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let response = json!({ "result": FALLBACK_TIP_ACCOUNTS });
        assert_eq!(parse_tip_accounts(&response), Some(expected));
    }

    #[test]
    fn unparseable_tip_accounts_yield_none() {
        assert!(parse_tip_accounts(&json!({})).is_none());
        assert!(parse_tip_accounts(&json!({ "result": {} })).is_none());
        assert!(parse_tip_accounts(&json!({ "result": ["not-base58!"] })).is_none());
    }

    #[test]
    fn tip_transaction_reuses_swap_blockhash() {
        let operator = Keypair::new();
        let tip_account = Pubkey::new_unique();
        let blockhash = Hash::new_unique();
        let tx = build_tip_transaction(&operator, &tip_account, 1_000_000, blockhash).unwrap();
        assert_eq!(*tx.message.recent_blockhash(), blockhash);
        assert_eq!(tx.signatures.len(), 1);
    }
}
