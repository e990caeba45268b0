//! Trade reconstruction from executed-transaction balance deltas.
//!
//! Instruction formats differ across aggregator versions and multi-hop
//! routes, but the user's pre/post token balances always reflect the
//! realized effect net of fees and wrapping. The detector therefore
//! fetches execution metadata for classified signatures and reads the
//! trade shape out of the per-mint balance deltas.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::debug;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::config::RpcTransactionConfig;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey, signature::Signature};
use solana_transaction_status::{
    option_serializer::OptionSerializer, UiTransactionEncoding, UiTransactionTokenBalance,
};
use thiserror::Error;

use crate::{
    amounts::{self, micro_to_ui_string},
    classifier::Aggregator,
};

pub const USDC_MINT: Pubkey =
    solana_sdk::pubkey!("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v");

const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(2);
/// Strict dust floor: a one-micro-USDC wiggle is not a trade.
const MIN_USDC_DELTA_MICRO: i128 = 1;
/// How long a (signature, user) pair stays in the seen-set.
const SEEN_HORIZON: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("transaction metadata fetch failed: {0}")]
    Rpc(#[from] solana_rpc_client_api::client_error::Error),
    #[error("transaction metadata fetch timed out")]
    Timeout,
    #[error("executed transaction carries no metadata")]
    MissingMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "buy",
            TradeDirection::Sell => "sell",
        }
    }
}

/// A normalized swap observed for a watched wallet.
#[derive(Debug, Clone)]
pub struct DetectedTrade {
    pub signature: Signature,
    pub slot: u64,
    pub direction: TradeDirection,
    pub token_mint: Pubkey,
    /// USDC leg in micro-units; always positive.
    pub usdc_micro: u64,
    pub token_amount_raw: u128,
    pub token_decimals: u8,
    pub user: Pubkey,
    pub aggregator: Aggregator,
    pub detected_at: Instant,
    pub detected_at_ms: u64,
}

impl DetectedTrade {
    pub fn usdc_ui(&self) -> String {
        micro_to_ui_string(self.usdc_micro)
    }
}

/// One side of a user's token balance in execution metadata.
#[derive(Debug, Clone)]
struct BalanceRow {
    mint: Pubkey,
    owner: Pubkey,
    raw: i128,
    decimals: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct MintDelta {
    pre: i128,
    post: i128,
    decimals: u8,
    decimals_from_post: bool,
}

impl MintDelta {
    fn delta(&self) -> i128 {
        self.post - self.pre
    }
}

pub struct TradeDetector {
    rpc: Arc<RpcClient>,
    seen: Mutex<HashMap<(Signature, Pubkey), Instant>>,
}

impl TradeDetector {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Reconstruct the trade behind a classified signature, or `None` when
    /// the balance deltas do not describe a USDC-against-token swap.
    ///
    /// Each `(signature, user)` pair is evaluated at most once within the
    /// seen-set horizon; duplicate stream frames are dropped before any
    /// RPC traffic.
    pub async fn detect(
        &self,
        signature: Signature,
        slot: u64,
        aggregator: Aggregator,
        user: Pubkey,
    ) -> Result<Option<DetectedTrade>, DetectorError> {
        if !self.mark_seen(signature, user) {
            debug!("{signature} already evaluated for {user}; skipping");
            return Ok(None);
        }

        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::JsonParsed),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let fetched = tokio::time::timeout(
            METADATA_FETCH_TIMEOUT,
            self.rpc.get_transaction_with_config(&signature, config),
        )
        .await
        .map_err(|_| DetectorError::Timeout)??;

        let meta = fetched
            .transaction
            .meta
            .as_ref()
            .ok_or(DetectorError::MissingMeta)?;
        let pre = balance_rows(&meta.pre_token_balances);
        let post = balance_rows(&meta.post_token_balances);

        let now = Instant::now();
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Ok(reconstruct(&user, &pre, &post).map(|shape| DetectedTrade {
            signature,
            slot,
            direction: shape.direction,
            token_mint: shape.token_mint,
            usdc_micro: shape.usdc_micro,
            token_amount_raw: shape.token_amount_raw,
            token_decimals: shape.token_decimals,
            user,
            aggregator,
            detected_at: now,
            detected_at_ms: now_ms,
        }))
    }

    /// Insert into the seen-set, pruning expired pairs. Returns false when
    /// the pair was already present.
    fn mark_seen(&self, signature: Signature, user: Pubkey) -> bool {
        let mut seen = self.seen.lock().expect("seen-set poisoned");
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < SEEN_HORIZON);
        seen.insert((signature, user), now).is_none()
    }
}

fn balance_rows(
    balances: &OptionSerializer<Vec<UiTransactionTokenBalance>>,
) -> Vec<BalanceRow> {
    let list: Option<&Vec<UiTransactionTokenBalance>> = balances.as_ref().into();
    let Some(list) = list else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|balance| {
            let owner: Option<&String> = balance.owner.as_ref().into();
            let owner = Pubkey::from_str(owner?).ok()?;
            let mint = Pubkey::from_str(&balance.mint).ok()?;
            let raw = amounts::raw_str_to_i128(&balance.ui_token_amount.amount)?;
            Some(BalanceRow {
                mint,
                owner,
                raw,
                decimals: balance.ui_token_amount.decimals,
            })
        })
        .collect()
}

struct TradeShape {
    direction: TradeDirection,
    token_mint: Pubkey,
    usdc_micro: u64,
    token_amount_raw: u128,
    token_decimals: u8,
}

/// Core delta math: per-mint `post − pre` restricted to the user's rows,
/// then the USDC leg against the single dominant non-USDC leg.
fn reconstruct(user: &Pubkey, pre: &[BalanceRow], post: &[BalanceRow]) -> Option<TradeShape> {
    let mut per_mint: HashMap<Pubkey, MintDelta> = HashMap::new();

    for row in pre.iter().filter(|r| r.owner == *user) {
        let entry = per_mint.entry(row.mint).or_default();
        entry.pre += row.raw;
        if !entry.decimals_from_post {
            entry.decimals = row.decimals;
        }
    }
    for row in post.iter().filter(|r| r.owner == *user) {
        let entry = per_mint.entry(row.mint).or_default();
        entry.post += row.raw;
        entry.decimals = row.decimals;
        entry.decimals_from_post = true;
    }

    let usdc_delta = per_mint.get(&USDC_MINT).map(MintDelta::delta)?;
    if usdc_delta.abs() <= MIN_USDC_DELTA_MICRO {
        return None;
    }

    // Dominant non-USDC leg; multi-hop dust legs lose.
    let (token_mint, token_delta) = per_mint
        .iter()
        .filter(|(mint, delta)| **mint != USDC_MINT && delta.delta() != 0)
        .max_by_key(|(_, delta)| delta.delta().unsigned_abs())
        .map(|(mint, delta)| (*mint, *delta))?;

    let direction = if usdc_delta > 0 {
        TradeDirection::Sell
    } else {
        TradeDirection::Buy
    };

    Some(TradeShape {
        direction,
        token_mint,
        usdc_micro: u64::try_from(usdc_delta.unsigned_abs()).ok()?,
        token_amount_raw: token_delta.delta().unsigned_abs(),
        token_decimals: token_delta.decimals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(mint: Pubkey, owner: Pubkey, raw: i128, decimals: u8) -> BalanceRow {
        BalanceRow {
            mint,
            owner,
            raw,
            decimals,
        }
    }

    #[test]
    fn reconstructs_buy_from_deltas() {
        // $2.05 USDC out, 46_672_314_888 raw token units in.
        let user = Pubkey::new_unique();
        let token = Pubkey::new_unique();
        let pre = vec![
            row(USDC_MINT, user, 10_000_000, 6),
            row(token, user, 0, 9),
        ];
        let post = vec![
            row(USDC_MINT, user, 7_950_000, 6),
            row(token, user, 46_672_314_888, 9),
        ];

        let shape = reconstruct(&user, &pre, &post).unwrap();
        assert_eq!(shape.direction, TradeDirection::Buy);
        assert_eq!(shape.token_mint, token);
        assert_eq!(shape.usdc_micro, 2_050_000);
        assert_eq!(micro_to_ui_string(shape.usdc_micro), "2.05");
        assert_eq!(shape.token_amount_raw, 46_672_314_888);
        assert_eq!(shape.token_decimals, 9);
    }

    #[test]
    fn reconstructs_fee_adjusted_sell_as_net_received() {
        // USDC received net of fees: +1.154294; token leg −89_719_395_723.
        let user = Pubkey::new_unique();
        let token = Pubkey::new_unique();
        let pre = vec![
            row(USDC_MINT, user, 500_000, 6),
            row(token, user, 89_719_395_723, 6),
        ];
        let post = vec![
            row(USDC_MINT, user, 1_654_294, 6),
            row(token, user, 0, 6),
        ];

        let shape = reconstruct(&user, &pre, &post).unwrap();
        assert_eq!(shape.direction, TradeDirection::Sell);
        assert_eq!(shape.usdc_micro, 1_154_294);
        assert_eq!(micro_to_ui_string(shape.usdc_micro), "1.154294");
        assert_eq!(shape.token_amount_raw, 89_719_395_723);
    }

    #[test]
    fn other_owners_are_ignored() {
        let user = Pubkey::new_unique();
        let pool = Pubkey::new_unique();
        let token = Pubkey::new_unique();
        let pre = vec![
            row(USDC_MINT, pool, 1_000_000_000, 6),
            row(token, pool, 0, 6),
        ];
        let post = vec![
            row(USDC_MINT, pool, 998_000_000, 6),
            row(token, pool, 5_000_000, 6),
        ];
        assert!(reconstruct(&user, &pre, &post).is_none());
    }

    #[test]
    fn missing_usdc_leg_is_not_a_trade() {
        let user = Pubkey::new_unique();
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        let pre = vec![row(a, user, 100, 6), row(b, user, 0, 6)];
        let post = vec![row(a, user, 0, 6), row(b, user, 50, 6)];
        assert!(reconstruct(&user, &pre, &post).is_none());
    }

    #[test]
    fn dust_usdc_delta_is_not_a_trade() {
        let user = Pubkey::new_unique();
        let token = Pubkey::new_unique();
        let pre = vec![row(USDC_MINT, user, 100, 6), row(token, user, 0, 6)];
        let post = vec![row(USDC_MINT, user, 101, 6), row(token, user, 5, 6)];
        assert!(reconstruct(&user, &pre, &post).is_none());
    }

    #[test]
    fn dominant_leg_wins_over_routing_dust() {
        let user = Pubkey::new_unique();
        let hop = Pubkey::new_unique();
        let token = Pubkey::new_unique();
        let pre = vec![
            row(USDC_MINT, user, 5_000_000, 6),
            row(hop, user, 0, 9),
            row(token, user, 0, 6),
        ];
        let post = vec![
            row(USDC_MINT, user, 3_000_000, 6),
            row(hop, user, 3, 9),
            row(token, user, 1_000_000_000, 6),
        ];
        let shape = reconstruct(&user, &pre, &post).unwrap();
        assert_eq!(shape.token_mint, token);
        assert_eq!(shape.token_amount_raw, 1_000_000_000);
    }

    #[test]
    fn decimals_prefer_post_entries() {
        let user = Pubkey::new_unique();
        let token = Pubkey::new_unique();
        let pre = vec![
            row(USDC_MINT, user, 9_000_000, 6),
            row(token, user, 10, 0),
        ];
        let post = vec![
            row(USDC_MINT, user, 1_000_000, 6),
            row(token, user, 110, 8),
        ];
        let shape = reconstruct(&user, &pre, &post).unwrap();
        assert_eq!(shape.token_decimals, 8);
    }

    #[test]
    fn randomized_decimal_places_preserve_raw_magnitudes() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let user = Pubkey::new_unique();
        for _ in 0..50 {
            let token = Pubkey::new_unique();
            let decimals = rng.gen_range(0..=12u8);
            let spent: i128 = rng.gen_range(2..1_000_000_000);
            let received: i128 = rng.gen_range(1..u64::MAX as i128);
            let pre = vec![
                row(USDC_MINT, user, spent, 6),
                row(token, user, 0, decimals),
            ];
            let post = vec![
                row(USDC_MINT, user, 0, 6),
                row(token, user, received, decimals),
            ];
            let shape = reconstruct(&user, &pre, &post).unwrap();
            assert_eq!(shape.direction, TradeDirection::Buy);
            assert_eq!(shape.usdc_micro as i128, spent);
            assert_eq!(shape.token_amount_raw as i128, received);
            assert_eq!(shape.token_decimals, decimals);
        }
    }

    #[test]
    fn seen_set_blocks_second_evaluation() {
        let detector = TradeDetector::new(Arc::new(RpcClient::new(
            "http://localhost:8899".to_string(),
        )));
        let sig = Signature::from([7u8; 64]);
        let user = Pubkey::new_unique();
        assert!(detector.mark_seen(sig, user));
        assert!(!detector.mark_seen(sig, user));
        // A different user for the same signature is a distinct evaluation.
        assert!(detector.mark_seen(sig, Pubkey::new_unique()));
    }
}
