//! In-memory position ledger with average-cost accounting and risk gating.
//!
//! All USDC values are integer micro-units. Mutations run inside one
//! short critical section with no await points, so the `can_trade →
//! record_*` sequence serializes against concurrent copies of the same
//! mint.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use log::info;
use serde::Serialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};

use crate::{
    amounts::{micro_to_ui_string, MICRO_PER_USDC},
    detector::TradeDirection,
    events::{EngineEvent, EventBus},
};

/// Fraction of a limit at which a pre-trade warning is emitted.
const LIMIT_WARNING_THRESHOLD: f64 = 0.80;

#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub max_position_micro: u64,
    pub max_total_exposure_micro: u64,
    pub max_open_positions: usize,
    pub min_usdc_reserve_micro: u64,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub token_mint: Pubkey,
    pub amount_raw: u128,
    pub total_cost_micro: u64,
    pub token_decimals: u8,
    pub entry_time: SystemTime,
    pub signatures: Vec<Signature>,
    pub buy_count: u32,
    pub sell_count: u32,
}

impl Position {
    /// Average entry price in USDC per UI token unit. Cost and amount are
    /// both scaled into UI units before dividing.
    pub fn avg_entry_price_usdc(&self) -> f64 {
        if self.amount_raw == 0 {
            return 0.0;
        }
        let cost_ui = self.total_cost_micro as f64 / MICRO_PER_USDC as f64;
        let amount_ui = self.amount_raw as f64 / 10f64.powi(self.token_decimals as i32);
        cost_ui / amount_ui
    }

    pub fn held_for(&self) -> std::time::Duration {
        self.entry_time.elapsed().unwrap_or_default()
    }
}

/// Serializable view of a position for outbound events.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub token_mint: String,
    pub amount_raw: u128,
    pub total_cost_usdc: String,
    pub avg_entry_price_usdc: f64,
    pub entry_time_ms: u64,
    pub buy_count: u32,
    pub sell_count: u32,
}

impl From<&Position> for PositionSnapshot {
    fn from(position: &Position) -> Self {
        Self {
            token_mint: position.token_mint.to_string(),
            amount_raw: position.amount_raw,
            total_cost_usdc: micro_to_ui_string(position.total_cost_micro),
            avg_entry_price_usdc: position.avg_entry_price_usdc(),
            entry_time_ms: position
                .entry_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            buy_count: position.buy_count,
            sell_count: position.sell_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeDecision {
    Allow,
    Reject(String),
}

impl TradeDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TradeDecision::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct SellOutcome {
    pub realized_pnl_micro: i128,
    pub closed: bool,
}

pub struct PositionLedger {
    limits: RiskLimits,
    positions: Mutex<HashMap<Pubkey, Position>>,
    events: EventBus,
}

impl PositionLedger {
    pub fn new(limits: RiskLimits, events: EventBus) -> Self {
        Self {
            limits,
            positions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Pre-trade risk gate. Rejections carry the human-readable reason;
    /// passing trades may still emit a `limit_warning` when the post-trade
    /// value reaches 80% of a limit.
    pub fn can_trade(
        &self,
        token_mint: &Pubkey,
        direction: TradeDirection,
        amount_micro: u64,
        current_usdc_balance_micro: u64,
    ) -> TradeDecision {
        let positions = self.positions.lock().expect("ledger poisoned");

        match direction {
            TradeDirection::Sell => {
                if positions.contains_key(token_mint) {
                    TradeDecision::Allow
                } else {
                    TradeDecision::Reject(format!("no open position for {token_mint}"))
                }
            }
            TradeDirection::Buy => {
                let remaining = current_usdc_balance_micro.saturating_sub(amount_micro);
                if remaining < self.limits.min_usdc_reserve_micro {
                    return TradeDecision::Reject(format!(
                        "would leave USDC below minimum reserve ${}",
                        micro_to_ui_string(self.limits.min_usdc_reserve_micro)
                    ));
                }

                let position_cost = positions
                    .get(token_mint)
                    .map(|p| p.total_cost_micro)
                    .unwrap_or(0);
                let new_position_cost = position_cost.saturating_add(amount_micro);
                if new_position_cost > self.limits.max_position_micro {
                    return TradeDecision::Reject(format!(
                        "position cost ${} would exceed per-position limit ${}",
                        micro_to_ui_string(new_position_cost),
                        micro_to_ui_string(self.limits.max_position_micro)
                    ));
                }

                let exposure: u64 = positions.values().map(|p| p.total_cost_micro).sum();
                let new_exposure = exposure.saturating_add(amount_micro);
                if new_exposure > self.limits.max_total_exposure_micro {
                    return TradeDecision::Reject(format!(
                        "total exposure ${} would exceed limit ${}",
                        micro_to_ui_string(new_exposure),
                        micro_to_ui_string(self.limits.max_total_exposure_micro)
                    ));
                }

                let opens_new = !positions.contains_key(token_mint);
                if opens_new && positions.len() + 1 > self.limits.max_open_positions {
                    return TradeDecision::Reject(format!(
                        "open positions at cap {}",
                        self.limits.max_open_positions
                    ));
                }

                drop(positions);
                self.warn_near_limits(new_position_cost, new_exposure);
                TradeDecision::Allow
            }
        }
    }

    fn warn_near_limits(&self, position_cost: u64, exposure: u64) {
        let near = |value: u64, limit: u64| {
            limit > 0 && value as f64 >= limit as f64 * LIMIT_WARNING_THRESHOLD
        };
        if near(position_cost, self.limits.max_position_micro) {
            self.events.publish(EngineEvent::limit_warning(
                "per_position",
                position_cost,
                self.limits.max_position_micro,
            ));
        }
        if near(exposure, self.limits.max_total_exposure_micro) {
            self.events.publish(EngineEvent::limit_warning(
                "total_exposure",
                exposure,
                self.limits.max_total_exposure_micro,
            ));
        }
    }

    /// Create or grow a position at weighted-average cost.
    pub fn record_buy(
        &self,
        token_mint: Pubkey,
        token_amount_raw: u128,
        usdc_spent_micro: u64,
        token_decimals: u8,
        signature: Signature,
    ) {
        let mut positions = self.positions.lock().expect("ledger poisoned");
        let (snapshot, opened) = match positions.get_mut(&token_mint) {
            Some(position) => {
                position.amount_raw += token_amount_raw;
                position.total_cost_micro += usdc_spent_micro;
                position.token_decimals = token_decimals;
                position.signatures.push(signature);
                position.buy_count += 1;
                (PositionSnapshot::from(&*position), false)
            }
            None => {
                let position = Position {
                    token_mint,
                    amount_raw: token_amount_raw,
                    total_cost_micro: usdc_spent_micro,
                    token_decimals,
                    entry_time: SystemTime::now(),
                    signatures: vec![signature],
                    buy_count: 1,
                    sell_count: 0,
                };
                let snapshot = PositionSnapshot::from(&position);
                positions.insert(token_mint, position);
                (snapshot, true)
            }
        };
        drop(positions);

        info!(
            "{} {} | amount_raw={} cost=${} avg={:.9}",
            if opened { "position opened" } else { "position updated" },
            token_mint,
            snapshot.amount_raw,
            snapshot.total_cost_usdc,
            snapshot.avg_entry_price_usdc
        );
        self.events.publish(if opened {
            EngineEvent::PositionOpened { position: snapshot }
        } else {
            EngineEvent::PositionUpdated { position: snapshot }
        });
    }

    /// Reduce a position, realizing P&L against the proportional cost
    /// basis. Fully sold positions are removed.
    pub fn record_sell(
        &self,
        token_mint: &Pubkey,
        token_amount_raw: u128,
        usdc_received_micro: u64,
        signature: Signature,
    ) -> Option<SellOutcome> {
        let mut positions = self.positions.lock().expect("ledger poisoned");
        let position = positions.get_mut(token_mint)?;

        let sold_raw = token_amount_raw.min(position.amount_raw);
        if sold_raw == 0 || position.amount_raw == 0 {
            return None;
        }
        // Proportional cost basis in integer math.
        let cost_basis_micro = ((position.total_cost_micro as u128 * sold_raw)
            / position.amount_raw) as u64;
        let realized_pnl_micro = usdc_received_micro as i128 - cost_basis_micro as i128;

        position.amount_raw -= sold_raw;
        position.total_cost_micro = position.total_cost_micro.saturating_sub(cost_basis_micro);
        position.signatures.push(signature);
        position.sell_count += 1;

        let closed = position.amount_raw == 0;
        if closed {
            // Paired deletion keeps cost zero exactly when amount is zero.
            position.total_cost_micro = 0;
        }
        let snapshot = PositionSnapshot::from(&*position);
        if closed {
            positions.remove(token_mint);
        }
        drop(positions);

        let pnl_pct = if cost_basis_micro > 0 {
            realized_pnl_micro as f64 / cost_basis_micro as f64 * 100.0
        } else {
            0.0
        };
        if closed {
            info!(
                "position closed {token_mint} | pnl={}{} ({pnl_pct:.2}%)",
                if realized_pnl_micro < 0 { "-$" } else { "$" },
                micro_to_ui_string(realized_pnl_micro.unsigned_abs() as u64)
            );
            self.events.publish(EngineEvent::PositionClosed {
                position: snapshot,
                realized_pnl_usdc: format_signed_micro(realized_pnl_micro),
                realized_pnl_pct: pnl_pct,
            });
        } else {
            self.events.publish(EngineEvent::PositionUpdated { position: snapshot });
        }

        Some(SellOutcome {
            realized_pnl_micro,
            closed,
        })
    }

    /// Consistent point-in-time view of every open position.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions
            .lock()
            .expect("ledger poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn position(&self, token_mint: &Pubkey) -> Option<Position> {
        self.positions
            .lock()
            .expect("ledger poisoned")
            .get(token_mint)
            .cloned()
    }

    pub fn open_positions(&self) -> usize {
        self.positions.lock().expect("ledger poisoned").len()
    }

    pub fn total_exposure_micro(&self) -> u64 {
        self.positions
            .lock()
            .expect("ledger poisoned")
            .values()
            .map(|p| p.total_cost_micro)
            .sum()
    }
}

fn format_signed_micro(micro: i128) -> String {
    let magnitude = micro_to_ui_string(micro.unsigned_abs().min(u64::MAX as u128) as u64);
    if micro < 0 {
        format!("-{magnitude}")
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amounts::ui_usdc_to_micro;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_micro: ui_usdc_to_micro("50").unwrap(),
            max_total_exposure_micro: ui_usdc_to_micro("200").unwrap(),
            max_open_positions: 10,
            min_usdc_reserve_micro: ui_usdc_to_micro("10").unwrap(),
        }
    }

    fn ledger(limits: RiskLimits) -> PositionLedger {
        PositionLedger::new(limits, EventBus::new())
    }

    fn sig(n: u8) -> Signature {
        Signature::from([n; 64])
    }

    #[test]
    fn buy_then_equal_sell_realizes_zero_and_closes() {
        let ledger = ledger(limits());
        let mint = Pubkey::new_unique();
        ledger.record_buy(mint, 1_000_000, 2_000_000, 6, sig(1));

        let outcome = ledger
            .record_sell(&mint, 1_000_000, 2_000_000, sig(2))
            .unwrap();
        assert_eq!(outcome.realized_pnl_micro, 0);
        assert!(outcome.closed);
        assert_eq!(ledger.open_positions(), 0);
    }

    #[test]
    fn buys_accumulate_cost_and_amount() {
        let ledger = ledger(limits());
        let mint = Pubkey::new_unique();
        let buys: [(u128, u64); 3] = [(500, 1_000_000), (300, 2_500_000), (200, 750_000)];
        for (i, (raw, cost)) in buys.iter().enumerate() {
            ledger.record_buy(mint, *raw, *cost, 6, sig(i as u8));
        }
        let position = ledger.position(&mint).unwrap();
        assert_eq!(position.amount_raw, buys.iter().map(|(r, _)| r).sum::<u128>());
        assert_eq!(
            position.total_cost_micro,
            buys.iter().map(|(_, c)| c).sum::<u64>()
        );
        assert_eq!(position.buy_count, 3);
    }

    #[test]
    fn average_entry_price_uses_ui_units() {
        let ledger = ledger(limits());
        let mint = Pubkey::new_unique();
        // 2 USDC for 4 tokens at 6 decimals: 0.5 USDC per token.
        ledger.record_buy(mint, 4_000_000, 2_000_000, 6, sig(1));
        let position = ledger.position(&mint).unwrap();
        assert!((position.avg_entry_price_usdc() - 0.5).abs() < 1e-12);

        // Same raw amount at 9 decimals is 1000x fewer UI tokens.
        let mint9 = Pubkey::new_unique();
        ledger.record_buy(mint9, 4_000_000, 2_000_000, 9, sig(2));
        let position9 = ledger.position(&mint9).unwrap();
        assert!((position9.avg_entry_price_usdc() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn partial_sell_reduces_proportionally() {
        let ledger = ledger(limits());
        let mint = Pubkey::new_unique();
        ledger.record_buy(mint, 1_000, 4_000_000, 6, sig(1));

        // Sell a quarter for more than its basis.
        let outcome = ledger.record_sell(&mint, 250, 1_500_000, sig(2)).unwrap();
        assert_eq!(outcome.realized_pnl_micro, 500_000);
        assert!(!outcome.closed);

        let position = ledger.position(&mint).unwrap();
        assert_eq!(position.amount_raw, 750);
        assert_eq!(position.total_cost_micro, 3_000_000);
        assert_eq!(position.sell_count, 1);
    }

    #[test]
    fn reserve_rejection_fires_before_other_checks() {
        // Scenario: $4 position cap, $10 reserve, balance at $8 after two
        // $2 buys on the same mint.
        let ledger = ledger(RiskLimits {
            max_position_micro: 4_000_000,
            max_total_exposure_micro: 200_000_000,
            max_open_positions: 10,
            min_usdc_reserve_micro: 10_000_000,
        });
        let mint = Pubkey::new_unique();
        ledger.record_buy(mint, 100, 2_000_000, 6, sig(1));
        ledger.record_buy(mint, 100, 2_000_000, 6, sig(2));

        let decision = ledger.can_trade(&mint, TradeDirection::Buy, 2_000_000, 8_000_000);
        assert_eq!(
            decision,
            TradeDecision::Reject("would leave USDC below minimum reserve $10".to_string())
        );
    }

    #[test]
    fn per_position_limit_rejects() {
        let ledger = ledger(RiskLimits {
            max_position_micro: 4_000_000,
            max_total_exposure_micro: 200_000_000,
            max_open_positions: 10,
            min_usdc_reserve_micro: 0,
        });
        let mint = Pubkey::new_unique();
        ledger.record_buy(mint, 100, 3_000_000, 6, sig(1));
        let decision = ledger.can_trade(&mint, TradeDirection::Buy, 2_000_000, 100_000_000);
        assert!(matches!(decision, TradeDecision::Reject(reason) if reason.contains("per-position")));
    }

    #[test]
    fn exposure_limit_rejects_across_mints() {
        let ledger = ledger(RiskLimits {
            max_position_micro: 100_000_000,
            max_total_exposure_micro: 5_000_000,
            max_open_positions: 10,
            min_usdc_reserve_micro: 0,
        });
        ledger.record_buy(Pubkey::new_unique(), 100, 4_000_000, 6, sig(1));
        let decision = ledger.can_trade(
            &Pubkey::new_unique(),
            TradeDirection::Buy,
            2_000_000,
            100_000_000,
        );
        assert!(matches!(decision, TradeDecision::Reject(reason) if reason.contains("exposure")));
    }

    #[test]
    fn open_position_cap_rejects_new_mints_only() {
        let ledger = ledger(RiskLimits {
            max_position_micro: 100_000_000,
            max_total_exposure_micro: 1_000_000_000,
            max_open_positions: 1,
            min_usdc_reserve_micro: 0,
        });
        let mint = Pubkey::new_unique();
        ledger.record_buy(mint, 100, 1_000_000, 6, sig(1));

        let new_mint = ledger.can_trade(
            &Pubkey::new_unique(),
            TradeDirection::Buy,
            1_000_000,
            100_000_000,
        );
        assert!(matches!(new_mint, TradeDecision::Reject(_)));

        let same_mint = ledger.can_trade(&mint, TradeDirection::Buy, 1_000_000, 100_000_000);
        assert!(same_mint.is_allowed());
    }

    #[test]
    fn sell_requires_open_position() {
        let ledger = ledger(limits());
        let mint = Pubkey::new_unique();
        let decision = ledger.can_trade(&mint, TradeDirection::Sell, 1_000_000, 0);
        assert!(matches!(decision, TradeDecision::Reject(_)));

        ledger.record_buy(mint, 100, 1_000_000, 6, sig(1));
        assert!(ledger
            .can_trade(&mint, TradeDirection::Sell, 1_000_000, 0)
            .is_allowed());
    }

    #[tokio::test]
    async fn warning_emitted_at_eighty_percent() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let ledger = PositionLedger::new(
            RiskLimits {
                max_position_micro: 10_000_000,
                max_total_exposure_micro: 1_000_000_000,
                max_open_positions: 10,
                min_usdc_reserve_micro: 0,
            },
            events,
        );
        let mint = Pubkey::new_unique();
        ledger.record_buy(mint, 100, 6_000_000, 6, sig(1));
        while !matches!(rx.recv().await, Ok(EngineEvent::PositionOpened { .. })) {}

        let decision = ledger.can_trade(&mint, TradeDirection::Buy, 2_000_000, 100_000_000);
        assert!(decision.is_allowed());
        match rx.recv().await.unwrap() {
            EngineEvent::LimitWarning { kind, percent, .. } => {
                assert_eq!(kind, "per_position");
                assert!((percent - 80.0).abs() < 1e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn interleaved_buys_and_sells_preserve_invariants() {
        use rand::Rng;
        let ledger = ledger(RiskLimits {
            max_position_micro: u64::MAX,
            max_total_exposure_micro: u64::MAX,
            max_open_positions: usize::MAX,
            min_usdc_reserve_micro: 0,
        });
        let mints: Vec<Pubkey> = (0..4).map(|_| Pubkey::new_unique()).collect();
        let mut rng = rand::thread_rng();

        for step in 0..200u32 {
            let mint = mints[rng.gen_range(0..mints.len())];
            if rng.gen_bool(0.6) {
                ledger.record_buy(
                    mint,
                    rng.gen_range(1..10_000u128),
                    rng.gen_range(1..5_000_000u64),
                    6,
                    sig(step as u8),
                );
            } else if let Some(position) = ledger.position(&mint) {
                let raw = rng.gen_range(1..=position.amount_raw);
                ledger.record_sell(&mint, raw, rng.gen_range(0..5_000_000), sig(step as u8));
            }

            for position in ledger.snapshot() {
                assert!(position.amount_raw > 0, "open positions hold tokens");
                assert!(position.total_cost_micro > 0 || position.amount_raw == 0);
            }
        }
    }
}
