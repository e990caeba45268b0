//! Background exit manager.
//!
//! Every tick the manager snapshots open positions, batch-fetches their
//! prices in one request, and walks the exit rules in order: take-profit
//! ladder, stop-loss, time limit, trailing stop. Exits submit sells
//! through the shared execution path and never block ingestion.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::watch;

use crate::{
    events::{EngineEvent, EventBus},
    executor::SwapExecutor,
    positions::{Position, PositionLedger},
    price::PriceClient,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeProfitTarget {
    pub profit_pct: f64,
    pub sell_pct: f64,
}

#[derive(Debug, Clone)]
pub struct ExitRules {
    pub take_profit: Vec<TakeProfitTarget>,
    pub stop_loss_pct: f64,
    pub max_hold: Duration,
    pub trailing_stop_pct: Option<f64>,
    pub trailing_activation_pct: Option<f64>,
    pub check_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitRule {
    TakeProfit { target_pct: f64, sell_pct: f64 },
    StopLoss,
    TimeLimit,
    TrailingStop,
}

impl ExitRule {
    pub fn label(&self) -> String {
        match self {
            ExitRule::TakeProfit { target_pct, .. } => format!("take_profit_{target_pct}"),
            ExitRule::StopLoss => "stop_loss".to_string(),
            ExitRule::TimeLimit => "time_limit".to_string(),
            ExitRule::TrailingStop => "trailing_stop".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ExitDecision {
    rule: ExitRule,
    sell_pct: f64,
}

/// Per-mint trigger memory. Ladder rungs stay latched even when the sell
/// fails, preventing re-entry storms on a flapping price.
#[derive(Debug, Default)]
struct ExitState {
    tp_hit: HashSet<usize>,
    high_water: f64,
    trailing_active: bool,
}

/// Rule walk for one priced position. Mutates trigger memory on the way:
/// the high-water mark always updates, and a fired ladder rung is marked
/// before execution is attempted.
fn evaluate(
    rules: &ExitRules,
    state: &mut ExitState,
    profit_pct: f64,
    price: f64,
    held: Duration,
) -> Option<ExitDecision> {
    if price > state.high_water {
        state.high_water = price;
    }

    for (index, target) in rules.take_profit.iter().enumerate() {
        if profit_pct >= target.profit_pct && !state.tp_hit.contains(&index) {
            state.tp_hit.insert(index);
            return Some(ExitDecision {
                rule: ExitRule::TakeProfit {
                    target_pct: target.profit_pct,
                    sell_pct: target.sell_pct,
                },
                sell_pct: target.sell_pct,
            });
        }
    }

    if profit_pct <= rules.stop_loss_pct {
        return Some(ExitDecision {
            rule: ExitRule::StopLoss,
            sell_pct: 100.0,
        });
    }

    if held >= rules.max_hold {
        return Some(ExitDecision {
            rule: ExitRule::TimeLimit,
            sell_pct: 100.0,
        });
    }

    if let (Some(trail_pct), Some(activation_pct)) =
        (rules.trailing_stop_pct, rules.trailing_activation_pct)
    {
        if profit_pct >= activation_pct {
            state.trailing_active = true;
        }
        if state.trailing_active && state.high_water > 0.0 {
            let drop_pct = (state.high_water - price) / state.high_water * 100.0;
            if drop_pct >= trail_pct {
                return Some(ExitDecision {
                    rule: ExitRule::TrailingStop,
                    sell_pct: 100.0,
                });
            }
        }
    }

    None
}

pub struct ExitManager {
    rules: ExitRules,
    ledger: Arc<PositionLedger>,
    executor: Arc<SwapExecutor>,
    prices: Arc<PriceClient>,
    events: EventBus,
    state: tokio::sync::Mutex<HashMap<Pubkey, ExitState>>,
}

impl ExitManager {
    pub fn new(
        rules: ExitRules,
        ledger: Arc<PositionLedger>,
        executor: Arc<SwapExecutor>,
        prices: Arc<PriceClient>,
        events: EventBus,
    ) -> Self {
        Self {
            rules,
            ledger,
            executor,
            prices,
            events,
            state: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "exit manager running (interval {}s, {} ladder rungs)",
            self.rules.check_interval.as_secs(),
            self.rules.take_profit.len()
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.rules.check_interval) => {}
                _ = shutdown.changed() => {
                    info!("exit manager stopping");
                    return;
                }
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let positions = self.ledger.snapshot();
        {
            // Forget trigger memory for mints that are no longer open.
            let open: HashSet<Pubkey> = positions.iter().map(|p| p.token_mint).collect();
            let mut state = self.state.lock().await;
            state.retain(|mint, _| open.contains(mint));
        }
        if positions.is_empty() {
            return;
        }

        let mints: Vec<Pubkey> = positions.iter().map(|p| p.token_mint).collect();
        let prices = match self.prices.prices(&mints).await {
            Ok(prices) => prices,
            Err(err) => {
                warn!("price fetch for {} mints failed: {err}", mints.len());
                return;
            }
        };

        for position in positions {
            let Some(&price) = prices.get(&position.token_mint) else {
                debug!("no price for {}; skipping this tick", position.token_mint);
                continue;
            };
            let entry_price = position.avg_entry_price_usdc();
            if entry_price <= 0.0 || price <= 0.0 {
                continue;
            }
            let profit_pct = (price / entry_price - 1.0) * 100.0;

            let decision = {
                let mut state = self.state.lock().await;
                let entry = state.entry(position.token_mint).or_default();
                evaluate(&self.rules, entry, profit_pct, price, position.held_for())
            };

            if let Some(decision) = decision {
                info!(
                    "exit {} on {} at {price:.9} ({profit_pct:+.1}%) selling {:.0}%",
                    decision.rule.label(),
                    position.token_mint,
                    decision.sell_pct
                );
                self.execute_exit(&position, decision).await;
            }
        }
    }

    async fn execute_exit(&self, position: &Position, decision: ExitDecision) {
        let mint = position.token_mint;
        let rule = decision.rule.label();
        // Whole-raw-unit floor of amount × sell% / 100.
        let sell_bps = (decision.sell_pct * 100.0).round() as u128;
        let sell_raw = position.amount_raw * sell_bps / 10_000;
        if sell_raw == 0 {
            return;
        }

        self.events
            .publish(EngineEvent::exit_triggered(&mint, rule.clone(), decision.sell_pct));

        match self.executor.sell_exact_tokens(mint, sell_raw).await {
            Ok((signature, quote)) => {
                self.ledger.record_sell(
                    &mint,
                    quote.in_amount_raw as u128,
                    quote.out_amount_raw,
                    signature,
                );
                self.events
                    .publish(EngineEvent::exit_executed(&mint, rule, &signature));
            }
            Err(err) => {
                // Ladder markers stay latched; the rung will not re-fire.
                warn!("exit sell for {mint} failed: {err}");
                self.events
                    .publish(EngineEvent::exit_failed(&mint, rule, err.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ExitRules {
        ExitRules {
            take_profit: vec![
                TakeProfitTarget { profit_pct: 50.0, sell_pct: 25.0 },
                TakeProfitTarget { profit_pct: 100.0, sell_pct: 50.0 },
                TakeProfitTarget { profit_pct: 300.0, sell_pct: 100.0 },
            ],
            stop_loss_pct: -30.0,
            max_hold: Duration::from_secs(24 * 3600),
            trailing_stop_pct: None,
            trailing_activation_pct: None,
            check_interval: Duration::from_secs(30),
        }
    }

    fn profit_pct(entry: f64, price: f64) -> f64 {
        (price / entry - 1.0) * 100.0
    }

    #[test]
    fn take_profit_ladder_fires_each_rung_once() {
        let rules = rules();
        let mut state = ExitState::default();
        let entry = 0.001234;
        let held = Duration::from_secs(60);

        // +50%: first rung, sell 25%.
        let d = evaluate(&rules, &mut state, profit_pct(entry, 0.001851), 0.001851, held)
            .unwrap();
        assert_eq!(d.sell_pct, 25.0);

        // Same price again: rung latched, nothing fires.
        assert!(
            evaluate(&rules, &mut state, profit_pct(entry, 0.001851), 0.001851, held).is_none()
        );

        // +100%: second rung, sell 50% of current holdings.
        let d = evaluate(&rules, &mut state, profit_pct(entry, 0.002468), 0.002468, held)
            .unwrap();
        assert_eq!(d.sell_pct, 50.0);

        // +300%: final rung closes the position.
        let d = evaluate(&rules, &mut state, profit_pct(entry, 0.004936), 0.004936, held)
            .unwrap();
        assert_eq!(d.sell_pct, 100.0);
        assert_eq!(state.tp_hit.len(), 3);
    }

    #[test]
    fn ladder_total_sells_whole_position_modulo_rounding() {
        // Mirror the ladder against an actual amount: 25%, then 50% of the
        // remainder, then 100% of what is left.
        let mut amount: u128 = 46_672_314_888;
        let original = amount;
        for sell_pct in [25.0f64, 50.0, 100.0] {
            let sold = amount * ((sell_pct * 100.0) as u128) / 10_000;
            amount -= sold;
        }
        assert_eq!(amount, 0, "ladder leaves nothing behind (started {original})");
    }

    #[test]
    fn stop_loss_fires_full_exit() {
        let rules = rules();
        let mut state = ExitState::default();
        let d = evaluate(&rules, &mut state, -35.0, 0.65, Duration::from_secs(60)).unwrap();
        assert_eq!(d.rule, ExitRule::StopLoss);
        assert_eq!(d.sell_pct, 100.0);
    }

    #[test]
    fn time_limit_fires_after_max_hold() {
        let rules = rules();
        let mut state = ExitState::default();
        assert!(evaluate(&rules, &mut state, 5.0, 1.05, Duration::from_secs(3600)).is_none());
        let d = evaluate(&rules, &mut state, 5.0, 1.05, Duration::from_secs(25 * 3600)).unwrap();
        assert_eq!(d.rule, ExitRule::TimeLimit);
    }

    #[test]
    fn trailing_stop_activates_then_fires_on_drawdown() {
        let mut rules = ExitRules {
            take_profit: vec![],
            stop_loss_pct: -90.0,
            max_hold: Duration::from_secs(u64::MAX / 2),
            trailing_stop_pct: Some(20.0),
            trailing_activation_pct: Some(50.0),
            check_interval: Duration::from_secs(30),
        };
        let mut state = ExitState::default();
        let entry = 1.0;
        let held = Duration::from_secs(60);

        // Below activation: drops are ignored.
        assert!(evaluate(&rules, &mut state, profit_pct(entry, 1.2), 1.2, held).is_none());
        assert!(!state.trailing_active);

        // $1.50 activates the trail.
        assert!(evaluate(&rules, &mut state, profit_pct(entry, 1.5), 1.5, held).is_none());
        assert!(state.trailing_active);

        // $3.00 raises the high-water mark.
        assert!(evaluate(&rules, &mut state, profit_pct(entry, 3.0), 3.0, held).is_none());
        assert_eq!(state.high_water, 3.0);

        // $2.40 is a 20% drop from the mark: full exit.
        let d = evaluate(&rules, &mut state, profit_pct(entry, 2.4), 2.4, held).unwrap();
        assert_eq!(d.rule, ExitRule::TrailingStop);
        assert_eq!(d.sell_pct, 100.0);

        // Without both knobs the trail never fires.
        rules.trailing_stop_pct = None;
        let mut fresh = ExitState::default();
        assert!(evaluate(&rules, &mut fresh, 500.0, 6.0, held).is_none());
    }

    #[test]
    fn ladder_outranks_stop_loss_and_time() {
        // A position simultaneously past a rung and past max-hold exits on
        // the rung first; the remainder exits on the next tick.
        let rules = rules();
        let mut state = ExitState::default();
        let d = evaluate(&rules, &mut state, 60.0, 1.6, Duration::from_secs(48 * 3600)).unwrap();
        assert!(matches!(d.rule, ExitRule::TakeProfit { .. }));
    }
}
