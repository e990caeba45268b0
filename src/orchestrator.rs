//! Copy orchestrator: filter chain, dedup, and trade mirroring.
//!
//! Detected trades arrive over a bounded channel and pass a fail-fast
//! filter chain. Accepted buys prefer the pre-built cache (single atomic
//! take, rebuild scheduled in the background); everything else goes
//! through the live quote → build → sign → race-submit path.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use log::{debug, info, warn};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use tokio::sync::{mpsc, watch};

use crate::{
    detector::{DetectedTrade, TradeDirection},
    events::{EngineEvent, EventBus, TradeSummary},
    executor::SwapExecutor,
    positions::{PositionLedger, TradeDecision},
    prebuilt::{PreBuilder, PreBuiltCache},
    quality::{QualityDecision, QualityFilter},
};

/// Orchestrator-side channel depth; upstream detection buffers deeper.
pub const TRADE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SkipReason {
    SellsDisabled,
    NotAllowlisted,
    BelowMinimumSize,
    InFlight,
    Quality(String),
    Risk(String),
}

impl SkipReason {
    fn label(&self) -> &'static str {
        match self {
            SkipReason::SellsDisabled => "sells_disabled",
            SkipReason::NotAllowlisted => "not_allowlisted",
            SkipReason::BelowMinimumSize => "below_minimum_size",
            SkipReason::InFlight => "duplicate_in_flight",
            SkipReason::Quality(_) => "quality_rejected",
            SkipReason::Risk(_) => "risk_rejected",
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            SkipReason::Quality(detail) | SkipReason::Risk(detail) => Some(detail.clone()),
            _ => None,
        }
    }
}

pub struct OrchestratorSettings {
    pub copy_buys_only: bool,
    pub allowed_tokens: HashSet<Pubkey>,
    pub min_trade_micro: u64,
    pub copy_amount_micro: u64,
    pub filter_enabled: bool,
}

pub struct CopyOrchestrator {
    settings: OrchestratorSettings,
    quality: Arc<QualityFilter>,
    ledger: Arc<PositionLedger>,
    prebuilt: Arc<PreBuiltCache>,
    prebuilder: Arc<PreBuilder>,
    executor: Arc<SwapExecutor>,
    events: EventBus,
    in_flight: Mutex<HashSet<Signature>>,
    usdc_balance_micro: AtomicU64,
}

impl CopyOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: OrchestratorSettings,
        quality: Arc<QualityFilter>,
        ledger: Arc<PositionLedger>,
        prebuilt: Arc<PreBuiltCache>,
        prebuilder: Arc<PreBuilder>,
        executor: Arc<SwapExecutor>,
        events: EventBus,
    ) -> Self {
        Self {
            settings,
            quality,
            ledger,
            prebuilt,
            prebuilder,
            executor,
            events,
            in_flight: Mutex::new(HashSet::new()),
            usdc_balance_micro: AtomicU64::new(0),
        }
    }

    pub fn set_usdc_balance_micro(&self, micro: u64) {
        self.usdc_balance_micro.store(micro, Ordering::Relaxed);
    }

    pub async fn run(
        self: Arc<Self>,
        mut trades: mpsc::Receiver<DetectedTrade>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe_trade = trades.recv() => {
                    match maybe_trade {
                        Some(trade) => self.handle_trade(trade).await,
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    info!("copy orchestrator stopping");
                    return;
                }
            }
        }
    }

    async fn handle_trade(&self, trade: DetectedTrade) {
        let copy_amount_micro = match trade.direction {
            TradeDirection::Buy => self.settings.copy_amount_micro,
            TradeDirection::Sell => trade.usdc_micro,
        };

        if let Some(reason) = self.filter(&trade, copy_amount_micro).await {
            debug!(
                "skipping {} ({}): {:?}",
                trade.signature,
                reason.label(),
                reason.details()
            );
            self.events.publish(EngineEvent::CopySkipped {
                trade: TradeSummary::from(&trade),
                reason: reason.label().to_string(),
                details: reason.details(),
            });
            return;
        }

        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .insert(trade.signature);
        self.events.publish(EngineEvent::CopyInitiated {
            trade: TradeSummary::from(&trade),
        });

        let started = Instant::now();
        let result = match trade.direction {
            TradeDirection::Buy => self.execute_buy(&trade).await,
            TradeDirection::Sell => self.execute_sell(&trade).await,
        };

        match result {
            Ok(copy_signature) => {
                let copy_latency_ms = started.elapsed().as_millis() as u64;
                let e2e_latency_ms = trade.detected_at.elapsed().as_millis() as u64;
                info!(
                    "copied {} -> {} | copy {} ms | end-to-end {} ms",
                    trade.signature, copy_signature, copy_latency_ms, e2e_latency_ms
                );
                self.events.publish(EngineEvent::CopyComplete {
                    original: trade.signature.to_string(),
                    copy_signature: copy_signature.to_string(),
                    copy_latency_ms,
                    e2e_latency_ms,
                });
            }
            Err(error) => {
                warn!("copy of {} failed: {error}", trade.signature);
                self.events.publish(EngineEvent::CopyFailed {
                    trade: TradeSummary::from(&trade),
                    error,
                });
            }
        }

        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .remove(&trade.signature);
    }

    /// Fail-fast filter chain. Returns the first reason to skip.
    async fn filter(&self, trade: &DetectedTrade, copy_amount_micro: u64) -> Option<SkipReason> {
        if self.settings.copy_buys_only && trade.direction == TradeDirection::Sell {
            return Some(SkipReason::SellsDisabled);
        }

        if !self.settings.allowed_tokens.is_empty()
            && !self.settings.allowed_tokens.contains(&trade.token_mint)
        {
            return Some(SkipReason::NotAllowlisted);
        }

        if trade.usdc_micro < self.settings.min_trade_micro {
            return Some(SkipReason::BelowMinimumSize);
        }

        if self
            .in_flight
            .lock()
            .expect("in-flight set poisoned")
            .contains(&trade.signature)
        {
            return Some(SkipReason::InFlight);
        }

        if self.settings.filter_enabled {
            match self.quality.should_copy(trade, copy_amount_micro).await {
                QualityDecision::Allow => {}
                QualityDecision::AllowFilterError(detail) => {
                    debug!("{} allowed with filter_error: {detail}", trade.token_mint);
                }
                QualityDecision::Reject(reason) => {
                    return Some(SkipReason::Quality(reason));
                }
            }
        }

        let balance = self.usdc_balance_micro.load(Ordering::Relaxed);
        match self
            .ledger
            .can_trade(&trade.token_mint, trade.direction, copy_amount_micro, balance)
        {
            TradeDecision::Allow => None,
            TradeDecision::Reject(reason) => Some(SkipReason::Risk(reason)),
        }
    }

    async fn execute_buy(&self, trade: &DetectedTrade) -> Result<Signature, String> {
        // Fast path: one atomic take of the pre-signed transaction.
        if let Some(prebuilt) = self.prebuilt.take(&trade.token_mint) {
            let signature = self
                .executor
                .send_prebuilt(&prebuilt)
                .await
                .map_err(|e| e.to_string())?;

            // Replace the consumed entry off the hot path.
            let builder = Arc::clone(&self.prebuilder);
            let mint = trade.token_mint;
            tokio::spawn(async move {
                if let Err(err) = builder.rebuild(mint).await {
                    warn!("post-take rebuild for {mint} failed: {err:?}");
                }
            });

            self.apply_buy_fill(
                trade,
                prebuilt.quote.out_amount_raw,
                prebuilt.quote.in_amount_raw,
                signature,
            );
            return Ok(signature);
        }

        let (signature, quote) = self
            .executor
            .buy_exact_usdc(trade.token_mint, self.settings.copy_amount_micro)
            .await
            .map_err(|e| e.to_string())?;
        self.apply_buy_fill(trade, quote.out_amount_raw, quote.in_amount_raw, signature);
        Ok(signature)
    }

    async fn execute_sell(&self, trade: &DetectedTrade) -> Result<Signature, String> {
        let (signature, quote) = self
            .executor
            .sell_exact_usdc_out(trade.token_mint, trade.usdc_micro)
            .await
            .map_err(|e| e.to_string())?;

        self.ledger.record_sell(
            &trade.token_mint,
            quote.in_amount_raw as u128,
            quote.out_amount_raw,
            signature,
        );
        self.usdc_balance_micro
            .fetch_add(quote.out_amount_raw, Ordering::Relaxed);
        Ok(signature)
    }

    fn apply_buy_fill(
        &self,
        trade: &DetectedTrade,
        token_out_raw: u64,
        usdc_in_micro: u64,
        signature: Signature,
    ) {
        self.ledger.record_buy(
            trade.token_mint,
            token_out_raw as u128,
            usdc_in_micro,
            trade.token_decimals,
            signature,
        );
        let balance = self.usdc_balance_micro.load(Ordering::Relaxed);
        self.usdc_balance_micro
            .store(balance.saturating_sub(usdc_in_micro), Ordering::Relaxed);
    }
}
