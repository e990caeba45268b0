//! Engine event bus and hot-path trace lines.
//!
//! Events are published fire-and-forget onto a broadcast channel read by
//! the external notification sink. Consumers never block producers: a
//! full or unsubscribed channel drops the event rather than stalling the
//! pipeline. The same rule covers human-readable trace lines from the
//! detection and submission hot paths, which go through [`TraceLog`].

use log::info;
use serde::Serialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use tokio::sync::{broadcast, mpsc};

use crate::{
    amounts::micro_to_ui_string,
    detector::DetectedTrade,
    positions::PositionSnapshot,
};

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct TradeSummary {
    pub signature: String,
    pub slot: u64,
    pub direction: &'static str,
    pub token_mint: String,
    pub usdc_amount: String,
    pub token_amount_raw: u128,
    pub user: String,
    pub aggregator: &'static str,
    pub detected_at_ms: u64,
}

impl From<&DetectedTrade> for TradeSummary {
    fn from(trade: &DetectedTrade) -> Self {
        Self {
            signature: trade.signature.to_string(),
            slot: trade.slot,
            direction: trade.direction.as_str(),
            token_mint: trade.token_mint.to_string(),
            usdc_amount: trade.usdc_ui(),
            token_amount_raw: trade.token_amount_raw,
            user: trade.user.to_string(),
            aggregator: trade.aggregator.as_str(),
            detected_at_ms: trade.detected_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeDetected {
        trade: TradeSummary,
    },
    CopyInitiated {
        trade: TradeSummary,
    },
    CopyComplete {
        original: String,
        copy_signature: String,
        copy_latency_ms: u64,
        e2e_latency_ms: u64,
    },
    CopySkipped {
        trade: TradeSummary,
        reason: String,
        details: Option<String>,
    },
    CopyFailed {
        trade: TradeSummary,
        error: String,
    },
    PositionOpened {
        position: PositionSnapshot,
    },
    PositionUpdated {
        position: PositionSnapshot,
    },
    PositionClosed {
        position: PositionSnapshot,
        realized_pnl_usdc: String,
        realized_pnl_pct: f64,
    },
    LimitWarning {
        kind: &'static str,
        current: String,
        max: String,
        percent: f64,
    },
    ExitTriggered {
        token_mint: String,
        rule: String,
        sell_pct: f64,
    },
    ExitExecuted {
        token_mint: String,
        rule: String,
        signature: String,
    },
    ExitFailed {
        token_mint: String,
        rule: String,
        error: String,
    },
}

impl EngineEvent {
    pub fn limit_warning(kind: &'static str, current_micro: u64, max_micro: u64) -> Self {
        let percent = if max_micro == 0 {
            0.0
        } else {
            current_micro as f64 / max_micro as f64 * 100.0
        };
        EngineEvent::LimitWarning {
            kind,
            current: micro_to_ui_string(current_micro),
            max: micro_to_ui_string(max_micro),
            percent,
        }
    }

    pub fn exit_triggered(mint: &Pubkey, rule: String, sell_pct: f64) -> Self {
        EngineEvent::ExitTriggered {
            token_mint: mint.to_string(),
            rule,
            sell_pct,
        }
    }

    pub fn exit_executed(mint: &Pubkey, rule: String, signature: &Signature) -> Self {
        EngineEvent::ExitExecuted {
            token_mint: mint.to_string(),
            rule,
            signature: signature.to_string(),
        }
    }

    pub fn exit_failed(mint: &Pubkey, rule: String, error: String) -> Self {
        EngineEvent::ExitFailed {
            token_mint: mint.to_string(),
            rule,
            error,
        }
    }
}

/// Cloneable publish handle; subscribers attach through `subscribe`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish without blocking; events without subscribers are dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// How many trace lines may queue before new ones are shed.
const TRACE_QUEUE_DEPTH: usize = 512;

/// Deferred logging handle for the detection and submission hot paths.
///
/// Those paths sit on the copy-latency budget, so they hand their lines
/// to a drainer task over a bounded channel instead of writing through
/// the logger themselves. A backed-up drainer sheds lines; it is never
/// waited on.
#[derive(Clone)]
pub struct TraceLog {
    queue: mpsc::Sender<String>,
}

impl TraceLog {
    /// Spawn the drainer task and return the shared handle.
    pub fn start() -> Self {
        let (queue, mut lines) = mpsc::channel::<String>(TRACE_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                info!("{line}");
            }
        });
        Self { queue }
    }

    /// Queue one line for the drainer, shedding it if the queue is full.
    pub fn line(&self, line: String) {
        let _ = self.queue.try_send(line);
    }
}
