mod amounts;
mod classifier;
mod config;
mod decoder;
mod detector;
mod entry;
mod events;
mod executor;
mod exit_manager;
mod lookup;
mod orchestrator;
mod positions;
mod prebuilt;
mod price;
mod quality;
mod quote;
mod relay;
mod shredstream;
mod submitter;
mod watchlist;

use std::{env, sync::Arc, time::Duration};

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde_json::json;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use tokio::sync::{mpsc, watch};

use crate::{
    classifier::{classify, Aggregator},
    config::Config,
    decoder::decode_transaction,
    detector::{TradeDetector, USDC_MINT},
    entry::decode_slot_entries,
    events::{EngineEvent, EventBus, TraceLog},
    executor::SwapExecutor,
    exit_manager::ExitManager,
    lookup::LookupResolver,
    orchestrator::{CopyOrchestrator, OrchestratorSettings, TRADE_CHANNEL_CAPACITY},
    prebuilt::{
        spawn_prebuilt_refresher, spawn_quote_refresher, PreBuilder, PreBuiltCache, QuoteCache,
    },
    price::PriceClient,
    quality::{MetadataClient, QualityFilter},
    quote::QuoteClient,
    relay::BundleRelay,
    shredstream::{
        shredstream_client::ShredstreamProxyClient, StreamState, SubscribeEntriesRequest,
    },
    submitter::RaceSubmitter,
    watchlist::Watchlist,
};

/// Depth of the detection-stage channel; the orchestrator buffers less.
const CANDIDATE_CHANNEL_CAPACITY: usize = 256;
const BALANCE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const STREAM_MAX_DECODING_BYTES: usize = 1024 * 1024 * 1024;

/// A classified, watched swap waiting for balance-delta reconstruction.
struct SwapCandidate {
    signature: Signature,
    slot: u64,
    aggregator: Aggregator,
    user: Pubkey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env::set_var(
        env_logger::DEFAULT_FILTER_ENV,
        env::var_os(env_logger::DEFAULT_FILTER_ENV).unwrap_or_else(|| "info".into()),
    );
    env_logger::init();
    let trace = TraceLog::start();

    let config = Arc::new(Config::load()?);
    let rpc = Arc::new(RpcClient::new(config.rpc_endpoint.clone()));
    log_startup_summary(&config, &rpc).await;

    let http = build_http_client();
    let quote_client = Arc::new(QuoteClient::new(
        http.clone(),
        config.quote_api_url.clone(),
        config.quote_api_key.as_deref(),
    ));
    quote_client.warm_up().await;
    warm_rpc(&http, &config.rpc_endpoint).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let events = EventBus::new();
    spawn_event_sink(&events, shutdown_rx.clone());

    let relay = if config.use_bundle_relay {
        BundleRelay::connect_with_retry(&config.relay_endpoint)
            .await
            .map(Arc::new)
    } else {
        None
    };
    let submitter = Arc::new(RaceSubmitter::new(
        Arc::clone(&rpc),
        relay,
        config.operator_keypair(),
        config.bundle_tip_lamports,
        trace.clone(),
    ));

    let quotes = Arc::new(QuoteCache::new(Arc::clone(&quote_client), config.slippage_bps));
    let prebuilt_cache = Arc::new(PreBuiltCache::new());
    let prebuilder = Arc::new(PreBuilder {
        quotes: Arc::clone(&quotes),
        client: Arc::clone(&quote_client),
        cache: Arc::clone(&prebuilt_cache),
        operator: config.operator_keypair(),
        amount_micro: config.trade_amount_micro,
        compute_unit_price_micro_lamports: config.priority_fee_microlamports,
    });
    let ledger = Arc::new(positions::PositionLedger::new(config.risk, events.clone()));
    let metadata_client = Arc::new(MetadataClient::new(
        http.clone(),
        config.metadata_api_url.clone(),
    ));
    let quality = Arc::new(QualityFilter::new(config.filter.clone(), metadata_client));
    let swap_executor = Arc::new(SwapExecutor::new(
        Arc::clone(&quotes),
        Arc::clone(&quote_client),
        Arc::clone(&submitter),
        config.operator_keypair(),
        config.priority_fee_microlamports,
    ));

    let orchestrator = Arc::new(CopyOrchestrator::new(
        OrchestratorSettings {
            copy_buys_only: config.copy_buys_only,
            allowed_tokens: config.allowed_tokens.iter().copied().collect(),
            min_trade_micro: config.min_trade_micro,
            copy_amount_micro: config.trade_amount_micro,
            filter_enabled: config.filter_enabled,
        },
        Arc::clone(&quality),
        Arc::clone(&ledger),
        Arc::clone(&prebuilt_cache),
        Arc::clone(&prebuilder),
        Arc::clone(&swap_executor),
        events.clone(),
    ));

    if let Some(balance) = fetch_usdc_balance(&rpc, &config.operator_pubkey()).await {
        info!("operator USDC balance: {}", amounts::micro_to_ui_string(balance));
        orchestrator.set_usdc_balance_micro(balance);
    }
    spawn_balance_refresher(
        Arc::clone(&rpc),
        config.operator_pubkey(),
        Arc::clone(&orchestrator),
        shutdown_rx.clone(),
    );

    let (trade_tx, trade_rx) = mpsc::channel(TRADE_CHANNEL_CAPACITY);
    tokio::spawn(Arc::clone(&orchestrator).run(trade_rx, shutdown_rx.clone()));

    let _quote_refresher = spawn_quote_refresher(
        Arc::clone(&quotes),
        config.allowed_tokens.clone(),
        config.trade_amount_micro,
        shutdown_rx.clone(),
    );
    let _prebuilt_refresher = spawn_prebuilt_refresher(
        Arc::clone(&prebuilder),
        config.allowed_tokens.clone(),
        shutdown_rx.clone(),
    );
    let _metadata_refresher = quality.spawn_refresher(shutdown_rx.clone());

    if config.exit_enabled {
        let price_client = Arc::new(PriceClient::new(http.clone(), config.price_api_url.clone()));
        let exit_manager = Arc::new(ExitManager::new(
            config.exit.clone(),
            Arc::clone(&ledger),
            Arc::clone(&swap_executor),
            price_client,
            events.clone(),
        ));
        tokio::spawn(exit_manager.run(shutdown_rx.clone()));
    }

    // Detection stage: reconstruct trades for classified candidates.
    let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_CHANNEL_CAPACITY);
    spawn_detection_stage(
        Arc::new(TradeDetector::new(Arc::clone(&rpc))),
        candidate_rx,
        trade_tx,
        events.clone(),
        trace,
        shutdown_rx.clone(),
    );

    let watchlist = Arc::new(Watchlist::new(config.target_wallets.iter().copied()));
    let resolver = Arc::new(LookupResolver::new(Arc::clone(&rpc)));

    run_stream_supervisor(&config, watchlist, resolver, candidate_tx, shutdown_rx).await;

    info!("engine stopped");
    Ok(())
}

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .tcp_nodelay(true)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .build()
        .expect("failed to build reqwest client")
}

async fn warm_rpc(http: &reqwest::Client, rpc_url: &str) {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "getHealth" });
    match http.post(rpc_url).json(&body).send().await {
        Ok(response) => debug!("rpc warm-up -> {}", response.status()),
        Err(err) => warn!("rpc warm-up failed: {err}"),
    }
}

async fn log_startup_summary(config: &Config, rpc: &RpcClient) {
    let operator = config.operator_pubkey();
    let balance_sol = match rpc.get_balance(&operator).await {
        Ok(lamports) => lamports as f64 / 1_000_000_000.0,
        Err(err) => {
            warn!("failed to fetch operator SOL balance: {err}");
            0.0
        }
    };

    info!(
        "Startup | operator={} | sol={:.4} | copy_size=${} | slippage={}bps | bundle_relay={}",
        operator,
        balance_sol,
        amounts::micro_to_ui_string(config.trade_amount_micro),
        config.slippage_bps,
        config.use_bundle_relay,
    );
    info!(
        "Endpoints | stream={} | rpc={} | quote={}",
        config.stream_endpoint, config.rpc_endpoint, config.quote_api_url
    );

    if config.target_wallets.is_empty() {
        info!("Targets | none configured");
    } else {
        for (idx, wallet) in config.target_wallets.iter().enumerate() {
            info!("Target {:02} | wallet={}", idx + 1, wallet);
        }
    }
}

/// The external notification boundary: structured events go out as JSON
/// lines. A real deployment points this at the fan-out service.
fn spawn_event_sink(events: &EventBus, mut shutdown: watch::Receiver<bool>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => info!(target: "events", "{line}"),
                        Err(err) => warn!("event serialization failed: {err}"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("event sink lagging, {missed} events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    });
}

async fn fetch_usdc_balance(rpc: &RpcClient, owner: &Pubkey) -> Option<u64> {
    let ata = spl_associated_token_account::get_associated_token_address(owner, &USDC_MINT);
    match rpc.get_token_account_balance(&ata).await {
        Ok(balance) => balance.amount.parse::<u64>().ok(),
        Err(err) => {
            warn!("USDC balance fetch failed: {err}");
            None
        }
    }
}

fn spawn_balance_refresher(
    rpc: Arc<RpcClient>,
    owner: Pubkey,
    orchestrator: Arc<CopyOrchestrator>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(BALANCE_REFRESH_INTERVAL) => {}
                _ = shutdown.changed() => return,
            }
            if let Some(balance) = fetch_usdc_balance(&rpc, &owner).await {
                orchestrator.set_usdc_balance_micro(balance);
            }
        }
    });
}

fn spawn_detection_stage(
    detector: Arc<TradeDetector>,
    mut candidates: mpsc::Receiver<SwapCandidate>,
    trades: mpsc::Sender<detector::DetectedTrade>,
    events: EventBus,
    trace: TraceLog,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            let candidate = tokio::select! {
                maybe = candidates.recv() => match maybe {
                    Some(candidate) => candidate,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            match detector
                .detect(
                    candidate.signature,
                    candidate.slot,
                    candidate.aggregator,
                    candidate.user,
                )
                .await
            {
                Ok(Some(trade)) => {
                    trace.line(format!(
                        "trade detected | {} {} ${} via {} (slot {})",
                        trade.direction.as_str(),
                        trade.token_mint,
                        trade.usdc_ui(),
                        trade.aggregator,
                        trade.slot
                    ));
                    events.publish(EngineEvent::TradeDetected {
                        trade: events::TradeSummary::from(&trade),
                    });
                    if trades.send(trade).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("reconstruction for {} failed: {err}", candidate.signature),
            }
        }
    });
}

/// Connect, subscribe, and feed slot payloads into the pipeline,
/// reconnecting with a fixed delay until the attempt cap (if any).
async fn run_stream_supervisor(
    config: &Config,
    watchlist: Arc<Watchlist>,
    resolver: Arc<LookupResolver>,
    candidates: mpsc::Sender<SwapCandidate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match ShredstreamProxyClient::connect(config.stream_url()).await {
            Ok(client) => {
                let mut client = client.max_decoding_message_size(STREAM_MAX_DECODING_BYTES);
                match client.subscribe_entries(SubscribeEntriesRequest {}).await {
                    Ok(response) => {
                        info!("stream {}: {}", config.stream_endpoint, StreamState::Connected);
                        attempts = 0;
                        let mut stream = response.into_inner();
                        loop {
                            tokio::select! {
                                frame = stream.message() => match frame {
                                    Ok(Some(frame)) => {
                                        process_slot(
                                            frame.slot,
                                            &frame.entries,
                                            &watchlist,
                                            &resolver,
                                            &candidates,
                                        )
                                        .await;
                                    }
                                    Ok(None) => {
                                        warn!("stream: {}", StreamState::Disconnected);
                                        break;
                                    }
                                    Err(status) => {
                                        let state = StreamState::Error {
                                            code: status.code() as i32,
                                            detail: status.message().to_string(),
                                        };
                                        error!("stream: {state}");
                                        break;
                                    }
                                },
                                _ = shutdown.changed() => return,
                            }
                        }
                    }
                    Err(status) => {
                        let state = StreamState::Error {
                            code: status.code() as i32,
                            detail: status.message().to_string(),
                        };
                        error!("stream subscribe failed: {state}");
                    }
                }
            }
            Err(err) => {
                error!(
                    "stream connect to {} failed: {err}",
                    config.stream_endpoint
                );
            }
        }

        attempts += 1;
        if let Some(cap) = config.stream_max_attempts {
            if attempts >= cap {
                error!("stream: {}", StreamState::MaxReconnectAttemptsReached);
                return;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(config.stream_reconnect) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Entries are processed sequentially within a slot; the transactions of
/// one entry are analyzed concurrently.
async fn process_slot(
    slot: u64,
    payload: &[u8],
    watchlist: &Arc<Watchlist>,
    resolver: &Arc<LookupResolver>,
    candidates: &mpsc::Sender<SwapCandidate>,
) {
    let entries = match decode_slot_entries(payload) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("slot {slot}: {err}");
            return;
        }
    };

    for entry in entries {
        join_all(entry.transactions.iter().map(|tx_bytes| {
            analyze_transaction(slot, tx_bytes, watchlist, resolver, candidates)
        }))
        .await;
    }
}

async fn analyze_transaction(
    slot: u64,
    tx_bytes: &[u8],
    watchlist: &Arc<Watchlist>,
    resolver: &Arc<LookupResolver>,
    candidates: &mpsc::Sender<SwapCandidate>,
) {
    let decoded = match decode_transaction(tx_bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!("slot {slot}: {err}");
            return;
        }
    };
    if decoded.is_vote() {
        return;
    }

    // The watched wallet signs its own swaps, so it is always a static
    // key; unwatched traffic never costs a lookup-table fetch.
    let Some(user) = watchlist.first_watched(&decoded.static_keys) else {
        return;
    };

    let signature = decoded.signature;
    let resolved = resolver.resolve(decoded).await;
    let Some(aggregator) = classify(&resolved) else {
        return;
    };

    if candidates
        .send(SwapCandidate {
            signature,
            slot,
            aggregator,
            user,
        })
        .await
        .is_err()
    {
        debug!("candidate channel closed; dropping {signature}");
    }
}
