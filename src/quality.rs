//! Pre-trade token-quality filter with cached external metadata.
//!
//! Metadata comes from the pairs endpoint of the screener API; the first
//! pair carries the liquidity, 24h volume, creation time, and price used
//! by the checks. Metadata failures fail open: a temporarily unreachable
//! screener must not veto every trade.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use url::Url;

use crate::{amounts::micro_to_ui_f64, detector::DetectedTrade};

const METADATA_TTL: Duration = Duration::from_secs(60);
const METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);
/// Price history window for the recent-pump check.
const PRICE_HISTORY_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metadata endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("metadata response malformed: {0}")]
    Malformed(String),
    #[error("no pairs listed for mint")]
    NoPairs,
}

#[derive(Debug, Clone)]
pub struct QualityLimits {
    pub min_liquidity_usdc: f64,
    pub max_price_impact_pct: f64,
    pub min_token_age_seconds: u64,
    pub min_24h_volume_usdc: f64,
    pub max_recent_pump_pct: f64,
    pub whitelist: HashSet<Pubkey>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QualityDecision {
    Allow,
    /// Metadata was unavailable; the trade proceeds flagged.
    AllowFilterError(String),
    Reject(String),
}

impl QualityDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, QualityDecision::Reject(_))
    }
}

#[derive(Debug, Clone)]
pub struct TokenMetadata {
    pub mint: Pubkey,
    pub liquidity_usdc: f64,
    pub volume_24h_usdc: f64,
    pub token_age_seconds: u64,
    pub price_history: VecDeque<(Instant, f64)>,
    pub last_updated: Instant,
}

impl TokenMetadata {
    fn is_stale(&self) -> bool {
        self.last_updated.elapsed() >= METADATA_TTL
    }

    fn trim_history(&mut self) {
        let cutoff = Instant::now() - PRICE_HISTORY_WINDOW;
        while matches!(self.price_history.front(), Some((at, _)) if *at < cutoff) {
            self.price_history.pop_front();
        }
    }
}

// Screener pairs payload; only the fields the checks need.
#[derive(Debug, Deserialize)]
struct PairsResponse {
    pairs: Option<Vec<PairInfo>>,
}

#[derive(Debug, Deserialize)]
struct PairInfo {
    liquidity: Option<PairLiquidity>,
    volume: Option<PairVolume>,
    #[serde(rename = "pairCreatedAt")]
    pair_created_at: Option<u64>,
    #[serde(rename = "priceUsd")]
    price_usd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PairLiquidity {
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairVolume {
    h24: Option<f64>,
}

pub struct MetadataClient {
    http: Client,
    base: Url,
}

impl MetadataClient {
    pub fn new(http: Client, base: Url) -> Self {
        Self { http, base }
    }

    /// `GET tokens/<mint>`, first pair selected.
    pub async fn fetch(&self, mint: &Pubkey) -> Result<(f64, f64, u64, Option<f64>), MetadataError> {
        let url = self
            .base
            .join(&format!("tokens/{mint}"))
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        let response = self
            .http
            .get(url)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(MetadataError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PairsResponse =
            serde_json::from_str(&body).map_err(|e| MetadataError::Malformed(e.to_string()))?;
        let pair = parsed
            .pairs
            .and_then(|pairs| pairs.into_iter().next())
            .ok_or(MetadataError::NoPairs)?;

        let liquidity = pair.liquidity.and_then(|l| l.usd).unwrap_or(0.0);
        let volume = pair.volume.and_then(|v| v.h24).unwrap_or(0.0);
        let age_seconds = pair
            .pair_created_at
            .map(|created_ms| {
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                now_ms.saturating_sub(created_ms) / 1000
            })
            .unwrap_or(0);
        let price = pair.price_usd.and_then(|p| p.parse::<f64>().ok());

        Ok((liquidity, volume, age_seconds, price))
    }
}

pub struct QualityFilter {
    limits: QualityLimits,
    client: Arc<MetadataClient>,
    cache: tokio::sync::Mutex<HashMap<Pubkey, TokenMetadata>>,
}

impl QualityFilter {
    pub fn new(limits: QualityLimits, client: Arc<MetadataClient>) -> Self {
        Self {
            limits,
            client,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Ordered checks over cached metadata. Whitelisted mints bypass.
    pub async fn should_copy(&self, trade: &DetectedTrade, amount_micro: u64) -> QualityDecision {
        if self.limits.whitelist.contains(&trade.token_mint) {
            return QualityDecision::Allow;
        }

        match self.metadata(&trade.token_mint).await {
            Ok(metadata) => evaluate(&self.limits, &metadata, micro_to_ui_f64(amount_micro)),
            Err(err) => {
                warn!(
                    "metadata for {} unavailable, allowing with filter_error: {err}",
                    trade.token_mint
                );
                QualityDecision::AllowFilterError(err.to_string())
            }
        }
    }

    async fn metadata(&self, mint: &Pubkey) -> Result<TokenMetadata, MetadataError> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(mint) {
                if !entry.is_stale() {
                    return Ok(entry.clone());
                }
            }
        }
        self.refresh_mint(mint).await
    }

    async fn refresh_mint(&self, mint: &Pubkey) -> Result<TokenMetadata, MetadataError> {
        let (liquidity, volume, age_seconds, price) = self.client.fetch(mint).await?;
        let mut cache = self.cache.lock().await;
        let entry = cache.entry(*mint).or_insert_with(|| TokenMetadata {
            mint: *mint,
            liquidity_usdc: 0.0,
            volume_24h_usdc: 0.0,
            token_age_seconds: 0,
            price_history: VecDeque::new(),
            last_updated: Instant::now(),
        });
        entry.liquidity_usdc = liquidity;
        entry.volume_24h_usdc = volume;
        entry.token_age_seconds = age_seconds;
        entry.last_updated = Instant::now();
        if let Some(price) = price {
            entry.price_history.push_back((Instant::now(), price));
        }
        entry.trim_history();
        Ok(entry.clone())
    }

    /// Refresh stale cache entries on the background cadence.
    pub fn spawn_refresher(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let filter = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(METADATA_REFRESH_INTERVAL) => {}
                    _ = shutdown.changed() => {
                        debug!("metadata refresher stopping");
                        return;
                    }
                }
                let stale: Vec<Pubkey> = {
                    let cache = filter.cache.lock().await;
                    cache
                        .values()
                        .filter(|entry| entry.is_stale())
                        .map(|entry| entry.mint)
                        .collect()
                };
                for mint in stale {
                    if let Err(err) = filter.refresh_mint(&mint).await {
                        warn!("metadata refresh for {mint} failed: {err}");
                    }
                }
            }
        })
    }

    #[cfg(test)]
    async fn insert_for_test(&self, metadata: TokenMetadata) {
        self.cache.lock().await.insert(metadata.mint, metadata);
    }
}

/// The five checks, in order, short-circuiting on the first failure.
fn evaluate(limits: &QualityLimits, metadata: &TokenMetadata, amount_usdc: f64) -> QualityDecision {
    if metadata.liquidity_usdc < limits.min_liquidity_usdc {
        return QualityDecision::Reject(format!(
            "liquidity ${:.0} below minimum ${:.0}",
            metadata.liquidity_usdc, limits.min_liquidity_usdc
        ));
    }

    if metadata.token_age_seconds < limits.min_token_age_seconds {
        return QualityDecision::Reject(format!(
            "token age {}s below minimum {}s",
            metadata.token_age_seconds, limits.min_token_age_seconds
        ));
    }

    if metadata.volume_24h_usdc < limits.min_24h_volume_usdc {
        return QualityDecision::Reject(format!(
            "24h volume ${:.0} below minimum ${:.0}",
            metadata.volume_24h_usdc, limits.min_24h_volume_usdc
        ));
    }

    if metadata.liquidity_usdc > 0.0 {
        let impact_pct = amount_usdc / metadata.liquidity_usdc * 100.0;
        if impact_pct > limits.max_price_impact_pct {
            return QualityDecision::Reject(format!(
                "estimated price impact {impact_pct:.3}% above maximum {:.3}%",
                limits.max_price_impact_pct
            ));
        }
    }

    let cutoff = Instant::now() - PRICE_HISTORY_WINDOW;
    let window: Vec<f64> = metadata
        .price_history
        .iter()
        .filter(|(at, _)| *at >= cutoff)
        .map(|(_, price)| *price)
        .collect();
    if window.len() >= 2 {
        let oldest = window[0];
        let newest = window[window.len() - 1];
        if oldest > 0.0 {
            let pump_pct = (newest / oldest - 1.0) * 100.0;
            if pump_pct > limits.max_recent_pump_pct {
                return QualityDecision::Reject(format!(
                    "price pumped {pump_pct:.1}% in the last 5m (max {:.1}%)",
                    limits.max_recent_pump_pct
                ));
            }
        }
    }

    QualityDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> QualityLimits {
        QualityLimits {
            min_liquidity_usdc: 50_000.0,
            max_price_impact_pct: 2.0,
            min_token_age_seconds: 3_600,
            min_24h_volume_usdc: 10_000.0,
            max_recent_pump_pct: 50.0,
            whitelist: HashSet::new(),
        }
    }

    fn metadata(liquidity: f64, volume: f64, age: u64) -> TokenMetadata {
        TokenMetadata {
            mint: Pubkey::new_unique(),
            liquidity_usdc: liquidity,
            volume_24h_usdc: volume,
            token_age_seconds: age,
            price_history: VecDeque::new(),
            last_updated: Instant::now(),
        }
    }

    #[test]
    fn healthy_token_passes() {
        let decision = evaluate(&limits(), &metadata(100_000.0, 50_000.0, 86_400), 2.0);
        assert_eq!(decision, QualityDecision::Allow);
    }

    #[test]
    fn checks_fire_in_order() {
        // Low liquidity outranks every later failure.
        let bad = metadata(1_000.0, 0.0, 0);
        match evaluate(&limits(), &bad, 2.0) {
            QualityDecision::Reject(reason) => assert!(reason.contains("liquidity")),
            other => panic!("unexpected: {other:?}"),
        }

        let young = metadata(100_000.0, 0.0, 60);
        match evaluate(&limits(), &young, 2.0) {
            QualityDecision::Reject(reason) => assert!(reason.contains("age")),
            other => panic!("unexpected: {other:?}"),
        }

        let thin = metadata(100_000.0, 500.0, 86_400);
        match evaluate(&limits(), &thin, 2.0) {
            QualityDecision::Reject(reason) => assert!(reason.contains("volume")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn price_impact_scales_with_amount() {
        let m = metadata(50_000.0, 50_000.0, 86_400);
        assert_eq!(evaluate(&limits(), &m, 2.0), QualityDecision::Allow);
        // 2000 / 50_000 * 100 = 4% > 2%
        match evaluate(&limits(), &m, 2_000.0) {
            QualityDecision::Reject(reason) => assert!(reason.contains("impact")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn recent_pump_rejects() {
        let mut m = metadata(100_000.0, 50_000.0, 86_400);
        let now = Instant::now();
        m.price_history.push_back((now - Duration::from_secs(200), 1.0));
        m.price_history.push_back((now, 1.8));
        match evaluate(&limits(), &m, 2.0) {
            QualityDecision::Reject(reason) => assert!(reason.contains("pump")),
            other => panic!("unexpected: {other:?}"),
        }

        // A 20% move stays under the 50% cap.
        let mut calm = metadata(100_000.0, 50_000.0, 86_400);
        calm.price_history.push_back((now - Duration::from_secs(200), 1.0));
        calm.price_history.push_back((now, 1.2));
        assert_eq!(evaluate(&limits(), &calm, 2.0), QualityDecision::Allow);
    }

    #[test]
    fn single_sample_history_cannot_pump() {
        let mut m = metadata(100_000.0, 50_000.0, 86_400);
        m.price_history.push_back((Instant::now(), 99.0));
        assert_eq!(evaluate(&limits(), &m, 2.0), QualityDecision::Allow);
    }

    #[test]
    fn history_trims_to_window() {
        let mut m = metadata(100_000.0, 50_000.0, 86_400);
        let now = Instant::now();
        m.price_history.push_back((now - Duration::from_secs(400), 1.0));
        m.price_history.push_back((now - Duration::from_secs(100), 2.0));
        m.trim_history();
        assert_eq!(m.price_history.len(), 1);
    }

    #[tokio::test]
    async fn whitelist_bypasses_checks() {
        use crate::classifier::Aggregator;
        use crate::detector::TradeDirection;
        use solana_sdk::signature::Signature;

        let mint = Pubkey::new_unique();
        let mut l = limits();
        l.whitelist.insert(mint);
        let filter = QualityFilter::new(
            l,
            Arc::new(MetadataClient::new(
                Client::new(),
                Url::parse("http://localhost:9000/").unwrap(),
            )),
        );

        let trade = DetectedTrade {
            signature: Signature::default(),
            slot: 1,
            direction: TradeDirection::Buy,
            token_mint: mint,
            usdc_micro: 2_000_000,
            token_amount_raw: 1,
            token_decimals: 6,
            user: Pubkey::new_unique(),
            aggregator: Aggregator::Jupiter,
            detected_at: Instant::now(),
            detected_at_ms: 0,
        };
        assert_eq!(filter.should_copy(&trade, 2_000_000).await, QualityDecision::Allow);
    }

    #[tokio::test]
    async fn cached_metadata_is_used_while_fresh() {
        let filter = QualityFilter::new(
            limits(),
            Arc::new(MetadataClient::new(
                Client::new(),
                Url::parse("http://localhost:9000/").unwrap(),
            )),
        );
        let m = metadata(100_000.0, 50_000.0, 86_400);
        let mint = m.mint;
        filter.insert_for_test(m).await;
        let got = filter.metadata(&mint).await.unwrap();
        assert_eq!(got.mint, mint);
    }

    #[test]
    fn pairs_payload_parses() {
        let body = r#"{
            "pairs": [{
                "liquidity": {"usd": 812345.6},
                "volume": {"h24": 99999.5},
                "pairCreatedAt": 1700000000000,
                "priceUsd": "0.001234"
            }]
        }"#;
        let parsed: PairsResponse = serde_json::from_str(body).unwrap();
        let pair = parsed.pairs.unwrap().into_iter().next().unwrap();
        assert_eq!(pair.liquidity.unwrap().usd, Some(812345.6));
        assert_eq!(pair.volume.unwrap().h24, Some(99999.5));
        assert_eq!(pair.price_usd.as_deref(), Some("0.001234"));
    }
}
