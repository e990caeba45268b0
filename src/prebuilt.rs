//! Quote cache and pre-built transaction cache.
//!
//! The copy path must not pay quote + build + sign latency at trade time.
//! A background task keeps quotes warm for every whitelisted buy shape,
//! and a second task keeps a signed, ready-to-send buy transaction cached
//! per whitelisted mint. Consumption is an atomic take: the first caller
//! gets the transaction, everyone else falls through to the live path.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::{debug, warn};
use solana_sdk::{
    hash::Hash, pubkey::Pubkey, signature::Signature, signer::keypair::Keypair,
    transaction::VersionedTransaction,
};
use tokio::{sync::watch, task::JoinHandle, time::sleep};

use crate::{
    detector::USDC_MINT,
    quote::{Quote, QuoteClient, QuoteError, SwapMode},
};

const QUOTE_TTL: Duration = Duration::from_secs(5);
const QUOTE_REFRESH_INTERVAL: Duration = Duration::from_secs(3);
pub const PREBUILT_TTL: Duration = Duration::from_secs(45);
const PREBUILT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Entries expiring within this horizon are rebuilt ahead of time.
const PREBUILT_EXPIRY_HORIZON: Duration = Duration::from_secs(15);
/// Spacing between per-mint rebuilds within one refresh pass.
const PREBUILT_STAGGER: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    pub input_mint: Pubkey,
    pub output_mint: Pubkey,
    pub amount_raw: u64,
    pub mode: SwapMode,
}

impl QuoteKey {
    pub fn usdc_buy(token_mint: Pubkey, amount_micro: u64) -> Self {
        Self {
            input_mint: USDC_MINT,
            output_mint: token_mint,
            amount_raw: amount_micro,
            mode: SwapMode::ExactIn,
        }
    }
}

pub struct QuoteCache {
    client: Arc<QuoteClient>,
    slippage_bps: u16,
    entries: Mutex<HashMap<QuoteKey, Quote>>,
}

impl QuoteCache {
    pub fn new(client: Arc<QuoteClient>, slippage_bps: u16) -> Self {
        Self {
            client,
            slippage_bps,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &QuoteKey) -> Option<Quote> {
        let entries = self.entries.lock().expect("quote cache poisoned");
        entries
            .get(key)
            .filter(|quote| quote.age() < QUOTE_TTL)
            .cloned()
    }

    fn store(&self, key: QuoteKey, quote: Quote) {
        let mut entries = self.entries.lock().expect("quote cache poisoned");
        entries.retain(|_, q| q.age() < QUOTE_TTL);
        entries.insert(key, quote);
    }

    /// Cached quote if fresh, otherwise fetch, insert, and return.
    pub async fn get_with_cache(&self, key: QuoteKey) -> Result<Quote, QuoteError> {
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }
        let quote = self.fetch(&key).await?;
        self.store(key, quote.clone());
        Ok(quote)
    }

    /// Unconditional fetch-and-insert, used by the background refresher.
    pub async fn refresh(&self, key: QuoteKey) -> Result<(), QuoteError> {
        let quote = self.fetch(&key).await?;
        self.store(key, quote);
        Ok(())
    }

    async fn fetch(&self, key: &QuoteKey) -> Result<Quote, QuoteError> {
        self.client
            .quote(
                &key.input_mint,
                &key.output_mint,
                key.amount_raw,
                self.slippage_bps,
                key.mode,
            )
            .await
    }

    #[cfg(test)]
    fn insert_for_test(&self, key: QuoteKey, quote: Quote) {
        self.entries.lock().unwrap().insert(key, quote);
    }
}

/// A signed buy transaction held ready for a single send.
#[derive(Debug, Clone)]
pub struct PreBuilt {
    pub token_mint: Pubkey,
    pub transaction: VersionedTransaction,
    pub signature: Signature,
    pub quote: Quote,
    pub blockhash: Hash,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl PreBuilt {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn expires_within(&self, horizon: Duration) -> bool {
        Instant::now() + horizon >= self.expires_at
    }
}

#[derive(Default)]
pub struct PreBuiltCache {
    entries: Mutex<HashMap<Pubkey, PreBuilt>>,
}

impl PreBuiltCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically remove and return a non-expired entry. A stale entry is
    /// deleted and `None` returned; a concurrent second caller for the
    /// same mint observes `None`.
    pub fn take(&self, token_mint: &Pubkey) -> Option<PreBuilt> {
        let mut entries = self.entries.lock().expect("pre-built cache poisoned");
        let entry = entries.remove(token_mint)?;
        if entry.is_expired() {
            debug!("pre-built entry for {token_mint} expired; discarding");
            return None;
        }
        Some(entry)
    }

    pub fn insert(&self, prebuilt: PreBuilt) {
        let mut entries = self.entries.lock().expect("pre-built cache poisoned");
        entries.insert(prebuilt.token_mint, prebuilt);
    }

    /// True when the mint has no entry or its entry expires within the
    /// rebuild horizon.
    pub fn needs_rebuild(&self, token_mint: &Pubkey) -> bool {
        let entries = self.entries.lock().expect("pre-built cache poisoned");
        match entries.get(token_mint) {
            Some(entry) => entry.expires_within(PREBUILT_EXPIRY_HORIZON),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pre-built cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a rebuild needs, shared by the refresher task and the
/// post-take rebuild scheduled by the orchestrator.
pub struct PreBuilder {
    pub quotes: Arc<QuoteCache>,
    pub client: Arc<QuoteClient>,
    pub cache: Arc<PreBuiltCache>,
    pub operator: Arc<Keypair>,
    pub amount_micro: u64,
    pub compute_unit_price_micro_lamports: u64,
}

impl PreBuilder {
    /// Quote, build, sign, and cache a buy for one mint. Errors are
    /// reported to the caller; refresher loops log and continue.
    pub async fn rebuild(&self, token_mint: Pubkey) -> anyhow::Result<()> {
        use solana_sdk::signer::Signer;

        let key = QuoteKey::usdc_buy(token_mint, self.amount_micro);
        let quote = self.quotes.get_with_cache(key).await?;
        let bytes = self
            .client
            .build_swap(
                &quote,
                &self.operator.pubkey(),
                self.compute_unit_price_micro_lamports,
            )
            .await?;

        let unsigned: VersionedTransaction = bincode::deserialize(&bytes)?;
        let blockhash = *unsigned.message.recent_blockhash();
        let signed = VersionedTransaction::try_new(unsigned.message, &[self.operator.as_ref()])?;
        let signature = *signed
            .signatures
            .first()
            .ok_or_else(|| anyhow::anyhow!("signed transaction missing signature"))?;

        let now = Instant::now();
        self.cache.insert(PreBuilt {
            token_mint,
            transaction: signed,
            signature,
            quote,
            blockhash,
            created_at: now,
            expires_at: now + PREBUILT_TTL,
        });
        debug!("pre-built buy refreshed for {token_mint} ({signature})");
        Ok(())
    }
}

/// Keep quotes warm for every whitelisted buy shape.
pub fn spawn_quote_refresher(
    quotes: Arc<QuoteCache>,
    mints: Vec<Pubkey>,
    amount_micro: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for mint in &mints {
                let key = QuoteKey::usdc_buy(*mint, amount_micro);
                if let Err(err) = quotes.refresh(key).await {
                    warn!("quote refresh for {mint} failed: {err}");
                }
            }
            tokio::select! {
                _ = sleep(QUOTE_REFRESH_INTERVAL) => {}
                _ = shutdown.changed() => {
                    debug!("quote refresher stopping");
                    return;
                }
            }
        }
    })
}

/// Keep a signed buy ready per whitelisted mint, rebuilding entries that
/// are absent or close to expiry. Rebuilds are staggered across mints.
pub fn spawn_prebuilt_refresher(
    builder: Arc<PreBuilder>,
    mints: Vec<Pubkey>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for mint in &mints {
                if !builder.cache.needs_rebuild(mint) {
                    continue;
                }
                if let Err(err) = builder.rebuild(*mint).await {
                    warn!("pre-built rebuild for {mint} failed: {err:?}");
                }
                sleep(PREBUILT_STAGGER).await;
            }
            tokio::select! {
                _ = sleep(PREBUILT_REFRESH_INTERVAL) => {}
                _ = shutdown.changed() => {
                    debug!("pre-built refresher stopping");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::QuoteResponse;
    use solana_sdk::message::{Message, VersionedMessage};

    fn sample_quote(input: Pubkey, output: Pubkey, amount: u64) -> Quote {
        Quote {
            input_mint: input,
            output_mint: output,
            in_amount_raw: amount,
            out_amount_raw: amount * 2,
            other_amount_threshold: amount * 2,
            price_impact_pct: 0.01,
            mode: SwapMode::ExactIn,
            fetched_at: Instant::now(),
            response: QuoteResponse {
                input_mint: input.to_string(),
                in_amount: amount.to_string(),
                output_mint: output.to_string(),
                out_amount: (amount * 2).to_string(),
                other_amount_threshold: (amount * 2).to_string(),
                swap_mode: "ExactIn".to_string(),
                slippage_bps: 100,
                price_impact_pct: None,
                route_plan: serde_json::json!([]),
                context_slot: None,
            },
        }
    }

    fn sample_prebuilt(mint: Pubkey, ttl: Duration) -> PreBuilt {
        let now = Instant::now();
        PreBuilt {
            token_mint: mint,
            transaction: VersionedTransaction {
                signatures: vec![Signature::default()],
                message: VersionedMessage::Legacy(Message::default()),
            },
            signature: Signature::from([9u8; 64]),
            quote: sample_quote(USDC_MINT, mint, 2_000_000),
            blockhash: Hash::new_unique(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    fn quote_cache() -> QuoteCache {
        let http = reqwest::Client::new();
        let client = Arc::new(QuoteClient::new(
            http,
            url::Url::parse("http://localhost:9000/").unwrap(),
            None,
        ));
        QuoteCache::new(client, 100)
    }

    #[test]
    fn fresh_quote_is_served_from_cache() {
        let cache = quote_cache();
        let key = QuoteKey::usdc_buy(Pubkey::new_unique(), 2_000_000);
        cache.insert_for_test(key, sample_quote(key.input_mint, key.output_mint, 2_000_000));
        assert!(cache.cached(&key).is_some());
    }

    #[test]
    fn stale_quote_is_not_served() {
        let cache = quote_cache();
        let key = QuoteKey::usdc_buy(Pubkey::new_unique(), 2_000_000);
        let mut quote = sample_quote(key.input_mint, key.output_mint, 2_000_000);
        quote.fetched_at = Instant::now() - QUOTE_TTL - Duration::from_millis(1);
        cache.insert_for_test(key, quote);
        assert!(cache.cached(&key).is_none());
    }

    #[test]
    fn take_is_exactly_once() {
        let cache = Arc::new(PreBuiltCache::new());
        let mint = Pubkey::new_unique();
        cache.insert(sample_prebuilt(mint, Duration::from_secs(30)));

        let cache_a = Arc::clone(&cache);
        let cache_b = Arc::clone(&cache);
        let mint_copy = mint;
        let a = std::thread::spawn(move || cache_a.take(&mint_copy).is_some());
        let b = std::thread::spawn(move || cache_b.take(&mint_copy).is_some());
        let hits = [a.join().unwrap(), b.join().unwrap()]
            .iter()
            .filter(|hit| **hit)
            .count();
        assert_eq!(hits, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entry_is_deleted_on_take() {
        let cache = PreBuiltCache::new();
        let mint = Pubkey::new_unique();
        cache.insert(sample_prebuilt(mint, Duration::ZERO));
        assert!(cache.take(&mint).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn rebuild_horizon_flags_near_expiry_entries() {
        let cache = PreBuiltCache::new();
        let mint = Pubkey::new_unique();
        assert!(cache.needs_rebuild(&mint));

        cache.insert(sample_prebuilt(mint, PREBUILT_TTL));
        assert!(!cache.needs_rebuild(&mint));

        let near = Pubkey::new_unique();
        cache.insert(sample_prebuilt(near, Duration::from_secs(10)));
        assert!(cache.needs_rebuild(&near));
    }
}
