//! Address-lookup-table resolution for versioned transactions.
//!
//! Table contents are fetched once and cached for the process lifetime
//! (deployed tables are immutable for this use). Concurrent requests for
//! the same table coalesce into a single fetch, and fetches are globally
//! throttled to at most two per second.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use log::{debug, warn};
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    address_lookup_table::state::AddressLookupTable,
    message::v0::MessageAddressTableLookup, pubkey::Pubkey,
};
use tokio::{sync::Mutex, time::sleep};

use crate::decoder::{DecodedTransaction, ResolvedTransaction, TxVersion};

const MIN_FETCH_SPACING: Duration = Duration::from_millis(500);

pub struct LookupResolver {
    rpc: Arc<RpcClient>,
    cache: RwLock<HashMap<Pubkey, Arc<Vec<Pubkey>>>>,
    inflight: Mutex<HashMap<Pubkey, Arc<Mutex<()>>>>,
    last_fetch: Mutex<Option<Instant>>,
}

impl LookupResolver {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            last_fetch: Mutex::new(None),
        }
    }

    /// Expand a decoded transaction to its full account-key vector.
    ///
    /// Tables that cannot be fetched are skipped; callers receive the
    /// best-effort key set (static keys are always present, in order,
    /// ahead of any lookup keys).
    pub async fn resolve(&self, decoded: DecodedTransaction) -> ResolvedTransaction {
        if decoded.version == TxVersion::Legacy || decoded.lookups.is_empty() {
            let account_keys = decoded.static_keys.clone();
            return ResolvedTransaction {
                decoded,
                account_keys,
            };
        }

        let mut account_keys = decoded.static_keys.clone();
        for lookup in &decoded.lookups {
            match self.table(&lookup.account_key).await {
                Some(addresses) => append_table_keys(&mut account_keys, lookup, &addresses),
                None => warn!(
                    "lookup table {} unavailable; continuing with partial keys for {}",
                    lookup.account_key, decoded.signature
                ),
            }
        }

        ResolvedTransaction {
            decoded,
            account_keys,
        }
    }

    /// Cached table addresses, fetching on miss. At most one fetch per
    /// table is in flight at a time.
    async fn table(&self, table: &Pubkey) -> Option<Arc<Vec<Pubkey>>> {
        if let Some(hit) = self.cached(table) {
            return Some(hit);
        }

        let table_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(*table)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = table_lock.lock().await;

        // A coalesced waiter sees the winner's insert here.
        if let Some(hit) = self.cached(table) {
            return Some(hit);
        }

        self.throttle().await;
        let fetched = self.fetch_table(table).await;
        if let Some(ref addresses) = fetched {
            self.cache
                .write()
                .expect("lookup cache poisoned")
                .insert(*table, Arc::clone(addresses));
        }
        self.inflight.lock().await.remove(table);
        fetched
    }

    fn cached(&self, table: &Pubkey) -> Option<Arc<Vec<Pubkey>>> {
        self.cache
            .read()
            .expect("lookup cache poisoned")
            .get(table)
            .cloned()
    }

    async fn fetch_table(&self, table: &Pubkey) -> Option<Arc<Vec<Pubkey>>> {
        let account = match self.rpc.get_account(table).await {
            Ok(account) => account,
            Err(err) => {
                warn!("lookup table {table} fetch failed: {err}");
                return None;
            }
        };
        match AddressLookupTable::deserialize(&account.data) {
            Ok(state) => {
                let addresses: Vec<Pubkey> = state.addresses.to_vec();
                debug!("cached lookup table {table} with {} addresses", addresses.len());
                Some(Arc::new(addresses))
            }
            Err(err) => {
                warn!("lookup table {table} deserialization failed: {err}");
                None
            }
        }
    }

    /// Global fetch spacing. The wait is computed while holding the lock
    /// and slept outside it; the reserved instant keeps concurrent callers
    /// spaced even before the sleep completes.
    async fn throttle(&self) {
        let wait = {
            let mut last = self.last_fetch.lock().await;
            let now = Instant::now();
            let next_allowed = match *last {
                Some(prev) => prev + MIN_FETCH_SPACING,
                None => now,
            };
            let slot = next_allowed.max(now);
            *last = Some(slot);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    #[cfg(test)]
    fn prime(&self, table: Pubkey, addresses: Vec<Pubkey>) {
        self.cache
            .write()
            .unwrap()
            .insert(table, Arc::new(addresses));
    }
}

/// Append a table's referenced addresses: writable indices first, then
/// readonly, preserving per-table order. Out-of-range indices are skipped.
fn append_table_keys(
    keys: &mut Vec<Pubkey>,
    lookup: &MessageAddressTableLookup,
    addresses: &[Pubkey],
) {
    for &index in lookup
        .writable_indexes
        .iter()
        .chain(lookup.readonly_indexes.iter())
    {
        match addresses.get(index as usize) {
            Some(key) => keys.push(*key),
            None => debug!(
                "lookup index {index} out of range for table with {} addresses",
                addresses.len()
            ),
        }
    }
}
