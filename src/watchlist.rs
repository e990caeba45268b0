//! Watched-wallet set consulted on the hot path.

use std::{
    collections::HashSet,
    sync::RwLock,
};

use solana_sdk::pubkey::Pubkey;

/// Read-mostly set of wallets being mirrored. The pipeline reads it for
/// every transaction; the subscription manager mutates it rarely.
#[derive(Debug, Default)]
pub struct Watchlist {
    wallets: RwLock<HashSet<Pubkey>>,
}

impl Watchlist {
    pub fn new(initial: impl IntoIterator<Item = Pubkey>) -> Self {
        Self {
            wallets: RwLock::new(initial.into_iter().collect()),
        }
    }

    /// First watched wallet appearing in the resolved account keys.
    /// O(#keys in the transaction), not O(#watched).
    pub fn first_watched(&self, account_keys: &[Pubkey]) -> Option<Pubkey> {
        let wallets = self.wallets.read().expect("watchlist poisoned");
        account_keys.iter().find(|key| wallets.contains(key)).copied()
    }

    pub fn insert(&self, wallet: Pubkey) -> bool {
        self.wallets.write().expect("watchlist poisoned").insert(wallet)
    }

    pub fn remove(&self, wallet: &Pubkey) -> bool {
        self.wallets.write().expect("watchlist poisoned").remove(wallet)
    }

    pub fn contains(&self, wallet: &Pubkey) -> bool {
        self.wallets.read().expect("watchlist poisoned").contains(wallet)
    }

    pub fn len(&self) -> usize {
        self.wallets.read().expect("watchlist poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Pubkey> {
        self.wallets
            .read()
            .expect("watchlist poisoned")
            .iter()
            .copied()
            .collect()
    }
}
