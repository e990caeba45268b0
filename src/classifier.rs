//! Aggregator-routed swap classification.
//!
//! Only top-level instructions are examined: a swap routed through either
//! aggregator always carries the router instruction at the top level, and
//! the router program id usually arrives via a lookup table, which is why
//! classification runs on resolved account keys.

use solana_sdk::pubkey::Pubkey;

use crate::decoder::ResolvedTransaction;

pub const JUPITER_V6: Pubkey =
    solana_sdk::pubkey!("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4");
pub const OKX_DEX_ROUTER: Pubkey =
    solana_sdk::pubkey!("6m2CDdhRgxpH4WjvdzxAYbGxwdGUz5MziiL5jek2kBma");

/// Anchor discriminators of the Jupiter v6 swap entrypoints.
const JUPITER_SWAP_DISCRIMINATORS: [[u8; 8]; 12] = [
    [229, 23, 203, 151, 122, 227, 173, 42],  // route
    [150, 86, 71, 116, 167, 93, 14, 104],    // route_with_token_ledger
    [208, 51, 239, 151, 123, 43, 237, 92],   // exact_out_route
    [193, 32, 155, 51, 65, 214, 156, 129],   // shared_accounts_route
    [230, 121, 143, 80, 119, 159, 106, 170], // shared_accounts_route_with_token_ledger
    [176, 209, 105, 168, 154, 125, 69, 62],  // shared_accounts_exact_out_route
    [187, 100, 250, 103, 8, 156, 237, 209],  // route_v2
    [76, 36, 116, 68, 27, 41, 178, 93],      // exact_out_route_v2
    [254, 15, 62, 161, 60, 86, 93, 137],     // shared_accounts_route_v2
    [93, 218, 44, 126, 207, 81, 33, 175],    // shared_accounts_exact_out_route_v2
    [18, 99, 215, 7, 130, 64, 176, 88],      // route_with_token_ledger_v2
    [101, 47, 208, 190, 51, 132, 9, 244],    // shared_accounts_route_with_token_ledger_v2
];

/// Swap entrypoints of the OKX DEX aggregation router.
const OKX_SWAP_DISCRIMINATORS: [[u8; 8]; 6] = [
    [248, 198, 158, 145, 225, 117, 135, 200], // swap
    [65, 75, 63, 76, 235, 91, 91, 136],       // swap2
    [84, 120, 44, 19, 103, 160, 126, 201],    // commission_sol_swap
    [35, 11, 178, 161, 62, 222, 107, 74],     // commission_sol_swap2
    [87, 227, 190, 22, 204, 36, 254, 103],    // commission_spl_swap
    [174, 90, 156, 11, 66, 215, 33, 182],     // commission_spl_swap2
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregator {
    Jupiter,
    OkxDex,
}

impl Aggregator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregator::Jupiter => "jupiter",
            Aggregator::OkxDex => "okx-dex",
        }
    }
}

impl std::fmt::Display for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[inline]
fn prefix_u64(data: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[inline]
fn matches_any(prefix: u64, table: &[[u8; 8]]) -> bool {
    table.iter().any(|d| u64::from_le_bytes(*d) == prefix)
}

/// Tag a resolved transaction by the aggregator that routed it, if any.
/// Inner (CPI) instructions are not examined.
pub fn classify(tx: &ResolvedTransaction) -> Option<Aggregator> {
    for instruction in &tx.decoded.instructions {
        let Some(program) = tx.program_id(instruction) else {
            continue;
        };
        let Some(prefix) = prefix_u64(&instruction.data) else {
            continue;
        };
        if *program == JUPITER_V6 && matches_any(prefix, &JUPITER_SWAP_DISCRIMINATORS) {
            return Some(Aggregator::Jupiter);
        }
        if *program == OKX_DEX_ROUTER && matches_any(prefix, &OKX_SWAP_DISCRIMINATORS) {
            return Some(Aggregator::OkxDex);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodedTransaction, TxVersion};
    use solana_sdk::{instruction::CompiledInstruction, signature::Signature};

    /// Program id placed beyond the static keys, as a lookup table would.
    fn resolved_with(program: Pubkey, data: Vec<u8>) -> ResolvedTransaction {
        let statics = vec![Pubkey::new_unique(), Pubkey::new_unique()];
        let decoded = DecodedTransaction {
            signature: Signature::default(),
            static_keys: statics.clone(),
            version: TxVersion::V0,
            instructions: vec![CompiledInstruction {
                program_id_index: 2,
                accounts: vec![0, 1],
                data,
            }],
            lookups: vec![],
        };
        ResolvedTransaction {
            decoded,
            account_keys: statics.into_iter().chain([program]).collect(),
        }
    }

    #[test]
    fn every_jupiter_discriminator_classifies() {
        for disc in JUPITER_SWAP_DISCRIMINATORS {
            let mut data = disc.to_vec();
            data.extend_from_slice(&[0u8; 16]);
            let tx = resolved_with(JUPITER_V6, data);
            assert_eq!(classify(&tx), Some(Aggregator::Jupiter));
        }
    }

    #[test]
    fn every_okx_discriminator_classifies() {
        for disc in OKX_SWAP_DISCRIMINATORS {
            let tx = resolved_with(OKX_DEX_ROUTER, disc.to_vec());
            assert_eq!(classify(&tx), Some(Aggregator::OkxDex));
        }
    }

    #[test]
    fn near_miss_prefixes_do_not_classify() {
        for table in [
            &JUPITER_SWAP_DISCRIMINATORS[..],
            &OKX_SWAP_DISCRIMINATORS[..],
        ] {
            for disc in table {
                for flip in 0..8 {
                    let mut data = disc.to_vec();
                    data[flip] ^= 0x01;
                    let altered: [u8; 8] = data[..8].try_into().unwrap();
                    // A single-byte mutation may collide with a sibling
                    // entry; only genuinely unknown prefixes must miss.
                    let known = JUPITER_SWAP_DISCRIMINATORS.contains(&altered)
                        || OKX_SWAP_DISCRIMINATORS.contains(&altered);
                    if known {
                        continue;
                    }
                    assert_eq!(classify(&resolved_with(JUPITER_V6, data.clone())), None);
                    assert_eq!(classify(&resolved_with(OKX_DEX_ROUTER, data)), None);
                }
            }
        }
    }

    #[test]
    fn unknown_program_does_not_classify() {
        let data = JUPITER_SWAP_DISCRIMINATORS[0].to_vec();
        let tx = resolved_with(Pubkey::new_unique(), data);
        assert_eq!(classify(&tx), None);
    }

    #[test]
    fn short_data_does_not_classify() {
        let tx = resolved_with(JUPITER_V6, vec![229, 23, 203]);
        assert_eq!(classify(&tx), None);
    }

    #[test]
    fn program_reached_through_lookup_keys_classifies() {
        // The router id sits past the static keys, exactly where resolution
        // placed it; classification must still see it.
        let tx = resolved_with(JUPITER_V6, JUPITER_SWAP_DISCRIMINATORS[0].to_vec());
        assert!(tx.decoded.static_keys.len() <= tx.account_keys.len());
        assert_eq!(classify(&tx), Some(Aggregator::Jupiter));
    }
}
