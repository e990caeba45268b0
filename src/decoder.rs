//! Transaction decoding from raw wire bytes.

use solana_sdk::{
    instruction::CompiledInstruction,
    message::{v0::MessageAddressTableLookup, VersionedMessage},
    pubkey::Pubkey,
    signature::Signature,
    transaction::{Transaction, VersionedTransaction},
};
use thiserror::Error;

/// Vote program; transactions referencing it are dropped right after decode.
const VOTE_PROGRAM: Pubkey = solana_sdk::pubkey!("Vote111111111111111111111111111111111111111");

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("transaction bytes decode failed (versioned and legacy): {0}")]
    Unparseable(String),
    #[error("transaction carries no signature")]
    MissingSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxVersion {
    Legacy,
    V0,
}

/// A structurally decoded transaction, alive for one pipeline pass.
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    pub signature: Signature,
    pub static_keys: Vec<Pubkey>,
    pub version: TxVersion,
    pub instructions: Vec<CompiledInstruction>,
    pub lookups: Vec<MessageAddressTableLookup>,
}

impl DecodedTransaction {
    pub fn is_vote(&self) -> bool {
        self.static_keys.contains(&VOTE_PROGRAM)
    }
}

/// A decoded transaction plus its fully expanded account-key vector
/// (static keys followed by lookup-table keys).
#[derive(Debug, Clone)]
pub struct ResolvedTransaction {
    pub decoded: DecodedTransaction,
    pub account_keys: Vec<Pubkey>,
}

impl ResolvedTransaction {
    /// Program id referenced by a compiled instruction, if its index is
    /// within the expanded key set.
    pub fn program_id(&self, instruction: &CompiledInstruction) -> Option<&Pubkey> {
        self.account_keys.get(instruction.program_id_index as usize)
    }
}

/// Decode one transaction blob. Versioned decode is attempted first;
/// a structural failure falls back to the legacy layout.
pub fn decode_transaction(bytes: &[u8]) -> Result<DecodedTransaction, DecodeError> {
    match bincode::deserialize::<VersionedTransaction>(bytes) {
        Ok(tx) => from_versioned(tx),
        Err(versioned_err) => match bincode::deserialize::<Transaction>(bytes) {
            Ok(tx) => from_legacy(tx),
            Err(legacy_err) => Err(DecodeError::Unparseable(format!(
                "versioned: {versioned_err}; legacy: {legacy_err}"
            ))),
        },
    }
}

fn from_versioned(tx: VersionedTransaction) -> Result<DecodedTransaction, DecodeError> {
    let signature = *tx.signatures.first().ok_or(DecodeError::MissingSignature)?;
    match tx.message {
        VersionedMessage::Legacy(message) => Ok(DecodedTransaction {
            signature,
            static_keys: message.account_keys,
            version: TxVersion::Legacy,
            instructions: message.instructions,
            lookups: Vec::new(),
        }),
        VersionedMessage::V0(message) => Ok(DecodedTransaction {
            signature,
            static_keys: message.account_keys,
            version: TxVersion::V0,
            instructions: message.instructions,
            lookups: message.address_table_lookups,
        }),
    }
}

fn from_legacy(tx: Transaction) -> Result<DecodedTransaction, DecodeError> {
    let signature = *tx.signatures.first().ok_or(DecodeError::MissingSignature)?;
    Ok(DecodedTransaction {
        signature,
        static_keys: tx.message.account_keys,
        version: TxVersion::Legacy,
        instructions: tx.message.instructions,
        lookups: Vec::new(),
    })
}
