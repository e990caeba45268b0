//! Shared swap execution path: quote, build, sign, race-submit.
//!
//! Both the copy orchestrator and the exit manager funnel their live
//! (non-pre-built) swaps through here so that fee settings, signing, and
//! transport behavior stay in one place.

use std::{sync::Arc, time::Instant};

use log::debug;
use solana_sdk::{
    pubkey::Pubkey,
    signature::Signature,
    signer::{keypair::Keypair, Signer, SignerError},
    transaction::VersionedTransaction,
};
use thiserror::Error;

use crate::{
    detector::USDC_MINT,
    prebuilt::{PreBuilt, QuoteCache, QuoteKey},
    quote::{BuildError, Quote, QuoteClient, QuoteError, SwapMode},
    submitter::{RaceSubmitter, SubmissionError},
};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Quote(#[from] QuoteError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("swap transaction deserialization failed: {0}")]
    Deserialize(#[from] bincode::Error),
    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("token amount {0} exceeds the wire range")]
    AmountRange(u128),
}

pub struct SwapExecutor {
    quotes: Arc<QuoteCache>,
    client: Arc<QuoteClient>,
    submitter: Arc<RaceSubmitter>,
    operator: Arc<Keypair>,
    compute_unit_price_micro_lamports: u64,
}

impl SwapExecutor {
    pub fn new(
        quotes: Arc<QuoteCache>,
        client: Arc<QuoteClient>,
        submitter: Arc<RaceSubmitter>,
        operator: Arc<Keypair>,
        compute_unit_price_micro_lamports: u64,
    ) -> Self {
        Self {
            quotes,
            client,
            submitter,
            operator,
            compute_unit_price_micro_lamports,
        }
    }

    /// Buy a token with an exact USDC spend.
    pub async fn buy_exact_usdc(
        &self,
        token_mint: Pubkey,
        usdc_micro: u64,
    ) -> Result<(Signature, Quote), ExecError> {
        let key = QuoteKey::usdc_buy(token_mint, usdc_micro);
        let quote = self.quotes.get_with_cache(key).await?;
        let signature = self.execute_quote(&quote).await?;
        Ok((signature, quote))
    }

    /// Sell a token for an exact USDC amount out (mirrors the original
    /// trade's USDC leg).
    pub async fn sell_exact_usdc_out(
        &self,
        token_mint: Pubkey,
        usdc_micro: u64,
    ) -> Result<(Signature, Quote), ExecError> {
        let key = QuoteKey {
            input_mint: token_mint,
            output_mint: USDC_MINT,
            amount_raw: usdc_micro,
            mode: SwapMode::ExactOut,
        };
        let quote = self.quotes.get_with_cache(key).await?;
        let signature = self.execute_quote(&quote).await?;
        Ok((signature, quote))
    }

    /// Sell an exact raw token quantity into USDC (exit path).
    pub async fn sell_exact_tokens(
        &self,
        token_mint: Pubkey,
        token_amount_raw: u128,
    ) -> Result<(Signature, Quote), ExecError> {
        let amount =
            u64::try_from(token_amount_raw).map_err(|_| ExecError::AmountRange(token_amount_raw))?;
        let key = QuoteKey {
            input_mint: token_mint,
            output_mint: USDC_MINT,
            amount_raw: amount,
            mode: SwapMode::ExactIn,
        };
        let quote = self.quotes.get_with_cache(key).await?;
        let signature = self.execute_quote(&quote).await?;
        Ok((signature, quote))
    }

    /// Build, sign, and race-submit a swap for an already-fetched quote.
    pub async fn execute_quote(&self, quote: &Quote) -> Result<Signature, ExecError> {
        let build_start = Instant::now();
        let bytes = self
            .client
            .build_swap(
                quote,
                &self.operator.pubkey(),
                self.compute_unit_price_micro_lamports,
            )
            .await?;

        let unsigned: VersionedTransaction = bincode::deserialize(&bytes)?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[self.operator.as_ref()])?;
        debug!(
            "swap built and signed in {} ms ({} -> {})",
            build_start.elapsed().as_millis(),
            quote.input_mint,
            quote.output_mint
        );

        let signature = self.submitter.submit(&signed).await?;
        self.submitter.spawn_confirmation_watcher(signature);
        Ok(signature)
    }

    /// Send a pre-built, pre-signed transaction. The entry was taken
    /// atomically from the cache, so this is its single use.
    pub async fn send_prebuilt(&self, prebuilt: &PreBuilt) -> Result<Signature, ExecError> {
        let signature = self.submitter.submit(&prebuilt.transaction).await?;
        self.submitter.spawn_confirmation_watcher(signature);
        Ok(signature)
    }
}
