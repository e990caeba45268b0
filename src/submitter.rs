//! Race submission across the RPC path and the bundle relay.
//!
//! Both transports carry identical signed bytes; the chain deduplicates on
//! signature, so the submitter can return on the first acknowledgment and
//! let the slower path finish in the background for logging.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, warn};
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    signature::Signature,
    signer::keypair::Keypair,
    transaction::VersionedTransaction,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{events::TraceLog, relay::BundleRelay};

const CONFIRMATION_BUDGET: Duration = Duration::from_secs(30);
const CONFIRMATION_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("transaction carries no signature")]
    MissingSignature,
    #[error("rpc submission failed: {0}")]
    Rpc(#[from] solana_rpc_client_api::client_error::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Rpc,
    BundleRelay,
}

impl Transport {
    fn as_str(&self) -> &'static str {
        match self {
            Transport::Rpc => "rpc",
            Transport::BundleRelay => "bundle-relay",
        }
    }
}

struct SendOutcome {
    transport: Transport,
    result: Result<(), String>,
    elapsed: Duration,
    rpc_error: Option<SubmissionError>,
}

pub struct RaceSubmitter {
    rpc: Arc<RpcClient>,
    relay: Option<Arc<BundleRelay>>,
    operator: Arc<Keypair>,
    tip_lamports: u64,
    trace: TraceLog,
}

impl RaceSubmitter {
    pub fn new(
        rpc: Arc<RpcClient>,
        relay: Option<Arc<BundleRelay>>,
        operator: Arc<Keypair>,
        tip_lamports: u64,
        trace: TraceLog,
    ) -> Self {
        Self {
            rpc,
            relay,
            operator,
            tip_lamports,
            trace,
        }
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay.is_some()
    }

    /// Dispatch one signed transaction over every available transport and
    /// return its own signature as soon as any transport acknowledges.
    /// Which transport answered first is logged, never relied upon.
    pub async fn submit(&self, tx: &VersionedTransaction) -> Result<Signature, SubmissionError> {
        let signature = *tx
            .signatures
            .first()
            .ok_or(SubmissionError::MissingSignature)?;

        let (outcome_tx, mut outcome_rx) = mpsc::channel::<SendOutcome>(2);
        let mut transports = 0usize;

        {
            let rpc = Arc::clone(&self.rpc);
            let tx = tx.clone();
            let outcome_tx = outcome_tx.clone();
            transports += 1;
            tokio::spawn(async move {
                let started = Instant::now();
                let result = send_rpc(&rpc, &tx).await;
                let outcome = SendOutcome {
                    transport: Transport::Rpc,
                    result: result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
                    elapsed: started.elapsed(),
                    rpc_error: result.err(),
                };
                let _ = outcome_tx.send(outcome).await;
            });
        }

        if let Some(relay) = self.relay.as_ref() {
            let relay = Arc::clone(relay);
            let operator = Arc::clone(&self.operator);
            let tip_lamports = self.tip_lamports;
            let tx = tx.clone();
            let outcome_tx = outcome_tx.clone();
            transports += 1;
            tokio::spawn(async move {
                let started = Instant::now();
                let result = relay
                    .submit(&operator, tip_lamports, &tx)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                let _ = outcome_tx
                    .send(SendOutcome {
                        transport: Transport::BundleRelay,
                        result,
                        elapsed: started.elapsed(),
                        rpc_error: None,
                    })
                    .await;
            });
        }
        drop(outcome_tx);

        let mut rpc_error: Option<SubmissionError> = None;
        let mut remaining = transports;
        while remaining > 0 {
            let Some(outcome) = outcome_rx.recv().await else {
                break;
            };
            remaining -= 1;
            match outcome.result {
                Ok(()) => {
                    self.trace.line(format!(
                        "{} accepted {} in {} ms",
                        outcome.transport.as_str(),
                        signature,
                        outcome.elapsed.as_millis()
                    ));
                    if remaining > 0 {
                        // Drain the slower path off the caller's latency.
                        tokio::spawn(async move {
                            while let Some(late) = outcome_rx.recv().await {
                                match late.result {
                                    Ok(()) => debug!(
                                        "{} also accepted {} in {} ms",
                                        late.transport.as_str(),
                                        signature,
                                        late.elapsed.as_millis()
                                    ),
                                    Err(err) => debug!(
                                        "{} failed for {} after {} ms: {}",
                                        late.transport.as_str(),
                                        signature,
                                        late.elapsed.as_millis(),
                                        err
                                    ),
                                }
                            }
                        });
                    }
                    return Ok(signature);
                }
                Err(err) => {
                    warn!(
                        "{} failed for {} after {} ms: {}",
                        outcome.transport.as_str(),
                        signature,
                        outcome.elapsed.as_millis(),
                        err
                    );
                    if let Some(e) = outcome.rpc_error {
                        rpc_error = Some(e);
                    }
                }
            }
        }

        // Both transports failed; the RPC error carries the most detail.
        Err(rpc_error.unwrap_or(SubmissionError::MissingSignature))
    }

    /// Best-effort confirmation watcher. Logs the landing, never surfaces
    /// an error to the copy path.
    pub fn spawn_confirmation_watcher(&self, signature: Signature) {
        let rpc = Arc::clone(&self.rpc);
        let trace = self.trace.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            while started.elapsed() < CONFIRMATION_BUDGET {
                match rpc
                    .confirm_transaction_with_commitment(&signature, CommitmentConfig::confirmed())
                    .await
                {
                    Ok(response) if response.value => {
                        trace.line(format!(
                            "{} confirmed after {} ms",
                            signature,
                            started.elapsed().as_millis()
                        ));
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => debug!("confirmation poll for {signature} failed: {err}"),
                }
                tokio::time::sleep(CONFIRMATION_POLL).await;
            }
            warn!("{signature} unconfirmed after {CONFIRMATION_BUDGET:?}");
        });
    }
}

async fn send_rpc(
    rpc: &RpcClient,
    tx: &VersionedTransaction,
) -> Result<Signature, SubmissionError> {
    let config = RpcSendTransactionConfig {
        skip_preflight: true,
        preflight_commitment: Some(CommitmentLevel::Processed),
        max_retries: Some(2),
        ..RpcSendTransactionConfig::default()
    };
    Ok(rpc.send_transaction_with_config(tx, config).await?)
}
