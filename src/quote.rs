//! Swap-quote and transaction-build API client.
//!
//! The external aggregator API quotes swaps over `GET /quote` and returns
//! ready-to-sign serialized transactions from `POST /swap`. All amounts
//! cross the wire as integer strings.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, warn};
use reqwest::{header::HeaderValue, Client};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use url::Url;

const API_TIMEOUT: Duration = Duration::from_secs(2);
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("quote request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("quote endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("quote response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("swap build request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("swap build endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("swap build response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapMode {
    ExactIn,
    ExactOut,
}

impl SwapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapMode::ExactIn => "ExactIn",
            SwapMode::ExactOut => "ExactOut",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    #[serde(rename = "inputMint")]
    pub input_mint: String,
    #[serde(rename = "inAmount")]
    pub in_amount: String,
    #[serde(rename = "outputMint")]
    pub output_mint: String,
    #[serde(rename = "outAmount")]
    pub out_amount: String,
    #[serde(rename = "otherAmountThreshold")]
    pub other_amount_threshold: String,
    #[serde(rename = "swapMode")]
    pub swap_mode: String,
    #[serde(rename = "slippageBps")]
    pub slippage_bps: u16,
    #[serde(rename = "priceImpactPct", default)]
    pub price_impact_pct: Option<String>,
    #[serde(rename = "routePlan", default)]
    pub route_plan: serde_json::Value,
    #[serde(rename = "contextSlot", default)]
    pub context_slot: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SwapRequest<'a> {
    #[serde(rename = "quoteResponse")]
    quote_response: &'a QuoteResponse,
    #[serde(rename = "userPublicKey")]
    user_public_key: String,
    #[serde(rename = "wrapAndUnwrapSol")]
    wrap_and_unwrap_sol: bool,
    #[serde(rename = "computeUnitPriceMicroLamports")]
    compute_unit_price_micro_lamports: u64,
    #[serde(rename = "dynamicComputeUnitLimit")]
    dynamic_compute_unit_limit: bool,
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    #[serde(rename = "swapTransaction")]
    swap_transaction: String,
}

/// A normalized quote plus the raw response needed by the build endpoint.
#[derive(Debug, Clone)]
pub struct Quote {
    pub input_mint: Pubkey,
    pub output_mint: Pubkey,
    pub in_amount_raw: u64,
    pub out_amount_raw: u64,
    pub other_amount_threshold: u64,
    pub price_impact_pct: f64,
    pub mode: SwapMode,
    pub fetched_at: Instant,
    pub response: QuoteResponse,
}

impl Quote {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

pub struct QuoteClient {
    http: Client,
    base: Url,
    api_key: Option<HeaderValue>,
}

impl QuoteClient {
    pub fn new(http: Client, base: Url, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .and_then(|key| match HeaderValue::from_str(key) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("quote API key contains invalid header characters; ignoring");
                    None
                }
            });
        Self {
            http,
            base,
            api_key,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(API_TIMEOUT);
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key.clone()),
            None => builder,
        }
    }

    pub async fn quote(
        &self,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount_raw: u64,
        slippage_bps: u16,
        mode: SwapMode,
    ) -> Result<Quote, QuoteError> {
        let mut url = self
            .base
            .join("quote")
            .map_err(|e| QuoteError::Malformed(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("inputMint", &input_mint.to_string())
            .append_pair("outputMint", &output_mint.to_string())
            .append_pair("amount", &amount_raw.to_string())
            .append_pair("slippageBps", &slippage_bps.to_string())
            .append_pair("swapMode", mode.as_str());

        let response = self.request(self.http.get(url)).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(QuoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: QuoteResponse =
            serde_json::from_str(&body).map_err(|e| QuoteError::Malformed(e.to_string()))?;
        normalize_quote(parsed, mode)
    }

    /// Request a serialized swap transaction for a previously fetched quote.
    /// Returns the raw (unsigned) transaction bytes.
    pub async fn build_swap(
        &self,
        quote: &Quote,
        user: &Pubkey,
        compute_unit_price_micro_lamports: u64,
    ) -> Result<Vec<u8>, BuildError> {
        let url = self
            .base
            .join("swap")
            .map_err(|e| BuildError::Malformed(e.to_string()))?;
        let request = SwapRequest {
            quote_response: &quote.response,
            user_public_key: user.to_string(),
            wrap_and_unwrap_sol: true,
            compute_unit_price_micro_lamports,
            dynamic_compute_unit_limit: true,
        };

        let response = self
            .request(self.http.post(url))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BuildError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SwapResponse =
            serde_json::from_str(&body).map_err(|e| BuildError::Malformed(e.to_string()))?;
        BASE64
            .decode(parsed.swap_transaction.as_bytes())
            .map_err(|e| BuildError::Malformed(format!("swap transaction base64: {e}")))
    }

    /// Open connection pools with one lightweight request per endpoint.
    /// Failures are logged and ignored; this only trades startup latency.
    pub async fn warm_up(&self) {
        for path in ["tokens", "quote", "swap"] {
            let Ok(url) = self.base.join(path) else {
                continue;
            };
            match self.request(self.http.get(url)).send().await {
                Ok(response) => debug!("warm-up {} -> {}", path, response.status()),
                Err(err) => debug!("warm-up {} failed: {}", path, err),
            }
        }
    }
}

fn normalize_quote(response: QuoteResponse, mode: SwapMode) -> Result<Quote, QuoteError> {
    let input_mint = response
        .input_mint
        .parse::<Pubkey>()
        .map_err(|e| QuoteError::Malformed(format!("inputMint: {e}")))?;
    let output_mint = response
        .output_mint
        .parse::<Pubkey>()
        .map_err(|e| QuoteError::Malformed(format!("outputMint: {e}")))?;
    let in_amount_raw = response
        .in_amount
        .parse::<u64>()
        .map_err(|e| QuoteError::Malformed(format!("inAmount: {e}")))?;
    let out_amount_raw = response
        .out_amount
        .parse::<u64>()
        .map_err(|e| QuoteError::Malformed(format!("outAmount: {e}")))?;
    let other_amount_threshold = response
        .other_amount_threshold
        .parse::<u64>()
        .map_err(|e| QuoteError::Malformed(format!("otherAmountThreshold: {e}")))?;
    let price_impact_pct = response
        .price_impact_pct
        .as_deref()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(Quote {
        input_mint,
        output_mint,
        in_amount_raw,
        out_amount_raw,
        other_amount_threshold,
        price_impact_pct,
        mode,
        fetched_at: Instant::now(),
        response,
    })
}
