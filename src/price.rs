//! Batched price lookups for the exit manager.

use std::collections::HashMap;

use reqwest::Client;
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("price endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("price response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    data: HashMap<String, PriceEntry>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    price: f64,
}

pub struct PriceClient {
    http: Client,
    base: Url,
}

impl PriceClient {
    pub fn new(http: Client, base: Url) -> Self {
        Self { http, base }
    }

    /// Fetch every mint's price in one request. Mints absent from the
    /// response are simply missing from the returned map.
    pub async fn prices(&self, mints: &[Pubkey]) -> Result<HashMap<Pubkey, f64>, PriceError> {
        if mints.is_empty() {
            return Ok(HashMap::new());
        }

        let ids = mints
            .iter()
            .map(Pubkey::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut url = self
            .base
            .join("price")
            .map_err(|e| PriceError::Malformed(e.to_string()))?;
        url.query_pairs_mut().append_pair("ids", &ids);

        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PriceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PriceResponse =
            serde_json::from_str(&body).map_err(|e| PriceError::Malformed(e.to_string()))?;
        Ok(parsed
            .data
            .into_iter()
            .filter_map(|(mint, entry)| Some((mint.parse().ok()?, entry.price)))
            .collect())
    }
}
