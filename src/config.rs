//! Engine configuration.
//!
//! All options live in one flat environment namespace, loaded from the
//! process environment with `.env` overlay. Every knob has a default
//! except the chain RPC endpoint and the operator key.

use std::{collections::HashSet, env, str::FromStr, sync::Arc, time::Duration};

use base64::{engine::general_purpose, Engine as _};
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use thiserror::Error;
use url::Url;

use crate::{
    amounts::ui_usdc_to_micro,
    exit_manager::{ExitRules, TakeProfitTarget},
    positions::RiskLimits,
    quality::QualityLimits,
};

const DEFAULT_STREAM_ENDPOINT: &str = "18.234.24.82:50051";
const DEFAULT_QUOTE_API_URL: &str = "https://quote-api.jup.ag/v6/";
const DEFAULT_PRICE_API_URL: &str = "https://price.jup.ag/v6/";
const DEFAULT_METADATA_API_URL: &str = "https://api.dexscreener.com/latest/dex/";
const DEFAULT_RELAY_ENDPOINT: &str = "https://mainnet.block-engine.jito.wtf/api/v1";
/// $WIF, the default whitelisted mint.
const DEFAULT_ALLOWED_TOKEN: &str = "EKpQGSJtjMFqKZ9KQanSqYXRcF8fBopzLHYxdM65zcjm";
const DEFAULT_TAKE_PROFIT_TARGETS: &str = "50:25,100:50,300:100";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("pubkey parse error for {0}")]
    Pubkey(String, #[source] solana_sdk::pubkey::ParsePubkeyError),
    #[error("invalid value {value} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid URL for {key}: {value}")]
    InvalidUrl { key: String, value: String },
    #[error("invalid boolean value {value} for {key}")]
    InvalidBoolean { key: String, value: String },
}

#[derive(Clone)]
pub struct Config {
    pub operator: Arc<Keypair>,
    pub stream_endpoint: String,
    pub stream_reconnect: Duration,
    pub stream_max_attempts: Option<u32>,
    pub rpc_endpoint: String,
    pub quote_api_url: Url,
    pub quote_api_key: Option<String>,
    pub price_api_url: Url,
    pub metadata_api_url: Url,
    pub relay_endpoint: String,
    pub trade_amount_micro: u64,
    pub allowed_tokens: Vec<Pubkey>,
    pub slippage_bps: u16,
    pub priority_fee_microlamports: u64,
    pub use_bundle_relay: bool,
    pub bundle_tip_lamports: u64,
    pub copy_buys_only: bool,
    pub min_trade_micro: u64,
    pub risk: RiskLimits,
    pub filter_enabled: bool,
    pub filter: QualityLimits,
    pub exit_enabled: bool,
    pub exit: ExitRules,
    pub target_wallets: Vec<Pubkey>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        // Optional .env overlay; real environment variables win.
        dotenvy::dotenv().ok();

        let operator = Arc::new(parse_keypair(&required("PRIVATE_KEY")?)?);
        let rpc_endpoint = required("RPC_ENDPOINT")?;

        let allowed_tokens =
            parse_pubkey_list(&var_or("TRADE_ALLOWED_TOKENS", DEFAULT_ALLOWED_TOKEN))?;
        let whitelist: HashSet<Pubkey> = allowed_tokens.iter().copied().collect();

        let stream_max_attempts = match env_var("STREAM_MAX_ATTEMPTS") {
            Some(raw) => Some(parse_number("STREAM_MAX_ATTEMPTS", &raw)?),
            None => None,
        };

        Ok(Self {
            operator,
            stream_endpoint: var_or("STREAM_ENDPOINT", DEFAULT_STREAM_ENDPOINT),
            stream_reconnect: Duration::from_millis(parse_var_or("STREAM_RECONNECT_MS", 5_000)?),
            stream_max_attempts,
            rpc_endpoint,
            quote_api_url: parse_url("QUOTE_API_URL", DEFAULT_QUOTE_API_URL)?,
            quote_api_key: env_var("QUOTE_API_KEY"),
            price_api_url: parse_url("PRICE_API_URL", DEFAULT_PRICE_API_URL)?,
            metadata_api_url: parse_url("METADATA_API_URL", DEFAULT_METADATA_API_URL)?,
            relay_endpoint: var_or("RELAY_ENDPOINT", DEFAULT_RELAY_ENDPOINT),
            trade_amount_micro: parse_usdc_or("TRADE_AMOUNT_USDC", "2")?,
            allowed_tokens,
            slippage_bps: parse_var_or("TRADE_SLIPPAGE_BPS", 100u16)?,
            priority_fee_microlamports: parse_var_or(
                "TRADE_PRIORITY_FEE_MICROLAMPORTS",
                200_000u64,
            )?,
            use_bundle_relay: parse_bool_or("TRADE_USE_BUNDLE_RELAY", false)?,
            bundle_tip_lamports: parse_var_or("TRADE_BUNDLE_TIP_LAMPORTS", 1_000_000u64)?,
            copy_buys_only: parse_bool_or("TRADE_COPY_BUYS_ONLY", false)?,
            min_trade_micro: parse_usdc_or("TRADE_MIN_USDC", "0")?,
            risk: RiskLimits {
                max_position_micro: parse_usdc_or("RISK_MAX_POSITION_USDC", "50")?,
                max_total_exposure_micro: parse_usdc_or("RISK_MAX_TOTAL_EXPOSURE_USDC", "200")?,
                max_open_positions: parse_var_or("RISK_MAX_OPEN_POSITIONS", 10usize)?,
                min_usdc_reserve_micro: parse_usdc_or("RISK_MIN_USDC_RESERVE", "10")?,
            },
            filter_enabled: parse_bool_or("FILTER_ENABLED", true)?,
            filter: QualityLimits {
                min_liquidity_usdc: parse_var_or("FILTER_MIN_LIQUIDITY_USDC", 50_000.0)?,
                max_price_impact_pct: parse_var_or("FILTER_MAX_PRICE_IMPACT_PCT", 2.0)?,
                min_token_age_seconds: parse_var_or("FILTER_MIN_TOKEN_AGE_SECONDS", 3_600u64)?,
                min_24h_volume_usdc: parse_var_or("FILTER_MIN_24H_VOLUME_USDC", 10_000.0)?,
                max_recent_pump_pct: parse_var_or("FILTER_MAX_RECENT_PUMP_PCT", 50.0)?,
                whitelist,
            },
            exit_enabled: parse_bool_or("EXIT_ENABLED", false)?,
            exit: ExitRules {
                take_profit: parse_take_profit_targets(&var_or(
                    "EXIT_TAKE_PROFIT_TARGETS",
                    DEFAULT_TAKE_PROFIT_TARGETS,
                ))?,
                stop_loss_pct: parse_var_or("EXIT_STOP_LOSS_PCT", -30.0)?,
                max_hold: Duration::from_secs(
                    parse_var_or("EXIT_MAX_HOLD_HOURS", 24u64)? * 3_600,
                ),
                trailing_stop_pct: parse_optional_f64("EXIT_TRAILING_STOP_PCT")?,
                trailing_activation_pct: parse_optional_f64("EXIT_TRAILING_ACTIVATION_PCT")?,
                check_interval: Duration::from_secs(parse_var_or(
                    "EXIT_CHECK_INTERVAL_SECONDS",
                    30u64,
                )?),
            },
            target_wallets: load_target_wallets()?,
        })
    }

    pub fn operator_pubkey(&self) -> Pubkey {
        self.operator.pubkey()
    }

    pub fn operator_keypair(&self) -> Arc<Keypair> {
        Arc::clone(&self.operator)
    }

    /// Stream endpoint with a scheme, as the gRPC channel expects.
    pub fn stream_url(&self) -> String {
        let endpoint = self.stream_endpoint.trim();
        if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

fn var_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env_var(key).ok_or(ConfigError::MissingVar(key))
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_var_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env_var(key) {
        Some(raw) => parse_number(key, &raw),
        None => Ok(default),
    }
}

fn parse_usdc_or(key: &str, default: &str) -> Result<u64, ConfigError> {
    let raw = var_or(key, default);
    ui_usdc_to_micro(&raw).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw,
    })
}

fn parse_optional_f64(key: &str) -> Result<Option<f64>, ConfigError> {
    match env_var(key) {
        Some(raw) => Ok(Some(parse_number(key, &raw)?)),
        None => Ok(None),
    }
}

fn parse_url(key: &str, default: &str) -> Result<Url, ConfigError> {
    let raw = var_or(key, default);
    // A trailing slash keeps Url::join from eating the last path segment.
    let normalized = if raw.ends_with('/') {
        raw.clone()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|_| ConfigError::InvalidUrl {
        key: key.to_string(),
        value: raw,
    })
}

fn parse_bool_or(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env_var(key) {
        Some(raw) => parse_bool(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(ConfigError::InvalidBoolean {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_keypair(encoded: &str) -> Result<Keypair, ConfigError> {
    let trimmed = encoded.trim();

    if let Ok(bytes) = bs58::decode(trimmed).into_vec() {
        if let Ok(kp) = Keypair::from_bytes(&bytes) {
            return Ok(kp);
        }
    }

    if let Ok(bytes) = general_purpose::STANDARD.decode(trimmed.as_bytes()) {
        if let Ok(kp) = Keypair::from_bytes(&bytes) {
            return Ok(kp);
        }
    }

    if trimmed.starts_with('[') {
        if let Ok(vec) = serde_json::from_str::<Vec<u8>>(trimmed) {
            if let Ok(kp) = Keypair::from_bytes(&vec) {
                return Ok(kp);
            }
        }
    }

    Err(ConfigError::InvalidPrivateKey)
}

fn parse_pubkey_list(raw: &str) -> Result<Vec<Pubkey>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Pubkey::from_str(part).map_err(|e| ConfigError::Pubkey(part.to_string(), e))
        })
        .collect()
}

/// `"50:25,100:50,300:100"` - profit% : sell% pairs, in firing order.
fn parse_take_profit_targets(raw: &str) -> Result<Vec<TakeProfitTarget>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let invalid = || ConfigError::InvalidValue {
                key: "EXIT_TAKE_PROFIT_TARGETS".to_string(),
                value: part.to_string(),
            };
            let (profit, sell) = part.split_once(':').ok_or_else(invalid)?;
            let profit_pct = profit.trim().parse::<f64>().map_err(|_| invalid())?;
            let sell_pct = sell.trim().parse::<f64>().map_err(|_| invalid())?;
            if !(0.0..=100.0).contains(&sell_pct) {
                return Err(invalid());
            }
            Ok(TakeProfitTarget {
                profit_pct,
                sell_pct,
            })
        })
        .collect()
}

/// `TARGET_WALLET1`, `TARGET_WALLET2`, … - the initial watched set.
fn load_target_wallets() -> Result<Vec<Pubkey>, ConfigError> {
    let mut wallets = Vec::new();
    let mut index = 1;
    while let Some(value) = env_var(&format!("TARGET_WALLET{index}")) {
        let wallet =
            Pubkey::from_str(value.trim()).map_err(|e| ConfigError::Pubkey(value.clone(), e))?;
        wallets.push(wallet);
        index += 1;
    }
    Ok(wallets)
}
