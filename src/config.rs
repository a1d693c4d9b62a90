//! Environment-driven configuration.
//!
//! Everything is optional except `STRATEGIES`; a missing private key
//! forces dry-run. Parsing failures on numeric overrides fall back to
//! defaults rather than aborting, the strategy list is validated
//! strictly.

use std::time::Duration;

use thiserror::Error;

use crate::discovery::{DiscoveryConfig, DEFAULT_EVENT_LIMIT, GAMMA_API_BASE};
use crate::types::RiskLimits;

/// Polymarket CLOB API host.
pub const DEFAULT_CLOB_HOST: &str = "https://clob.polymarket.com";

/// Polygon chain id.
pub const DEFAULT_CHAIN_ID: u64 = 137;

pub const DEFAULT_DATABASE_PATH: &str = "polybot.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("STRATEGIES must name at least one strategy")]
    NoStrategies,

    #[error("unknown strategy '{0}' (expected market-maker, momentum, mean-reversion or bregman-arb)")]
    UnknownStrategy(String),
}

/// Strategy selection tokens accepted in `STRATEGIES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    MarketMaker,
    Momentum,
    MeanReversion,
    BregmanArb,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::MarketMaker => "market-maker",
            StrategyKind::Momentum => "momentum",
            StrategyKind::MeanReversion => "mean-reversion",
            StrategyKind::BregmanArb => "bregman-arb",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "market-maker" => Some(StrategyKind::MarketMaker),
            "momentum" => Some(StrategyKind::Momentum),
            "mean-reversion" => Some(StrategyKind::MeanReversion),
            "bregman-arb" => Some(StrategyKind::BregmanArb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub chain_id: u64,
    pub private_key: Option<String>,
    pub api_credentials: Option<ApiCredentials>,
    pub dry_run: bool,
    pub strategies: Vec<StrategyKind>,
    pub token_ids: Vec<String>,
    pub database_path: String,
    pub poll_interval: Duration,
    pub risk_limits: RiskLimits,
    pub discovery: DiscoveryConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Tests feed a map instead of
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let strategies = parse_strategies(lookup("STRATEGIES").as_deref())?;

        let private_key = lookup("POLY_PRIVATE_KEY").filter(|s| !s.is_empty());
        // No credentials means no live trading, whatever DRY_RUN says
        let dry_run = flag(lookup("DRY_RUN").as_deref(), true) || private_key.is_none();

        let api_credentials = match (
            lookup("POLY_API_KEY"),
            lookup("POLY_API_SECRET"),
            lookup("POLY_API_PASSPHRASE"),
        ) {
            (Some(key), Some(secret), Some(passphrase)) => Some(ApiCredentials {
                key,
                secret,
                passphrase,
            }),
            _ => None,
        };

        let defaults = RiskLimits::default();
        let risk_limits = RiskLimits {
            max_position_size: num(lookup("MAX_POSITION_SIZE").as_deref(), defaults.max_position_size),
            max_total_exposure: num(lookup("MAX_TOTAL_EXPOSURE").as_deref(), defaults.max_total_exposure),
            max_loss_per_trade: num(lookup("MAX_LOSS_PER_TRADE").as_deref(), defaults.max_loss_per_trade),
            max_daily_loss: num(lookup("MAX_DAILY_LOSS").as_deref(), defaults.max_daily_loss),
            max_open_orders: num(lookup("MAX_OPEN_ORDERS").as_deref(), defaults.max_open_orders),
        };

        let discovery = DiscoveryConfig {
            base_url: lookup("GAMMA_BASE_URL").unwrap_or_else(|| GAMMA_API_BASE.to_string()),
            tags: list(lookup("GAMMA_TAGS").as_deref()),
            refresh_interval: Duration::from_secs(num(
                lookup("GAMMA_REFRESH_INTERVAL").as_deref(),
                30u64,
            )),
            limit: num(lookup("GAMMA_LIMIT").as_deref(), DEFAULT_EVENT_LIMIT),
        };

        Ok(Self {
            host: lookup("POLY_HOST").unwrap_or_else(|| DEFAULT_CLOB_HOST.to_string()),
            chain_id: num(lookup("POLY_CHAIN_ID").as_deref(), DEFAULT_CHAIN_ID),
            private_key,
            api_credentials,
            dry_run,
            strategies,
            token_ids: list(lookup("TOKEN_IDS").as_deref()),
            database_path: lookup("DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            poll_interval: Duration::from_millis(num(lookup("POLL_INTERVAL_MS").as_deref(), 1000u64)),
            risk_limits,
            discovery,
        })
    }

    pub fn wants(&self, kind: StrategyKind) -> bool {
        self.strategies.contains(&kind)
    }
}

fn parse_strategies(raw: Option<&str>) -> Result<Vec<StrategyKind>, ConfigError> {
    let raw = raw.unwrap_or("").trim();
    if raw.is_empty() {
        return Err(ConfigError::NoStrategies);
    }

    let mut strategies = Vec::new();
    for name in raw.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let kind =
            StrategyKind::from_str(name).ok_or_else(|| ConfigError::UnknownStrategy(name.to_string()))?;
        if !strategies.contains(&kind) {
            strategies.push(kind);
        }
    }

    if strategies.is_empty() {
        return Err(ConfigError::NoStrategies);
    }
    Ok(strategies)
}

fn flag(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(v) => v == "1" || v.to_lowercase() == "true",
        None => default,
    }
}

fn num<T: std::str::FromStr + Copy>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
