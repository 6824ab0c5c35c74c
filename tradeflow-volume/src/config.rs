use crate::{
    aggregator::{
        AggregatorConfig, DEFAULT_EXCHANGE_HISTORY, DEFAULT_GLOBAL_HISTORY,
        DEFAULT_INTERVAL_HISTORY, DEFAULT_INTERVAL_MS,
    },
    baseline::{DEFAULT_HISTORICAL_URL, DEFAULT_MARKETS, Lookback},
};
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use tradeflow_data::{
    connection::{ConnectionConfig, status::DEFAULT_GATE_TIMEOUT},
    error::DataError,
    exchange::ExchangeId,
};
use url::Url;

/// Fatal startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid url {value:?}: {error}")]
    InvalidUrl {
        key: &'static str,
        value: String,
        #[source]
        error: url::ParseError,
    },

    #[error("{key}: invalid number {value:?}: {error}")]
    InvalidNumber {
        key: &'static str,
        value: String,
        #[source]
        error: std::num::ParseIntError,
    },

    #[error("{key}: {error}")]
    InvalidExchange {
        key: &'static str,
        #[source]
        error: DataError,
    },

    #[error("{key}: unknown lookback {value:?}, expected one of 1m, 5m, 15m, 20m, 30m, 1h")]
    InvalidLookback { key: &'static str, value: String },

    #[error("{key}: must not be empty")]
    Empty { key: &'static str },

    #[error("{key}: must be greater than zero")]
    Zero { key: &'static str },
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Exchanges to connect, in registry order.
    pub exchanges: Vec<ExchangeId>,
    pub historical_url: String,
    pub historical_markets: Vec<String>,
    pub lookback: Lookback,
    /// Re-fetch the baseline on this period, or fetch once when `None`.
    pub baseline_refresh: Option<Duration>,
    pub aggregator: AggregatorConfig,
    pub gate_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchanges: ExchangeId::ALL.to_vec(),
            historical_url: DEFAULT_HISTORICAL_URL.to_string(),
            historical_markets: DEFAULT_MARKETS.iter().map(|market| market.to_string()).collect(),
            lookback: Lookback::default(),
            baseline_refresh: None,
            aggregator: AggregatorConfig::default(),
            gate_timeout: DEFAULT_GATE_TIMEOUT,
            connection: ConnectionConfig::default(),
        }
    }
}

impl Config {
    pub fn with_exchanges(mut self, exchanges: Vec<ExchangeId>) -> Self {
        self.exchanges = exchanges;
        self
    }

    pub fn with_historical_url<S: Into<String>>(mut self, url: S) -> Self {
        self.historical_url = url.into();
        self
    }

    pub fn with_historical_markets(mut self, markets: Vec<String>) -> Self {
        self.historical_markets = markets;
        self
    }

    pub fn with_lookback(mut self, lookback: Lookback) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn with_baseline_refresh(mut self, period: Option<Duration>) -> Self {
        self.baseline_refresh = period;
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Read `TRADEFLOW_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup, unset or blank variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = Self::default();

        let exchanges = match get("TRADEFLOW_EXCHANGES") {
            Some(value) => parse_exchanges("TRADEFLOW_EXCHANGES", &value)?,
            None => defaults.exchanges,
        };

        let historical_url = get("TRADEFLOW_HISTORICAL_URL").unwrap_or(defaults.historical_url);

        let historical_markets = match get("TRADEFLOW_HISTORICAL_MARKETS") {
            Some(value) => value
                .split('+')
                .map(str::trim)
                .filter(|market| !market.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.historical_markets,
        };

        let lookback = match get("TRADEFLOW_LOOKBACK") {
            Some(value) => Lookback::from_str(&value).map_err(|value| {
                ConfigError::InvalidLookback {
                    key: "TRADEFLOW_LOOKBACK",
                    value,
                }
            })?,
            None => defaults.lookback,
        };

        let baseline_refresh = parse_u64(&get, "TRADEFLOW_BASELINE_REFRESH_SECS")?
            .map(positive("TRADEFLOW_BASELINE_REFRESH_SECS"))
            .transpose()?
            .map(Duration::from_secs);

        let aggregator = AggregatorConfig {
            interval_ms: parse_u64(&get, "TRADEFLOW_INTERVAL_MS")?
                .map(positive("TRADEFLOW_INTERVAL_MS"))
                .transpose()?
                .map_or(DEFAULT_INTERVAL_MS, |millis| millis as i64),
            exchange_history: parse_capacity(
                &get,
                "TRADEFLOW_EXCHANGE_HISTORY",
                DEFAULT_EXCHANGE_HISTORY,
            )?,
            global_history: parse_capacity(&get, "TRADEFLOW_GLOBAL_HISTORY", DEFAULT_GLOBAL_HISTORY)?,
            interval_history: parse_capacity(
                &get,
                "TRADEFLOW_INTERVAL_HISTORY",
                DEFAULT_INTERVAL_HISTORY,
            )?,
        };

        let gate_timeout = parse_u64(&get, "TRADEFLOW_GATE_TIMEOUT_MS")?
            .map_or(defaults.gate_timeout, Duration::from_millis);

        let mut connection = defaults.connection;
        if let Some(attempts) = parse_u64(&get, "TRADEFLOW_CONNECT_ATTEMPTS")? {
            let attempts = positive("TRADEFLOW_CONNECT_ATTEMPTS")(attempts)?;
            connection = connection.with_connect_attempts(attempts.min(u32::MAX as u64) as u32);
        }
        if let Some(millis) = parse_u64(&get, "TRADEFLOW_BACKOFF_MS")? {
            connection = connection.with_backoff_base(Duration::from_millis(millis));
        }
        if let Some(millis) = parse_u64(&get, "TRADEFLOW_RECONNECT_DELAY_MS")? {
            connection = connection.with_reconnect_delay(Duration::from_millis(millis));
        }
        if let Some(millis) = parse_u64(&get, "TRADEFLOW_SUBSCRIBE_DELAY_MS")? {
            connection = connection.with_subscribe_delay(Duration::from_millis(millis));
        }
        if let Some(secs) = parse_u64(&get, "TRADEFLOW_READ_TIMEOUT_SECS")? {
            let secs = positive("TRADEFLOW_READ_TIMEOUT_SECS")(secs)?;
            connection = connection.with_read_timeout(Duration::from_secs(secs));
        }

        let config = Self {
            exchanges,
            historical_url,
            historical_markets,
            lookback,
            baseline_refresh,
            aggregator,
            gate_timeout,
            connection,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every consumer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(error) = Url::parse(&self.historical_url) {
            return Err(ConfigError::InvalidUrl {
                key: "TRADEFLOW_HISTORICAL_URL",
                value: self.historical_url.clone(),
                error,
            });
        }
        if self.exchanges.is_empty() {
            return Err(ConfigError::Empty {
                key: "TRADEFLOW_EXCHANGES",
            });
        }
        if self.historical_markets.is_empty() {
            return Err(ConfigError::Empty {
                key: "TRADEFLOW_HISTORICAL_MARKETS",
            });
        }
        if self.aggregator.interval_ms <= 0 {
            return Err(ConfigError::Zero {
                key: "TRADEFLOW_INTERVAL_MS",
            });
        }
        if self.connection.connect_attempts == 0 {
            return Err(ConfigError::Zero {
                key: "TRADEFLOW_CONNECT_ATTEMPTS",
            });
        }
        Ok(())
    }
}

fn parse_exchanges(key: &'static str, value: &str) -> Result<Vec<ExchangeId>, ConfigError> {
    let mut exchanges = value
        .split(',')
        .map(str::trim)
        .filter(|exchange| !exchange.is_empty())
        .map(ExchangeId::from_str)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| ConfigError::InvalidExchange { key, error })?;

    exchanges.sort();
    exchanges.dedup();
    Ok(exchanges)
}

fn parse_u64<G>(get: &G, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidNumber { key, value, error })
        })
        .transpose()
}

fn parse_capacity<G>(get: &G, key: &'static str, default: usize) -> Result<usize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_u64(get, key)? {
        Some(capacity) => Ok(positive(key)(capacity)? as usize),
        None => Ok(default),
    }
}

fn positive(key: &'static str) -> impl Fn(u64) -> Result<u64, ConfigError> {
    move |value| {
        if value == 0 {
            Err(ConfigError::Zero { key })
        } else {
            Ok(value)
        }
    }
}
