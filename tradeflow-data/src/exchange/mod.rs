use crate::{error::DataError, trade::CanonicalTrade};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, time::Duration};
use tracing::debug;
use url::Url;

/// [`Binance`](binance) Spot, USDT-M Futures and COIN-M Futures adapters.
pub mod binance;

/// [`Bitfinex`](bitfinex) adapter.
pub mod bitfinex;

/// [`BitMEX`](bitmex) adapter.
pub mod bitmex;

/// [`Bitstamp`](bitstamp) adapter.
pub mod bitstamp;

/// [`Bybit`](bybit) Inverse and Linear adapters.
pub mod bybit;

/// [`Coinbase`](coinbase) Advanced Trade adapter.
pub mod coinbase;

/// [`Deribit`](deribit) adapter.
pub mod deribit;

/// [`Okx`](okx) adapter.
pub mod okx;

/// Unique identifier for every supported exchange stream.
///
/// Declaration order is the registry order.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeId {
    #[display("binance_spot")]
    BinanceSpot,
    #[display("bitmex")]
    Bitmex,
    #[display("bitfinex")]
    Bitfinex,
    #[display("coinbase")]
    Coinbase,
    #[display("deribit")]
    Deribit,
    #[display("okx")]
    Okx,
    #[display("bybit_inverse")]
    BybitInverse,
    #[display("bitstamp")]
    Bitstamp,
    #[display("binance_futures_usd")]
    BinanceFuturesUsd,
    #[display("binance_futures_coin")]
    BinanceFuturesCoin,
    #[display("bybit_linear")]
    BybitLinear,
}

impl ExchangeId {
    /// Every supported exchange, in registry order.
    pub const ALL: [ExchangeId; 11] = [
        ExchangeId::BinanceSpot,
        ExchangeId::Bitmex,
        ExchangeId::Bitfinex,
        ExchangeId::Coinbase,
        ExchangeId::Deribit,
        ExchangeId::Okx,
        ExchangeId::BybitInverse,
        ExchangeId::Bitstamp,
        ExchangeId::BinanceFuturesUsd,
        ExchangeId::BinanceFuturesCoin,
        ExchangeId::BybitLinear,
    ];
}

impl FromStr for ExchangeId {
    type Err = DataError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalised = input.trim().to_lowercase();
        ExchangeId::ALL
            .into_iter()
            .find(|exchange| exchange.to_string() == normalised)
            .ok_or_else(|| DataError::UnknownExchange(input.to_string()))
    }
}

/// Keepalive payload an [`ExchangeAdapter`] sends on its own timer while connected.
#[derive(Clone, PartialEq, Debug)]
pub struct Keepalive {
    pub message: Value,
    pub interval: Duration,
}

/// Pure mapping from a raw inbound message to zero or more [`CanonicalTrade`]s.
///
/// Unrecognised message shapes must map to an empty `Vec`.
pub type ParseFn = fn(ExchangeId, &Value) -> Vec<CanonicalTrade>;

/// Declarative per-exchange description shared read-only by the connection layer and the
/// aggregator.
#[derive(Clone)]
pub struct ExchangeAdapter {
    pub exchange: ExchangeId,
    pub endpoint: Url,
    /// Payloads sent in order after connecting.
    pub subscriptions: Vec<Value>,
    pub keepalive: Option<Keepalive>,
    parser: ParseFn,
}

impl ExchangeAdapter {
    pub fn new(
        exchange: ExchangeId,
        endpoint: &str,
        subscriptions: Vec<Value>,
        keepalive: Option<Keepalive>,
        parser: ParseFn,
    ) -> Result<Self, DataError> {
        let endpoint =
            Url::parse(endpoint).map_err(|error| DataError::Endpoint { exchange, error })?;

        Ok(Self {
            exchange,
            endpoint,
            subscriptions,
            keepalive,
            parser,
        })
    }

    /// Map a raw inbound message to the [`CanonicalTrade`]s it contains.
    pub fn parse(&self, raw: &Value) -> Vec<CanonicalTrade> {
        (self.parser)(self.exchange, raw)
    }
}

impl fmt::Debug for ExchangeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeAdapter")
            .field("exchange", &self.exchange)
            .field("endpoint", &self.endpoint.as_str())
            .field("subscriptions", &self.subscriptions)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

/// Construct the [`ExchangeAdapter`] for the provided [`ExchangeId`].
pub fn adapter(exchange: ExchangeId) -> Result<ExchangeAdapter, DataError> {
    match exchange {
        ExchangeId::BinanceSpot => binance::spot(),
        ExchangeId::Bitmex => bitmex::adapter(),
        ExchangeId::Bitfinex => bitfinex::adapter(),
        ExchangeId::Coinbase => coinbase::adapter(),
        ExchangeId::Deribit => deribit::adapter(),
        ExchangeId::Okx => okx::adapter(),
        ExchangeId::BybitInverse => bybit::inverse(),
        ExchangeId::Bitstamp => bitstamp::adapter(),
        ExchangeId::BinanceFuturesUsd => binance::futures_usd(),
        ExchangeId::BinanceFuturesCoin => binance::futures_coin(),
        ExchangeId::BybitLinear => bybit::linear(),
    }
}

/// Build every supported [`ExchangeAdapter`] in registry order.
pub fn registry() -> Result<Vec<ExchangeAdapter>, DataError> {
    registry_for(&ExchangeId::ALL)
}

/// Build the [`ExchangeAdapter`]s for a subset of exchanges, in registry order and without
/// duplicates.
pub fn registry_for(exchanges: &[ExchangeId]) -> Result<Vec<ExchangeAdapter>, DataError> {
    ExchangeId::ALL
        .into_iter()
        .filter(|exchange| exchanges.contains(exchange))
        .map(adapter)
        .collect()
}

/// Deserialise a recognised message into its venue model, dropping it if malformed.
pub(crate) fn deserialise_or_skip<'a, T>(exchange: ExchangeId, raw: &'a Value) -> Option<T>
where
    T: Deserialize<'a>,
{
    match T::deserialize(raw) {
        Ok(message) => Some(message),
        Err(error) => {
            debug!(%exchange, %error, "dropping malformed trade message");
            None
        }
    }
}

/// Deserialise every element of a batched trade array on its own, so a malformed fill drops
/// only itself. Anything other than an array yields no trades.
pub(crate) fn deserialise_each<'a, T>(exchange: ExchangeId, items: Option<&'a Value>) -> Vec<T>
where
    T: Deserialize<'a>,
{
    items
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| deserialise_or_skip(exchange, item))
                .collect()
        })
        .unwrap_or_default()
}
