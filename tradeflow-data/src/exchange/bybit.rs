use crate::{
    de::de_str,
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, Keepalive, deserialise_each},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// [`BybitInverse`](ExchangeId::BybitInverse) server base url.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/ws/connect>
pub const BASE_URL_BYBIT_INVERSE: &str = "wss://stream.bybit.com/v5/public/inverse";

/// [`BybitLinear`](ExchangeId::BybitLinear) server base url.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/ws/connect>
pub const BASE_URL_BYBIT_LINEAR: &str = "wss://stream.bybit.com/v5/public/linear";

/// Bybit keepalive interval.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/ws/connect#how-to-send-the-heartbeat-packet>
pub const PING_INTERVAL_BYBIT: Duration = Duration::from_secs(20);

/// Bybit inverse perpetual BTCUSD trades adapter.
pub fn inverse() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::BybitInverse,
        BASE_URL_BYBIT_INVERSE,
        vec![subscription("BTCUSD")],
        Some(keepalive()),
        parse_inverse,
    )
}

/// Bybit linear perpetual BTCUSDT trades adapter.
pub fn linear() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::BybitLinear,
        BASE_URL_BYBIT_LINEAR,
        vec![subscription("BTCUSDT")],
        Some(keepalive()),
        parse_linear,
    )
}

fn subscription(market: &str) -> Value {
    json!({ "op": "subscribe", "args": [format!("publicTrade.{market}")] })
}

fn keepalive() -> Keepalive {
    Keepalive {
        message: json!({ "op": "ping" }),
        interval: PING_INTERVAL_BYBIT,
    }
}

/// One fill of a Bybit `publicTrade` topic message.
///
/// ### Raw Payload Examples
/// See docs: <https://bybit-exchange.github.io/docs/v5/websocket/public/trade>
/// ```json
/// {
///     "topic": "publicTrade.BTCUSDT",
///     "type": "snapshot",
///     "ts": 1672304486868,
///     "data": [
///         {
///             "T": 1672304486865,
///             "s": "BTCUSDT",
///             "S": "Buy",
///             "v": "0.001",
///             "p": "16578.50",
///             "L": "PlusTick",
///             "i": "20f43950-d8dd-5b31-9112-a178eb6023af",
///             "BT": false
///         }
///     ]
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BybitTrade {
    #[serde(rename = "T")]
    pub time: i64,

    #[serde(rename = "S")]
    pub side: Side,

    #[serde(rename = "v", deserialize_with = "de_str")]
    pub amount: f64,

    #[serde(rename = "p", deserialize_with = "de_str")]
    pub price: f64,
}

fn trades(exchange: ExchangeId, raw: &Value) -> Vec<BybitTrade> {
    let is_trade_topic = raw
        .get("topic")
        .and_then(Value::as_str)
        .is_some_and(|topic| topic.starts_with("publicTrade."));
    if !is_trade_topic {
        return vec![];
    }

    deserialise_each(exchange, raw.get("data"))
}

/// Inverse contracts are 1 USD each, so `v` is already the notional.
fn parse_inverse(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    trades(exchange, raw)
        .into_iter()
        .map(|trade| CanonicalTrade::new(exchange, trade.price, trade.amount, trade.side, trade.time))
        .collect()
}

fn parse_linear(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    trades(exchange, raw)
        .into_iter()
        .map(|trade| {
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.price * trade.amount,
                trade.side,
                trade.time,
            )
        })
        .collect()
}
