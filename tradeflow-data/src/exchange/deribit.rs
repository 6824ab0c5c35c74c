use crate::{
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, Keepalive, deserialise_each},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// [`Deribit`](ExchangeId::Deribit) server base url.
///
/// See docs: <https://docs.deribit.com/#json-rpc>
pub const BASE_URL_DERIBIT: &str = "wss://www.deribit.com/ws/api/v2";

/// [`Deribit`](ExchangeId::Deribit) keepalive interval.
pub const PING_INTERVAL_DERIBIT: Duration = Duration::from_secs(60);

/// Deribit BTC-PERPETUAL trades adapter.
pub fn adapter() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::Deribit,
        BASE_URL_DERIBIT,
        vec![json!({
            "method": "public/subscribe",
            "params": { "channels": ["trades.BTC-PERPETUAL.100ms"] },
        })],
        Some(Keepalive {
            message: json!({ "method": "public/ping" }),
            interval: PING_INTERVAL_DERIBIT,
        }),
        parse,
    )
}

/// One trade of a Deribit trades subscription notification.
///
/// Perpetual `amount` is denominated in USD, so it is used directly as the notional.
///
/// ### Raw Payload Examples
/// See docs: <https://docs.deribit.com/#trades-instrument_name-interval>
/// ```json
/// {
///     "jsonrpc": "2.0",
///     "method": "subscription",
///     "params": {
///         "channel": "trades.BTC-PERPETUAL.100ms",
///         "data": [
///             {
///                 "trade_seq": 30289442,
///                 "trade_id": "48079269",
///                 "timestamp": 1590484156350,
///                 "tick_direction": 2,
///                 "price": 8950,
///                 "mark_price": 8948.9,
///                 "instrument_name": "BTC-PERPETUAL",
///                 "index_price": 8955.88,
///                 "direction": "sell",
///                 "amount": 10
///             }
///         ]
///     }
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct DeribitTrade {
    pub timestamp: i64,
    pub price: f64,
    pub direction: Side,
    pub amount: f64,
}

fn parse(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    if raw.get("method").and_then(Value::as_str) != Some("subscription") {
        return vec![];
    }

    deserialise_each::<DeribitTrade>(exchange, raw.pointer("/params/data"))
        .into_iter()
        .map(|trade| {
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.amount,
                trade.direction,
                trade.timestamp,
            )
        })
        .collect()
}
