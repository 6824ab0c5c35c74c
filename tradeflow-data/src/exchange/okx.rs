use crate::{
    de::de_str,
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, deserialise_each},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// [`Okx`](ExchangeId::Okx) server base url.
///
/// See docs: <https://www.okx.com/docs-v5/en/#overview-api-resources-and-support>
pub const BASE_URL_OKX: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// Okx BTC-USDT-SWAP trades adapter.
pub fn adapter() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::Okx,
        BASE_URL_OKX,
        vec![json!({
            "op": "subscribe",
            "args": [{ "channel": "trades", "instId": "BTC-USDT-SWAP" }],
        })],
        None,
        parse,
    )
}

/// One fill of an Okx real-time trades WebSocket message.
///
/// ### Raw Payload Examples
/// See docs: <https://www.okx.com/docs-v5/en/#websocket-api-public-channel-trades-channel>
/// ```json
/// {
///   "arg": {
///     "channel": "trades",
///     "instId": "BTC-USDT-SWAP"
///   },
///   "data": [
///     {
///       "instId": "BTC-USDT-SWAP",
///       "tradeId": "130639474",
///       "px": "42219.9",
///       "sz": "0.12060306",
///       "side": "buy",
///       "ts": "1630048897897"
///     }
///   ]
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct OkxTrade {
    #[serde(rename = "px", deserialize_with = "de_str")]
    pub price: f64,

    #[serde(rename = "sz", deserialize_with = "de_str")]
    pub amount: f64,

    pub side: Side,

    #[serde(rename = "ts", deserialize_with = "de_str")]
    pub time: i64,
}

fn parse(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    let channel = raw
        .get("arg")
        .and_then(|arg| arg.get("channel"))
        .and_then(Value::as_str);
    if channel != Some("trades") {
        return vec![];
    }

    deserialise_each::<OkxTrade>(exchange, raw.get("data"))
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
