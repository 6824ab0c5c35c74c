use crate::{
    de::{de_flexible_f64, de_str_epoch_s_as_ms},
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, deserialise_or_skip},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// [`Bitstamp`](ExchangeId::Bitstamp) server base url.
///
/// See docs: <https://www.bitstamp.net/websocket/v2/>
pub const BASE_URL_BITSTAMP: &str = "wss://ws.bitstamp.net/";

/// Bitstamp BTC/USD live trades adapter.
pub fn adapter() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::Bitstamp,
        BASE_URL_BITSTAMP,
        vec![json!({
            "event": "bts:subscribe",
            "data": { "channel": "live_trades_btcusd" },
        })],
        None,
        parse,
    )
}

/// Bitstamp `live_trades` event. Trade `type` 0 is a buy, 1 a sell.
///
/// ### Raw Payload Examples
/// See docs: <https://www.bitstamp.net/websocket/v2/>
/// ```json
/// {
///     "data": {
///         "id": 253934562,
///         "timestamp": "1664455327",
///         "amount": 0.00521,
///         "amount_str": "0.00521000",
///         "price": 19437,
///         "price_str": "19437",
///         "type": 1,
///         "microtimestamp": "1664455327456107",
///         "buy_order_id": 1543516546654208,
///         "sell_order_id": 1543516558413824
///     },
///     "channel": "live_trades_btcusd",
///     "event": "trade"
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BitstampTradeEvent {
    pub data: BitstampTrade,
}

#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BitstampTrade {
    #[serde(deserialize_with = "de_str_epoch_s_as_ms")]
    pub timestamp: i64,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub amount: f64,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub price: f64,

    #[serde(rename = "type")]
    pub kind: u8,
}

impl BitstampTrade {
    fn side(&self) -> Side {
        if self.kind == 0 { Side::Buy } else { Side::Sell }
    }
}

fn parse(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    if raw.get("event").and_then(Value::as_str) != Some("trade") {
        return vec![];
    }

    deserialise_or_skip::<BitstampTradeEvent>(exchange, raw)
        .map(|event| {
            let trade = event.data;
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.price * trade.amount,
                trade.side(),
                trade.timestamp,
            )
        })
        .into_iter()
        .collect()
}
