use crate::{
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, deserialise_or_skip},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// [`Bitfinex`](ExchangeId::Bitfinex) server base url.
///
/// See docs: <https://docs.bitfinex.com/docs/ws-general>
pub const BASE_URL_BITFINEX: &str = "wss://api-pub.bitfinex.com/ws/2/";

/// Bitfinex tBTCUSD trades adapter.
pub fn adapter() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::Bitfinex,
        BASE_URL_BITFINEX,
        vec![json!({ "event": "subscribe", "channel": "trades", "symbol": "tBTCUSD" })],
        None,
        parse,
    )
}

/// Bitfinex positional trade execution update.
///
/// A positive amount is a buy, a negative amount a sell. `te` messages are used rather than
/// the later `tu` confirmation so each fill is counted once.
///
/// ### Raw Payload Examples
/// See docs: <https://docs.bitfinex.com/reference/ws-public-trades>
/// ```json
/// [17470, "te", [401597393, 1574694475039, -0.005, 7245.3]]
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BitfinexTrade {
    pub id: u64,
    pub time: i64,
    pub amount: f64,
    pub price: f64,
}

fn parse(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    let Some([_channel, kind, trade]) = raw.as_array().map(Vec::as_slice) else {
        return vec![];
    };
    if kind.as_str() != Some("te") || !trade.is_array() {
        return vec![];
    }

    deserialise_or_skip::<BitfinexTrade>(exchange, trade)
        .map(|trade| {
            let side = if trade.amount > 0.0 { Side::Buy } else { Side::Sell };
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.price * trade.amount.abs(),
                side,
                trade.time,
            )
        })
        .into_iter()
        .collect()
}
