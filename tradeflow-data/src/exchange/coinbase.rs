use crate::{
    de::{de_rfc3339_as_epoch_ms, de_str},
    error::DataError,
    exchange::{ExchangeAdapter, ExchangeId, deserialise_each},
    trade::{CanonicalTrade, Side},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// [`Coinbase`](ExchangeId::Coinbase) Advanced Trade server base url.
///
/// See docs: <https://docs.cdp.coinbase.com/advanced-trade/docs/ws-overview>
pub const BASE_URL_COINBASE: &str = "wss://advanced-trade-ws.coinbase.com/";

/// Coinbase BTC-USD market trades adapter.
pub fn adapter() -> Result<ExchangeAdapter, DataError> {
    ExchangeAdapter::new(
        ExchangeId::Coinbase,
        BASE_URL_COINBASE,
        vec![json!({
            "type": "subscribe",
            "channel": "market_trades",
            "product_ids": ["BTC-USD"],
        })],
        None,
        parse,
    )
}

/// One trade of a Coinbase `market_trades` channel message. Each event may batch several trades.
///
/// ### Raw Payload Examples
/// See docs: <https://docs.cdp.coinbase.com/advanced-trade/docs/ws-channels#market-trades-channel>
/// ```json
/// {
///     "channel": "market_trades",
///     "client_id": "",
///     "timestamp": "2023-02-09T20:19:35.39625135Z",
///     "sequence_num": 0,
///     "events": [
///         {
///             "type": "snapshot",
///             "trades": [
///                 {
///                     "trade_id": "000000000",
///                     "product_id": "BTC-USD",
///                     "price": "1260.01",
///                     "size": "0.3",
///                     "side": "BUY",
///                     "time": "2019-08-14T20:42:27.265Z"
///                 }
///             ]
///         }
///     ]
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct CoinbaseTrade {
    #[serde(deserialize_with = "de_str")]
    pub price: f64,
    #[serde(deserialize_with = "de_str")]
    pub size: f64,
    pub side: Side,
    #[serde(deserialize_with = "de_rfc3339_as_epoch_ms")]
    pub time: i64,
}

fn parse(exchange: ExchangeId, raw: &Value) -> Vec<CanonicalTrade> {
    if raw.get("channel").and_then(Value::as_str) != Some("market_trades") {
        return vec![];
    }

    raw.get("events")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|event| deserialise_each::<CoinbaseTrade>(exchange, event.get("trades")))
        .map(|trade| {
            CanonicalTrade::new(
                exchange,
                trade.price,
                trade.price * trade.size,
                trade.side,
                trade.time,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        struct TestCase {
            input: Value,
            expected: Vec<CanonicalTrade>,
        }

        let tests = vec![
            TestCase {
                // TC0: every trade of every event is emitted
                input: json!({
                    "channel": "market_trades",
                    "client_id": "",
                    "timestamp": "2023-11-14T22:13:21Z",
                    "sequence_num": 4,
                    "events": [
                        {
                            "type": "update",
                            "trades": [
                                {
                                    "trade_id": "1", "product_id": "BTC-USD",
                                    "price": "100.0", "size": "0.5", "side": "BUY",
                                    "time": "2023-11-14T22:13:20.123Z"
                                },
                                {
                                    "trade_id": "2", "product_id": "BTC-USD",
                                    "price": "200.0", "size": "0.25", "side": "SELL",
                                    "time": "2023-11-14T22:13:20.124Z"
                                }
                            ]
                        },
                        { "type": "update", "trades": [] }
                    ]
                }),
                expected: vec![
                    CanonicalTrade::new(
                        ExchangeId::Coinbase,
                        100.0,
                        50.0,
                        Side::Buy,
                        1_700_000_000_123,
                    ),
                    CanonicalTrade::new(
                        ExchangeId::Coinbase,
                        200.0,
                        50.0,
                        Side::Sell,
                        1_700_000_000_124,
                    ),
                ],
            },
            TestCase {
                // TC1: subscriptions channel
                input: json!({
                    "channel": "subscriptions",
                    "events": [{ "subscriptions": { "market_trades": ["BTC-USD"] } }]
                }),
                expected: vec![],
            },
            TestCase {
                // TC2: trade with a non-numeric size is dropped alone
                input: json!({
                    "channel": "market_trades",
                    "events": [{
                        "type": "update",
                        "trades": [
                            {
                                "price": "100.0", "size": "lots", "side": "BUY",
                                "time": "2023-11-14T22:13:20.123Z"
                            },
                            {
                                "price": "300.0", "size": "2", "side": "SELL",
                                "time": "2023-11-14T22:13:20.125Z"
                            }
                        ]
                    }]
                }),
                expected: vec![CanonicalTrade::new(
                    ExchangeId::Coinbase,
                    300.0,
                    600.0,
                    Side::Sell,
                    1_700_000_000_125,
                )],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = adapter().unwrap().parse(&test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
