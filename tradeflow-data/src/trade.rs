use crate::exchange::ExchangeId;
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
pub enum Side {
    #[serde(alias = "buy", alias = "BUY")]
    #[display("buy")]
    Buy,
    #[serde(alias = "sell", alias = "SELL")]
    #[display("sell")]
    Sell,
}

/// Normalised trade produced by one [`ExchangeAdapter`](crate::exchange::ExchangeAdapter) parse.
///
/// Volume is always expressed in quote-currency (USD-equivalent) terms.
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug, Constructor, Deserialize, Serialize)]
pub struct CanonicalTrade {
    pub exchange: ExchangeId,
    pub price: f64,
    pub volume_usd: f64,
    pub side: Side,
    /// Exchange timestamp in epoch milliseconds.
    pub timestamp: i64,
}
