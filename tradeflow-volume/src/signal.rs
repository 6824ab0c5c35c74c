use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Directional signal of one completed window.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[display("buy-dominant")]
    BuyDominant,
    #[display("sell-dominant")]
    SellDominant,
}

impl Direction {
    /// Classify a window from its buy and sell volume.
    ///
    /// With a baseline buy ratio and non-zero volume the window is buy-dominant iff its own buy
    /// ratio is at least the baseline, so ties favour buy. Otherwise it is buy-dominant iff
    /// `buy > sell`, so ties favour sell.
    pub fn classify(buy: f64, sell: f64, baseline_buy_ratio: Option<f64>) -> Self {
        let total = buy + sell;

        let buy_dominant = match baseline_buy_ratio {
            Some(baseline) if total > 0.0 && baseline.is_finite() => buy / total >= baseline,
            _ => buy > sell,
        };

        if buy_dominant {
            Direction::BuyDominant
        } else {
            Direction::SellDominant
        }
    }

    /// Colour indicator used in rendered reports.
    pub fn indicator(&self) -> &'static str {
        match self {
            Direction::BuyDominant => "🟢",
            Direction::SellDominant => "🔴",
        }
    }
}
