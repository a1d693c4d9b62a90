//! Short-window momentum following on a single token.

use anyhow::Result;
use async_trait::async_trait;

use super::{PriceHistory, Strategy, StrategyCore};
use crate::types::{OrderBook, Side, TradeSignal};

const WINDOW: usize = 10;
const MIN_SAMPLES: usize = 5;

pub struct MomentumStrategy {
    core: StrategyCore,
    history: PriceHistory,
    threshold: f64,
    base_size: f64,
}

impl MomentumStrategy {
    pub fn new() -> Self {
        Self::with_params(0.05, 10.0)
    }

    pub fn with_params(threshold: f64, base_size: f64) -> Self {
        Self {
            core: StrategyCore::new("momentum"),
            history: PriceHistory::new(WINDOW),
            threshold,
            base_size,
        }
    }
}

impl Default for MomentumStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for MomentumStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn evaluate(&self, token_id: &str, book: &OrderBook) -> Result<Vec<TradeSignal>> {
        if !self.core.is_enabled() {
            return Ok(vec![]);
        }
        let mid = match book.mid_price() {
            Some(m) => m,
            None => return Ok(vec![]),
        };
        let window = self.history.push(token_id, mid);
        if window.len() < MIN_SAMPLES {
            return Ok(vec![]);
        }

        let first = window[0];
        if first == 0.0 {
            return Ok(vec![]);
        }
        let momentum = (mid - first) / first;

        let signal = if momentum > self.threshold {
            book.best_ask().map(|ask| TradeSignal {
                token_id: token_id.to_string(),
                side: Side::Buy,
                confidence: (0.5 + momentum).min(1.0),
                target_price: ask.price,
                size: self.base_size,
                reason: format!("Momentum: {:+.3} over {} samples", momentum, window.len()),
            })
        } else if momentum < -self.threshold {
            book.best_bid().map(|bid| TradeSignal {
                token_id: token_id.to_string(),
                side: Side::Sell,
                confidence: (0.5 - momentum).min(1.0),
                target_price: bid.price,
                size: self.base_size,
                reason: format!("Momentum: {:+.3} over {} samples", momentum, window.len()),
            })
        } else {
            None
        };

        Ok(signal.into_iter().collect())
    }

    async fn shutdown(&self) {
        self.history.clear();
    }
}
