//! Multi-outcome arbitrage: simple basket arb and Bregman-projection arb.
//!
//! For each discovered market group the strategy watches two conditions:
//!
//! 1. **Simple arbitrage** — the best asks of every outcome sum (with
//!    fees) to less than the guaranteed payout of 1. Buying one of each
//!    outcome locks in the difference. Risk free; short-circuits the
//!    evaluation when present.
//! 2. **Bregman-projection arbitrage** — the implied probability
//!    distribution (normalized mids) diverges from the uniform prior by
//!    more than a KL-divergence threshold. The most underpriced outcome
//!    is bought. Statistical, not risk free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info};

use super::{Strategy, StrategyCore};
use crate::market_data::MarketDataService;
use crate::storage::Store;
use crate::types::{MarketGroup, OrderBook, Side, TradeSignal};

#[derive(Debug, Clone)]
pub struct ArbConfig {
    /// Minimum simple-arb edge (1 - fee-adjusted basket cost).
    pub min_edge: f64,
    /// Taker fee applied to the basket cost.
    pub fee_rate: f64,
    /// Nominal order size before liquidity and capacity caps.
    pub base_size: f64,
    /// Minimum KL divergence from the uniform prior.
    pub divergence_threshold: f64,
    /// Books older than this are ignored.
    pub max_staleness_ms: i64,
    /// Per-token signed-size cap used for remaining capacity.
    pub max_position_size: f64,
    /// Cadence of the counter log line.
    pub stats_interval: Duration,
}

impl Default for ArbConfig {
    fn default() -> Self {
        Self {
            min_edge: 0.02,
            fee_rate: 0.02,
            base_size: 10.0,
            divergence_threshold: 0.05,
            max_staleness_ms: 5_000,
            max_position_size: 100.0,
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Observability counters, readable at any time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArbCounters {
    pub evaluations: u64,
    pub skipped_no_group: u64,
    pub skipped_missing_book: u64,
    pub skipped_stale_book: u64,
    pub simple_arb_signals: u64,
    pub bregman_arb_signals: u64,
    pub no_arb_found: u64,
}

#[derive(Default)]
struct CounterCells {
    evaluations: AtomicU64,
    skipped_no_group: AtomicU64,
    skipped_missing_book: AtomicU64,
    skipped_stale_book: AtomicU64,
    simple_arb_signals: AtomicU64,
    bregman_arb_signals: AtomicU64,
    no_arb_found: AtomicU64,
}

impl CounterCells {
    fn snapshot(&self) -> ArbCounters {
        ArbCounters {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            skipped_no_group: self.skipped_no_group.load(Ordering::Relaxed),
            skipped_missing_book: self.skipped_missing_book.load(Ordering::Relaxed),
            skipped_stale_book: self.skipped_stale_book.load(Ordering::Relaxed),
            simple_arb_signals: self.simple_arb_signals.load(Ordering::Relaxed),
            bregman_arb_signals: self.bregman_arb_signals.load(Ordering::Relaxed),
            no_arb_found: self.no_arb_found.load(Ordering::Relaxed),
        }
    }
}

/// Immutable group list plus token -> group reverse index, swapped
/// wholesale on every discovery update.
struct GroupState {
    groups: Vec<MarketGroup>,
    index: FxHashMap<String, usize>,
}

impl GroupState {
    fn empty() -> Self {
        Self {
            groups: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    fn build(groups: Vec<MarketGroup>) -> Self {
        let mut index = FxHashMap::default();
        for (i, group) in groups.iter().enumerate() {
            for token in &group.token_ids {
                index.insert(token.clone(), i);
            }
        }
        Self { groups, index }
    }
}

pub struct BregmanArbStrategy {
    core: StrategyCore,
    config: ArbConfig,
    market_data: Arc<MarketDataService>,
    store: Arc<Store>,
    state: RwLock<Arc<GroupState>>,
    counters: CounterCells,
    last_stats_log: Mutex<Instant>,
}

impl BregmanArbStrategy {
    pub fn new(market_data: Arc<MarketDataService>, store: Arc<Store>, config: ArbConfig) -> Self {
        Self {
            core: StrategyCore::new("bregman-arb"),
            config,
            market_data,
            store,
            state: RwLock::new(Arc::new(GroupState::empty())),
            counters: CounterCells::default(),
            last_stats_log: Mutex::new(Instant::now()),
        }
    }

    /// Replace the group list and rebuild the reverse index atomically.
    pub fn update_market_groups(&self, groups: Vec<MarketGroup>) {
        let state = Arc::new(GroupState::build(groups));
        info!(
            "[ARB] Tracking {} group(s) over {} token(s)",
            state.groups.len(),
            state.index.len()
        );
        *self.state.write().expect("group state lock poisoned") = state;
    }

    pub fn counters(&self) -> ArbCounters {
        self.counters.snapshot()
    }

    pub fn group_count(&self) -> usize {
        self.state.read().expect("group state lock poisoned").groups.len()
    }

    fn signed_position_size(&self, token_id: &str) -> f64 {
        self.store
            .get_position(token_id)
            .ok()
            .flatten()
            .map(|p| p.size)
            .unwrap_or(0.0)
    }

    fn remaining_capacity(&self, token_id: &str) -> f64 {
        self.config.max_position_size - self.signed_position_size(token_id)
    }

    fn maybe_log_stats(&self) {
        let mut last = self.last_stats_log.lock().expect("stats lock poisoned");
        if last.elapsed() < self.config.stats_interval {
            return;
        }
        *last = Instant::now();
        let c = self.counters.snapshot();
        info!(
            "[ARB] Stats: {} evals, {} simple, {} bregman, {} no-arb, skips: {} no-group / {} missing / {} stale",
            c.evaluations,
            c.simple_arb_signals,
            c.bregman_arb_signals,
            c.no_arb_found,
            c.skipped_no_group,
            c.skipped_missing_book,
            c.skipped_stale_book
        );
    }

    /// Basket check: one BUY per outcome at its best ask, equal sizes.
    fn check_simple_arb(&self, group: &MarketGroup, books: &[OrderBook]) -> Option<Vec<TradeSignal>> {
        let mut asks = Vec::with_capacity(books.len());
        for book in books {
            asks.push(*book.best_ask()?);
        }

        let ask_sum: f64 = asks.iter().map(|a| a.price).sum();
        let cost = ask_sum * (1.0 + self.config.fee_rate);
        let edge = 1.0 - cost;
        if edge < self.config.min_edge {
            return None;
        }

        let min_ask_size = asks.iter().map(|a| a.size).fold(f64::INFINITY, f64::min);
        let min_capacity = group
            .token_ids
            .iter()
            .map(|t| self.remaining_capacity(t))
            .fold(f64::INFINITY, f64::min);
        let size = self.config.base_size.min(min_ask_size).min(min_capacity);
        if size <= 0.0 {
            debug!("[ARB] Simple arb in {} but no capacity", group.condition_id);
            return Some(vec![]);
        }

        let confidence = (edge / self.config.min_edge).min(1.0);
        let signals: Vec<TradeSignal> = group
            .token_ids
            .iter()
            .zip(asks.iter())
            .map(|(token, ask)| TradeSignal {
                token_id: token.clone(),
                side: Side::Buy,
                confidence,
                target_price: ask.price,
                size,
                reason: format!(
                    "Simple arb: basket {:.4} with fees, edge {:.4}",
                    cost, edge
                ),
            })
            .collect();

        self.counters
            .simple_arb_signals
            .fetch_add(signals.len() as u64, Ordering::Relaxed);
        info!(
            "[ARB] Simple arb in {}: edge {:.4}, size {:.2} x {} legs",
            group.condition_id,
            edge,
            size,
            signals.len()
        );
        Some(signals)
    }

    /// Divergence check: buy the most underpriced outcome when the
    /// implied distribution strays far enough from uniform.
    fn check_bregman_arb(&self, group: &MarketGroup, books: &[OrderBook]) -> Vec<TradeSignal> {
        let mids: Option<Vec<f64>> = books.iter().map(|b| b.mid_price()).collect();
        let mids = match mids {
            Some(m) => m,
            None => return vec![],
        };

        let mid_sum: f64 = mids.iter().sum();
        if mid_sum == 0.0 {
            return vec![];
        }
        let q: Vec<f64> = mids.iter().map(|m| m / mid_sum).collect();
        if q.iter().any(|&qi| qi <= 0.0) {
            return vec![];
        }

        // KL divergence of the uniform prior from the observed
        // distribution: D = sum( u * ln(u / q_i) ), u = 1/n
        let u = 1.0 / q.len() as f64;
        let divergence: f64 = q.iter().map(|&qi| u * (u / qi).ln()).sum();
        if divergence < self.config.divergence_threshold {
            self.counters.no_arb_found.fetch_add(1, Ordering::Relaxed);
            return vec![];
        }

        // Most underpriced outcome
        let (target_idx, _) = q
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).expect("q contains no NaN"))
            .expect("group is non-empty");
        let token = &group.token_ids[target_idx];

        // Empty ask side means no executable liquidity
        let ask = match books[target_idx].best_ask() {
            Some(a) => *a,
            None => return vec![],
        };

        let scale = (divergence / self.config.divergence_threshold).min(2.0);
        let size = (self.config.base_size * scale)
            .min(ask.size)
            .min(self.remaining_capacity(token));
        if size <= 0.0 {
            return vec![];
        }

        let confidence = (divergence / (2.0 * self.config.divergence_threshold)).min(1.0);
        self.counters.bregman_arb_signals.fetch_add(1, Ordering::Relaxed);
        info!(
            "[ARB] Bregman arb in {}: D {:.4}, buying {} at {:.3}, size {:.2}",
            group.condition_id, divergence, token, ask.price, size
        );

        vec![TradeSignal {
            token_id: token.clone(),
            side: Side::Buy,
            confidence,
            target_price: ask.price,
            size,
            reason: format!(
                "Bregman arb: divergence {:.4} >= {:.4}, most underpriced outcome",
                divergence, self.config.divergence_threshold
            ),
        }]
    }
}

#[async_trait]
impl Strategy for BregmanArbStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn evaluate(&self, token_id: &str, book: &OrderBook) -> Result<Vec<TradeSignal>> {
        if !self.core.is_enabled() {
            return Ok(vec![]);
        }
        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        self.maybe_log_stats();

        let state = self.state.read().expect("group state lock poisoned").clone();
        let group = match state.index.get(token_id) {
            Some(&i) => &state.groups[i],
            None => {
                self.counters.skipped_no_group.fetch_add(1, Ordering::Relaxed);
                return Ok(vec![]);
            }
        };

        // Gather one book per outcome; the trigger token uses the fresh
        // book, siblings come from the market-data cache.
        let mut books = Vec::with_capacity(group.token_ids.len());
        for token in &group.token_ids {
            let b = if token == token_id {
                book.clone()
            } else {
                match self.market_data.get_order_book(token) {
                    Some(b) => b,
                    None => {
                        self.counters.skipped_missing_book.fetch_add(1, Ordering::Relaxed);
                        return Ok(vec![]);
                    }
                }
            };
            books.push(b);
        }

        for b in &books {
            if b.age_ms() > self.config.max_staleness_ms {
                self.counters.skipped_stale_book.fetch_add(1, Ordering::Relaxed);
                return Ok(vec![]);
            }
        }

        // Simple arb short-circuits the Bregman check
        if let Some(signals) = self.check_simple_arb(group, &books) {
            return Ok(signals);
        }

        Ok(self.check_bregman_arb(group, &books))
    }

    async fn on_market_groups(&self, groups: &[MarketGroup]) {
        self.update_market_groups(groups.to_vec());
    }

    async fn shutdown(&self) {
        let c = self.counters.snapshot();
        info!(
            "[ARB] Shutdown after {} evaluations ({} simple, {} bregman)",
            c.evaluations, c.simple_arb_signals, c.bregman_arb_signals
        );
    }
}
