//! Core type definitions for the trading engine.
//!
//! This module provides the foundational types shared across the pipeline:
//! order books, orders, positions, trades, strategy signals, market groups
//! and risk limits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// === Sides and order classification ===

/// Order side (buy/sell). Positions carry the side of their net exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    /// +1 for BUY, -1 for SELL. Used to sign fill sizes.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-in-force for submitted orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Good-til-cancelled
    Gtc,
    /// Good-til-date (requires an expiration)
    Gtd,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Gtc => "GTC",
            OrderType::Gtd => "GTD",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GTC" => Some(OrderType::Gtc),
            "GTD" => Some(OrderType::Gtd),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a submitted order.
///
/// Orders in `Pending` or `Open` are live and count toward risk limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    /// Closed remotely while we were not looking; exact outcome unknown.
    FilledOrCancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::FilledOrCancelled => "filled_or_cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "open" => Some(OrderStatus::Open),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "filled_or_cancelled" => Some(OrderStatus::FilledOrCancelled),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// === Order book ===

/// A single price level: price in (0,1) representing probability, size >= 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Snapshot of one token's order book.
///
/// Bids are ordered descending by price, asks ascending; either side may
/// be empty. When both sides are present, `best_bid < best_ask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn new(token_id: impl Into<String>, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            token_id: token_id.into(),
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// best_ask - best_bid; `None` unless both sides are present.
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// (best_ask + best_bid) / 2; `None` unless both sides are present.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((ask.price + bid.price) / 2.0),
            _ => None,
        }
    }

    /// Age of this snapshot relative to now, in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }
}

// === Orders ===

/// A request to place an order, as produced by the order manager from a
/// strategy signal. `price` must lie in (0,1) and `size` must be positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub order_type: OrderType,
    pub expiration: Option<DateTime<Utc>>,
}

impl OrderRequest {
    /// Good-til-cancelled limit order.
    pub fn gtc(token_id: impl Into<String>, side: Side, price: f64, size: f64) -> Self {
        Self {
            token_id: token_id.into(),
            side,
            price,
            size,
            order_type: OrderType::Gtc,
            expiration: None,
        }
    }

    /// Notional value of the request.
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.price > 0.0 && self.price < 1.0) {
            return Err(format!("price {} outside (0,1)", self.price));
        }
        if self.size <= 0.0 {
            return Err(format!("size {} must be positive", self.size));
        }
        if self.order_type == OrderType::Gtd && self.expiration.is_none() {
            return Err("GTD order requires an expiration".to_string());
        }
        Ok(())
    }
}

/// A persisted order: the original request plus identity and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn from_request(
        order_id: impl Into<String>,
        request: &OrderRequest,
        status: OrderStatus,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            token_id: request.token_id.clone(),
            side: request.side,
            price: request.price,
            size: request.size,
            order_type: request.order_type,
            status,
            created_at: Utc::now(),
        }
    }
}

/// Exchange response to a `place_order` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaceOrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_size: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub error: Option<String>,
}

impl PlaceOrderResult {
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// An open order as reported by the exchange (remote truth for
/// reconciliation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
}

// === Positions and trades ===

/// Net position in one token. Positive `size` is net long (BUY), negative
/// net short (SELL). Zero-size positions are retained for their realized
/// PnL but excluded from the active set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token_id: String,
    pub market_id: String,
    pub size: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub side: Side,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.size != 0.0
    }

    /// Re-mark against a new price, keeping the unrealized-PnL invariant
    /// `unrealized = (current - avg_entry) * size`.
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = (self.current_price - self.avg_entry_price) * self.size;
    }
}

/// An executed trade, persisted for daily-PnL aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub executed_at: DateTime<Utc>,
}

// === Strategy output ===

/// A trading intent produced by a strategy evaluation. The orchestrator
/// discards signals with confidence <= 0.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub token_id: String,
    pub side: Side,
    pub confidence: f64,
    pub target_price: f64,
    pub size: f64,
    pub reason: String,
}

// === Market groups ===

/// The mutually-exclusive outcome tokens of one exchange event. Binary
/// markets have two tokens; negative-risk events have one "yes" token per
/// sub-market. Always at least two tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketGroup {
    pub condition_id: String,
    pub token_ids: Vec<String>,
}

impl MarketGroup {
    pub fn new(condition_id: impl Into<String>, token_ids: Vec<String>) -> Self {
        Self {
            condition_id: condition_id.into(),
            token_ids,
        }
    }
}

// === Risk limits ===

/// Hard limits enforced by the risk manager. `max_daily_loss` is a
/// positive bound on negative daily PnL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_total_exposure: f64,
    pub max_loss_per_trade: f64,
    pub max_daily_loss: f64,
    pub max_open_orders: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: 100.0,
            max_total_exposure: 1000.0,
            max_loss_per_trade: 50.0,
            max_daily_loss: 100.0,
            max_open_orders: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with(bid: f64, ask: f64) -> OrderBook {
        OrderBook::new(
            "t1",
            vec![PriceLevel::new(bid, 100.0)],
            vec![PriceLevel::new(ask, 100.0)],
        )
    }

    #[test]
    fn test_order_book_spread_and_mid() {
        let book = book_with(0.48, 0.52);
        assert!((book.spread().unwrap() - 0.04).abs() < 1e-9);
        assert!((book.mid_price().unwrap() - 0.50).abs() < 1e-9);
    }

    #[test]
    fn test_order_book_one_sided() {
        let book = OrderBook::new("t1", vec![], vec![PriceLevel::new(0.55, 10.0)]);
        assert!(book.best_bid().is_none());
        assert_eq!(book.best_ask().unwrap().price, 0.55);
        assert!(book.spread().is_none());
        assert!(book.mid_price().is_none());
    }

    #[test]
    fn test_order_request_validation() {
        assert!(OrderRequest::gtc("t1", Side::Buy, 0.5, 10.0).validate().is_ok());
        assert!(OrderRequest::gtc("t1", Side::Buy, 0.0, 10.0).validate().is_err());
        assert!(OrderRequest::gtc("t1", Side::Buy, 1.0, 10.0).validate().is_err());
        assert!(OrderRequest::gtc("t1", Side::Buy, 0.5, 0.0).validate().is_err());

        let mut gtd = OrderRequest::gtc("t1", Side::Sell, 0.4, 5.0);
        gtd.order_type = OrderType::Gtd;
        assert!(gtd.validate().is_err(), "GTD without expiration should fail");
        gtd.expiration = Some(Utc::now());
        assert!(gtd.validate().is_ok());
    }

    #[test]
    fn test_position_mark_invariant() {
        let mut pos = Position {
            token_id: "t1".into(),
            market_id: "m1".into(),
            size: 20.0,
            avg_entry_price: 0.50,
            current_price: 0.50,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            side: Side::Buy,
        };

        pos.mark(0.60);
        assert!((pos.unrealized_pnl - 2.0).abs() < 1e-9);

        pos.size = -10.0;
        pos.side = Side::Sell;
        pos.mark(0.60);
        assert!((pos.unrealized_pnl - (0.60 - 0.50) * -10.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Open,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::FilledOrCancelled,
        ] {
            assert_eq!(OrderStatus::from_str(status.as_str()), Some(status));
        }
        assert!(OrderStatus::Pending.is_live());
        assert!(OrderStatus::Open.is_live());
        assert!(!OrderStatus::Filled.is_live());
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
        assert_eq!(Side::from_str("BUY"), Some(Side::Buy));
        assert_eq!(Side::from_str("nope"), None);
    }
}
