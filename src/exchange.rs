//! Exchange client abstraction.
//!
//! The engine only depends on this trait; the production CLOB adapter
//! lives outside the core. [`MockExchangeClient`] backs dry-run wiring
//! and tests with deterministic order ids and scriptable books.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::types::{OpenOrder, OrderBook, OrderRequest, PlaceOrderResult};

/// Bidirectional exchange surface required by the trading pipeline.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Latest order book for a token. The returned book carries its own
    /// timestamp.
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook>;

    async fn place_order(&self, request: &OrderRequest) -> Result<PlaceOrderResult>;

    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    async fn cancel_all_orders(&self) -> Result<bool>;

    /// Open orders as known by the exchange, optionally scoped to one
    /// market.
    async fn get_open_orders(&self, market: Option<&str>) -> Result<Vec<OpenOrder>>;
}

/// In-process exchange simulator.
///
/// Books are set by the test or the dry-run harness; orders fill
/// immediately at the requested price unless `set_fill_orders(false)`.
pub struct MockExchangeClient {
    books: RwLock<HashMap<String, OrderBook>>,
    open_orders: Mutex<Vec<OpenOrder>>,
    next_order_id: AtomicU64,
    fill_orders: AtomicBool,
    fail_books: AtomicBool,
    cancel_all_calls: AtomicU64,
}

impl MockExchangeClient {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            open_orders: Mutex::new(Vec::new()),
            next_order_id: AtomicU64::new(1),
            fill_orders: AtomicBool::new(true),
            fail_books: AtomicBool::new(false),
            cancel_all_calls: AtomicU64::new(0),
        }
    }

    /// Install or replace the book returned for a token.
    pub fn set_order_book(&self, book: OrderBook) {
        self.books
            .write()
            .expect("mock books lock poisoned")
            .insert(book.token_id.clone(), book);
    }

    /// When false, placed orders rest (zero filled size) and show up in
    /// `get_open_orders`.
    pub fn set_fill_orders(&self, fill: bool) {
        self.fill_orders.store(fill, Ordering::SeqCst);
    }

    /// When true, every `get_order_book` call fails. For error-path tests.
    pub fn set_fail_books(&self, fail: bool) {
        self.fail_books.store(fail, Ordering::SeqCst);
    }

    /// Replace the remote open-order set (reconciliation tests).
    pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
        *self.open_orders.lock().expect("mock orders lock poisoned") = orders;
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.lock().expect("mock orders lock poisoned").len()
    }

    pub fn cancel_all_calls(&self) -> u64 {
        self.cancel_all_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockExchangeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook> {
        if self.fail_books.load(Ordering::SeqCst) {
            return Err(anyhow!("mock exchange unavailable"));
        }
        self.books
            .read()
            .expect("mock books lock poisoned")
            .get(token_id)
            .cloned()
            .ok_or_else(|| anyhow!("no order book for token {}", token_id))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlaceOrderResult> {
        let order_id = format!("mock-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        let filled = self.fill_orders.load(Ordering::SeqCst);

        if !filled {
            self.open_orders
                .lock()
                .expect("mock orders lock poisoned")
                .push(OpenOrder {
                    order_id: order_id.clone(),
                    token_id: request.token_id.clone(),
                    side: request.side,
                    price: request.price,
                    size: request.size,
                });
        }

        Ok(PlaceOrderResult {
            success: true,
            order_id: Some(order_id),
            filled_size: Some(if filled { request.size } else { 0.0 }),
            avg_fill_price: Some(request.price),
            error: None,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut orders = self.open_orders.lock().expect("mock orders lock poisoned");
        orders.retain(|o| o.order_id != order_id);
        Ok(true)
    }

    async fn cancel_all_orders(&self) -> Result<bool> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        self.open_orders
            .lock()
            .expect("mock orders lock poisoned")
            .clear();
        Ok(true)
    }

    async fn get_open_orders(&self, market: Option<&str>) -> Result<Vec<OpenOrder>> {
        let orders = self.open_orders.lock().expect("mock orders lock poisoned");
        Ok(match market {
            Some(token) => orders.iter().filter(|o| o.token_id == token).cloned().collect(),
            None => orders.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriceLevel, Side};

    #[tokio::test]
    async fn test_mock_books() {
        let client = MockExchangeClient::new();
        assert!(client.get_order_book("t1").await.is_err());

        client.set_order_book(OrderBook::new(
            "t1",
            vec![PriceLevel::new(0.49, 100.0)],
            vec![PriceLevel::new(0.51, 100.0)],
        ));

        let book = client.get_order_book("t1").await.unwrap();
        assert_eq!(book.best_ask().unwrap().price, 0.51);
    }

    #[tokio::test]
    async fn test_mock_order_ids_are_deterministic() {
        let client = MockExchangeClient::new();
        let req = OrderRequest::gtc("t1", Side::Buy, 0.5, 10.0);

        let first = client.place_order(&req).await.unwrap();
        let second = client.place_order(&req).await.unwrap();

        assert_eq!(first.order_id.as_deref(), Some("mock-1"));
        assert_eq!(second.order_id.as_deref(), Some("mock-2"));
        assert_eq!(first.filled_size, Some(10.0));
    }

    #[tokio::test]
    async fn test_mock_resting_orders() {
        let client = MockExchangeClient::new();
        client.set_fill_orders(false);

        let req = OrderRequest::gtc("t1", Side::Buy, 0.5, 10.0);
        let result = client.place_order(&req).await.unwrap();

        assert_eq!(result.filled_size, Some(0.0));
        assert_eq!(client.get_open_orders(None).await.unwrap().len(), 1);

        client.cancel_all_orders().await.unwrap();
        assert!(client.get_open_orders(None).await.unwrap().is_empty());
    }
}
