//! Order submission, cancellation and position bookkeeping.
//!
//! Every request is offered to the risk manager first. In dry-run mode a
//! synthetic success with a deterministic identifier is returned and no
//! external call is made. Real placements are persisted, announced on the
//! bus, and any immediate fill flows into the position and trade records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::events::{EventBus, EventData, EventType, OrderFill};
use crate::exchange::ExchangeClient;
use crate::risk::RiskManager;
use crate::storage::Store;
use crate::types::{
    OrderRecord, OrderRequest, OrderStatus, Position, Side, Trade,
};

/// Outcome of a submission attempt. Failures carry the rejection or
/// transport reason; no error is propagated as `Err`.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

impl SubmitResult {
    fn ok(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
        }
    }
}

pub struct OrderManager {
    client: Arc<dyn ExchangeClient>,
    store: Arc<Store>,
    risk: Arc<RiskManager>,
    bus: Arc<EventBus>,
    dry_run: bool,
    dry_run_seq: AtomicU64,
    trade_seq: AtomicU64,
}

impl OrderManager {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        store: Arc<Store>,
        risk: Arc<RiskManager>,
        bus: Arc<EventBus>,
        dry_run: bool,
    ) -> Self {
        info!("[ORDERS] Order manager ready (dry_run={})", dry_run);
        Self {
            client,
            store,
            risk,
            bus,
            dry_run,
            dry_run_seq: AtomicU64::new(1),
            trade_seq: AtomicU64::new(1),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Risk-gate and place an order.
    pub async fn submit_order(&self, request: OrderRequest) -> SubmitResult {
        if let Err(e) = request.validate() {
            return SubmitResult::fail(format!("invalid order: {}", e));
        }

        let check = self.risk.check_order(&request).await;
        if !check.allowed {
            let reason = check.reason.unwrap_or_else(|| "risk rejection".to_string());
            warn!(
                "[ORDERS] Rejected {} {} {:.2}@{:.3}: {}",
                request.side, request.token_id, request.size, request.price, reason
            );
            return SubmitResult::fail(reason);
        }

        if self.dry_run {
            let order_id = format!("dry-run-{}", self.dry_run_seq.fetch_add(1, Ordering::SeqCst));
            info!(
                "[ORDERS] DRY RUN {} {} {:.2}@{:.3} -> {}",
                request.side, request.token_id, request.size, request.price, order_id
            );
            return SubmitResult::ok(order_id);
        }

        let result = match self.client.place_order(&request).await {
            Ok(result) => result,
            Err(e) => {
                warn!("[ORDERS] Exchange call failed: {:#}", e);
                return SubmitResult::fail(format!("exchange error: {}", e));
            }
        };

        if !result.success {
            let reason = result.error.unwrap_or_else(|| "order rejected".to_string());
            warn!("[ORDERS] Placement rejected: {}", reason);
            return SubmitResult::fail(reason);
        }

        let order_id = match result.order_id.clone() {
            Some(id) => id,
            None => return SubmitResult::fail("exchange returned no order id"),
        };

        let record = OrderRecord::from_request(order_id.as_str(), &request, OrderStatus::Open);
        if let Err(e) = self.store.save_order(&record) {
            error!("[ORDERS] Failed to persist order {}: {}", order_id, e);
        }

        info!(
            "[ORDERS] Placed {} {} {} {:.2}@{:.3} (filled {:.2})",
            order_id,
            request.side,
            request.token_id,
            request.size,
            request.price,
            result.filled_size.unwrap_or(0.0)
        );

        // Emitted on every accepted placement, resting orders included;
        // consumers must tolerate filled_size == 0.
        self.bus
            .emit(
                EventType::OrderFilled,
                EventData::Fill(OrderFill {
                    order_id: order_id.clone(),
                    order: request.clone(),
                    result: result.clone(),
                }),
            )
            .await;

        let filled_size = result.filled_size.unwrap_or(0.0);
        if filled_size > 0.0 {
            let fill_price = result.avg_fill_price.unwrap_or(request.price);
            self.record_fill(&order_id, &request.token_id, request.side, filled_size, fill_price)
                .await;
        }

        SubmitResult::ok(order_id)
    }

    /// Persist the trade, fold the fill into the position, and announce
    /// both.
    async fn record_fill(&self, order_id: &str, token_id: &str, side: Side, size: f64, price: f64) {
        let trade = Trade {
            id: format!("trade-{}", self.trade_seq.fetch_add(1, Ordering::SeqCst)),
            order_id: order_id.to_string(),
            token_id: token_id.to_string(),
            side,
            price,
            size,
            executed_at: Utc::now(),
        };
        if let Err(e) = self.store.save_trade(&trade) {
            error!("[ORDERS] Failed to persist trade for {}: {}", order_id, e);
        }
        self.bus
            .emit(EventType::TradeExecuted, EventData::Trade(trade))
            .await;

        let existing = match self.store.get_position(token_id) {
            Ok(p) => p,
            Err(e) => {
                error!("[ORDERS] Position read failed for {}: {}", token_id, e);
                None
            }
        };

        let position = apply_fill(existing, token_id, side, size, price);
        if let Err(e) = self.store.save_position(&position) {
            error!("[ORDERS] Failed to persist position {}: {}", token_id, e);
        }

        info!(
            "[ORDERS] Position {} size {:.2} avg {:.3} realized {:.2}",
            token_id, position.size, position.avg_entry_price, position.realized_pnl
        );

        self.bus
            .emit(EventType::PositionChanged, EventData::Position(position))
            .await;
    }

    /// Cancel one order. Dry-run is a successful no-op.
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        if self.dry_run {
            return true;
        }

        match self.client.cancel_order(order_id).await {
            Ok(true) => {
                if let Err(e) = self.store.update_order_status(order_id, OrderStatus::Cancelled) {
                    error!("[ORDERS] Status update failed for {}: {}", order_id, e);
                }
                self.bus
                    .emit(
                        EventType::OrderCancelled,
                        EventData::OrderCancelled {
                            order_id: order_id.to_string(),
                        },
                    )
                    .await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("[ORDERS] Cancel failed for {}: {:#}", order_id, e);
                false
            }
        }
    }

    /// Cancel everything we believe is live. Dry-run is a successful
    /// no-op.
    pub async fn cancel_all_orders(&self) -> bool {
        if self.dry_run {
            return true;
        }

        match self.client.cancel_all_orders().await {
            Ok(true) => {
                let open = match self.store.get_open_orders() {
                    Ok(orders) => orders,
                    Err(e) => {
                        error!("[ORDERS] Open-order query failed: {}", e);
                        return true;
                    }
                };
                info!("[ORDERS] Cancelling {} local open order(s)", open.len());
                for order in open {
                    if let Err(e) = self
                        .store
                        .update_order_status(&order.order_id, OrderStatus::Cancelled)
                    {
                        error!("[ORDERS] Status update failed for {}: {}", order.order_id, e);
                    }
                    self.bus
                        .emit(
                            EventType::OrderCancelled,
                            EventData::OrderCancelled {
                                order_id: order.order_id.clone(),
                            },
                        )
                        .await;
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("[ORDERS] Cancel-all failed: {:#}", e);
                false
            }
        }
    }

    /// Reconcile local open orders against remote truth: anything we hold
    /// as live that the exchange no longer lists becomes
    /// `filled_or_cancelled`.
    pub async fn sync_orders(&self) {
        let remote = match self.client.get_open_orders(None).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("[ORDERS] Sync skipped, open-order fetch failed: {:#}", e);
                return;
            }
        };
        let remote_ids: std::collections::HashSet<&str> =
            remote.iter().map(|o| o.order_id.as_str()).collect();

        let local = match self.store.get_open_orders() {
            Ok(orders) => orders,
            Err(e) => {
                error!("[ORDERS] Sync skipped, local query failed: {}", e);
                return;
            }
        };

        let mut reconciled = 0;
        for order in local {
            if !remote_ids.contains(order.order_id.as_str()) {
                if let Err(e) = self
                    .store
                    .update_order_status(&order.order_id, OrderStatus::FilledOrCancelled)
                {
                    error!("[ORDERS] Status update failed for {}: {}", order.order_id, e);
                } else {
                    reconciled += 1;
                }
            }
        }

        if reconciled > 0 {
            info!("[ORDERS] Reconciled {} stale open order(s)", reconciled);
        }
    }
}

/// Fold a fill into an existing position (authoritative algorithm).
///
/// Same-side fills move the size-weighted average entry; opposite-side
/// fills realize PnL on the fill size against the average entry. A fill
/// that crosses through zero keeps the full fill size in the realized
/// term; the resulting side follows the sign of the new net size.
pub fn apply_fill(
    existing: Option<Position>,
    token_id: &str,
    side: Side,
    size: f64,
    price: f64,
) -> Position {
    let signed_fill = side.sign() * size;

    let mut position = match existing {
        Some(p) if p.size != 0.0 => p,
        _ => {
            let mut fresh = Position {
                token_id: token_id.to_string(),
                market_id: token_id.to_string(),
                size: signed_fill,
                avg_entry_price: price,
                current_price: price,
                unrealized_pnl: 0.0,
                realized_pnl: 0.0,
                side,
            };
            fresh.mark(price);
            return fresh;
        }
    };

    if side == position.side {
        let new_size = position.size + signed_fill;
        position.avg_entry_price = (position.size.abs() * position.avg_entry_price
            + size * price)
            / new_size.abs();
        position.size = new_size;
    } else {
        let direction = if position.side == Side::Buy { 1.0 } else { -1.0 };
        position.realized_pnl += size * (price - position.avg_entry_price) * direction;
        position.size += signed_fill;
        position.side = if position.size >= 0.0 { Side::Buy } else { Side::Sell };
    }

    position.mark(price);
    position
}
