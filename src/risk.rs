//! Pre-trade risk admission and monitoring.
//!
//! Every order passes through [`RiskManager::check_order`] before it can
//! reach the exchange. A daily-loss breach latches a halt that rejects
//! all further admissions (and is announced on the bus as `risk_breach`)
//! until `resume` is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::events::{EventBus, EventData, EventType};
use crate::storage::Store;
use crate::types::{OrderRequest, RiskLimits};

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl RiskCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Live exposure attributed per token plus the aggregate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Exposure {
    pub per_token: HashMap<String, f64>,
    pub total: f64,
}

pub struct RiskManager {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    limits: RiskLimits,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
}

impl RiskManager {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, limits: RiskLimits) -> Self {
        info!(
            "[RISK] Limits: position {:.2}, exposure {:.2}, daily loss {:.2}, open orders {}",
            limits.max_position_size,
            limits.max_total_exposure,
            limits.max_daily_loss,
            limits.max_open_orders
        );
        Self {
            store,
            bus,
            limits,
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().expect("halt reason lock poisoned").clone()
    }

    /// Latch the halt flag and announce the breach. Idempotent: a second
    /// call while halted neither re-records nor re-emits.
    pub async fn halt(&self, reason: impl Into<String>) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        error!("[RISK] HALTED: {}", reason);
        *self.halt_reason.lock().expect("halt reason lock poisoned") = Some(reason.clone());
        self.bus
            .emit(EventType::RiskBreach, EventData::RiskBreach { reason })
            .await;
    }

    /// Clear the halt latch and re-enable admission.
    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
        *self.halt_reason.lock().expect("halt reason lock poisoned") = None;
        info!("[RISK] Resumed");
    }

    /// Admission gate, enforced in order: halt state, per-order notional,
    /// total exposure, open-order count, daily loss (which halts as a
    /// side effect). Note the notional clause compares `price * size`
    /// against `max_position_size`.
    pub async fn check_order(&self, order: &OrderRequest) -> RiskCheck {
        if self.is_halted() {
            let reason = self
                .halt_reason()
                .unwrap_or_else(|| "unspecified".to_string());
            return RiskCheck::reject(format!("trading halted: {}", reason));
        }

        let notional = order.notional();
        if notional > self.limits.max_position_size {
            return RiskCheck::reject(format!(
                "order notional {:.2} exceeds max position size {:.2}",
                notional, self.limits.max_position_size
            ));
        }

        let exposure = match self.get_exposure() {
            Ok(e) => e,
            Err(e) => {
                error!("[RISK] Exposure computation failed: {}", e);
                return RiskCheck::reject("risk state unavailable");
            }
        };
        if exposure.total + notional > self.limits.max_total_exposure {
            return RiskCheck::reject(format!(
                "total exposure {:.2} + {:.2} exceeds limit {:.2}",
                exposure.total, notional, self.limits.max_total_exposure
            ));
        }

        let open_orders = match self.store.get_open_orders() {
            Ok(orders) => orders.len(),
            Err(e) => {
                error!("[RISK] Open-order query failed: {}", e);
                return RiskCheck::reject("risk state unavailable");
            }
        };
        if open_orders >= self.limits.max_open_orders {
            return RiskCheck::reject(format!(
                "open order limit reached ({})",
                self.limits.max_open_orders
            ));
        }

        let daily_pnl = match self.store.get_daily_pnl(Utc::now().date_naive()) {
            Ok(pnl) => pnl,
            Err(e) => {
                error!("[RISK] Daily PnL query failed: {}", e);
                return RiskCheck::reject("risk state unavailable");
            }
        };
        if daily_pnl < -self.limits.max_daily_loss {
            let reason = format!(
                "daily loss {:.2} breaches limit {:.2}",
                daily_pnl, self.limits.max_daily_loss
            );
            warn!("[RISK] {}", reason);
            self.halt(reason.clone()).await;
            return RiskCheck::reject(reason);
        }

        RiskCheck::allow()
    }

    /// Sum of `|position size x current price|` over stored positions
    /// plus `price x size` over live open orders, per token and in
    /// aggregate.
    pub fn get_exposure(&self) -> crate::storage::StoreResult<Exposure> {
        let mut exposure = Exposure::default();

        for position in self.store.get_all_active_positions()? {
            let value = (position.size * position.current_price).abs();
            *exposure.per_token.entry(position.token_id).or_insert(0.0) += value;
            exposure.total += value;
        }

        for order in self.store.get_open_orders()? {
            let value = order.price * order.size;
            *exposure.per_token.entry(order.token_id).or_insert(0.0) += value;
            exposure.total += value;
        }

        Ok(exposure)
    }
}
