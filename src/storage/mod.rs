//! SQLite persistence for positions, orders and trades.
//!
//! All writes are upserts keyed by the entity's primary identifier
//! (`token_id` for positions, `order_id` for orders, trade `id` for
//! trades). The store starts empty; there are no migrations.

mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::info;

use crate::types::{OrderRecord, OrderStatus, OrderType, Position, Side, Trade};

/// Errors from database operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe handle to the trading database.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        schema::create_tables(&conn)?;

        info!("[STORE] Database ready at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Flush WAL state. Safe to call more than once; the connection itself
    /// closes when the last handle is dropped.
    pub fn close(&self) {
        if let Ok(conn) = self.lock() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
        info!("[STORE] Closed");
    }

    // === Positions ===

    pub fn save_position(&self, position: &Position) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO positions (token_id, market_id, size, avg_entry_price, current_price,
                                    unrealized_pnl, realized_pnl, side, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(token_id) DO UPDATE SET
                market_id = excluded.market_id,
                size = excluded.size,
                avg_entry_price = excluded.avg_entry_price,
                current_price = excluded.current_price,
                unrealized_pnl = excluded.unrealized_pnl,
                realized_pnl = excluded.realized_pnl,
                side = excluded.side,
                updated_at = excluded.updated_at",
            params![
                position.token_id,
                position.market_id,
                position.size,
                position.avg_entry_price,
                position.current_price,
                position.unrealized_pnl,
                position.realized_pnl,
                position.side.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_position(&self, token_id: &str) -> StoreResult<Option<Position>> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                "SELECT token_id, market_id, size, avg_entry_price, current_price,
                        unrealized_pnl, realized_pnl, side
                 FROM positions WHERE token_id = ?1",
                [token_id],
                Self::row_to_position,
            )
            .optional()?;
        Ok(result)
    }

    /// All positions with non-zero size.
    pub fn get_all_active_positions(&self) -> StoreResult<Vec<Position>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT token_id, market_id, size, avg_entry_price, current_price,
                    unrealized_pnl, realized_pnl, side
             FROM positions WHERE size != 0",
        )?;
        let positions = stmt
            .query_map([], Self::row_to_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    fn row_to_position(row: &Row) -> rusqlite::Result<Position> {
        let side_str: String = row.get(7)?;
        Ok(Position {
            token_id: row.get(0)?,
            market_id: row.get(1)?,
            size: row.get(2)?,
            avg_entry_price: row.get(3)?,
            current_price: row.get(4)?,
            unrealized_pnl: row.get(5)?,
            realized_pnl: row.get(6)?,
            side: Side::from_str(&side_str).unwrap_or(Side::Buy),
        })
    }

    // === Orders ===

    pub fn save_order(&self, order: &OrderRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO orders (order_id, token_id, side, price, size, order_type, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(order_id) DO UPDATE SET
                token_id = excluded.token_id,
                side = excluded.side,
                price = excluded.price,
                size = excluded.size,
                order_type = excluded.order_type,
                status = excluded.status",
            params![
                order.order_id,
                order.token_id,
                order.side.as_str(),
                order.price,
                order.size,
                order.order_type.as_str(),
                order.status.as_str(),
                order.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_order_status(&self, order_id: &str, status: OrderStatus) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE orders SET status = ?1 WHERE order_id = ?2",
            params![status.as_str(), order_id],
        )?;
        Ok(())
    }

    /// Orders whose status is `pending` or `open`.
    pub fn get_open_orders(&self) -> StoreResult<Vec<OrderRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, token_id, side, price, size, order_type, status, created_at
             FROM orders WHERE status IN ('pending', 'open')",
        )?;
        let orders = stmt
            .query_map([], Self::row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    fn row_to_order(row: &Row) -> rusqlite::Result<OrderRecord> {
        let side_str: String = row.get(2)?;
        let type_str: String = row.get(5)?;
        let status_str: String = row.get(6)?;
        let created_str: String = row.get(7)?;
        Ok(OrderRecord {
            order_id: row.get(0)?,
            token_id: row.get(1)?,
            side: Side::from_str(&side_str).unwrap_or(Side::Buy),
            price: row.get(3)?,
            size: row.get(4)?,
            order_type: OrderType::from_str(&type_str).unwrap_or(OrderType::Gtc),
            status: OrderStatus::from_str(&status_str).unwrap_or(OrderStatus::Pending),
            created_at: DateTime::parse_from_rfc3339(&created_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // === Trades ===

    pub fn save_trade(&self, trade: &Trade) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO trades (id, order_id, token_id, side, price, size, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                order_id = excluded.order_id,
                token_id = excluded.token_id,
                side = excluded.side,
                price = excluded.price,
                size = excluded.size,
                executed_at = excluded.executed_at",
            params![
                trade.id,
                trade.order_id,
                trade.token_id,
                trade.side.as_str(),
                trade.price,
                trade.size,
                trade.executed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Trades newest first, optionally filtered by token.
    pub fn get_trades(&self, token_id: Option<&str>, limit: usize) -> StoreResult<Vec<Trade>> {
        let conn = self.lock()?;
        let trades = match token_id {
            Some(token) => {
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, token_id, side, price, size, executed_at
                     FROM trades WHERE token_id = ?1
                     ORDER BY executed_at DESC LIMIT ?2",
                )?;
                let result = stmt
                    .query_map(params![token, limit as i64], Self::row_to_trade)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, token_id, side, price, size, executed_at
                     FROM trades ORDER BY executed_at DESC LIMIT ?1",
                )?;
                let result = stmt
                    .query_map(params![limit as i64], Self::row_to_trade)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(trades)
    }

    /// Sum over trades on the given UTC date of `sell_notional - buy_notional`,
    /// where notional is `price * size`. Buys contribute negatively.
    pub fn get_daily_pnl(&self, date: NaiveDate) -> StoreResult<f64> {
        let conn = self.lock()?;
        // executed_at is RFC 3339, so the first ten characters are the date
        let pnl: f64 = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN side = 'sell' THEN price * size
                                      ELSE -(price * size) END), 0.0)
             FROM trades WHERE substr(executed_at, 1, 10) = ?1",
            [date.format("%Y-%m-%d").to_string()],
            |row| row.get(0),
        )?;
        Ok(pnl)
    }

    fn row_to_trade(row: &Row) -> rusqlite::Result<Trade> {
        let side_str: String = row.get(3)?;
        let executed_str: String = row.get(6)?;
        Ok(Trade {
            id: row.get(0)?,
            order_id: row.get(1)?,
            token_id: row.get(2)?,
            side: Side::from_str(&side_str).unwrap_or(Side::Buy),
            price: row.get(4)?,
            size: row.get(5)?,
            executed_at: DateTime::parse_from_rfc3339(&executed_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
