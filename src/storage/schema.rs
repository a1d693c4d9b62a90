//! Database schema creation.

use rusqlite::{Connection, Result};

/// Create all tables and indexes. Idempotent.
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Positions: one row per token, upserted on every fill and mark
    conn.execute(
        "CREATE TABLE IF NOT EXISTS positions (
            token_id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            size REAL NOT NULL,
            avg_entry_price REAL NOT NULL,
            current_price REAL NOT NULL,
            unrealized_pnl REAL NOT NULL,
            realized_pnl REAL NOT NULL,
            side TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Orders: keyed by exchange order id
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT PRIMARY KEY,
            token_id TEXT NOT NULL,
            side TEXT NOT NULL,
            price REAL NOT NULL,
            size REAL NOT NULL,
            order_type TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Trades: append-only fill log, source of daily PnL
    conn.execute(
        "CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            token_id TEXT NOT NULL,
            side TEXT NOT NULL,
            price REAL NOT NULL,
            size REAL NOT NULL,
            executed_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trades_token_time ON trades(token_id, executed_at DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trades_time ON trades(executed_at DESC)",
        [],
    )?;

    Ok(())
}
