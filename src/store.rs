//! SQLite persistence layer.
//!
//! One shared connection behind an async mutex, WAL mode. Every table the
//! settlement core owns is created here; conditional atomic updates are
//! expressed as `UPDATE … WHERE <selector>` statements whose affected-row
//! count tells the caller whether the selector matched.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Acquire the connection. Held across a whole ledger transaction so the
    /// conditional update, entry insert and reservation transition commit as
    /// one unit.
    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS wallet_balances (
            user_id       TEXT PRIMARY KEY,
            available_usd REAL NOT NULL DEFAULT 0,
            reserved_usd  REAL NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_entries (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id               TEXT NOT NULL,
            entry_type            TEXT NOT NULL,
            amount_usd            REAL NOT NULL,
            reference             TEXT NOT NULL DEFAULT '',
            metadata              TEXT,
            balance_available_usd REAL NOT NULL,
            balance_reserved_usd  REAL NOT NULL,
            created_at            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_user_created
            ON ledger_entries(user_id, created_at DESC);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_reference
            ON ledger_entries(reference) WHERE reference <> '';

        CREATE TABLE IF NOT EXISTS withdrawal_reservations (
            withdrawal_id TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            amount_usd    REAL NOT NULL,
            status        TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_withdrawal_res_user
            ON withdrawal_reservations(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS bet_reservations (
            session_id TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL,
            amount_usd REAL NOT NULL,
            status     TEXT NOT NULL,
            result     TEXT,
            trace_id   TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_bet_res_user ON bet_reservations(user_id);

        CREATE TABLE IF NOT EXISTS game_sessions (
            session_id   TEXT PRIMARY KEY,
            user_id      TEXT NOT NULL,
            game_type    TEXT NOT NULL,
            stake_usd    REAL NOT NULL,
            prediction   TEXT,
            trace_id     TEXT,
            status       TEXT NOT NULL,
            outcome      TEXT,
            payout_usd   REAL,
            contract_id  TEXT,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user_created
            ON game_sessions(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_sessions_status_created
            ON game_sessions(status, created_at);

        CREATE TABLE IF NOT EXISTS payment_intents (
            reference      TEXT PRIMARY KEY,
            user_id        TEXT NOT NULL,
            intent_type    TEXT NOT NULL,
            channel        TEXT,
            phone          TEXT,
            amount_usd     REAL NOT NULL,
            currency       TEXT NOT NULL,
            status         TEXT NOT NULL,
            provider_tx_id TEXT,
            error          TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            settled_at     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_intents_user_created
            ON payment_intents(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_intents_status_created
            ON payment_intents(status, created_at);

        CREATE TABLE IF NOT EXISTS withdrawal_requests (
            withdrawal_id TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            phone         TEXT NOT NULL,
            channel       TEXT NOT NULL,
            amount_usd    REAL NOT NULL,
            currency      TEXT NOT NULL,
            provider_ref  TEXT NOT NULL,
            transfer_code TEXT,
            status        TEXT NOT NULL,
            error         TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            settled_at    TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_withdrawal_req_provider_ref
            ON withdrawal_requests(provider_ref);
        CREATE INDEX IF NOT EXISTS idx_withdrawal_req_user_created
            ON withdrawal_requests(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_withdrawal_req_status_created
            ON withdrawal_requests(status, created_at);

        CREATE TABLE IF NOT EXISTS crypto_wallets (
            address          TEXT PRIMARY KEY,
            user_id          TEXT NOT NULL,
            coin             TEXT NOT NULL,
            network          TEXT NOT NULL,
            derivation_index INTEGER NOT NULL,
            subscription_id  TEXT,
            status           TEXT NOT NULL,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_crypto_wallets_user_coin
            ON crypto_wallets(user_id, coin);

        CREATE TABLE IF NOT EXISTS crypto_deposits (
            tx_hash       TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            coin          TEXT NOT NULL,
            address       TEXT NOT NULL,
            amount_crypto REAL NOT NULL DEFAULT 0,
            amount_usd    REAL NOT NULL DEFAULT 0,
            confirmations INTEGER NOT NULL DEFAULT 0,
            status        TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS crypto_counters (
            coin TEXT PRIMARY KEY,
            seq  INTEGER NOT NULL
        );",
    )
    .context("initialize schema")?;
    Ok(())
}
