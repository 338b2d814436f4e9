//! Ledger operations.
//!
//! Every operation runs inside a single SQLite transaction: the conditional
//! balance update, the entry insert and the reservation-document transition
//! either all commit or none do. A conditional update that matches no row
//! aborts the transaction with the corresponding typed error — there are no
//! compensating writes.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::models::Balance;
use crate::store::Store;

const LEADERBOARD_KEY: &str = "leaderboard:global";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("insufficient balance")]
    InsufficientFunds,
    #[error("reservation not found")]
    ReservationNotFound,
    #[error("ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// One row of the append-only entry log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(rename = "amountUsd")]
    pub amount_usd: f64,
    #[serde(rename = "reference", skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(rename = "balanceAvailableUsd")]
    pub balance_available_usd: f64,
    #[serde(rename = "balanceReservedUsd")]
    pub balance_reserved_usd: f64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Ledger-owned reservation backing one payout attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalReservation {
    #[serde(rename = "withdrawalId")]
    pub withdrawal_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "amountUsd")]
    pub amount_usd: f64,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LedgerService {
    store: Store,
    bus: Bus,
}

impl LedgerService {
    pub fn new(store: Store, bus: Bus) -> Self {
        Self { store, bus }
    }

    /// Credit an external deposit. Idempotent by `reference`: a repeated
    /// reference returns the current balance unchanged.
    pub async fn credit_deposit(
        &self,
        user_id: &str,
        amount_usd: f64,
        reference: &str,
        source: &str,
    ) -> Result<Balance, LedgerError> {
        if amount_usd <= 0.0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut conn = self.store.conn().await;
        let tx = conn.transaction()?;

        if !reference.is_empty() && reference_exists(&tx, reference)? {
            let bal = fetch_balance(&tx, user_id)?;
            tx.commit()?;
            debug!(user = user_id, reference, "duplicate deposit reference, no-op");
            return Ok(bal);
        }

        let bal = increment_available(&tx, user_id, amount_usd)?;
        insert_entry(
            &tx,
            user_id,
            "DEPOSIT_CONFIRMED",
            amount_usd,
            reference,
            Some(serde_json::json!({ "source": source })),
            &bal,
        )?;
        tx.commit()?;
        Ok(bal)
    }

    /// Move funds from available to reserved for a payout attempt.
    /// Idempotent by `withdrawal_id`.
    pub async fn reserve_withdrawal(
        &self,
        user_id: &str,
        withdrawal_id: &str,
        amount_usd: f64,
    ) -> Result<Balance, LedgerError> {
        if amount_usd <= 0.0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut conn = self.store.conn().await;
        let tx = conn.transaction()?;

        if find_withdrawal(&tx, withdrawal_id)?.is_some() {
            let bal = fetch_balance(&tx, user_id)?;
            tx.commit()?;
            return Ok(bal);
        }

        let bal = move_available_to_reserved(&tx, user_id, amount_usd)?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO withdrawal_reservations
                (withdrawal_id, user_id, amount_usd, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'HELD', ?4, ?4)",
            params![withdrawal_id, user_id, amount_usd, now],
        )?;
        insert_entry(
            &tx,
            user_id,
            "WITHDRAWAL_RESERVED",
            -amount_usd,
            &format!("{withdrawal_id}:reserve"),
            None,
            &bal,
        )?;
        tx.commit()?;
        Ok(bal)
    }

    /// Resolve a held withdrawal. `success` burns the reserved funds (they
    /// left the system); failure returns them to available. Repeated calls
    /// against a terminal reservation return the current balance.
    pub async fn release_withdrawal(
        &self,
        user_id: &str,
        withdrawal_id: &str,
        success: bool,
    ) -> Result<Balance, LedgerError> {
        let mut conn = self.store.conn().await;
        let tx = conn.transaction()?;

        let Some(reservation) = find_withdrawal(&tx, withdrawal_id)? else {
            return Err(LedgerError::ReservationNotFound);
        };
        if reservation.status != "HELD" {
            let bal = fetch_balance(&tx, user_id)?;
            tx.commit()?;
            return Ok(bal);
        }

        let amount = reservation.amount_usd;
        let (bal, entry_type, entry_amount, status) = if success {
            let bal = burn_reserved(&tx, user_id, amount)?;
            (bal, "WITHDRAWAL_CONFIRMED", -amount, "COMPLETED")
        } else {
            let bal = move_reserved_to_available(&tx, user_id, amount)?;
            (bal, "WITHDRAWAL_RELEASED", amount, "FAILED")
        };

        tx.execute(
            "UPDATE withdrawal_reservations SET status = ?1, updated_at = ?2
             WHERE withdrawal_id = ?3",
            params![status, Utc::now().to_rfc3339(), withdrawal_id],
        )?;
        insert_entry(
            &tx,
            user_id,
            entry_type,
            entry_amount,
            &format!("{withdrawal_id}:release"),
            None,
            &bal,
        )?;
        tx.commit()?;
        Ok(bal)
    }

    /// Reserve a bet stake for a session. Idempotent by `session_id`.
    pub async fn reserve_bet(
        &self,
        user_id: &str,
        session_id: &str,
        amount_usd: f64,
        trace_id: &str,
    ) -> Result<Balance, LedgerError> {
        if amount_usd <= 0.0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut conn = self.store.conn().await;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM bet_reservations WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            let bal = fetch_balance(&tx, user_id)?;
            tx.commit()?;
            return Ok(bal);
        }

        let bal = move_available_to_reserved(&tx, user_id, amount_usd)?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO bet_reservations
                (session_id, user_id, amount_usd, status, trace_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'HELD', ?4, ?5, ?5)",
            params![session_id, user_id, amount_usd, trace_id, now],
        )?;
        insert_entry(
            &tx,
            user_id,
            "BET_RESERVED",
            -amount_usd,
            &format!("{session_id}:reserve"),
            trace_metadata(None, trace_id),
            &bal,
        )?;
        tx.commit()?;
        Ok(bal)
    }

    /// Settle a session. The stake recorded at reserve time is authoritative.
    /// Idempotent: a SETTLED bet returns the current balance unchanged.
    pub async fn settle_game(
        &self,
        user_id: &str,
        session_id: &str,
        outcome: &str,
        stake_usd: f64,
        payout_usd: f64,
        trace_id: &str,
    ) -> Result<Balance, LedgerError> {
        let outcome = outcome.to_uppercase();
        let mut leaderboard_delta = 0.0;

        let bal = {
            let mut conn = self.store.conn().await;
            let tx = conn.transaction()?;

            let bet: Option<(String, f64)> = tx
                .query_row(
                    "SELECT status, amount_usd FROM bet_reservations WHERE session_id = ?1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((status, reserved_amount)) = bet else {
                return Err(LedgerError::ReservationNotFound);
            };
            if status == "SETTLED" {
                let bal = fetch_balance(&tx, user_id)?;
                tx.commit()?;
                return Ok(bal);
            }

            let stake = if reserved_amount > 0.0 {
                reserved_amount
            } else {
                stake_usd
            };
            if stake <= 0.0 {
                return Err(LedgerError::ReservationNotFound);
            }

            let mut bal = match outcome.as_str() {
                "REFUND" => move_reserved_to_available(&tx, user_id, stake)?,
                _ => burn_reserved(&tx, user_id, stake)?,
            };
            if outcome == "WIN" && payout_usd > 0.0 {
                bal = increment_available(&tx, user_id, payout_usd)?;
                if payout_usd - stake > 0.0 {
                    leaderboard_delta = payout_usd - stake;
                }
            }

            tx.execute(
                "UPDATE bet_reservations
                 SET status = 'SETTLED', result = ?1, updated_at = ?2
                 WHERE session_id = ?3",
                params![outcome, Utc::now().to_rfc3339(), session_id],
            )?;
            insert_entry(
                &tx,
                user_id,
                "GAME_RESULT",
                payout_usd - stake,
                &format!("{session_id}:settle"),
                trace_metadata(
                    Some(serde_json::json!({
                        "outcome": outcome,
                        "stakeUsd": stake,
                        "payoutUsd": payout_usd,
                    })),
                    trace_id,
                ),
                &bal,
            )?;
            tx.commit()?;
            bal
        };

        // Leaderboard score is a side effect, applied only after the commit
        // and never allowed to fail the settlement.
        if leaderboard_delta > 0.0 {
            self.bus.zincr_by(LEADERBOARD_KEY, user_id, leaderboard_delta);
        }
        Ok(bal)
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        let conn = self.store.conn().await;
        Ok(read_balance(&conn, user_id)?)
    }

    /// Ledger entries for a user, newest first.
    pub async fn list_ledger(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.store.conn().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, entry_type, amount_usd, reference, metadata,
                    balance_available_usd, balance_reserved_usd, created_at
             FROM ledger_entries
             WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let entries = stmt
            .query_map(params![user_id, limit, offset], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub async fn list_withdrawals(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<WithdrawalReservation>, LedgerError> {
        let conn = self.store.conn().await;
        let mut stmt = conn.prepare(
            "SELECT withdrawal_id, user_id, amount_usd, status, created_at, updated_at
             FROM withdrawal_reservations
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![user_id, limit], |row| {
                Ok(WithdrawalReservation {
                    withdrawal_id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount_usd: row.get(2)?,
                    status: row.get(3)?,
                    created_at: parse_ts(row.get::<_, String>(4)?),
                    updated_at: parse_ts(row.get::<_, String>(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

// --- transaction-scoped helpers ---------------------------------------------

fn reference_exists(tx: &Transaction<'_>, reference: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM ledger_entries WHERE reference = ?1",
        params![reference],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn fetch_balance(tx: &Transaction<'_>, user_id: &str) -> Result<Balance, rusqlite::Error> {
    read_balance(tx, user_id)
}

fn read_balance(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Balance, rusqlite::Error> {
    let row = conn
        .query_row(
            "SELECT available_usd, reserved_usd, updated_at
             FROM wallet_balances WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(match row {
        Some((available_usd, reserved_usd, updated_at)) => Balance {
            user_id: user_id.to_string(),
            available_usd,
            reserved_usd,
            updated_at: parse_ts(updated_at),
        },
        // Balances are created lazily on first credit or reservation.
        None => Balance {
            user_id: user_id.to_string(),
            available_usd: 0.0,
            reserved_usd: 0.0,
            updated_at: Utc::now(),
        },
    })
}

fn increment_available(
    tx: &Transaction<'_>,
    user_id: &str,
    amount: f64,
) -> Result<Balance, rusqlite::Error> {
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO wallet_balances (user_id, available_usd, reserved_usd, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
            available_usd = available_usd + excluded.available_usd,
            updated_at = excluded.updated_at",
        params![user_id, amount, now],
    )?;
    fetch_balance(tx, user_id)
}

fn move_available_to_reserved(
    tx: &Transaction<'_>,
    user_id: &str,
    amount: f64,
) -> Result<Balance, LedgerError> {
    let changed = tx.execute(
        "UPDATE wallet_balances
         SET available_usd = available_usd - ?1,
             reserved_usd = reserved_usd + ?1,
             updated_at = ?2
         WHERE user_id = ?3 AND available_usd >= ?1",
        params![amount, Utc::now().to_rfc3339(), user_id],
    )?;
    if changed == 0 {
        return Err(LedgerError::InsufficientFunds);
    }
    Ok(fetch_balance(tx, user_id)?)
}

fn move_reserved_to_available(
    tx: &Transaction<'_>,
    user_id: &str,
    amount: f64,
) -> Result<Balance, LedgerError> {
    let changed = tx.execute(
        "UPDATE wallet_balances
         SET available_usd = available_usd + ?1,
             reserved_usd = reserved_usd - ?1,
             updated_at = ?2
         WHERE user_id = ?3 AND reserved_usd >= ?1",
        params![amount, Utc::now().to_rfc3339(), user_id],
    )?;
    if changed == 0 {
        warn!(user = user_id, amount, "reserved shortfall on release");
        return Err(LedgerError::ReservationNotFound);
    }
    Ok(fetch_balance(tx, user_id)?)
}

fn burn_reserved(
    tx: &Transaction<'_>,
    user_id: &str,
    amount: f64,
) -> Result<Balance, LedgerError> {
    let changed = tx.execute(
        "UPDATE wallet_balances
         SET reserved_usd = reserved_usd - ?1,
             updated_at = ?2
         WHERE user_id = ?3 AND reserved_usd >= ?1",
        params![amount, Utc::now().to_rfc3339(), user_id],
    )?;
    if changed == 0 {
        warn!(user = user_id, amount, "reserved shortfall on burn");
        return Err(LedgerError::ReservationNotFound);
    }
    Ok(fetch_balance(tx, user_id)?)
}

#[allow(clippy::too_many_arguments)]
fn insert_entry(
    tx: &Transaction<'_>,
    user_id: &str,
    entry_type: &str,
    amount_usd: f64,
    reference: &str,
    metadata: Option<serde_json::Value>,
    balance: &Balance,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT INTO ledger_entries
            (user_id, entry_type, amount_usd, reference, metadata,
             balance_available_usd, balance_reserved_usd, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            entry_type,
            amount_usd,
            reference,
            metadata.map(|m| m.to_string()),
            balance.available_usd,
            balance.reserved_usd,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn find_withdrawal(
    tx: &Transaction<'_>,
    withdrawal_id: &str,
) -> Result<Option<WithdrawalReservation>, rusqlite::Error> {
    tx.query_row(
        "SELECT withdrawal_id, user_id, amount_usd, status, created_at, updated_at
         FROM withdrawal_reservations WHERE withdrawal_id = ?1",
        params![withdrawal_id],
        |row| {
            Ok(WithdrawalReservation {
                withdrawal_id: row.get(0)?,
                user_id: row.get(1)?,
                amount_usd: row.get(2)?,
                status: row.get(3)?,
                created_at: parse_ts(row.get::<_, String>(4)?),
                updated_at: parse_ts(row.get::<_, String>(5)?),
            })
        },
    )
    .optional()
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<LedgerEntry, rusqlite::Error> {
    let metadata: Option<String> = row.get(5)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        entry_type: row.get(2)?,
        amount_usd: row.get(3)?,
        reference: row.get(4)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        balance_available_usd: row.get(6)?,
        balance_reserved_usd: row.get(7)?,
        created_at: parse_ts(row.get::<_, String>(8)?),
    })
}

fn trace_metadata(base: Option<serde_json::Value>, trace_id: &str) -> Option<serde_json::Value> {
    let mut map = match base {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    if !trace_id.is_empty() {
        map.insert("traceId".into(), serde_json::Value::String(trace_id.into()));
    }
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn test_ledger() -> (LedgerService, Bus, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        let bus = Bus::new();
        (LedgerService::new(store, bus.clone()), bus, temp)
    }

    #[tokio::test]
    async fn test_credit_creates_balance_lazily() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        let bal = ledger
            .credit_deposit("u1", 100.0, "DEP-1", "MOMO_DEPOSIT")
            .await
            .unwrap();
        assert_eq!(bal.available_usd, 100.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_credit_rejects_non_positive_amount() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        assert!(matches!(
            ledger.credit_deposit("u1", 0.0, "DEP-1", "X").await,
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            ledger.credit_deposit("u1", -5.0, "DEP-2", "X").await,
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[tokio::test]
    async fn test_credit_idempotent_by_reference() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger
            .credit_deposit("u1", 25.0, "R1", "MOMO_DEPOSIT")
            .await
            .unwrap();
        let bal = ledger
            .credit_deposit("u1", 25.0, "R1", "MOMO_DEPOSIT")
            .await
            .unwrap();
        assert_eq!(bal.available_usd, 25.0);

        let entries = ledger.list_ledger("u1", 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, "DEPOSIT_CONFIRMED");
    }

    #[tokio::test]
    async fn test_reserve_bet_boundary() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();

        // Reserving the exact available amount succeeds.
        let bal = ledger.reserve_bet("u1", "s1", 50.0, "t1").await.unwrap();
        assert_eq!(bal.available_usd, 0.0);
        assert_eq!(bal.reserved_usd, 50.0);

        // Anything beyond the (now zero) available misses the selector.
        assert!(matches!(
            ledger.reserve_bet("u1", "s2", 0.01, "t2").await,
            Err(LedgerError::InsufficientFunds)
        ));
    }

    #[tokio::test]
    async fn test_reserve_bet_idempotent_by_session() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();

        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();
        let bal = ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();
        assert_eq!(bal.available_usd, 90.0);
        assert_eq!(bal.reserved_usd, 10.0);
    }

    #[tokio::test]
    async fn test_refund_round_trip_restores_balance() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();

        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();
        let bal = ledger
            .settle_game("u1", "s1", "REFUND", 10.0, 10.0, "t1")
            .await
            .unwrap();
        assert_eq!(bal.available_usd, 100.0);
        assert_eq!(bal.reserved_usd, 0.0);

        let entries = ledger.list_ledger("u1", 10, 0).await.unwrap();
        let types: Vec<_> = entries.iter().map(|e| e.entry_type.as_str()).collect();
        assert!(types.contains(&"BET_RESERVED"));
        assert!(types.contains(&"GAME_RESULT"));
        let result = entries
            .iter()
            .find(|e| e.entry_type == "GAME_RESULT")
            .unwrap();
        assert_eq!(result.amount_usd, 0.0);
    }

    #[tokio::test]
    async fn test_loss_burns_stake() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();

        let bal = ledger
            .settle_game("u1", "s1", "LOSS", 10.0, 0.0, "t1")
            .await
            .unwrap();
        assert_eq!(bal.available_usd, 90.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_win_credits_payout_and_leaderboard() {
        let (ledger, bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();

        // payout includes the returned stake: 10 × 1.9
        let bal = ledger
            .settle_game("u1", "s1", "WIN", 10.0, 19.0, "t1")
            .await
            .unwrap();
        assert_eq!(bal.available_usd, 109.0);
        assert_eq!(bal.reserved_usd, 0.0);
        assert_eq!(bus.zscore("leaderboard:global", "u1"), Some(9.0));

        let entries = ledger.list_ledger("u1", 10, 0).await.unwrap();
        let result = entries
            .iter()
            .find(|e| e.entry_type == "GAME_RESULT")
            .unwrap();
        assert_eq!(result.amount_usd, 9.0);
    }

    #[tokio::test]
    async fn test_settle_idempotent() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();
        ledger
            .settle_game("u1", "s1", "WIN", 10.0, 19.0, "t1")
            .await
            .unwrap();

        // Repeated settles, even with different arguments, change nothing.
        let bal = ledger
            .settle_game("u1", "s1", "LOSS", 10.0, 0.0, "t1")
            .await
            .unwrap();
        assert_eq!(bal.available_usd, 109.0);
        let entries = ledger.list_ledger("u1", 10, 0).await.unwrap();
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.entry_type == "GAME_RESULT")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_settle_uses_reserved_stake_not_caller_stake() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();

        // Caller lies about the stake; the reserve-time amount wins.
        let bal = ledger
            .settle_game("u1", "s1", "REFUND", 999.0, 999.0, "t1")
            .await
            .unwrap();
        assert_eq!(bal.available_usd, 100.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_settle_unknown_session() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        assert!(matches!(
            ledger.settle_game("u1", "missing", "WIN", 1.0, 2.0, "").await,
            Err(LedgerError::ReservationNotFound)
        ));
    }

    #[tokio::test]
    async fn test_withdrawal_failed_release_restores() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();

        let bal = ledger.reserve_withdrawal("u1", "w1", 20.0).await.unwrap();
        assert_eq!(bal.available_usd, 30.0);
        assert_eq!(bal.reserved_usd, 20.0);

        let bal = ledger.release_withdrawal("u1", "w1", false).await.unwrap();
        assert_eq!(bal.available_usd, 50.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_withdrawal_success_burns() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        ledger.reserve_withdrawal("u1", "w1", 20.0).await.unwrap();

        let bal = ledger.release_withdrawal("u1", "w1", true).await.unwrap();
        assert_eq!(bal.available_usd, 30.0);
        assert_eq!(bal.reserved_usd, 0.0);

        let entries = ledger.list_ledger("u1", 10, 0).await.unwrap();
        let types: Vec<_> = entries.iter().map(|e| e.entry_type.as_str()).collect();
        assert!(types.contains(&"WITHDRAWAL_RESERVED"));
        assert!(types.contains(&"WITHDRAWAL_CONFIRMED"));
    }

    #[tokio::test]
    async fn test_withdrawal_release_terminal_is_noop() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        ledger.reserve_withdrawal("u1", "w1", 20.0).await.unwrap();
        ledger.release_withdrawal("u1", "w1", true).await.unwrap();

        // Second release with the opposite verdict must not move funds.
        let bal = ledger.release_withdrawal("u1", "w1", false).await.unwrap();
        assert_eq!(bal.available_usd, 30.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_release_unknown_withdrawal() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        assert!(matches!(
            ledger.release_withdrawal("u1", "missing", true).await,
            Err(LedgerError::ReservationNotFound)
        ));
    }

    #[tokio::test]
    async fn test_insufficient_funds_on_withdrawal() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 10.0, "D1", "X").await.unwrap();
        assert!(matches!(
            ledger.reserve_withdrawal("u1", "w1", 10.01).await,
            Err(LedgerError::InsufficientFunds)
        ));
    }

    #[tokio::test]
    async fn test_conservation_across_mixed_operations() {
        let (ledger, _bus, _tmp) = test_ledger().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        ledger.credit_deposit("u2", 40.0, "D2", "X").await.unwrap();

        ledger.reserve_bet("u1", "s1", 10.0, "").await.unwrap();
        ledger
            .settle_game("u1", "s1", "WIN", 10.0, 19.0, "")
            .await
            .unwrap();

        ledger.reserve_withdrawal("u2", "w1", 15.0).await.unwrap();
        ledger.release_withdrawal("u2", "w1", true).await.unwrap();

        let b1 = ledger.get_balance("u1").await.unwrap();
        let b2 = ledger.get_balance("u2").await.unwrap();
        let total = b1.available_usd + b1.reserved_usd + b2.available_usd + b2.reserved_usd;

        // deposits − confirmed withdrawals + game results
        let expected = (100.0 + 40.0) - 15.0 + (19.0 - 10.0);
        assert!((total - expected).abs() < 1e-9);
    }
}
