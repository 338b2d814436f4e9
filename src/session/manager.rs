//! Session manager.
//!
//! Owns the game-session documents and the in-process per-user subscriber
//! registry. The reserve and the settle both commit to the same user balance
//! and are idempotent, so a lost order is recoverable: the stale sweeper
//! refunds any PENDING session that never produced an outcome.

use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::ledger::LedgerService;
use crate::models::{ws_message, Config, SessionOutcome, TradeOrder};
use crate::store::Store;

const DEFAULT_GAME_TYPE: &str = "RANGE_BREAKER";
const SUBSCRIBER_BUFFER: usize = 8;
const QUEUE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const LEDGER_DEADLINE: Duration = Duration::from_secs(5);
const SWEEP_TICK_BUDGET: Duration = Duration::from_secs(8);
const SWEEP_BATCH: i64 = 50;

#[derive(Debug, Error)]
pub enum BetError {
    #[error("stake must be greater than zero")]
    InvalidStake,
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceBetRequest {
    #[serde(rename = "gameType", default)]
    pub game_type: String,
    #[serde(rename = "stakeUsd")]
    pub stake_usd: f64,
    #[serde(default)]
    pub prediction: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "traceId", default)]
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BetAcknowledgement {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "stakeUsd")]
    pub stake_usd: f64,
    #[serde(rename = "newBalance")]
    pub new_balance: f64,
    #[serde(rename = "traceId")]
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameSessionRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "gameType")]
    pub game_type: String,
    #[serde(rename = "stakeUsd")]
    pub stake_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<serde_json::Value>,
    #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(rename = "payoutUsd", skip_serializing_if = "Option::is_none")]
    pub payout_usd: Option<f64>,
    #[serde(rename = "contractId", skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

type SubscriberMap = HashMap<String, HashMap<u64, mpsc::Sender<Vec<u8>>>>;

pub struct SessionManager {
    store: Store,
    bus: Bus,
    ledger: LedgerService,
    cfg: Arc<Config>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_subscriber_id: AtomicU64,
}

/// Removes a WebSocket subscriber from the registry on socket close.
pub struct SubscriberGuard {
    subscribers: Arc<RwLock<SubscriberMap>>,
    user_id: String,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let mut subs = self.subscribers.write();
        if let Some(user_subs) = subs.get_mut(&self.user_id) {
            user_subs.remove(&self.id);
            if user_subs.is_empty() {
                subs.remove(&self.user_id);
            }
        }
    }
}

impl SessionManager {
    pub fn new(store: Store, bus: Bus, ledger: LedgerService, cfg: Arc<Config>) -> Self {
        Self {
            store,
            bus,
            ledger,
            cfg,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Reserve the stake, persist the session and hand the order to the
    /// execution pool. If anything after the reservation fails the funds stay
    /// reserved and the sweeper refunds them.
    pub async fn place_bet(
        &self,
        user_id: &str,
        mut req: PlaceBetRequest,
    ) -> Result<BetAcknowledgement, BetError> {
        if req.stake_usd <= 0.0 {
            return Err(BetError::InvalidStake);
        }
        if req.trace_id.is_empty() {
            req.trace_id = Uuid::new_v4().to_string();
        }
        if req.game_type.is_empty() {
            req.game_type = DEFAULT_GAME_TYPE.to_string();
        }
        let session_id = Uuid::new_v4().simple().to_string();

        let bal = tokio::time::timeout(
            LEDGER_DEADLINE,
            self.ledger
                .reserve_bet(user_id, &session_id, req.stake_usd, &req.trace_id),
        )
        .await
        .map_err(|_| BetError::Rejected("wallet timeout".into()))?
        .map_err(|e| {
            warn!(trace = %req.trace_id, user = user_id, error = %e, "reserve bet failed");
            BetError::Rejected(e.to_string())
        })?;

        let now = Utc::now().to_rfc3339();
        {
            let conn = self.store.conn().await;
            conn.execute(
                "INSERT INTO game_sessions
                    (session_id, user_id, game_type, stake_usd, prediction, trace_id,
                     status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7, ?7)",
                params![
                    session_id,
                    user_id,
                    req.game_type,
                    req.stake_usd,
                    serde_json::Value::Object(req.prediction.clone()).to_string(),
                    req.trace_id,
                    now,
                ],
            )
            .map_err(|e| {
                warn!(trace = %req.trace_id, session = %session_id, error = %e, "session insert failed");
                BetError::Rejected("failed to record session".into())
            })?;
        }

        let order = TradeOrder {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            game_type: req.game_type.clone(),
            stake_usd: req.stake_usd,
            prediction: req.prediction,
            trace_id: req.trace_id.clone(),
            created_at: Utc::now().timestamp_millis(),
        };
        let payload = serde_json::to_string(&order)
            .map_err(|e| BetError::Rejected(format!("encode order: {e}")))?;
        self.bus.rpush(&self.cfg.order_queue, payload);
        self.bus.expire_queue(&self.cfg.order_queue, QUEUE_TTL);

        info!(
            trace = %req.trace_id,
            session = %session_id,
            user = user_id,
            game = %req.game_type,
            stake = req.stake_usd,
            "queued bet"
        );
        Ok(BetAcknowledgement {
            session_id,
            stake_usd: req.stake_usd,
            new_balance: bal.available_usd,
            trace_id: req.trace_id,
        })
    }

    /// Register a subscriber channel for a user's game events.
    pub fn subscribe(&self, user_id: &str) -> (mpsc::Receiver<Vec<u8>>, SubscriberGuard) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(user_id.to_string())
            .or_default()
            .insert(id, tx);
        (
            rx,
            SubscriberGuard {
                subscribers: self.subscribers.clone(),
                user_id: user_id.to_string(),
                id,
            },
        )
    }

    /// Serialize once and deliver to every subscriber without blocking: a
    /// slow client drops frames rather than stalling the rest. The client
    /// reconciles over REST on reconnect.
    pub fn broadcast(&self, user_id: &str, payload: &serde_json::Value) {
        let data = payload.to_string().into_bytes();
        let subs = self.subscribers.read();
        let Some(user_subs) = subs.get(user_id) else {
            return;
        };
        for tx in user_subs.values() {
            if tx.try_send(data.clone()).is_err() {
                debug!(user = user_id, "subscriber channel full, dropping frame");
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, user_id: &str) -> usize {
        self.subscribers
            .read()
            .get(user_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Long-lived task: consume settlement outcomes published by the
    /// execution pool, persist them and fan out to the user's sockets.
    pub async fn run_outcome_subscriber(&self, mut shutdown: watch::Receiver<bool>) {
        let pattern = format!("{}:*", self.cfg.outcome_prefix);
        let (mut rx, _guard) = self.bus.psubscribe(&pattern);
        info!(pattern = %pattern, "outcome subscriber started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let outcome: SessionOutcome = match serde_json::from_str(&msg.payload) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(topic = %msg.topic, error = %e, "unparseable outcome message");
                            continue;
                        }
                    };
                    info!(
                        trace = %outcome.trace_id,
                        session = %outcome.session_id,
                        user = %outcome.user_id,
                        result = %outcome.outcome,
                        payout = outcome.payout_usd,
                        "outcome received"
                    );
                    self.persist_outcome(&outcome).await;
                    self.broadcast(&outcome.user_id, &ws_message("GAME_RESULT", &outcome));
                }
            }
        }
        info!("outcome subscriber stopped");
    }

    async fn persist_outcome(&self, outcome: &SessionOutcome) {
        let conn = self.store.conn().await;
        let result = conn.execute(
            "UPDATE game_sessions
             SET status = ?1, outcome = ?1, payout_usd = ?2, contract_id = ?3,
                 completed_at = ?4, updated_at = ?4
             WHERE session_id = ?5",
            params![
                outcome.outcome,
                outcome.payout_usd,
                outcome.contract_id,
                Utc::now().to_rfc3339(),
                outcome.session_id,
            ],
        );
        if let Err(e) = result {
            warn!(session = %outcome.session_id, error = %e, "failed to persist outcome");
        }
    }

    /// Long-lived task: refund sessions stuck in PENDING past the refund
    /// window. Safe to run repeatedly because settle-game is idempotent.
    pub async fn run_stale_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.stale_sweep_sec.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            sweep_sec = self.cfg.stale_sweep_sec,
            refund_sec = self.cfg.stale_refund_sec,
            "stale sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if tokio::time::timeout(SWEEP_TICK_BUDGET, self.refund_stale_sessions())
                        .await
                        .is_err()
                    {
                        warn!("stale sweep tick exceeded its budget");
                    }
                }
            }
        }
        info!("stale sweeper stopped");
    }

    async fn refund_stale_sessions(&self) {
        if self.cfg.stale_refund_sec == 0 {
            return;
        }
        let cutoff = (Utc::now()
            - chrono::Duration::seconds(self.cfg.stale_refund_sec as i64))
        .to_rfc3339();

        let stale: Vec<(String, String, String, f64, String)> = {
            let conn = self.store.conn().await;
            let mut stmt = match conn.prepare(
                "SELECT session_id, user_id, game_type, stake_usd, COALESCE(trace_id, '')
                 FROM game_sessions
                 WHERE status = 'PENDING' AND created_at < ?1
                 LIMIT ?2",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    warn!(error = %e, "stale sweep query failed");
                    return;
                }
            };
            stmt.query_map(params![cutoff, SWEEP_BATCH], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .and_then(|rows| rows.collect())
            .unwrap_or_default()
        };

        for (session_id, user_id, game_type, stake_usd, trace_id) in stale {
            if stake_usd <= 0.0 {
                continue;
            }
            info!(trace = %trace_id, session = %session_id, "stale session detected, issuing refund");

            let settled = tokio::time::timeout(
                LEDGER_DEADLINE,
                self.ledger
                    .settle_game(&user_id, &session_id, "REFUND", stake_usd, stake_usd, &trace_id),
            )
            .await;
            let bal = match settled {
                Ok(Ok(bal)) => bal,
                Ok(Err(e)) => {
                    warn!(trace = %trace_id, session = %session_id, error = %e, "refund settle failed");
                    continue;
                }
                Err(_) => {
                    warn!(trace = %trace_id, session = %session_id, "refund settle timed out");
                    continue;
                }
            };

            let outcome = SessionOutcome {
                session_id: session_id.clone(),
                user_id: user_id.clone(),
                game_type,
                outcome: "REFUND".to_string(),
                payout_usd: stake_usd,
                stake_usd,
                new_balance: bal.available_usd,
                trace_id,
                contract_id: "REFUND".to_string(),
            };
            self.persist_outcome(&outcome).await;
            self.broadcast(&user_id, &ws_message("GAME_RESULT", &outcome));
        }
    }

    /// Paged session history, newest first.
    pub async fn list_history(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<GameSessionRecord>> {
        let conn = self.store.conn().await;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, game_type, stake_usd, prediction, trace_id,
                    status, outcome, payout_usd, contract_id, created_at, completed_at
             FROM game_sessions
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let sessions = stmt
            .query_map(params![user_id, limit, offset], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Option<GameSessionRecord>> {
        let conn = self.store.conn().await;
        let session = conn
            .query_row(
                "SELECT session_id, user_id, game_type, stake_usd, prediction, trace_id,
                        status, outcome, payout_usd, contract_id, created_at, completed_at
                 FROM game_sessions
                 WHERE session_id = ?1 AND user_id = ?2",
                params![session_id, user_id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<GameSessionRecord, rusqlite::Error> {
    let prediction: Option<String> = row.get(4)?;
    Ok(GameSessionRecord {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        game_type: row.get(2)?,
        stake_usd: row.get(3)?,
        prediction: prediction.and_then(|p| serde_json::from_str(&p).ok()),
        trace_id: row.get(5)?,
        status: row.get(6)?,
        outcome: row.get(7)?,
        payout_usd: row.get(8)?,
        contract_id: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}
