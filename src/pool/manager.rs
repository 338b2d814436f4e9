//! Order consumption and settlement.
//!
//! A blocking pop on the order queue drives the pool; each dequeued order is
//! handled on its own task. Three paths produce a settlement — the upstream
//! venue, the simulator, and the bounce gate — and all of them converge on
//! the same finalize step: rake, ledger settle, outcome publish.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::ledger::LedgerService;
use crate::models::{Config, TradeOrder};
use crate::pool::bounce::BounceTracker;
use crate::pool::upstream::UpstreamAccount;

const ORDER_TIMEOUT: Duration = Duration::from_secs(120);
const SETTLE_DEADLINE: Duration = Duration::from_secs(10);
const SIMULATED_WIN_PCT: u32 = 45;

/// Settlement produced by any of the three execution paths.
#[derive(Debug, Clone)]
pub struct TradeSettlement {
    pub outcome: String,
    pub payout_usd: f64,
    pub contract_id: String,
}

pub struct PoolManager {
    bus: Bus,
    ledger: LedgerService,
    cfg: Arc<Config>,
    accounts: Vec<Arc<UpstreamAccount>>,
    simulate: bool,
    bounce: BounceTracker,
}

impl PoolManager {
    pub fn new(bus: Bus, ledger: LedgerService, cfg: Arc<Config>) -> Arc<Self> {
        let mut accounts = Vec::new();
        let mut simulate = false;

        if cfg.upstream_tokens.is_empty() || cfg.upstream_app_id.is_empty() {
            warn!("upstream credentials missing, execution pool running in simulation mode");
            simulate = true;
        } else {
            for (idx, token) in cfg.upstream_tokens.iter().enumerate() {
                accounts.push(UpstreamAccount::new(
                    format!("acct-{}", idx + 1),
                    token.clone(),
                ));
            }
        }
        if cfg.bounce_rate > 0.0 {
            info!(
                rate = cfg.bounce_rate,
                profit_target = cfg.profit_target_usd,
                "bounce gate active"
            );
        }

        Arc::new(Self {
            bus,
            ledger,
            bounce: BounceTracker::new(cfg.bounce_rate, cfg.profit_target_usd),
            accounts,
            simulate,
            cfg,
        })
    }

    /// Long-lived consumer loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.cfg.order_queue, "execution pool consuming orders");
        loop {
            let raw = tokio::select! {
                _ = shutdown.changed() => break,
                raw = self.bus.blocking_pop(&self.cfg.order_queue) => raw,
            };
            let order: TradeOrder = match serde_json::from_str(&raw) {
                Ok(order) => order,
                Err(e) => {
                    warn!(error = %e, "invalid order payload");
                    continue;
                }
            };
            let pool = self.clone();
            tokio::spawn(async move { pool.process_order(order).await });
        }
        info!("execution pool stopped");
    }

    async fn process_order(&self, mut order: TradeOrder) {
        if order.trace_id.is_empty() {
            order.trace_id = uuid::Uuid::new_v4().to_string();
        }

        // Bounce gate: intercept before the venue ever sees the order.
        if self.bounce.should_bounce() {
            info!(trace = %order.trace_id, stake = order.stake_usd, "order bounced");
            self.bounced_settle(&order).await;
            return;
        }

        if self.simulate {
            self.simulate_order(&order).await;
            return;
        }

        let Some(account) = self.select_account() else {
            warn!(trace = %order.trace_id, "no upstream account available, refunding");
            self.refund_order(&order, "no upstream accounts").await;
            return;
        };

        match tokio::time::timeout(ORDER_TIMEOUT, account.execute(&order, &self.cfg)).await {
            Ok(Ok(settlement)) => self.finalize(&order, settlement).await,
            Ok(Err(e)) => {
                warn!(trace = %order.trace_id, account = %account.id, error = %e, "venue execution failed");
                self.refund_order(&order, &e.to_string()).await;
            }
            Err(_) => {
                warn!(trace = %order.trace_id, account = %account.id, "venue settlement timeout");
                self.refund_order(&order, "settlement timeout").await;
            }
        }
    }

    /// Least-loaded account by in-flight count.
    fn select_account(&self) -> Option<Arc<UpstreamAccount>> {
        self.accounts
            .iter()
            .min_by_key(|account| account.in_flight())
            .cloned()
    }

    async fn simulate_order(&self, order: &TradeOrder) {
        tokio::time::sleep(self.random_delay()).await;

        let win = rand::thread_rng().gen_range(0..100) < SIMULATED_WIN_PCT;
        let settlement = if win {
            TradeSettlement {
                outcome: "WIN".into(),
                payout_usd: order.stake_usd * self.cfg.payout_multiplier,
                contract_id: "SIMULATED".into(),
            }
        } else {
            TradeSettlement {
                outcome: "LOSS".into(),
                payout_usd: 0.0,
                contract_id: "SIMULATED".into(),
            }
        };
        self.finalize(order, settlement).await;
    }

    /// Settle a bounced order as a forced LOSS after a realistic delay. The
    /// stake goes to the house accumulator; the user-visible flow is
    /// indistinguishable from a losing trade.
    async fn bounced_settle(&self, order: &TradeOrder) {
        tokio::time::sleep(self.random_delay()).await;
        self.bounce.record_bounce(order.stake_usd);
        self.finalize(
            order,
            TradeSettlement {
                outcome: "LOSS".into(),
                payout_usd: 0.0,
                contract_id: "BOUNCED".into(),
            },
        )
        .await;
    }

    async fn refund_order(&self, order: &TradeOrder, cause: &str) {
        info!(trace = %order.trace_id, session = %order.session_id, cause, "refunding order");
        self.finalize(
            order,
            TradeSettlement {
                outcome: "REFUND".into(),
                payout_usd: order.stake_usd,
                contract_id: "REFUND".into(),
            },
        )
        .await;
    }

    /// Shared tail of every execution path: apply the win rake, settle with
    /// the ledger, publish the outcome. A settle failure is logged and left
    /// to the stale sweeper, which will refund the session.
    async fn finalize(&self, order: &TradeOrder, mut settlement: TradeSettlement) {
        if settlement.outcome == "WIN" && self.cfg.win_rake_rate > 0.0 {
            let profit = settlement.payout_usd - order.stake_usd;
            if profit > 0.0 {
                let rake = profit * self.cfg.win_rake_rate;
                settlement.payout_usd -= rake;
                info!(
                    trace = %order.trace_id,
                    gross = settlement.payout_usd + rake,
                    rake,
                    net = settlement.payout_usd,
                    "win rake applied"
                );
            }
        }

        let settled = tokio::time::timeout(
            SETTLE_DEADLINE,
            self.ledger.settle_game(
                &order.user_id,
                &order.session_id,
                &settlement.outcome,
                order.stake_usd,
                settlement.payout_usd,
                &order.trace_id,
            ),
        )
        .await;
        let balance = match settled {
            Ok(Ok(bal)) => bal.available_usd,
            Ok(Err(e)) => {
                error!(trace = %order.trace_id, session = %order.session_id, error = %e, "ledger settle failed");
                return;
            }
            Err(_) => {
                error!(trace = %order.trace_id, session = %order.session_id, "ledger settle timed out");
                return;
            }
        };

        let win_amount = if settlement.outcome == "WIN" {
            (settlement.payout_usd - order.stake_usd).max(0.0)
        } else {
            0.0
        };
        let payload = serde_json::json!({
            "sessionId": order.session_id,
            "userId": order.user_id,
            "gameType": order.game_type,
            "stakeUsd": order.stake_usd,
            "payoutUsd": settlement.payout_usd,
            "winAmountUsd": win_amount,
            "outcome": settlement.outcome,
            "newBalance": balance,
            "traceId": order.trace_id,
            "contractId": settlement.contract_id,
        });
        let topic = format!("{}:{}", self.cfg.outcome_prefix, order.session_id);
        self.bus.publish(&topic, payload.to_string());
    }

    fn random_delay(&self) -> Duration {
        let min = self.cfg.min_settle_ms;
        let mut max = self.cfg.max_settle_ms;
        if max <= min {
            max = min + 1000;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionOutcome;
    use crate::store::Store;
    use tempfile::NamedTempFile;

    fn pool_config(bounce_rate: f64, win_rake_rate: f64) -> Arc<Config> {
        let mut cfg = Config::from_env();
        cfg.order_queue = "trade:orders".into();
        cfg.outcome_prefix = "game:outcome".into();
        cfg.min_settle_ms = 0;
        cfg.max_settle_ms = 1;
        cfg.payout_multiplier = 1.9;
        cfg.bounce_rate = bounce_rate;
        cfg.profit_target_usd = 0.0;
        cfg.win_rake_rate = win_rake_rate;
        cfg.upstream_tokens = Vec::new();
        cfg.upstream_app_id = String::new();
        Arc::new(cfg)
    }

    async fn pool_fixture(
        bounce_rate: f64,
        win_rake_rate: f64,
    ) -> (Arc<PoolManager>, LedgerService, Bus, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        let bus = Bus::new();
        let ledger = LedgerService::new(store, bus.clone());
        let pool = PoolManager::new(bus.clone(), ledger.clone(), pool_config(bounce_rate, win_rake_rate));
        (pool, ledger, bus, temp)
    }

    fn order(session_id: &str, stake: f64) -> TradeOrder {
        TradeOrder {
            session_id: session_id.into(),
            user_id: "u1".into(),
            game_type: "RANGE_BREAKER".into(),
            stake_usd: stake,
            prediction: serde_json::Map::new(),
            trace_id: "t1".into(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_finalize_settles_and_publishes() {
        let (pool, ledger, bus, _tmp) = pool_fixture(0.0, 0.0).await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();

        let (mut rx, _guard) = bus.psubscribe("game:outcome:*");
        pool.finalize(
            &order("s1", 10.0),
            TradeSettlement {
                outcome: "WIN".into(),
                payout_usd: 19.0,
                contract_id: "c-1".into(),
            },
        )
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "game:outcome:s1");
        let outcome: SessionOutcome = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(outcome.outcome, "WIN");
        assert_eq!(outcome.payout_usd, 19.0);
        assert_eq!(outcome.new_balance, 109.0);
        assert_eq!(outcome.contract_id, "c-1");

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 109.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_finalize_applies_win_rake() {
        let (pool, ledger, bus, _tmp) = pool_fixture(0.0, 0.10).await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 10.0, "t1").await.unwrap();

        let (mut rx, _guard) = bus.psubscribe("game:outcome:*");
        pool.finalize(
            &order("s1", 10.0),
            TradeSettlement {
                outcome: "WIN".into(),
                payout_usd: 19.0,
                contract_id: "c-1".into(),
            },
        )
        .await;

        // 10% of the 9.0 net profit goes to the house.
        let msg = rx.recv().await.unwrap();
        let outcome: SessionOutcome = serde_json::from_str(&msg.payload).unwrap();
        assert!((outcome.payout_usd - 18.1).abs() < 1e-9);

        let bal = ledger.get_balance("u1").await.unwrap();
        assert!((bal.available_usd - 108.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_bounced_order_settles_as_loss() {
        let (pool, ledger, bus, _tmp) = pool_fixture(1.0, 0.0).await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 5.0, "t1").await.unwrap();

        let (mut rx, _guard) = bus.psubscribe("game:outcome:*");
        pool.process_order(order("s1", 5.0)).await;

        let msg = rx.recv().await.unwrap();
        let outcome: SessionOutcome = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(outcome.outcome, "LOSS");
        assert_eq!(outcome.payout_usd, 0.0);
        assert_eq!(outcome.contract_id, "BOUNCED");

        let (house_profit, _) = pool.bounce.stats();
        assert_eq!(house_profit, 5.0);

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 45.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_simulation_produces_terminal_outcome() {
        let (pool, ledger, bus, _tmp) = pool_fixture(0.0, 0.0).await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 5.0, "t1").await.unwrap();

        let (mut rx, _guard) = bus.psubscribe("game:outcome:*");
        pool.process_order(order("s1", 5.0)).await;

        let msg = rx.recv().await.unwrap();
        let outcome: SessionOutcome = serde_json::from_str(&msg.payload).unwrap();
        assert!(outcome.outcome == "WIN" || outcome.outcome == "LOSS");
        assert_eq!(outcome.contract_id, "SIMULATED");
        if outcome.outcome == "WIN" {
            assert!((outcome.payout_usd - 9.5).abs() < 1e-9);
        } else {
            assert_eq!(outcome.payout_usd, 0.0);
        }

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_refund_order_returns_stake() {
        let (pool, ledger, bus, _tmp) = pool_fixture(0.0, 0.0).await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        ledger.reserve_bet("u1", "s1", 5.0, "t1").await.unwrap();

        let (mut rx, _guard) = bus.psubscribe("game:outcome:*");
        pool.refund_order(&order("s1", 5.0), "venue unreachable").await;

        let msg = rx.recv().await.unwrap();
        let outcome: SessionOutcome = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(outcome.outcome, "REFUND");
        assert_eq!(outcome.payout_usd, 5.0);

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 50.0);
    }
}
