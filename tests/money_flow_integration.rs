//! End-to-end money-flow scenarios across the ledger, bet pipeline,
//! execution pool and payment adapters, run against a temp-file store and
//! the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::sync::watch;
use tokio::time::timeout;

use playgrid_backend::bus::Bus;
use playgrid_backend::ledger::LedgerService;
use playgrid_backend::models::Config;
use playgrid_backend::payments::{FlutterwaveClient, MomoService, ProviderWebhookEvent, WithdrawalService};
use playgrid_backend::pool::PoolManager;
use playgrid_backend::session::{PlaceBetRequest, SessionManager};
use playgrid_backend::store::Store;

struct Harness {
    store: Store,
    bus: Bus,
    ledger: LedgerService,
    sessions: Arc<SessionManager>,
    cfg: Arc<Config>,
    _tmp: NamedTempFile,
}

fn base_config() -> Config {
    let mut cfg = Config::from_env();
    cfg.order_queue = "trade:orders".into();
    cfg.outcome_prefix = "game:outcome".into();
    cfg.stale_sweep_sec = 1;
    cfg.stale_refund_sec = 60;
    cfg.min_settle_ms = 0;
    cfg.max_settle_ms = 1;
    cfg.payout_multiplier = 1.9;
    cfg.bounce_rate = 0.0;
    cfg.profit_target_usd = 0.0;
    cfg.win_rake_rate = 0.0;
    cfg.upstream_tokens = Vec::new();
    cfg.upstream_app_id = String::new();
    cfg.momo_allowed_channels = vec!["mtn-gh".into(), "vodafone-gh".into(), "airteltigo-gh".into()];
    cfg.momo_default_currency = "GHS".into();
    cfg.provider_secret_key = String::new();
    cfg
}

fn harness(cfg: Config) -> Harness {
    let tmp = NamedTempFile::new().unwrap();
    let store = Store::open(tmp.path().to_str().unwrap()).unwrap();
    let bus = Bus::new();
    let ledger = LedgerService::new(store.clone(), bus.clone());
    let cfg = Arc::new(cfg);
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        bus.clone(),
        ledger.clone(),
        cfg.clone(),
    ));
    Harness {
        store,
        bus,
        ledger,
        sessions,
        cfg,
        _tmp: tmp,
    }
}

fn bet(stake: f64) -> PlaceBetRequest {
    serde_json::from_value(serde_json::json!({
        "gameType": "RANGE_BREAKER",
        "stakeUsd": stake,
        "prediction": {},
        "traceId": "trace-e2e",
    }))
    .unwrap()
}

/// Bet placed through the session manager, consumed by the pool running in
/// bounce mode, outcome persisted by the subscriber and pushed to the user's
/// channel. No order ever reaches an upstream account.
#[tokio::test]
async fn bounced_bet_full_pipeline() {
    let mut cfg = base_config();
    cfg.bounce_rate = 1.0;
    let h = harness(cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let sessions = h.sessions.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { sessions.run_outcome_subscriber(rx).await });
    }
    let pool = PoolManager::new(h.bus.clone(), h.ledger.clone(), h.cfg.clone());
    tokio::spawn(pool.run(shutdown_rx));
    // Let the subscriber and consumer loops register before producing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
    let (mut frames, _guard) = h.sessions.subscribe("u1");

    let ack = h.sessions.place_bet("u1", bet(5.0)).await.unwrap();
    assert_eq!(ack.new_balance, 95.0);

    let frame = timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("outcome frame within deadline")
        .expect("subscriber channel open");
    let msg: serde_json::Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(msg["type"], "GAME_RESULT");
    assert_eq!(msg["payload"]["outcome"], "LOSS");
    assert_eq!(msg["payload"]["payoutUsd"], 0.0);
    assert_eq!(msg["payload"]["sessionId"], ack.session_id.as_str());

    let bal = h.ledger.get_balance("u1").await.unwrap();
    assert_eq!(bal.available_usd, 95.0);
    assert_eq!(bal.reserved_usd, 0.0);

    let entries = h.ledger.list_ledger("u1", 10, 0).await.unwrap();
    let reserved = entries.iter().find(|e| e.entry_type == "BET_RESERVED").unwrap();
    assert_eq!(reserved.amount_usd, -5.0);
    let result = entries.iter().find(|e| e.entry_type == "GAME_RESULT").unwrap();
    assert_eq!(result.amount_usd, -5.0);

    let session = h
        .sessions
        .get_session("u1", &ack.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "LOSS");

    let _ = shutdown_tx.send(true);
}

/// Simulation-mode pipeline always settles terminally and frees the
/// reservation, whichever way the coin lands.
#[tokio::test]
async fn simulated_bet_settles_terminally() {
    let h = harness(base_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = PoolManager::new(h.bus.clone(), h.ledger.clone(), h.cfg.clone());
    tokio::spawn(pool.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
    let (mut outcomes, _guard) = h.bus.psubscribe("game:outcome:*");

    let ack = h.sessions.place_bet("u1", bet(10.0)).await.unwrap();

    let msg = timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .expect("outcome within deadline")
        .unwrap();
    let outcome: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
    let bal = h.ledger.get_balance("u1").await.unwrap();
    assert_eq!(bal.reserved_usd, 0.0);

    match outcome["outcome"].as_str().unwrap() {
        "WIN" => {
            // payout = 10 × 1.9, burn 10 from reserved, credit 19.
            assert!((bal.available_usd - 109.0).abs() < 1e-9);
            assert_eq!(h.bus.zscore("leaderboard:global", "u1"), Some(9.0));
        }
        "LOSS" => assert!((bal.available_usd - 90.0).abs() < 1e-9),
        other => panic!("unexpected outcome {other}"),
    }
    assert_eq!(outcome["contractId"], "SIMULATED");
    assert_eq!(outcome["sessionId"], ack.session_id.as_str());

    let _ = shutdown_tx.send(true);
}

/// A WIN settled through the ledger produces the exact §-style arithmetic:
/// burn the stake from reserved, credit the payout, log the signed result.
#[tokio::test]
async fn win_settlement_arithmetic() {
    let h = harness(base_config());
    h.ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();

    let ack = h.sessions.place_bet("u1", bet(10.0)).await.unwrap();
    assert_eq!(ack.new_balance, 90.0);
    let bal = h.ledger.get_balance("u1").await.unwrap();
    assert_eq!(bal.reserved_usd, 10.0);

    let bal = h
        .ledger
        .settle_game("u1", &ack.session_id, "WIN", 10.0, 19.0, "trace-e2e")
        .await
        .unwrap();
    assert_eq!(bal.available_usd, 109.0);
    assert_eq!(bal.reserved_usd, 0.0);

    let entries = h.ledger.list_ledger("u1", 10, 0).await.unwrap();
    let result = entries.iter().find(|e| e.entry_type == "GAME_RESULT").unwrap();
    assert_eq!(result.amount_usd, 9.0);
    assert_eq!(h.bus.zscore("leaderboard:global", "u1"), Some(9.0));
}

/// Order lost after enqueue: the sweeper refunds and the ledger records a
/// zero-amount REFUND result.
#[tokio::test]
async fn stale_session_swept_to_refund() {
    let mut cfg = base_config();
    cfg.stale_refund_sec = 1;
    cfg.stale_sweep_sec = 1;
    let h = harness(cfg);

    h.ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
    let ack = h.sessions.place_bet("u1", bet(10.0)).await.unwrap();

    // Drop the order on the floor; nobody consumes the queue.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let sessions = h.sessions.clone();
        tokio::spawn(async move { sessions.run_stale_sweeper(shutdown_rx).await });
    }

    let refunded = timeout(Duration::from_secs(10), async {
        loop {
            let bal = h.ledger.get_balance("u1").await.unwrap();
            if bal.reserved_usd == 0.0 && bal.available_usd == 100.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(refunded.is_ok(), "sweeper refunded within the deadline");

    let entries = h.ledger.list_ledger("u1", 10, 0).await.unwrap();
    let result = entries.iter().find(|e| e.entry_type == "GAME_RESULT").unwrap();
    assert_eq!(result.amount_usd, 0.0);

    let session = h
        .sessions
        .get_session("u1", &ack.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "REFUND");

    let _ = shutdown_tx.send(true);
}

/// Duplicate deposit webhooks credit exactly once: first the set-if-absent
/// gate, then the conditional intent transition, then the ledger reference
/// check each stop the replay.
#[tokio::test]
async fn deposit_duplicate_webhook_single_credit() {
    let h = harness(base_config());
    let provider = Arc::new(FlutterwaveClient::new(
        String::new(),
        "https://api.example".into(),
        String::new(),
    ));
    let momo = MomoService::new(
        h.store.clone(),
        h.bus.clone(),
        h.ledger.clone(),
        provider,
        h.cfg.clone(),
    );

    h.ledger.credit_deposit("u1", 100.0, "SEED", "X").await.unwrap();
    let out = momo
        .initiate_deposit("u1", "0241234567", 25.0, "mtn-gh")
        .await
        .unwrap();

    let event: ProviderWebhookEvent = serde_json::from_value(serde_json::json!({
        "event": "charge.completed",
        "data": {
            "status": "successful",
            "tx_ref": out.reference,
            "flw_ref": "FLW-1",
            "amount": 25.0,
        }
    }))
    .unwrap();
    momo.handle_deposit_event(event.clone()).await;
    momo.handle_deposit_event(event).await;
    // Belt and braces: even a direct replay of the credit path no-ops.
    let _ = momo.mark_deposit_confirmed(&out.reference, "FLW-1").await;

    let bal = h.ledger.get_balance("u1").await.unwrap();
    assert_eq!(bal.available_usd, 125.0);

    let entries = h.ledger.list_ledger("u1", 10, 0).await.unwrap();
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.reference == out.reference)
            .count(),
        1
    );
}

/// Provider rejects the transfer: the reservation is released and the user
/// ends where they started.
#[tokio::test]
async fn withdrawal_rejected_by_provider_releases_funds() {
    let h = harness(base_config());
    // A configured secret forces real HTTP against an unroutable endpoint,
    // so the transfer call fails after its retries.
    let provider = Arc::new(FlutterwaveClient::new(
        "sk_test_dead".into(),
        "http://127.0.0.1:9".into(),
        String::new(),
    ));
    let withdrawals = WithdrawalService::new(
        h.store.clone(),
        h.bus.clone(),
        h.ledger.clone(),
        provider,
        h.cfg.clone(),
    );

    h.ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
    let err = withdrawals
        .initiate("u1", "0241234567", 20.0, "mtn-gh")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("could not initiate withdrawal"));

    let bal = h.ledger.get_balance("u1").await.unwrap();
    assert_eq!(bal.available_usd, 50.0);
    assert_eq!(bal.reserved_usd, 0.0);

    let entries = h.ledger.list_ledger("u1", 10, 0).await.unwrap();
    let types: Vec<_> = entries.iter().map(|e| e.entry_type.as_str()).collect();
    assert!(types.contains(&"WITHDRAWAL_RESERVED"));
    assert!(types.contains(&"WITHDRAWAL_RELEASED"));

    let records = withdrawals.list("u1", 10).await.unwrap();
    assert_eq!(records[0].status, "FAILED");
}

/// Successful withdrawal burns the reservation and keeps both ledger
/// entries.
#[tokio::test]
async fn withdrawal_completed_burns_reservation() {
    let h = harness(base_config());
    let provider = Arc::new(FlutterwaveClient::new(
        String::new(),
        "https://api.example".into(),
        String::new(),
    ));
    let withdrawals = WithdrawalService::new(
        h.store.clone(),
        h.bus.clone(),
        h.ledger.clone(),
        provider,
        h.cfg.clone(),
    );

    h.ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
    let out = withdrawals
        .initiate("u1", "0241234567", 20.0, "mtn-gh")
        .await
        .unwrap();
    withdrawals.settle(&out.reference, true).await.unwrap();

    let bal = h.ledger.get_balance("u1").await.unwrap();
    assert_eq!(bal.available_usd, 30.0);
    assert_eq!(bal.reserved_usd, 0.0);

    let entries = h.ledger.list_ledger("u1", 10, 0).await.unwrap();
    let types: Vec<_> = entries.iter().map(|e| e.entry_type.as_str()).collect();
    assert!(types.contains(&"WITHDRAWAL_RESERVED"));
    assert!(types.contains(&"WITHDRAWAL_CONFIRMED"));
}

/// Conservation: total user claims equal deposits − confirmed withdrawals +
/// game results across a mixed workload.
#[tokio::test]
async fn conservation_over_mixed_workload() {
    let h = harness(base_config());

    h.ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
    h.ledger.credit_deposit("u2", 60.0, "D2", "X").await.unwrap();

    let ack = h.sessions.place_bet("u1", bet(10.0)).await.unwrap();
    h.ledger
        .settle_game("u1", &ack.session_id, "WIN", 10.0, 19.0, "")
        .await
        .unwrap();

    let ack = h.sessions.place_bet("u2", bet(15.0)).await.unwrap();
    h.ledger
        .settle_game("u2", &ack.session_id, "LOSS", 15.0, 0.0, "")
        .await
        .unwrap();

    h.ledger.reserve_withdrawal("u1", "w1", 30.0).await.unwrap();
    h.ledger.release_withdrawal("u1", "w1", true).await.unwrap();

    let b1 = h.ledger.get_balance("u1").await.unwrap();
    let b2 = h.ledger.get_balance("u2").await.unwrap();
    let claims = b1.available_usd + b1.reserved_usd + b2.available_usd + b2.reserved_usd;

    let mut deposits = 0.0;
    let mut confirmed_withdrawals = 0.0;
    let mut game_results = 0.0;
    for user in ["u1", "u2"] {
        for entry in h.ledger.list_ledger(user, 50, 0).await.unwrap() {
            match entry.entry_type.as_str() {
                "DEPOSIT_CONFIRMED" => deposits += entry.amount_usd,
                "WITHDRAWAL_CONFIRMED" => confirmed_withdrawals += entry.amount_usd.abs(),
                "GAME_RESULT" => game_results += entry.amount_usd,
                _ => {}
            }
        }
    }
    assert!((claims - (deposits - confirmed_withdrawals + game_results)).abs() < 1e-9);
}
