//! Crypto deposits.
//!
//! Address allocation derives HD indexes from an atomic per-coin counter.
//! The webhook and the watcher converge on the same transition: a deposit
//! keyed by transaction hash moves PENDING→CONFIRMED at most once, and that
//! single transition is what triggers the idempotent ledger credit.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::tatum::TatumClient;
use super::PaymentError;
use crate::bus::Bus;
use crate::ledger::LedgerService;
use crate::models::Config;
use crate::store::Store;

const SUPPORTED_COINS: [&str; 3] = ["BTC", "ETH", "USDT"];
const RECHECK_DELAYS: [Duration; 2] = [Duration::from_secs(60), Duration::from_secs(180)];

/// Per-coin block-confirmation count at which a deposit is credit-eligible.
fn confirmation_threshold(coin: &str) -> i64 {
    match coin {
        "BTC" => 3,
        "ETH" => 12,
        "USDT" => 1,
        _ => 3,
    }
}

fn default_network(coin: &str) -> &'static str {
    match coin {
        "BTC" => "BTC",
        "ETH" => "ERC20",
        "USDT" => "TRC20",
        _ => "L1",
    }
}

/// Normalized on-chain transaction, whichever path produced it.
#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub hash: String,
    pub amount_crypto: f64,
    pub amount_usd: f64,
    pub confirmations: i64,
}

/// Indexer webhook body for a confirmed address event.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoWebhookPayload {
    #[serde(rename = "txId")]
    pub tx_id: String,
    pub address: String,
    #[serde(default)]
    pub coin: String,
    #[serde(default)]
    pub network: String,
    #[serde(rename = "amount", default)]
    pub amount_crypto: f64,
    #[serde(rename = "amountUsd", default)]
    pub amount_usd: f64,
    #[serde(default)]
    pub confirmations: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CryptoAddress {
    pub address: String,
    pub coin: String,
    pub network: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CryptoDepositRecord {
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub coin: String,
    pub address: String,
    #[serde(rename = "amountCrypto")]
    pub amount_crypto: f64,
    #[serde(rename = "amountUsd")]
    pub amount_usd: f64,
    pub confirmations: i64,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualCheckResult {
    pub status: String,
    pub found: usize,
}

pub struct CryptoService {
    store: Store,
    bus: Bus,
    ledger: LedgerService,
    indexer: Arc<TatumClient>,
    cfg: Arc<Config>,
    active_checks: Mutex<HashSet<String>>,
}

impl CryptoService {
    pub fn new(
        store: Store,
        bus: Bus,
        ledger: LedgerService,
        indexer: Arc<TatumClient>,
        cfg: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            ledger,
            indexer,
            cfg,
            active_checks: Mutex::new(HashSet::new()),
        })
    }

    /// Get-or-create the deposit address for (user, coin).
    pub async fn ensure_address(
        self: &Arc<Self>,
        user_id: &str,
        coin: &str,
        network: &str,
    ) -> Result<CryptoAddress, PaymentError> {
        let coin = normalize_coin(coin);
        let network = if network.trim().is_empty() {
            default_network(&coin).to_string()
        } else {
            network.trim().to_uppercase()
        };

        {
            let conn = self.store.conn().await;
            let existing = conn
                .query_row(
                    "SELECT address, coin, network, created_at FROM crypto_wallets
                     WHERE user_id = ?1 AND coin = ?2",
                    params![user_id, coin],
                    |row| {
                        Ok(CryptoAddress {
                            address: row.get(0)?,
                            coin: row.get(1)?,
                            network: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }

        // Atomic counter: the derivation index is monotonically unique per coin.
        let derivation_index: i64 = {
            let conn = self.store.conn().await;
            conn.query_row(
                "INSERT INTO crypto_counters (coin, seq) VALUES (?1, 1)
                 ON CONFLICT(coin) DO UPDATE SET seq = seq + 1
                 RETURNING seq",
                params![coin],
                |row| row.get(0),
            )?
        };

        let address = self
            .indexer
            .generate_address(&coin, derivation_index)
            .await
            .map_err(|e| PaymentError::Gateway(format!("address generation failed: {e}")))?;

        let created_at = Utc::now().to_rfc3339();
        {
            let conn = self.store.conn().await;
            conn.execute(
                "INSERT INTO crypto_wallets
                    (address, user_id, coin, network, derivation_index, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'ACTIVE', ?6)",
                params![address, user_id, coin, network, derivation_index, created_at],
            )?;
        }
        info!(user = user_id, coin = %coin, index = derivation_index, "crypto address allocated");

        self.spawn_subscription_registration(coin.clone(), address.clone());

        Ok(CryptoAddress {
            address,
            coin,
            network,
            created_at,
        })
    }

    /// Best-effort webhook registration for a freshly allocated address.
    fn spawn_subscription_registration(self: &Arc<Self>, coin: String, address: String) {
        if self.cfg.crypto_webhook_url.is_empty() {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            match service
                .indexer
                .create_address_subscription(&coin, &address, &service.cfg.crypto_webhook_url)
                .await
            {
                Ok(subscription_id) => {
                    let conn = service.store.conn().await;
                    let _ = conn.execute(
                        "UPDATE crypto_wallets SET subscription_id = ?1 WHERE address = ?2",
                        params![subscription_id, address],
                    );
                    info!(coin = %coin, address = %address, "webhook subscription registered");
                }
                Err(e) => {
                    warn!(coin = %coin, address = %address, error = %e, "webhook subscription failed");
                }
            }
        });
    }

    /// Provision addresses for every supported coin (internal surface, used
    /// at account creation).
    pub async fn generate_all(self: &Arc<Self>, user_id: &str) -> BTreeMap<String, String> {
        let mut results = BTreeMap::new();
        for coin in SUPPORTED_COINS {
            match self.ensure_address(user_id, coin, "").await {
                Ok(address) => results.insert(coin.to_string(), address.address),
                Err(e) => results.insert(coin.to_string(), format!("error: {e}")),
            };
        }
        results
    }

    /// Indexer webhook entry point. Unknown addresses are absorbed.
    pub async fn handle_webhook(self: &Arc<Self>, payload: CryptoWebhookPayload) {
        let coin = normalize_coin(&payload.coin);
        let owner = match self.resolve_address(&payload.address).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(address = %payload.address, error = %e, "address lookup failed");
                return;
            }
        };
        let Some(user_id) = owner else {
            return;
        };
        self.process_tx(
            &user_id,
            &coin,
            &payload.address,
            ChainTransaction {
                hash: payload.tx_id,
                amount_crypto: payload.amount_crypto,
                amount_usd: payload.amount_usd,
                confirmations: payload.confirmations,
            },
        )
        .await;
    }

    /// The convergence point for watcher, webhook and manual checks.
    pub async fn process_tx(
        &self,
        user_id: &str,
        coin: &str,
        address: &str,
        tx: ChainTransaction,
    ) {
        if tx.hash.is_empty() || tx.amount_crypto <= 0.0 {
            return;
        }
        let threshold = confirmation_threshold(coin);
        let confirmed = tx.confirmations >= threshold;
        let now = Utc::now().to_rfc3339();

        if !confirmed {
            // Still pending: track progress, but never downgrade a deposit
            // that was already confirmed elsewhere.
            let conn = self.store.conn().await;
            let result = conn.execute(
                "INSERT INTO crypto_deposits
                    (tx_hash, user_id, coin, address, amount_crypto, amount_usd,
                     confirmations, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8, ?8)
                 ON CONFLICT(tx_hash) DO UPDATE SET
                    confirmations = excluded.confirmations,
                    amount_crypto = excluded.amount_crypto,
                    updated_at = excluded.updated_at
                 WHERE crypto_deposits.status <> 'CONFIRMED'",
                params![
                    tx.hash,
                    user_id,
                    coin,
                    address,
                    tx.amount_crypto,
                    tx.amount_usd,
                    tx.confirmations,
                    now
                ],
            );
            if let Err(e) = result {
                warn!(tx = %tx.hash, error = %e, "pending deposit upsert failed");
            }
            return;
        }

        // Confirmed: the conditional upsert matches only while the deposit is
        // not yet CONFIRMED, so exactly one caller wins the transition.
        let won = {
            let conn = self.store.conn().await;
            match conn.execute(
                "INSERT INTO crypto_deposits
                    (tx_hash, user_id, coin, address, amount_crypto, amount_usd,
                     confirmations, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'CONFIRMED', ?8, ?8)
                 ON CONFLICT(tx_hash) DO UPDATE SET
                    confirmations = excluded.confirmations,
                    amount_crypto = excluded.amount_crypto,
                    status = 'CONFIRMED',
                    updated_at = excluded.updated_at
                 WHERE crypto_deposits.status <> 'CONFIRMED'",
                params![
                    tx.hash,
                    user_id,
                    coin,
                    address,
                    tx.amount_crypto,
                    tx.amount_usd,
                    tx.confirmations,
                    now
                ],
            ) {
                Ok(changed) => changed > 0,
                Err(e) => {
                    warn!(tx = %tx.hash, error = %e, "confirmed deposit upsert failed");
                    return;
                }
            }
        };
        if !won {
            return;
        }

        // Crypto amounts are denominated in the accounting unit when no USD
        // amount was supplied by the caller.
        let amount_usd = if tx.amount_usd > 0.0 {
            tx.amount_usd
        } else {
            tx.amount_crypto
        };
        let credit = self
            .ledger
            .credit_deposit(
                user_id,
                amount_usd,
                &tx.hash,
                &format!("CRYPTO_{coin}"),
            )
            .await;
        if let Err(e) = credit {
            // Roll the status back so the next poll retries the credit.
            warn!(tx = %tx.hash, error = %e, "crypto credit failed, reverting to PENDING");
            let conn = self.store.conn().await;
            let _ = conn.execute(
                "UPDATE crypto_deposits SET status = 'PENDING', updated_at = ?1
                 WHERE tx_hash = ?2",
                params![Utc::now().to_rfc3339(), tx.hash],
            );
            return;
        }

        self.bus.publish(
            &format!("payment:user:{user_id}"),
            serde_json::json!({
                "type": "CRYPTO_DEPOSIT_CONFIRMED",
                "amountUsd": amount_usd,
                "coin": coin,
                "txHash": tx.hash,
            })
            .to_string(),
        );
        info!(user = user_id, coin = %coin, amount = amount_usd, tx = %tx.hash, "crypto deposit credited");
    }

    /// Safety-net poller for missed webhooks.
    pub async fn run_watcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval_sec = self.cfg.crypto_watcher_interval_sec.max(10);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_sec, "crypto deposit watcher started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.poll_active_addresses().await,
            }
        }
        info!("crypto deposit watcher stopped");
    }

    async fn poll_active_addresses(&self) {
        let wallets: Vec<(String, String, String)> = {
            let conn = self.store.conn().await;
            let mut stmt = match conn.prepare(
                "SELECT address, coin, user_id FROM crypto_wallets WHERE status = 'ACTIVE'",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    warn!(error = %e, "wallet scan query failed");
                    return;
                }
            };
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .and_then(|rows| rows.collect())
                .unwrap_or_default()
        };

        for (address, coin, user_id) in wallets {
            let txs = match self
                .indexer
                .get_transactions_by_address(&coin, &address)
                .await
            {
                Ok(txs) => txs,
                Err(e) => {
                    warn!(coin = %coin, address = %address, error = %e, "transaction lookup failed");
                    continue;
                }
            };
            for tx in txs {
                self.process_tx(&user_id, &coin, &address, tx).await;
            }
        }
    }

    /// User-requested one-shot scan of a specific address. A per
    /// (coin, address) flag keeps a single writer; if nothing is found yet,
    /// background rechecks run at +1 min and +4 min.
    pub async fn manual_check(
        self: &Arc<Self>,
        user_id: &str,
        coin: &str,
        address: &str,
    ) -> Result<ManualCheckResult, PaymentError> {
        let coin = normalize_coin(coin);
        let owned: Option<String> = {
            let conn = self.store.conn().await;
            conn.query_row(
                "SELECT address FROM crypto_wallets
                 WHERE user_id = ?1 AND coin = ?2 AND address = ?3",
                params![user_id, coin, address],
                |row| row.get(0),
            )
            .optional()?
        };
        if owned.is_none() {
            return Err(PaymentError::NotFound);
        }

        let tracking_key = format!("{coin}_{address}");
        if !self.active_checks.lock().insert(tracking_key.clone()) {
            return Ok(ManualCheckResult {
                status: "TRACKING_STARTED".into(),
                found: 0,
            });
        }

        let (status, found) = match self.check_address(user_id, &coin, address).await {
            Ok(result) => result,
            Err(e) => {
                self.active_checks.lock().remove(&tracking_key);
                return Err(PaymentError::Gateway(format!(
                    "failed to contact blockchain indexer: {e}"
                )));
            }
        };
        if status == "CONFIRMED" || status == "PENDING" {
            self.active_checks.lock().remove(&tracking_key);
            return Ok(ManualCheckResult { status, found });
        }

        let service = self.clone();
        let user_id = user_id.to_string();
        let address = address.to_string();
        tokio::spawn(async move {
            for delay in RECHECK_DELAYS {
                tokio::time::sleep(delay).await;
                match service.check_address(&user_id, &coin, &address).await {
                    Ok((status, _)) if status == "CONFIRMED" || status == "PENDING" => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(coin = %coin, address = %address, error = %e, "manual recheck failed");
                    }
                }
            }
            service.active_checks.lock().remove(&tracking_key);
        });

        Ok(ManualCheckResult {
            status: "TRACKING_STARTED".into(),
            found,
        })
    }

    async fn check_address(
        &self,
        user_id: &str,
        coin: &str,
        address: &str,
    ) -> anyhow::Result<(String, usize)> {
        let txs = self
            .indexer
            .get_transactions_by_address(coin, address)
            .await?;
        if txs.is_empty() {
            return Ok(("NO_TX".into(), 0));
        }

        let threshold = confirmation_threshold(coin);
        let mut highest = "NO_TX";
        let count = txs.len();
        for tx in txs {
            if tx.hash.is_empty() {
                continue;
            }
            let confirmations = tx.confirmations;
            self.process_tx(user_id, coin, address, tx).await;
            if confirmations >= threshold {
                highest = "CONFIRMED";
            } else if highest != "CONFIRMED" {
                highest = "PENDING";
            }
        }
        Ok((highest.to_string(), count))
    }

    pub async fn get_deposit(
        &self,
        tx_hash: &str,
    ) -> Result<Option<CryptoDepositRecord>, PaymentError> {
        let conn = self.store.conn().await;
        let deposit = conn
            .query_row(
                "SELECT tx_hash, user_id, coin, address, amount_crypto, amount_usd,
                        confirmations, status, created_at, updated_at
                 FROM crypto_deposits WHERE tx_hash = ?1",
                params![tx_hash],
                |row| {
                    Ok(CryptoDepositRecord {
                        tx_hash: row.get(0)?,
                        user_id: row.get(1)?,
                        coin: row.get(2)?,
                        address: row.get(3)?,
                        amount_crypto: row.get(4)?,
                        amount_usd: row.get(5)?,
                        confirmations: row.get(6)?,
                        status: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(deposit)
    }

    async fn resolve_address(&self, address: &str) -> Result<Option<String>, PaymentError> {
        let conn = self.store.conn().await;
        let user = conn
            .query_row(
                "SELECT user_id FROM crypto_wallets WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user)
    }
}

fn normalize_coin(coin: &str) -> String {
    let coin = coin.trim().to_uppercase();
    if coin.is_empty() {
        "USDT".to_string()
    } else {
        coin
    }
}
