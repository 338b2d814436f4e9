//! Withdrawal driver.
//!
//! Reserve with the ledger, initiate the provider transfer, then converge on
//! settle via webhook or poller. A failed transfer releases the reservation
//! back to the user; a confirmed one burns it.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::flutterwave::{FlutterwaveClient, ProviderWebhookEvent, TransferRequest};
use super::{
    normalize_channel, normalize_phone, reference_nonce, round_money, short_id, PaymentError,
};
use crate::bus::Bus;
use crate::ledger::{LedgerError, LedgerService};
use crate::models::Config;
use crate::store::Store;

const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(30);
const RECONCILE_AGE_SEC: i64 = 120;
const LEDGER_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalInitiation {
    #[serde(rename = "withdrawalId")]
    pub withdrawal_id: String,
    pub reference: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalRequestRecord {
    #[serde(rename = "withdrawalId")]
    pub withdrawal_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub phone: String,
    pub channel: String,
    #[serde(rename = "amountUsd")]
    pub amount_usd: f64,
    pub currency: String,
    #[serde(rename = "providerRef")]
    pub provider_ref: String,
    #[serde(rename = "transferCode", skip_serializing_if = "Option::is_none")]
    pub transfer_code: Option<String>,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "settledAt", skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<String>,
}

pub struct WithdrawalService {
    store: Store,
    bus: Bus,
    ledger: LedgerService,
    provider: Arc<FlutterwaveClient>,
    cfg: Arc<Config>,
}

impl WithdrawalService {
    pub fn new(
        store: Store,
        bus: Bus,
        ledger: LedgerService,
        provider: Arc<FlutterwaveClient>,
        cfg: Arc<Config>,
    ) -> Self {
        Self {
            store,
            bus,
            ledger,
            provider,
            cfg,
        }
    }

    /// Reserve, record, and hand the payout to the provider.
    pub async fn initiate(
        &self,
        user_id: &str,
        phone: &str,
        amount: f64,
        channel: &str,
    ) -> Result<WithdrawalInitiation, PaymentError> {
        let phone = normalize_phone(phone);
        let channel = normalize_channel(channel);
        if phone.is_empty() || channel.is_empty() || amount <= 0.0 {
            return Err(PaymentError::Validation(
                "phone, amount and channel are required".into(),
            ));
        }
        if !self.channel_supported(&channel) {
            return Err(PaymentError::Validation("unsupported channel".into()));
        }
        let amount = round_money(amount);

        let withdrawal_id = Uuid::new_v4().simple().to_string();
        let reserve = tokio::time::timeout(
            LEDGER_DEADLINE,
            self.ledger.reserve_withdrawal(user_id, &withdrawal_id, amount),
        )
        .await
        .map_err(|_| PaymentError::Gateway("wallet timeout".into()))?;
        if let Err(e) = reserve {
            return Err(match e {
                LedgerError::InsufficientFunds => PaymentError::InsufficientFunds(format!(
                    "insufficient balance or reservation failed: {e}"
                )),
                other => PaymentError::Internal(other.into()),
            });
        }

        let provider_ref = format!("WIT-{}-{}", short_id(user_id), reference_nonce());
        {
            let conn = self.store.conn().await;
            conn.execute(
                "INSERT INTO withdrawal_requests
                    (withdrawal_id, user_id, phone, channel, amount_usd, currency,
                     provider_ref, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PROCESSING', ?8, ?8)",
                params![
                    withdrawal_id,
                    user_id,
                    phone,
                    channel,
                    amount,
                    self.cfg.momo_default_currency,
                    provider_ref,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        info!(reference = %provider_ref, user = user_id, channel = %channel, amount, "withdrawal initiated");

        let transfer = self
            .provider
            .initiate_transfer(
                TransferRequest {
                    reference: provider_ref.clone(),
                    amount,
                    currency: self.cfg.momo_default_currency.clone(),
                    debit_currency: self.cfg.momo_default_currency.clone(),
                    account_bank: super::network_from_channel(&channel),
                    account_number: phone,
                    narration: "PlayGrid Wallet Withdrawal".into(),
                    callback_url: self.cfg.provider_transfer_callback.clone(),
                    beneficiary: format!("PG {}", short_id(user_id)),
                },
                &provider_ref,
            )
            .await;
        match transfer {
            Ok(transfer) => {
                let conn = self.store.conn().await;
                let _ = conn.execute(
                    "UPDATE withdrawal_requests SET transfer_code = ?1, updated_at = ?2
                     WHERE withdrawal_id = ?3",
                    params![transfer.flw_ref, Utc::now().to_rfc3339(), withdrawal_id],
                );
            }
            Err(e) => {
                warn!(reference = %provider_ref, error = %e, "provider transfer failed, releasing reservation");
                if let Err(release_err) = self
                    .ledger
                    .release_withdrawal(user_id, &withdrawal_id, false)
                    .await
                {
                    warn!(
                        withdrawal = %withdrawal_id,
                        error = %release_err,
                        "release after failed transfer also failed"
                    );
                }
                let conn = self.store.conn().await;
                let _ = conn.execute(
                    "UPDATE withdrawal_requests
                     SET status = 'FAILED', error = ?1, updated_at = ?2
                     WHERE withdrawal_id = ?3",
                    params![e.to_string(), Utc::now().to_rfc3339(), withdrawal_id],
                );
                return Err(PaymentError::Gateway("could not initiate withdrawal".into()));
            }
        }

        Ok(WithdrawalInitiation {
            withdrawal_id,
            reference: provider_ref,
            status: "PROCESSING".into(),
            message:
                "Withdrawal is being processed. Funds will arrive within minutes once the provider confirms."
                    .into(),
        })
    }

    /// Transfer webhook, after signature verification.
    pub async fn handle_transfer_event(&self, event: ProviderWebhookEvent) {
        let reference = if !event.data.reference.trim().is_empty() {
            event.data.reference.trim().to_string()
        } else {
            event.data.tx_ref.trim().to_string()
        };
        if reference.is_empty() {
            return;
        }
        let key = format!("idempotency:flutterwave:withdrawal:{reference}");
        if !self.bus.set_nx(&key, DEDUP_TTL) {
            return;
        }

        let status = event.data.status.to_lowercase();
        let success =
            status == "successful" || event.event.eq_ignore_ascii_case("transfer.completed");
        let failed = status == "failed" || event.event.eq_ignore_ascii_case("transfer.failed");
        if !success && !failed {
            return;
        }
        info!(reference = %reference, success, "withdrawal webhook");
        if let Err(e) = self.settle(&reference, success).await {
            warn!(reference = %reference, error = %e, "withdrawal settle failed");
        }
    }

    /// Converge a PROCESSING withdrawal on its terminal state.
    pub async fn settle(&self, provider_ref: &str, success: bool) -> Result<(), PaymentError> {
        let record: Option<(String, String, f64, String)> = {
            let conn = self.store.conn().await;
            conn.query_row(
                "SELECT withdrawal_id, user_id, amount_usd, status
                 FROM withdrawal_requests WHERE provider_ref = ?1",
                params![provider_ref],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()?
        };
        let Some((withdrawal_id, user_id, amount_usd, status)) = record else {
            return Ok(());
        };
        if status != "PROCESSING" {
            return Ok(());
        }

        self.ledger
            .release_withdrawal(&user_id, &withdrawal_id, success)
            .await
            .map_err(|e| PaymentError::Internal(e.into()))?;

        let (new_status, event_type) = if success {
            ("COMPLETED", "WITHDRAWAL_COMPLETED")
        } else {
            ("FAILED", "WITHDRAWAL_FAILED")
        };
        {
            let conn = self.store.conn().await;
            conn.execute(
                "UPDATE withdrawal_requests
                 SET status = ?1, settled_at = ?2, updated_at = ?2
                 WHERE withdrawal_id = ?3",
                params![new_status, Utc::now().to_rfc3339(), withdrawal_id],
            )?;
        }
        self.bus.publish(
            &format!("payment:user:{user_id}"),
            serde_json::json!({
                "type": event_type,
                "amount": amount_usd,
            })
            .to_string(),
        );
        Ok(())
    }

    /// Poller for transfers whose webhook never arrived.
    pub async fn run_withdrawal_poller(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("withdrawal reconciliation poller started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.poll_processing_withdrawals().await,
            }
        }
        info!("withdrawal reconciliation poller stopped");
    }

    async fn poll_processing_withdrawals(&self) {
        let cutoff = (Utc::now() - chrono::Duration::seconds(RECONCILE_AGE_SEC)).to_rfc3339();
        let processing: Vec<String> = {
            let conn = self.store.conn().await;
            let mut stmt = match conn.prepare(
                "SELECT provider_ref FROM withdrawal_requests
                 WHERE status = 'PROCESSING' AND created_at < ?1",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    warn!(error = %e, "withdrawal poller query failed");
                    return;
                }
            };
            stmt.query_map(params![cutoff], |row| row.get(0))
                .and_then(|rows| rows.collect())
                .unwrap_or_default()
        };

        for provider_ref in processing {
            let transfer = match self
                .provider
                .get_transfer_by_reference(&provider_ref, &provider_ref)
                .await
            {
                Ok(transfer) => transfer,
                Err(e) => {
                    warn!(reference = %provider_ref, error = %e, "transfer lookup failed");
                    continue;
                }
            };
            info!(reference = %provider_ref, status = %transfer.status, "withdrawal poller verified");
            let result = if transfer.status.eq_ignore_ascii_case("successful") {
                self.settle(&provider_ref, true).await
            } else if transfer.status.eq_ignore_ascii_case("failed") {
                self.settle(&provider_ref, false).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!(reference = %provider_ref, error = %e, "withdrawal poller settle failed");
            }
        }
    }

    pub async fn list(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<WithdrawalRequestRecord>, PaymentError> {
        let conn = self.store.conn().await;
        let mut stmt = conn.prepare(
            "SELECT withdrawal_id, user_id, phone, channel, amount_usd, currency,
                    provider_ref, transfer_code, status, created_at, settled_at
             FROM withdrawal_requests
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![user_id, limit], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Withdrawals still in flight for a user (internal surface).
    pub async fn list_pending(
        &self,
        user_id: &str,
    ) -> Result<Vec<WithdrawalRequestRecord>, PaymentError> {
        let conn = self.store.conn().await;
        let mut stmt = conn.prepare(
            "SELECT withdrawal_id, user_id, phone, channel, amount_usd, currency,
                    provider_ref, transfer_code, status, created_at, settled_at
             FROM withdrawal_requests
             WHERE user_id = ?1 AND status = 'PROCESSING'
             ORDER BY created_at DESC",
        )?;
        let records = stmt
            .query_map(params![user_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn channel_supported(&self, channel: &str) -> bool {
        self.cfg.momo_allowed_channels.is_empty()
            || self.cfg.momo_allowed_channels.iter().any(|c| c == channel)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<WithdrawalRequestRecord, rusqlite::Error> {
    Ok(WithdrawalRequestRecord {
        withdrawal_id: row.get(0)?,
        user_id: row.get(1)?,
        phone: row.get(2)?,
        channel: row.get(3)?,
        amount_usd: row.get(4)?,
        currency: row.get(5)?,
        provider_ref: row.get(6)?,
        transfer_code: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        settled_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::flutterwave::ProviderWebhookData;
    use tempfile::NamedTempFile;

    fn wd_config() -> Arc<Config> {
        let mut cfg = Config::from_env();
        cfg.momo_allowed_channels = vec!["mtn-gh".into(), "vodafone-gh".into()];
        cfg.momo_default_currency = "GHS".into();
        Arc::new(cfg)
    }

    async fn wd_fixture() -> (WithdrawalService, LedgerService, Bus, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        let bus = Bus::new();
        let ledger = LedgerService::new(store.clone(), bus.clone());
        let provider = Arc::new(FlutterwaveClient::new(
            String::new(),
            "https://api.example".into(),
            String::new(),
        ));
        let service =
            WithdrawalService::new(store, bus.clone(), ledger.clone(), provider, wd_config());
        (service, ledger, bus, temp)
    }

    #[tokio::test]
    async fn test_initiate_reserves_funds() {
        let (service, ledger, _bus, _tmp) = wd_fixture().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();

        let out = service
            .initiate("u1", "0241234567", 20.0, "mtn-gh")
            .await
            .unwrap();
        assert_eq!(out.status, "PROCESSING");
        assert!(out.reference.starts_with("WIT-"));

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 30.0);
        assert_eq!(bal.reserved_usd, 20.0);

        let records = service.list("u1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "PROCESSING");
        assert!(records[0].transfer_code.is_some());
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let (service, ledger, _bus, _tmp) = wd_fixture().await;
        ledger.credit_deposit("u1", 10.0, "D1", "X").await.unwrap();
        let err = service
            .initiate("u1", "0241234567", 20.0, "mtn-gh")
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn test_settle_success_burns_reservation() {
        let (service, ledger, bus, _tmp) = wd_fixture().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        let out = service
            .initiate("u1", "0241234567", 20.0, "mtn-gh")
            .await
            .unwrap();

        let (mut rx, _guard) = bus.psubscribe("payment:user:u1");
        service.settle(&out.reference, true).await.unwrap();

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 30.0);
        assert_eq!(bal.reserved_usd, 0.0);

        let records = service.list("u1", 10).await.unwrap();
        assert_eq!(records[0].status, "COMPLETED");

        let msg = rx.recv().await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(payload["type"], "WITHDRAWAL_COMPLETED");
    }

    #[tokio::test]
    async fn test_settle_failure_returns_funds() {
        let (service, ledger, _bus, _tmp) = wd_fixture().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        let out = service
            .initiate("u1", "0241234567", 20.0, "mtn-gh")
            .await
            .unwrap();

        service.settle(&out.reference, false).await.unwrap();

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 50.0);
        assert_eq!(bal.reserved_usd, 0.0);

        let records = service.list("u1", 10).await.unwrap();
        assert_eq!(records[0].status, "FAILED");
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let (service, ledger, _bus, _tmp) = wd_fixture().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        let out = service
            .initiate("u1", "0241234567", 20.0, "mtn-gh")
            .await
            .unwrap();

        service.settle(&out.reference, true).await.unwrap();
        // Second settle with the opposite verdict finds a terminal record.
        service.settle(&out.reference, false).await.unwrap();

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 30.0);
        let records = service.list("u1", 10).await.unwrap();
        assert_eq!(records[0].status, "COMPLETED");
    }

    #[tokio::test]
    async fn test_unknown_provider_ref_is_noop() {
        let (service, _ledger, _bus, _tmp) = wd_fixture().await;
        service.settle("WIT-unknown", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_webhook_dedup() {
        let (service, ledger, _bus, _tmp) = wd_fixture().await;
        ledger.credit_deposit("u1", 50.0, "D1", "X").await.unwrap();
        let out = service
            .initiate("u1", "0241234567", 20.0, "mtn-gh")
            .await
            .unwrap();

        let event = ProviderWebhookEvent {
            event: "transfer.completed".into(),
            data: ProviderWebhookData {
                status: "successful".into(),
                reference: out.reference.clone(),
                ..Default::default()
            },
        };
        service.handle_transfer_event(event.clone()).await;
        service.handle_transfer_event(event).await;

        let bal = ledger.get_balance("u1").await.unwrap();
        assert_eq!(bal.available_usd, 30.0);
        assert_eq!(bal.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_list_pending_filters_terminal() {
        let (service, ledger, _bus, _tmp) = wd_fixture().await;
        ledger.credit_deposit("u1", 100.0, "D1", "X").await.unwrap();
        let first = service
            .initiate("u1", "0241234567", 20.0, "mtn-gh")
            .await
            .unwrap();
        service
            .initiate("u1", "0241234567", 10.0, "mtn-gh")
            .await
            .unwrap();
        service.settle(&first.reference, true).await.unwrap();

        let pending = service.list_pending("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount_usd, 10.0);
    }
}
