//! Mobile-money deposits.
//!
//! The payment-intent reference is the idempotency anchor for the whole
//! credit path: a unique PENDING intent per attempt, a set-if-absent gate on
//! the webhook, a conditional status transition before the ledger credit.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::flutterwave::{FlutterwaveClient, MobileMoneyChargeRequest, ProviderWebhookEvent};
use super::{
    normalize_channel, normalize_phone, reference_nonce, round_money, short_id, PaymentError,
};
use crate::bus::Bus;
use crate::ledger::LedgerService;
use crate::models::Config;
use crate::store::Store;

const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(30);
const RECONCILE_AGE_SEC: i64 = 120;

#[derive(Debug, Clone, Serialize)]
pub struct DepositInitiation {
    pub reference: String,
    pub status: String,
    pub message: String,
    #[serde(rename = "providerReference", skip_serializing_if = "String::is_empty")]
    pub provider_reference: String,
    #[serde(rename = "providerAuthMode", skip_serializing_if = "Option::is_none")]
    pub provider_auth_mode: Option<String>,
    #[serde(rename = "providerRedirectUrl", skip_serializing_if = "Option::is_none")]
    pub provider_redirect_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentRecord {
    pub reference: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "type")]
    pub intent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(rename = "amountUsd")]
    pub amount_usd: f64,
    pub currency: String,
    pub status: String,
    #[serde(rename = "providerTxId", skip_serializing_if = "Option::is_none")]
    pub provider_tx_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "settledAt", skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<String>,
}

pub struct MomoService {
    store: Store,
    bus: Bus,
    ledger: LedgerService,
    provider: Arc<FlutterwaveClient>,
    cfg: Arc<Config>,
}

impl MomoService {
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

    /// Record a PENDING intent and trigger the provider push prompt.
    pub async fn initiate_deposit(
        &self,
        user_id: &str,
        phone: &str,
        amount: f64,
        channel: &str,
    ) -> Result<DepositInitiation, PaymentError> {
        let phone = normalize_phone(phone);
        let channel = normalize_channel(channel);
        if phone.is_empty() || channel.is_empty() || amount <= 0.0 {
            return Err(PaymentError::Validation(
                "phone, channel and amount are required".into(),
            ));
        }
        if !self.channel_supported(&channel) {
            return Err(PaymentError::Validation("unsupported channel".into()));
        }
        let amount = round_money(amount);
        if amount <= 0.0 {
            return Err(PaymentError::Validation(
                "amount must be at least 0.01".into(),
            ));
        }

        let reference = format!("DEP-{}-{}", short_id(user_id), reference_nonce());
        {
            let conn = self.store.conn().await;
            conn.execute(
                "INSERT INTO payment_intents
                    (reference, user_id, intent_type, channel, phone, amount_usd, currency,
                     status, created_at, updated_at)
                 VALUES (?1, ?2, 'MOMO_DEPOSIT', ?3, ?4, ?5, ?6, 'PENDING', ?7, ?7)",
                params![
                    reference,
                    user_id,
                    channel,
                    phone,
                    amount,
                    self.cfg.momo_default_currency,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        info!(reference = %reference, user = user_id, channel = %channel, amount, "deposit initiated");

        let charge = self
            .provider
            .charge_mobile_money(
                MobileMoneyChargeRequest {
                    reference: reference.clone(),
                    amount,
                    currency: self.cfg.momo_default_currency.clone(),
                    email: format!("{user_id}@users.playgrid.io"),
                    full_name: format!("PlayGrid {}", short_id(user_id)),
                    phone_number: phone,
                    network: super::network_from_channel(&channel),
                    narration: "PlayGrid Deposit".into(),
                    callback_url: self.cfg.provider_charge_callback.clone(),
                },
                &reference,
            )
            .await;
        let charge = match charge {
            Ok(charge) => charge,
            Err(e) => {
                warn!(reference = %reference, error = %e, "provider charge failed");
                let conn = self.store.conn().await;
                let _ = conn.execute(
                    "UPDATE payment_intents
                     SET status = 'INITIATION_FAILED', error = ?1, updated_at = ?2
                     WHERE reference = ?3",
                    params![e.to_string(), Utc::now().to_rfc3339(), reference],
                );
                return Err(PaymentError::Gateway(
                    "could not initiate provider payment".into(),
                ));
            }
        };

        let mut out = DepositInitiation {
            reference,
            status: "PENDING".into(),
            message: "Approve the mobile money prompt that just appeared on your phone to finish the deposit.".into(),
            provider_reference: charge.flw_ref,
            provider_auth_mode: None,
            provider_redirect_url: None,
        };
        if let Some(auth) = charge.authorization {
            if !auth.mode.is_empty() {
                out.provider_auth_mode = Some(auth.mode);
            }
            if !auth.redirect.is_empty() {
                out.provider_redirect_url = Some(auth.redirect);
                out.message = "Complete the provider verification step, then approve the prompt on your phone.".into();
            }
        }
        Ok(out)
    }

    /// Deposit webhook, after signature verification. Malformed events are
    /// absorbed; the set-if-absent gate drops duplicates.
    pub async fn handle_deposit_event(&self, event: ProviderWebhookEvent) {
        let reference = first_non_empty(&event.data.tx_ref, &event.data.reference);
        if reference.is_empty() {
            return;
        }
        let key = format!("idempotency:flutterwave:deposit:{reference}");
        if !self.bus.set_nx(&key, DEDUP_TTL) {
            return;
        }

        let status = event.data.status.to_lowercase();
        if status == "successful" || event.event.eq_ignore_ascii_case("charge.completed") {
            info!(reference = %reference, "deposit webhook success");
            if let Err(e) = self
                .mark_deposit_confirmed(&reference, &event.data.flw_ref)
                .await
            {
                warn!(reference = %reference, error = %e, "webhook confirm failed");
            }
        } else if status == "failed" || event.event.eq_ignore_ascii_case("charge.failed") {
            info!(reference = %reference, "deposit webhook failure");
            if let Err(e) = self.mark_deposit_failed(&reference).await {
                warn!(reference = %reference, error = %e, "webhook fail-mark failed");
            }
        }
    }

    /// Transition the intent to CONFIRMED and credit the ledger. The
    /// conditional update is the at-most-once gate; an already-final intent
    /// makes this a no-op.
    pub async fn mark_deposit_confirmed(
        &self,
        reference: &str,
        provider_tx_id: &str,
    ) -> Result<(), PaymentError> {
        let confirmed: Option<(String, f64)> = {
            let conn = self.store.conn().await;
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE payment_intents
                 SET status = 'CONFIRMED', provider_tx_id = ?1, settled_at = ?2, updated_at = ?2
                 WHERE reference = ?3 AND status IN ('PENDING', 'PROCESSING')",
                params![provider_tx_id, now, reference],
            )?;
            if changed == 0 {
                None
            } else {
                conn.query_row(
                    "SELECT user_id, amount_usd FROM payment_intents WHERE reference = ?1",
                    params![reference],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
            }
        };
        let Some((user_id, amount_usd)) = confirmed else {
            return Ok(());
        };
        if user_id.is_empty() || amount_usd <= 0.0 {
            return Ok(());
        }

        self.ledger
            .credit_deposit(&user_id, amount_usd, reference, "MOMO_DEPOSIT")
            .await
            .map_err(|e| PaymentError::Internal(e.into()))?;
        self.bus.publish(
            &format!("payment:user:{user_id}"),
            serde_json::json!({
                "type": "DEPOSIT_CONFIRMED",
                "amount": amount_usd,
                "reference": reference,
            })
            .to_string(),
        );
        Ok(())
    }

    pub async fn mark_deposit_failed(&self, reference: &str) -> Result<(), PaymentError> {
        let conn = self.store.conn().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE payment_intents
             SET status = 'FAILED', settled_at = ?1, updated_at = ?1
             WHERE reference = ?2 AND status IN ('PENDING', 'PROCESSING')",
            params![now, reference],
        )?;
        Ok(())
    }

    /// Reconciliation poller: re-verify PENDING intents older than the
    /// reconciliation window. Together with the webhook's set-if-absent gate
    /// and the conditional transition this keeps the credit at-most-once.
    pub async fn run_deposit_poller(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("deposit reconciliation poller started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.poll_pending_deposits().await,
            }
        }
        info!("deposit reconciliation poller stopped");
    }

    async fn poll_pending_deposits(&self) {
        let cutoff = (Utc::now() - chrono::Duration::seconds(RECONCILE_AGE_SEC)).to_rfc3339();
        let pending: Vec<String> = {
            let conn = self.store.conn().await;
            let mut stmt = match conn.prepare(
                "SELECT reference FROM payment_intents
                 WHERE status = 'PENDING' AND intent_type = 'MOMO_DEPOSIT' AND created_at < ?1",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    warn!(error = %e, "deposit poller query failed");
                    return;
                }
            };
            stmt.query_map(params![cutoff], |row| row.get(0))
                .and_then(|rows| rows.collect())
                .unwrap_or_default()
        };

        for reference in pending {
            let tx = match self
                .provider
                .verify_transaction_by_reference(&reference, &reference)
                .await
            {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(reference = %reference, error = %e, "deposit verify failed");
                    continue;
                }
            };
            info!(reference = %reference, status = %tx.status, "deposit poller verified");
            let result = if tx.status.eq_ignore_ascii_case("successful") {
                self.mark_deposit_confirmed(&reference, &tx.flw_ref).await
            } else if tx.status.eq_ignore_ascii_case("failed") {
                self.mark_deposit_failed(&reference).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!(reference = %reference, error = %e, "deposit poller transition failed");
            }
        }
    }

    pub async fn get_intent(
        &self,
        user_id: &str,
        reference: &str,
    ) -> Result<Option<PaymentIntentRecord>, PaymentError> {
        let conn = self.store.conn().await;
        let intent = conn
            .query_row(
                "SELECT reference, user_id, intent_type, channel, phone, amount_usd, currency,
                        status, provider_tx_id, created_at, settled_at
                 FROM payment_intents
                 WHERE reference = ?1 AND user_id = ?2",
                params![reference, user_id],
                row_to_intent,
            )
            .optional()?;
        Ok(intent)
    }

    pub async fn list_history(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<PaymentIntentRecord>, PaymentError> {
        let conn = self.store.conn().await;
        let mut stmt = conn.prepare(
            "SELECT reference, user_id, intent_type, channel, phone, amount_usd, currency,
                    status, provider_tx_id, created_at, settled_at
             FROM payment_intents
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let intents = stmt
            .query_map(params![user_id, limit], row_to_intent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(intents)
    }

    fn channel_supported(&self, channel: &str) -> bool {
        self.cfg.momo_allowed_channels.is_empty()
            || self.cfg.momo_allowed_channels.iter().any(|c| c == channel)
    }
}

fn first_non_empty<'a>(a: &'a str, b: &'a str) -> &'a str {
    if !a.trim().is_empty() {
        a.trim()
    } else {
        b.trim()
    }
}

fn row_to_intent(row: &rusqlite::Row<'_>) -> Result<PaymentIntentRecord, rusqlite::Error> {
    Ok(PaymentIntentRecord {
        reference: row.get(0)?,
        user_id: row.get(1)?,
        intent_type: row.get(2)?,
        channel: row.get(3)?,
        phone: row.get(4)?,
        amount_usd: row.get(5)?,
        currency: row.get(6)?,
        status: row.get(7)?,
        provider_tx_id: row.get(8)?,
        created_at: row.get(9)?,
        settled_at: row.get(10)?,
    })
}
