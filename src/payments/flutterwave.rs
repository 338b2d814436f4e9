//! Mobile-money provider client (Flutterwave dialect).
//!
//! Wraps the subset of the provider surface the gateway needs: push-prompt
//! charges, transaction verification, transfers and transfer lookup. With no
//! secret key configured the client fabricates responses locally so the full
//! flow stays exercisable in development.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 2;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct FlutterwaveClient {
    secret_key: String,
    base_url: String,
    transfer_base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct MobileMoneyChargeRequest {
    pub reference: String,
    pub amount: f64,
    pub currency: String,
    pub email: String,
    pub full_name: String,
    pub phone_number: String,
    pub network: String,
    pub narration: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Authorization {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub redirect: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChargeResponse {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tx_ref: String,
    #[serde(default)]
    pub flw_ref: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(skip)]
    pub authorization: Option<Authorization>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tx_ref: String,
    #[serde(default)]
    pub flw_ref: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub reference: String,
    pub amount: f64,
    pub currency: String,
    pub debit_currency: String,
    pub account_bank: String,
    pub account_number: String,
    pub narration: String,
    pub callback_url: String,
    pub beneficiary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferResponse {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub flw_ref: String,
}

/// Provider webhook body, shared by charge and transfer notifications.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderWebhookEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub data: ProviderWebhookData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderWebhookData {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tx_ref: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub flw_ref: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    meta: serde_json::Value,
}

impl FlutterwaveClient {
    pub fn new(secret_key: String, base_url: String, transfer_base_url: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let transfer_base_url = if transfer_base_url.is_empty() {
            base_url.clone()
        } else {
            transfer_base_url.trim_end_matches('/').to_string()
        };
        Self {
            secret_key,
            base_url,
            transfer_base_url,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    fn simulated(&self) -> bool {
        self.secret_key.is_empty()
    }

    /// Trigger a mobile-money push prompt on the user's phone.
    pub async fn charge_mobile_money(
        &self,
        req: MobileMoneyChargeRequest,
        trace_id: &str,
    ) -> Result<ChargeResponse> {
        if self.simulated() {
            info!(trace = trace_id, reference = %req.reference, amount = req.amount, "simulated charge");
            return Ok(ChargeResponse {
                id: chrono::Utc::now().timestamp(),
                status: "pending".into(),
                tx_ref: req.reference.clone(),
                flw_ref: format!("SIM-{}", req.reference),
                amount: req.amount,
                currency: req.currency,
                authorization: None,
            });
        }

        let mut payload = serde_json::json!({
            "tx_ref": req.reference,
            "amount": req.amount,
            "currency": req.currency,
            "email": req.email,
            "fullname": req.full_name,
            "phone_number": req.phone_number,
            "network": req.network.to_uppercase(),
        });
        if !req.narration.is_empty() {
            payload["narration"] = req.narration.clone().into();
        }
        if !req.callback_url.is_empty() {
            payload["callback_url"] = req.callback_url.clone().into();
        }

        let url = format!("{}/v3/charges?type=mobile_money_ghana", self.base_url);
        let envelope = self
            .request_with_retry(reqwest::Method::POST, &url, Some(payload), trace_id)
            .await?;
        let mut charge: ChargeResponse =
            serde_json::from_value(envelope.data).context("decode charge response")?;
        if let Ok(auth) =
            serde_json::from_value::<Authorization>(envelope.meta["authorization"].clone())
        {
            charge.authorization = Some(auth);
        }
        Ok(charge)
    }

    /// Look up a transaction by our client reference.
    pub async fn verify_transaction_by_reference(
        &self,
        reference: &str,
        trace_id: &str,
    ) -> Result<Transaction> {
        if self.simulated() {
            info!(trace = trace_id, reference, "simulated verify");
            return Ok(Transaction {
                status: "successful".into(),
                tx_ref: reference.to_string(),
                ..Default::default()
            });
        }
        let url = format!(
            "{}/v3/transactions/verify_by_reference?tx_ref={}",
            self.base_url,
            urlencode(reference)
        );
        let envelope = self
            .request_with_retry(reqwest::Method::GET, &url, None, trace_id)
            .await?;
        if envelope.data.is_null() {
            bail!("provider verify: empty response for {reference}");
        }
        serde_json::from_value(envelope.data).context("decode transaction")
    }

    /// Initiate a payout transfer to a mobile wallet.
    pub async fn initiate_transfer(
        &self,
        req: TransferRequest,
        trace_id: &str,
    ) -> Result<TransferResponse> {
        if self.simulated() {
            info!(trace = trace_id, reference = %req.reference, amount = req.amount, "simulated transfer");
            return Ok(TransferResponse {
                id: chrono::Utc::now().timestamp(),
                status: "pending".into(),
                reference: req.reference.clone(),
                amount: req.amount,
                currency: req.currency,
                flw_ref: format!("SIM-{}", req.reference),
            });
        }

        let mut payload = serde_json::json!({
            "account_bank": req.account_bank.to_uppercase(),
            "account_number": req.account_number,
            "amount": req.amount,
            "currency": req.currency,
            "reference": req.reference,
            "narration": req.narration,
        });
        if !req.debit_currency.is_empty() {
            payload["debit_currency"] = req.debit_currency.clone().into();
        }
        if !req.callback_url.is_empty() {
            payload["callback_url"] = req.callback_url.clone().into();
        }
        if !req.beneficiary.is_empty() {
            payload["beneficiary_name"] = req.beneficiary.clone().into();
        }

        let url = format!("{}/v3/transfers", self.transfer_base_url);
        let envelope = self
            .request_with_retry(reqwest::Method::POST, &url, Some(payload), trace_id)
            .await?;
        serde_json::from_value(envelope.data).context("decode transfer response")
    }

    /// Fetch a transfer's current state by our reference.
    pub async fn get_transfer_by_reference(
        &self,
        reference: &str,
        trace_id: &str,
    ) -> Result<TransferResponse> {
        if self.simulated() {
            info!(trace = trace_id, reference, "simulated transfer lookup");
            return Ok(TransferResponse {
                status: "successful".into(),
                reference: reference.to_string(),
                ..Default::default()
            });
        }
        let url = format!(
            "{}/v3/transfers?reference={}",
            self.transfer_base_url,
            urlencode(reference)
        );
        let envelope = self
            .request_with_retry(reqwest::Method::GET, &url, None, trace_id)
            .await?;
        let transfers: Vec<TransferResponse> =
            serde_json::from_value(envelope.data).unwrap_or_default();
        transfers
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("transfer not found for {reference}"))
    }

    /// One provider call with bounded retries. Only 5xx responses are
    /// retried; 4xx answers are permanent and surface immediately.
    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        url: &str,
        payload: Option<serde_json::Value>,
        trace_id: &str,
    ) -> Result<ApiEnvelope> {
        let mut last_err = anyhow!("provider request not attempted");
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * attempt as u64);
                warn!(trace = trace_id, attempt, url, "retrying provider call");
                tokio::time::sleep(backoff).await;
            }
            match self.request_once(method.clone(), url, payload.clone(), trace_id).await {
                Ok(envelope) => return Ok(envelope),
                Err(RequestError::Transient(err)) => last_err = err,
                Err(RequestError::Permanent(err)) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn request_once(
        &self,
        method: reqwest::Method,
        url: &str,
        payload: Option<serde_json::Value>,
        trace_id: &str,
    ) -> std::result::Result<ApiEnvelope, RequestError> {
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(&self.secret_key);
        if let Some(payload) = payload {
            builder = builder.json(&payload);
        }
        let response = builder.send().await.map_err(|e| {
            warn!(trace = trace_id, url, error = %e, "provider network error");
            RequestError::Transient(e.into())
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RequestError::Transient(e.into()))?;
        if status.is_server_error() {
            return Err(RequestError::Transient(anyhow!(
                "provider http {status}: {body}"
            )));
        }
        if !status.is_success() {
            return Err(RequestError::Permanent(anyhow!(
                "provider http {status}: {body}"
            )));
        }
        let envelope: ApiEnvelope = serde_json::from_str(&body)
            .map_err(|e| RequestError::Permanent(anyhow!("decode provider response: {e}")))?;
        if !envelope.status.eq_ignore_ascii_case("success") {
            return Err(RequestError::Permanent(anyhow!(
                "provider error: {}",
                envelope.message
            )));
        }
        Ok(envelope)
    }
}

enum RequestError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

fn urlencode(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                c.to_string()
                    .bytes()
                    .map(|b| format!("%{b:02X}"))
                    .collect::<String>()
            }
        })
        .collect()
}
