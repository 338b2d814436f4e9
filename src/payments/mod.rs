//! External settlement adapters: mobile-money deposits and withdrawals,
//! crypto deposits, and the provider/indexer clients they talk to.

mod crypto;
mod flutterwave;
mod momo;
mod tatum;
mod withdrawals;

pub use crypto::{
    ChainTransaction, CryptoAddress, CryptoDepositRecord, CryptoService, CryptoWebhookPayload,
    ManualCheckResult,
};
pub use flutterwave::{FlutterwaveClient, ProviderWebhookEvent};
pub use momo::{DepositInitiation, MomoService, PaymentIntentRecord};
pub use tatum::TatumClient;
pub use withdrawals::{WithdrawalInitiation, WithdrawalRequestRecord, WithdrawalService};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

/// Error taxonomy shared by the payment adapters. Maps onto the HTTP codes
/// the surface exposes.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InsufficientFunds(String),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Gateway(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for PaymentError {
    fn from(err: rusqlite::Error) -> Self {
        PaymentError::Internal(err.into())
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PaymentError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            PaymentError::InsufficientFunds(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            PaymentError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            PaymentError::Gateway(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            PaymentError::Internal(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Collapse spaces and dashes out of a phone number.
pub(crate) fn normalize_phone(phone: &str) -> String {
    phone
        .trim()
        .chars()
        .filter(|c| *c != ' ' && *c != '-')
        .collect()
}

/// Map loose channel spellings onto the closed channel set.
pub(crate) fn normalize_channel(channel: &str) -> String {
    let channel = channel.trim().to_lowercase();
    if channel.is_empty() || channel.ends_with("-gh") {
        return channel;
    }
    match channel.as_str() {
        "mtn" => "mtn-gh".to_string(),
        "vodafone" | "telecel" => "vodafone-gh".to_string(),
        "airteltigo" | "airtel" | "tigo" => "airteltigo-gh".to_string(),
        other => other.to_string(),
    }
}

/// Provider-side network code for a channel.
pub(crate) fn network_from_channel(channel: &str) -> String {
    match channel {
        "mtn-gh" | "mtn" => "MTN".to_string(),
        "vodafone-gh" | "vodafone" | "telecel-gh" | "telecel" => "VODAFONE".to_string(),
        "airteltigo-gh" | "airteltigo" | "airtel" | "tigo" => "TIGO".to_string(),
        other => other.trim_end_matches("-gh").to_uppercase(),
    }
}

/// Round to the two-decimal accounting unit.
pub(crate) fn round_money(amount: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    (amount * 100.0).round() / 100.0
}

pub(crate) fn short_id(id: &str) -> &str {
    if id.len() <= 8 {
        id
    } else {
        &id[..8]
    }
}

/// Monotonic suffix for client references.
pub(crate) fn reference_nonce() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone_strips_separators() {
        assert_eq!(normalize_phone(" 024-123 4567 "), "0241234567");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn test_normalize_channel_aliases() {
        assert_eq!(normalize_channel("MTN"), "mtn-gh");
        assert_eq!(normalize_channel("vodafone"), "vodafone-gh");
        assert_eq!(normalize_channel("telecel"), "vodafone-gh");
        assert_eq!(normalize_channel("airtel"), "airteltigo-gh");
        assert_eq!(normalize_channel("mtn-gh"), "mtn-gh");
        assert_eq!(normalize_channel("  "), "");
    }

    #[test]
    fn test_network_from_channel() {
        assert_eq!(network_from_channel("mtn-gh"), "MTN");
        assert_eq!(network_from_channel("vodafone-gh"), "VODAFONE");
        assert_eq!(network_from_channel("airteltigo-gh"), "TIGO");
        assert_eq!(network_from_channel("custom-gh"), "CUSTOM");
    }

    #[test]
    fn test_round_money() {
        assert_eq!(round_money(10.005), 10.01);
        assert_eq!(round_money(10.004), 10.0);
        assert_eq!(round_money(-3.0), 0.0);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("abcdefghij"), "abcdefgh");
        assert_eq!(short_id("abc"), "abc");
    }
}
