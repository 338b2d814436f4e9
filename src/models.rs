//! Shared wire types and application configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order message pushed onto the trade queue by the session manager and
/// consumed by the execution pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOrder {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "gameType")]
    pub game_type: String,
    #[serde(rename = "stakeUsd")]
    pub stake_usd: f64,
    #[serde(default)]
    pub prediction: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "traceId", default)]
    pub trace_id: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,
}

/// Outcome message published by the execution pool on the per-session topic
/// and fanned out to the user's WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "gameType", default)]
    pub game_type: String,
    pub outcome: String,
    #[serde(rename = "payoutUsd")]
    pub payout_usd: f64,
    #[serde(rename = "stakeUsd")]
    pub stake_usd: f64,
    #[serde(rename = "newBalance")]
    pub new_balance: f64,
    #[serde(rename = "traceId", default)]
    pub trace_id: String,
    #[serde(rename = "contractId", default)]
    pub contract_id: String,
}

/// Snapshot of a user balance as returned by every ledger operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "availableUsd")]
    pub available_usd: f64,
    #[serde(rename = "reservedUsd")]
    pub reserved_usd: f64,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Envelope for frames pushed to game/payment WebSocket clients.
pub fn ws_message<T: Serialize>(message_type: &str, payload: T) -> serde_json::Value {
    serde_json::json!({
        "type": message_type,
        "payload": payload,
    })
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,

    pub internal_service_key: String,
    pub jwt_public_key_path: String,
    pub jwt_issuer: String,

    // Bet pipeline
    pub order_queue: String,
    pub outcome_prefix: String,
    pub stale_sweep_sec: u64,
    pub stale_refund_sec: u64,

    // Execution pool
    pub min_settle_ms: u64,
    pub max_settle_ms: u64,
    pub payout_multiplier: f64,
    pub bounce_rate: f64,
    pub profit_target_usd: f64,
    pub win_rake_rate: f64,
    pub upstream_tokens: Vec<String>,
    pub upstream_app_id: String,
    pub upstream_url: String,
    pub upstream_symbol: String,

    // Mobile money provider
    pub provider_secret_key: String,
    pub provider_base_url: String,
    pub provider_transfer_base_url: String,
    pub provider_webhook_secret: String,
    pub provider_charge_callback: String,
    pub provider_transfer_callback: String,
    pub momo_allowed_channels: Vec<String>,
    pub momo_default_currency: String,

    // Crypto indexer
    pub indexer_api_key: String,
    pub indexer_base_url: String,
    pub indexer_webhook_secret: String,
    pub btc_xpub: String,
    pub eth_xpub: String,
    pub tron_xpub: String,
    pub indexer_testnet: bool,
    pub crypto_watcher_interval_sec: u64,
    pub crypto_webhook_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let provider_base = env_str("PROVIDER_BASE_URL", "https://api.flutterwave.com");

        Self {
            port: env_parse("PORT", 8080),
            database_path: env_str("DATABASE_PATH", "./playgrid.db"),

            internal_service_key: env_str("INTERNAL_SERVICE_KEY", "dev-internal-key"),
            jwt_public_key_path: env_str("JWT_PUBLIC_KEY_PATH", "/run/secrets/jwt_public.pem"),
            jwt_issuer: env_str("JWT_ISSUER", "playgrid-auth"),

            order_queue: env_str("TRADE_ORDER_QUEUE", "trade:orders"),
            outcome_prefix: env_str("GAME_OUTCOME_PREFIX", "game:outcome"),
            stale_sweep_sec: env_parse("GAME_STALE_SWEEP_INTERVAL_SECONDS", 20),
            stale_refund_sec: env_parse("GAME_STALE_REFUND_SECONDS", 90),

            min_settle_ms: env_parse("MIN_SETTLE_MS", 1500),
            max_settle_ms: env_parse("MAX_SETTLE_MS", 4500),
            payout_multiplier: env_parse("PAYOUT_MULTIPLIER", 1.9),
            bounce_rate: env_parse("BOUNCE_RATE", 0.0),
            profit_target_usd: env_parse("PROFIT_TARGET_USD", 0.0),
            win_rake_rate: env_parse("WIN_RAKE_RATE", 0.0),
            upstream_tokens: load_upstream_tokens(),
            upstream_app_id: env_str("UPSTREAM_APP_ID", ""),
            upstream_url: env_str("UPSTREAM_WS_URL", "wss://ws.binaryws.com/websockets/v3"),
            upstream_symbol: env_str("UPSTREAM_SYMBOL", "R_50"),

            provider_secret_key: env_str("PROVIDER_SECRET_KEY", ""),
            provider_transfer_base_url: env_str("PROVIDER_TRANSFERS_BASE_URL", &provider_base),
            provider_base_url: provider_base,
            provider_webhook_secret: env_str("PROVIDER_WEBHOOK_SECRET", ""),
            provider_charge_callback: env_str(
                "PROVIDER_CHARGE_CALLBACK_URL",
                "https://api.playgrid.io/webhooks/payment/flutterwave",
            ),
            provider_transfer_callback: env_str(
                "PROVIDER_TRANSFER_CALLBACK_URL",
                "https://api.playgrid.io/webhooks/payment/flutterwave/withdrawal",
            ),
            momo_allowed_channels: split_csv(&env_str(
                "MOMO_ALLOWED_CHANNELS",
                "mtn-gh,vodafone-gh,airteltigo-gh",
            )),
            momo_default_currency: env_str("MOMO_DEFAULT_CURRENCY", "GHS"),

            indexer_api_key: env_str("INDEXER_API_KEY", ""),
            indexer_base_url: env_str("INDEXER_BASE_URL", "https://api.tatum.io"),
            indexer_webhook_secret: env_str("INDEXER_WEBHOOK_SECRET", ""),
            btc_xpub: env_str("BTC_XPUB", ""),
            eth_xpub: env_str("ETH_XPUB", ""),
            tron_xpub: env_str("TRON_XPUB", ""),
            indexer_testnet: env_str("INDEXER_TESTNET", "false").eq_ignore_ascii_case("true"),
            crypto_watcher_interval_sec: env_parse("CRYPTO_WATCHER_INTERVAL_SECONDS", 60),
            crypto_webhook_url: env_str(
                "CRYPTO_WEBHOOK_URL",
                "https://api.playgrid.io/webhooks/payment/crypto",
            ),
        }
    }
}

fn env_str(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(fallback)
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Upstream account tokens are supplied as `UPSTREAM_ACCOUNT_<N>_TOKEN`
/// variables and consumed in index order.
fn load_upstream_tokens() -> Vec<String> {
    let mut pairs: Vec<(u32, String)> = Vec::new();
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix("UPSTREAM_ACCOUNT_") else {
            continue;
        };
        let Some(idx) = rest.strip_suffix("_TOKEN") else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        if let Ok(idx) = idx.parse::<u32>() {
            pairs.push((idx, value));
        }
    }
    pairs.sort_by_key(|(idx, _)| *idx);
    pairs.into_iter().map(|(_, token)| token).collect()
}
