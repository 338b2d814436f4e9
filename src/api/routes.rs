//! Route assembly and HTTP handlers.
//!
//! Three authentication zones: user-bearer routes under `/api/v1`, the
//! internal ledger surface under `/internal` guarded by the shared service
//! key, and HMAC-signed provider webhooks under `/webhooks`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::auth::{require_auth, require_internal_key, verify_webhook_signature, AuthedUser, TokenValidator};
use crate::bus::Bus;
use crate::ledger::{LedgerError, LedgerService};
use crate::middleware::request_logging;
use crate::models::Config;
use crate::payments::{
    CryptoService, CryptoWebhookPayload, MomoService, PaymentError, ProviderWebhookEvent,
    WithdrawalService,
};
use crate::session::SessionManager;

const PROVIDER_SIGNATURE_HEADER: &str = "flw-signature";
const INDEXER_SIGNATURE_HEADER: &str = "x-tatum-signature";

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub bus: Bus,
    pub ledger: LedgerService,
    pub sessions: Arc<SessionManager>,
    pub momo: Arc<MomoService>,
    pub crypto: Arc<CryptoService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub validator: Arc<TokenValidator>,
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::InvalidAmount => StatusCode::BAD_REQUEST,
            LedgerError::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::ReservationNotFound => StatusCode::NOT_FOUND,
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route("/api/v1/wallet/balance", get(get_balance))
        .route("/api/v1/wallet/ledger", get(get_ledger))
        .route("/api/v1/wallet/withdrawals", get(get_ledger_withdrawals))
        .route("/api/v1/payments/momo/deposit", post(momo_deposit))
        .route("/api/v1/payments/momo/status/:reference", get(momo_status))
        .route("/api/v1/payments/momo/withdraw", post(momo_withdraw))
        .route("/api/v1/payments/crypto/address", post(crypto_address))
        .route("/api/v1/payments/crypto/check", post(crypto_manual_check))
        .route("/api/v1/payments/crypto/status/:tx_hash", get(crypto_status))
        .route("/api/v1/payments/history", get(payment_history))
        .route("/api/v1/payments/withdrawals", get(payment_withdrawals))
        .route("/api/v1/games/history", get(game_history))
        .route("/api/v1/games/session/:id", get(game_session))
        .route("/ws", get(super::ws::game_socket))
        .route("/ws/payments", get(super::ws::payments_socket))
        .route_layer(from_fn_with_state(state.validator.clone(), require_auth));

    let internal_key = Arc::new(state.cfg.internal_service_key.clone());
    let internal_routes = Router::new()
        .route("/internal/ledger/credit", post(internal_credit))
        .route(
            "/internal/ledger/reserve-withdrawal",
            post(internal_reserve_withdrawal),
        )
        .route(
            "/internal/ledger/release-withdrawal",
            post(internal_release_withdrawal),
        )
        .route("/internal/ledger/reserve-bet", post(internal_reserve_bet))
        .route("/internal/ledger/settle-game", post(internal_settle_game))
        .route(
            "/internal/crypto/wallets/generate-all",
            post(internal_generate_wallets),
        )
        .route(
            "/internal/payments/withdrawals/pending/:user_id",
            get(internal_pending_withdrawals),
        )
        .route_layer(from_fn_with_state(internal_key, require_internal_key));

    let webhook_routes = Router::new()
        .route("/webhooks/payment/flutterwave", post(provider_deposit_webhook))
        .route(
            "/webhooks/payment/flutterwave/withdrawal",
            post(provider_withdrawal_webhook),
        )
        .route("/webhooks/payment/crypto", post(crypto_webhook));

    Router::new()
        .route("/health", get(health))
        .merge(user_routes)
        .merge(internal_routes)
        .merge(webhook_routes)
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "playgrid-backend",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ===== Wallet =====

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    page: Option<i64>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

fn page_bounds(query: &PageQuery, default_limit: i64, max_limit: i64) -> (i64, i64, i64) {
    let mut limit = query.limit.unwrap_or(default_limit);
    if limit <= 0 || limit > max_limit {
        limit = default_limit;
    }
    let page = query.page.unwrap_or(1).max(1);
    (limit, page, (page - 1) * limit)
}

fn clamp_limit(raw: Option<i64>, default_limit: i64, max_limit: i64) -> i64 {
    match raw {
        Some(limit) if limit > 0 && limit <= max_limit => limit,
        _ => default_limit,
    }
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Response, LedgerError> {
    let balance = state.ledger.get_balance(&user.user_id).await?;
    Ok(Json(balance).into_response())
}

async fn get_ledger(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<PageQuery>,
) -> Result<Response, LedgerError> {
    let (limit, page, offset) = page_bounds(&query, 25, 100);
    let entries = state.ledger.list_ledger(&user.user_id, limit, offset).await?;
    Ok(Json(serde_json::json!({
        "entries": entries,
        "page": page,
        "limit": limit,
    }))
    .into_response())
}

async fn get_ledger_withdrawals(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<LimitQuery>,
) -> Result<Response, LedgerError> {
    let limit = clamp_limit(query.limit, 20, 50);
    let items = state.ledger.list_withdrawals(&user.user_id, limit).await?;
    Ok(Json(serde_json::json!({ "items": items })).into_response())
}

// ===== Mobile money =====

#[derive(Deserialize)]
struct MomoRequest {
    #[serde(default)]
    phone: String,
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    channel: String,
}

async fn momo_deposit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<MomoRequest>,
) -> Result<Response, PaymentError> {
    let out = state
        .momo
        .initiate_deposit(&user.user_id, &body.phone, body.amount, &body.channel)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(out)).into_response())
}

async fn momo_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(reference): Path<String>,
) -> Result<Response, PaymentError> {
    let intent = state
        .momo
        .get_intent(&user.user_id, &reference)
        .await?
        .ok_or(PaymentError::NotFound)?;
    Ok(Json(intent).into_response())
}

async fn momo_withdraw(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<MomoRequest>,
) -> Result<Response, PaymentError> {
    let out = state
        .withdrawals
        .initiate(&user.user_id, &body.phone, body.amount, &body.channel)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(out)).into_response())
}

async fn payment_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<LimitQuery>,
) -> Result<Response, PaymentError> {
    let limit = clamp_limit(query.limit, 20, 100);
    let items = state.momo.list_history(&user.user_id, limit).await?;
    Ok(Json(serde_json::json!({ "items": items })).into_response())
}

async fn payment_withdrawals(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<LimitQuery>,
) -> Result<Response, PaymentError> {
    let limit = clamp_limit(query.limit, 20, 100);
    let items = state.withdrawals.list(&user.user_id, limit).await?;
    Ok(Json(serde_json::json!({ "items": items })).into_response())
}

// ===== Crypto =====

#[derive(Deserialize)]
struct CryptoAddressRequest {
    #[serde(default)]
    coin: String,
    #[serde(default)]
    network: String,
}

async fn crypto_address(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<CryptoAddressRequest>,
) -> Result<Response, PaymentError> {
    let address = state
        .crypto
        .ensure_address(&user.user_id, &body.coin, &body.network)
        .await?;
    Ok(Json(address).into_response())
}

#[derive(Deserialize)]
struct ManualCheckRequest {
    #[serde(default)]
    coin: String,
    #[serde(default)]
    address: String,
}

async fn crypto_manual_check(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<ManualCheckRequest>,
) -> Result<Response, PaymentError> {
    if body.coin.is_empty() || body.address.is_empty() {
        return Err(PaymentError::Validation(
            "coin and address are required".into(),
        ));
    }
    let result = state
        .crypto
        .manual_check(&user.user_id, &body.coin, &body.address)
        .await?;
    Ok(Json(result).into_response())
}

async fn crypto_status(
    State(state): State<AppState>,
    Extension(_user): Extension<AuthedUser>,
    Path(tx_hash): Path<String>,
) -> Result<Response, PaymentError> {
    let deposit = state
        .crypto
        .get_deposit(&tx_hash)
        .await?
        .ok_or(PaymentError::NotFound)?;
    Ok(Json(deposit).into_response())
}

// ===== Games =====

async fn game_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<PageQuery>,
) -> Result<Response, PaymentError> {
    let (limit, page, offset) = page_bounds(&query, 20, 100);
    let items = state
        .sessions
        .list_history(&user.user_id, limit, offset)
        .await
        .map_err(PaymentError::Internal)?;
    Ok(Json(serde_json::json!({
        "items": items,
        "page": page,
        "limit": limit,
    }))
    .into_response())
}

async fn game_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> Result<Response, PaymentError> {
    let session = state
        .sessions
        .get_session(&user.user_id, &session_id)
        .await
        .map_err(PaymentError::Internal)?
        .ok_or(PaymentError::NotFound)?;
    Ok(Json(session).into_response())
}

// ===== Internal ledger surface =====

#[derive(Deserialize)]
struct InternalCreditBody {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(rename = "amountUsd", default)]
    amount_usd: f64,
    #[serde(default)]
    reference: String,
    #[serde(default)]
    source: String,
}

async fn internal_credit(
    State(state): State<AppState>,
    Json(body): Json<InternalCreditBody>,
) -> Result<Response, LedgerError> {
    if body.user_id.is_empty() {
        return Err(LedgerError::InvalidAmount);
    }
    let balance = state
        .ledger
        .credit_deposit(&body.user_id, body.amount_usd, &body.reference, &body.source)
        .await?;
    Ok(Json(balance).into_response())
}

#[derive(Deserialize)]
struct InternalWithdrawalBody {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(rename = "withdrawalId", default)]
    withdrawal_id: String,
    #[serde(rename = "amountUsd", default)]
    amount_usd: f64,
    #[serde(default)]
    success: bool,
}

async fn internal_reserve_withdrawal(
    State(state): State<AppState>,
    Json(body): Json<InternalWithdrawalBody>,
) -> Result<Response, LedgerError> {
    if body.user_id.is_empty() || body.withdrawal_id.is_empty() {
        return Err(LedgerError::InvalidAmount);
    }
    let balance = state
        .ledger
        .reserve_withdrawal(&body.user_id, &body.withdrawal_id, body.amount_usd)
        .await?;
    Ok(Json(balance).into_response())
}

async fn internal_release_withdrawal(
    State(state): State<AppState>,
    Json(body): Json<InternalWithdrawalBody>,
) -> Result<Response, LedgerError> {
    if body.user_id.is_empty() || body.withdrawal_id.is_empty() {
        return Err(LedgerError::ReservationNotFound);
    }
    let balance = state
        .ledger
        .release_withdrawal(&body.user_id, &body.withdrawal_id, body.success)
        .await?;
    Ok(Json(balance).into_response())
}

#[derive(Deserialize)]
struct InternalBetBody {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(rename = "sessionId", default)]
    session_id: String,
    #[serde(rename = "amountUsd", default)]
    amount_usd: f64,
    #[serde(rename = "traceId", default)]
    trace_id: String,
}

async fn internal_reserve_bet(
    State(state): State<AppState>,
    Json(body): Json<InternalBetBody>,
) -> Result<Response, LedgerError> {
    if body.user_id.is_empty() || body.session_id.is_empty() {
        return Err(LedgerError::InvalidAmount);
    }
    let balance = state
        .ledger
        .reserve_bet(&body.user_id, &body.session_id, body.amount_usd, &body.trace_id)
        .await?;
    Ok(Json(balance).into_response())
}

#[derive(Deserialize)]
struct InternalSettleBody {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(rename = "sessionId", default)]
    session_id: String,
    #[serde(default)]
    outcome: String,
    #[serde(rename = "stakeUsd", default)]
    stake_usd: f64,
    #[serde(rename = "payoutUsd", default)]
    payout_usd: f64,
    #[serde(rename = "traceId", default)]
    trace_id: String,
}

async fn internal_settle_game(
    State(state): State<AppState>,
    Json(body): Json<InternalSettleBody>,
) -> Result<Response, LedgerError> {
    if body.user_id.is_empty() || body.session_id.is_empty() || body.outcome.is_empty() {
        return Err(LedgerError::ReservationNotFound);
    }
    let balance = state
        .ledger
        .settle_game(
            &body.user_id,
            &body.session_id,
            &body.outcome,
            body.stake_usd,
            body.payout_usd,
            &body.trace_id,
        )
        .await?;
    Ok(Json(balance).into_response())
}

#[derive(Deserialize)]
struct GenerateWalletsBody {
    #[serde(rename = "userId", default)]
    user_id: String,
}

async fn internal_generate_wallets(
    State(state): State<AppState>,
    Json(body): Json<GenerateWalletsBody>,
) -> Result<Response, PaymentError> {
    if body.user_id.is_empty() {
        return Err(PaymentError::Validation("userId is required".into()));
    }
    let wallets = state.crypto.generate_all(&body.user_id).await;
    Ok(Json(serde_json::json!({
        "userId": body.user_id,
        "wallets": wallets,
    }))
    .into_response())
}

async fn internal_pending_withdrawals(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Response, PaymentError> {
    let items = state.withdrawals.list_pending(&user_id).await?;
    Ok(Json(serde_json::json!({ "items": items })).into_response())
}

// ===== Webhooks =====

async fn provider_deposit_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !verify_webhook_signature(
        &headers,
        PROVIDER_SIGNATURE_HEADER,
        &body,
        &state.cfg.provider_webhook_secret,
    ) {
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }
    let Ok(event) = serde_json::from_slice::<ProviderWebhookEvent>(&body) else {
        return (StatusCode::BAD_REQUEST, "bad payload").into_response();
    };
    state.momo.handle_deposit_event(event).await;
    StatusCode::OK.into_response()
}

async fn provider_withdrawal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !verify_webhook_signature(
        &headers,
        PROVIDER_SIGNATURE_HEADER,
        &body,
        &state.cfg.provider_webhook_secret,
    ) {
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }
    let Ok(event) = serde_json::from_slice::<ProviderWebhookEvent>(&body) else {
        return (StatusCode::BAD_REQUEST, "bad payload").into_response();
    };
    state.withdrawals.handle_transfer_event(event).await;
    StatusCode::OK.into_response()
}

async fn crypto_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !verify_webhook_signature(
        &headers,
        INDEXER_SIGNATURE_HEADER,
        &body,
        &state.cfg.indexer_webhook_secret,
    ) {
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }
    let payload = match serde_json::from_slice::<CryptoWebhookPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "invalid crypto webhook payload");
            return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
        }
    };
    state.crypto.handle_webhook(payload).await;
    StatusCode::OK.into_response()
}
