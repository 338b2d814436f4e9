//! WebSocket endpoints: game session events and payment pushes.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    Extension,
};
use chrono::Utc;
use tracing::debug;

use super::routes::AppState;
use crate::auth::AuthedUser;
use crate::session::{BetError, PlaceBetRequest};

pub async fn game_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Response {
    ws.on_upgrade(move |socket| handle_game_socket(socket, state, user.user_id))
}

async fn handle_game_socket(mut socket: WebSocket, state: AppState, user_id: String) {
    let (mut events, _guard) = state.sessions.subscribe(&user_id);

    let greeting = serde_json::json!({
        "type": "CONNECTED",
        "userId": user_id,
        "connectedAt": Utc::now(),
    });
    if socket.send(Message::Text(greeting.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = events.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = String::from_utf8(frame) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let reply = handle_client_message(&state, &user_id, &text).await;
                if socket.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(user = %user_id, "game socket closed");
}

async fn handle_client_message(
    state: &AppState,
    user_id: &str,
    text: &str,
) -> serde_json::Value {
    #[derive(serde::Deserialize)]
    struct Envelope {
        #[serde(rename = "type", default)]
        message_type: String,
        #[serde(rename = "traceId", default)]
        trace_id: String,
    }

    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        return serde_json::json!({ "type": "ERROR", "message": "invalid payload" });
    };

    match envelope.message_type.as_str() {
        "PLACE_BET" => {
            let Ok(req) = serde_json::from_str::<PlaceBetRequest>(text) else {
                return serde_json::json!({ "type": "ERROR", "message": "bad bet payload" });
            };
            match state.sessions.place_bet(user_id, req).await {
                Ok(ack) => serde_json::json!({
                    "type": "BET_ACCEPTED",
                    "sessionId": ack.session_id,
                    "stakeUsd": ack.stake_usd,
                    "newBalance": ack.new_balance,
                    "traceId": ack.trace_id,
                }),
                Err(err) => {
                    let reason = match &err {
                        BetError::InvalidStake => err.to_string(),
                        BetError::Rejected(reason) => reason.clone(),
                    };
                    serde_json::json!({
                        "type": "BET_REJECTED",
                        "reason": reason,
                        "traceId": envelope.trace_id,
                    })
                }
            }
        }
        "PING" => serde_json::json!({ "type": "PONG" }),
        _ => serde_json::json!({ "type": "ERROR", "message": "unknown message type" }),
    }
}

pub async fn payments_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Response {
    ws.on_upgrade(move |socket| handle_payments_socket(socket, state, user.user_id))
}

async fn handle_payments_socket(mut socket: WebSocket, state: AppState, user_id: String) {
    let topic = format!("payment:user:{user_id}");
    let (mut events, _guard) = state.bus.psubscribe(&topic);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if socket.send(Message::Text(event.payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!(user = %user_id, "payments socket closed");
}
