//! Proposal construction from the order's open prediction bag.
//!
//! The prediction dictionary arrives as loose JSON from the client; values
//! may be strings, numbers or booleans. The typed getters coerce forgivingly
//! (a numeric-looking string is a number); anything unparseable is treated
//! as absent and rejected at proposal-build time if required.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{Config, TradeOrder};

#[derive(Debug, Clone, Serialize)]
pub struct LimitOrder {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
}

/// Proposal request sent to the upstream venue.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest {
    pub proposal: u8,
    pub amount: f64,
    pub basis: String,
    pub contract_type: String,
    pub currency: String,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_order: Option<LimitOrder>,
    pub passthrough: Value,
}

pub fn read_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn read_f64(map: &Map<String, Value>, key: &str) -> Option<f64> {
    match map.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn read_i64(map: &Map<String, Value>, key: &str) -> Option<i64> {
    match map.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f.round() as i64)),
        _ => None,
    }
}

/// Build the venue proposal for an order.
pub fn build_proposal(order: &TradeOrder, cfg: &Config) -> Result<ProposalRequest> {
    let pred = &order.prediction;

    let contract_type = read_string(pred, "contractType")
        .map(|s| s.to_uppercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_contract_type(order));
    if contract_type.is_empty() {
        bail!("missing contractType in prediction");
    }
    if order.stake_usd <= 0.0 {
        bail!("invalid stake amount {:.2}", order.stake_usd);
    }

    let basis = match read_string(pred, "basis") {
        Some(b) if b.eq_ignore_ascii_case("payout") => "payout",
        _ => "stake",
    };
    let symbol = read_string(pred, "symbol")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| cfg.upstream_symbol.clone());
    let currency = read_string(pred, "currency")
        .map(|c| c.to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "USD".to_string());

    let mut req = ProposalRequest {
        proposal: 1,
        amount: order.stake_usd,
        basis: basis.to_string(),
        contract_type,
        currency,
        symbol,
        duration: None,
        duration_unit: None,
        barrier: None,
        barrier2: None,
        multiplier: None,
        limit_order: None,
        passthrough: serde_json::json!({
            "sessionId": order.session_id,
            "userId": order.user_id,
        }),
    };

    assign_duration(pred, &mut req);
    normalize_duration(&mut req);

    if let Some(barrier) = read_string(pred, "barrier").filter(|b| !b.is_empty()) {
        req.barrier = Some(barrier);
    }
    if let Some(high) = read_f64(pred, "barrierHigh") {
        req.barrier = Some(format_barrier(high));
    }
    if let Some(low) = read_f64(pred, "barrierLow") {
        req.barrier2 = Some(format_barrier(low));
    }

    if let Some(multiplier) = read_f64(pred, "multiplier") {
        req.multiplier = Some(multiplier);
    }
    let take_profit = read_f64(pred, "takeProfit");
    let stop_loss = read_f64(pred, "stopLoss");
    if take_profit.is_some() || stop_loss.is_some() {
        req.limit_order = Some(LimitOrder {
            take_profit,
            stop_loss,
        });
    }

    Ok(req)
}

/// Per-game default contract family, refined by the prediction's direction.
fn default_contract_type(order: &TradeOrder) -> String {
    let direction = read_string(&order.prediction, "direction")
        .map(|d| d.to_uppercase())
        .unwrap_or_default();
    match order.game_type.as_str() {
        "RANGE_BREAKER" => {
            if direction == "OUT" {
                "EXPIRYMISS"
            } else {
                "EXPIRYRANGE"
            }
        }
        "DIGIT_RUSH" => "DIGITDIFF",
        "FLIP_CALL" => {
            if direction == "PUT" {
                "PUT"
            } else {
                "CALL"
            }
        }
        "TICK_SNIPER" => {
            if direction == "LOW" {
                "TICKLOW"
            } else {
                "TICKHIGH"
            }
        }
        "MOMENTUM_X" => {
            if direction == "DOWN" {
                "MULTDOWN"
            } else {
                "MULTUP"
            }
        }
        _ => {
            if direction == "PUT" {
                "PUT"
            } else {
                "CALL"
            }
        }
    }
    .to_string()
}

fn assign_duration(pred: &Map<String, Value>, req: &mut ProposalRequest) {
    if let Some(ticks) = read_i64(pred, "durationTicks").filter(|t| *t > 0) {
        req.duration = Some(ticks);
        req.duration_unit = Some("t".into());
        return;
    }
    if let Some(minutes) = read_i64(pred, "durationMinutes").filter(|m| *m > 0) {
        req.duration = Some(minutes);
        req.duration_unit = Some("m".into());
        return;
    }
    if let Some(duration) = read_i64(pred, "duration").filter(|d| *d > 0) {
        req.duration = Some(duration);
        req.duration_unit = Some(
            match read_string(pred, "durationUnit").as_deref() {
                Some("m") | Some("M") => "m",
                Some("h") | Some("H") => "h",
                Some("d") | Some("D") => "d",
                Some("t") | Some("T") => "t",
                _ => "s",
            }
            .into(),
        );
        return;
    }
    if let Some(seconds) = read_i64(pred, "durationSeconds").filter(|s| *s > 0) {
        req.duration = Some(seconds);
        req.duration_unit = Some("s".into());
    }
}

/// Clamp the duration into what each contract family accepts.
fn normalize_duration(req: &mut ProposalRequest) {
    match req.contract_type.as_str() {
        "MULTUP" | "MULTDOWN" => {
            req.duration = None;
            req.duration_unit = None;
        }
        "TICKHIGH" | "TICKLOW" => {
            req.duration = Some(5);
            req.duration_unit = Some("t".into());
        }
        "CALL" | "PUT" | "CALLE" | "PUTE" => {
            let ticks = match (req.duration, req.duration_unit.as_deref()) {
                (Some(d), Some("t")) => d.clamp(1, 10),
                _ => 5,
            };
            req.duration = Some(ticks);
            req.duration_unit = Some("t".into());
        }
        "ONETOUCH" | "NOTOUCH" => {
            let ticks = match (req.duration, req.duration_unit.as_deref()) {
                (Some(d), Some("t")) => d.clamp(5, 10),
                _ => 5,
            };
            req.duration = Some(ticks);
            req.duration_unit = Some("t".into());
        }
        "EXPIRYRANGE" | "EXPIRYMISS" | "RANGE" | "UPORDOWN" => {
            let minutes = match req.duration {
                Some(d) => {
                    let m = duration_to_minutes(d, req.duration_unit.as_deref());
                    if m > 0 {
                        m
                    } else {
                        2
                    }
                }
                None => 2,
            };
            req.duration = Some(minutes.clamp(3, 60));
            req.duration_unit = Some("m".into());
        }
        ct if ct.starts_with("DIGIT") => {
            let ticks = match (req.duration, req.duration_unit.as_deref()) {
                (Some(d), Some("t")) => d.clamp(1, 10),
                _ => 1,
            };
            req.duration = Some(ticks);
            req.duration_unit = Some("t".into());
        }
        _ => {
            if req.duration.is_none() {
                req.duration = Some(60);
                req.duration_unit = Some("s".into());
            }
        }
    }
}

fn duration_to_minutes(value: i64, unit: Option<&str>) -> i64 {
    match unit {
        Some("m") => value,
        Some("s") => (value as f64 / 60.0).ceil() as i64,
        Some("h") => value * 60,
        Some("d") => value * 24 * 60,
        _ => 0,
    }
}

fn format_barrier(value: f64) -> String {
    format!("{value:+.5}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_with(game_type: &str, prediction: Value) -> TradeOrder {
        TradeOrder {
            session_id: "s1".into(),
            user_id: "u1".into(),
            game_type: game_type.into(),
            stake_usd: 10.0,
            prediction: prediction.as_object().cloned().unwrap_or_default(),
            trace_id: "t1".into(),
            created_at: 0,
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.upstream_symbol = "R_50".into();
        cfg
    }

    #[test]
    fn test_coercion_from_numeric_strings() {
        let map = serde_json::json!({
            "durationTicks": "7",
            "barrierHigh": "1.25",
            "flag": true
        });
        let map = map.as_object().unwrap();
        assert_eq!(read_i64(map, "durationTicks"), Some(7));
        assert_eq!(read_f64(map, "barrierHigh"), Some(1.25));
        assert_eq!(read_string(map, "flag"), Some("true".into()));
        assert_eq!(read_i64(map, "missing"), None);
        assert_eq!(read_f64(map, "flag"), None);
    }

    #[test]
    fn test_default_contract_types_per_game() {
        let cfg = test_config();
        let cases = [
            ("RANGE_BREAKER", serde_json::json!({}), "EXPIRYRANGE"),
            (
                "RANGE_BREAKER",
                serde_json::json!({"direction": "OUT"}),
                "EXPIRYMISS",
            ),
            ("DIGIT_RUSH", serde_json::json!({}), "DIGITDIFF"),
            (
                "FLIP_CALL",
                serde_json::json!({"direction": "put"}),
                "PUT",
            ),
            (
                "TICK_SNIPER",
                serde_json::json!({"direction": "LOW"}),
                "TICKLOW",
            ),
            (
                "MOMENTUM_X",
                serde_json::json!({"direction": "DOWN"}),
                "MULTDOWN",
            ),
            ("UNKNOWN_GAME", serde_json::json!({}), "CALL"),
        ];
        for (game, pred, expected) in cases {
            let req = build_proposal(&order_with(game, pred), &cfg).unwrap();
            assert_eq!(req.contract_type, expected, "game {game}");
        }
    }

    #[test]
    fn test_duration_normalization_table() {
        let cfg = test_config();

        // Multiplier family carries no duration at all.
        let req = build_proposal(
            &order_with("MOMENTUM_X", serde_json::json!({"durationTicks": 9})),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.duration, None);
        assert_eq!(req.duration_unit, None);

        // Tick-sniper family is fixed at 5 ticks.
        let req = build_proposal(
            &order_with("TICK_SNIPER", serde_json::json!({"durationTicks": 9})),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.duration, Some(5));

        // CALL/PUT clamps ticks into [1, 10].
        let req = build_proposal(
            &order_with("FLIP_CALL", serde_json::json!({"durationTicks": 25})),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.duration, Some(10));
        assert_eq!(req.duration_unit.as_deref(), Some("t"));

        // Range family converts to minutes and clamps into [3, 60]; the
        // 2-minute default lands on the lower bound.
        let req = build_proposal(&order_with("RANGE_BREAKER", serde_json::json!({})), &cfg).unwrap();
        assert_eq!(req.duration, Some(3));
        assert_eq!(req.duration_unit.as_deref(), Some("m"));

        let req = build_proposal(
            &order_with(
                "RANGE_BREAKER",
                serde_json::json!({"duration": 2, "durationUnit": "h"}),
            ),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.duration, Some(60));

        // Digit family defaults to a single tick.
        let req = build_proposal(&order_with("DIGIT_RUSH", serde_json::json!({})), &cfg).unwrap();
        assert_eq!(req.duration, Some(1));

        // Unknown contract types default to 60 seconds.
        let req = build_proposal(
            &order_with("X", serde_json::json!({"contractType": "ASIANU"})),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.duration, Some(60));
        assert_eq!(req.duration_unit.as_deref(), Some("s"));
    }

    #[test]
    fn test_barriers_and_limit_order() {
        let cfg = test_config();
        let req = build_proposal(
            &order_with(
                "RANGE_BREAKER",
                serde_json::json!({
                    "barrierHigh": 1.5,
                    "barrierLow": -0.75,
                    "multiplier": 100,
                    "takeProfit": 50.0,
                    "stopLoss": "25",
                }),
            ),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.barrier.as_deref(), Some("+1.50000"));
        assert_eq!(req.barrier2.as_deref(), Some("-0.75000"));
        assert_eq!(req.multiplier, Some(100.0));
        let limit = req.limit_order.unwrap();
        assert_eq!(limit.take_profit, Some(50.0));
        assert_eq!(limit.stop_loss, Some(25.0));
    }

    #[test]
    fn test_symbol_and_currency_defaults() {
        let cfg = test_config();
        let req = build_proposal(&order_with("FLIP_CALL", serde_json::json!({})), &cfg).unwrap();
        assert_eq!(req.symbol, "R_50");
        assert_eq!(req.currency, "USD");
        assert_eq!(req.basis, "stake");

        let req = build_proposal(
            &order_with(
                "FLIP_CALL",
                serde_json::json!({"symbol": "R_100", "currency": "eur", "basis": "PAYOUT"}),
            ),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.symbol, "R_100");
        assert_eq!(req.currency, "EUR");
        assert_eq!(req.basis, "payout");
    }
}
