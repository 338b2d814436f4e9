//! Upstream venue account.
//!
//! One WebSocket session per executed order: authorize with the account
//! token, request a proposal, buy at the proposal price subscribed to
//! open-contract updates, and block until the contract reports sold. The
//! caller bounds the whole exchange with the per-order timeout.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::models::{Config, TradeOrder};
use crate::pool::manager::TradeSettlement;
use crate::pool::prediction::build_proposal;

const PROFIT_EPSILON: f64 = 1e-5;

pub struct UpstreamAccount {
    pub id: String,
    token: String,
    in_flight: AtomicI64,
}

/// Decrements the account's in-flight counter when the order finishes,
/// whatever the path out.
struct InFlightGuard<'a>(&'a AtomicI64);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize)]
struct VenueMessage {
    #[serde(default)]
    msg_type: String,
    #[serde(default)]
    error: Option<VenueError>,
    #[serde(default)]
    proposal: Option<ProposalReply>,
    #[serde(default)]
    proposal_open_contract: Option<OpenContract>,
}

#[derive(Debug, Deserialize)]
struct VenueError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProposalReply {
    id: String,
    #[serde(default)]
    ask_price: f64,
    #[serde(default)]
    payout: f64,
    #[serde(default)]
    spot: f64,
}

#[derive(Debug, Deserialize)]
struct OpenContract {
    #[serde(default)]
    contract_id: Option<i64>,
    #[serde(default)]
    is_sold: Option<i64>,
    #[serde(default)]
    profit: Option<f64>,
    #[serde(default)]
    sell_price: Option<f64>,
}

impl UpstreamAccount {
    pub fn new(id: String, token: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            token,
            in_flight: AtomicI64::new(0),
        })
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Execute one order against the venue and return its settlement.
    pub async fn execute(&self, order: &TradeOrder, cfg: &Config) -> Result<TradeSettlement> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let url = format!("{}?app_id={}", cfg.upstream_url, cfg.upstream_app_id);
        let (ws, _) = connect_async(&url).await.context("venue connect")?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(
            serde_json::json!({ "authorize": self.token }).to_string(),
        ))
        .await
        .context("send authorize")?;
        await_message(&mut stream, "authorize").await?;
        info!(trace = %order.trace_id, account = %self.id, "authorized with venue");

        let proposal_req = build_proposal(order, cfg)?;
        debug!(
            trace = %order.trace_id,
            account = %self.id,
            contract = %proposal_req.contract_type,
            symbol = %proposal_req.symbol,
            stake = order.stake_usd,
            duration = ?proposal_req.duration,
            unit = ?proposal_req.duration_unit,
            "placing contract"
        );
        sink.send(Message::Text(serde_json::to_string(&proposal_req)?))
            .await
            .context("send proposal")?;
        let reply = await_message(&mut stream, "proposal").await?;
        let proposal = reply
            .proposal
            .context("proposal reply missing payload")?;
        debug!(
            trace = %order.trace_id,
            account = %self.id,
            proposal_id = %proposal.id,
            ask = proposal.ask_price,
            payout = proposal.payout,
            spot = proposal.spot,
            "proposal received"
        );

        sink.send(Message::Text(
            serde_json::json!({
                "buy": proposal.id,
                "price": order.stake_usd,
                "subscribe": 1,
            })
            .to_string(),
        ))
        .await
        .context("send buy")?;

        let mut contract_id = String::new();
        loop {
            let msg = match stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => bail!("venue stream closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => bail!("venue stream error: {e}"),
            };
            let parsed: VenueMessage = match serde_json::from_str(&msg) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if let Some(err) = parsed.error {
                bail!("venue error {}: {}", err.code, err.message);
            }
            let Some(contract) = parsed.proposal_open_contract else {
                continue;
            };
            if let Some(id) = contract.contract_id {
                contract_id = id.to_string();
            }
            if contract.is_sold != Some(1) {
                debug!(
                    trace = %order.trace_id,
                    account = %self.id,
                    contract = %contract_id,
                    profit = ?contract.profit,
                    "contract update"
                );
                continue;
            }

            let profit = contract.profit.unwrap_or(0.0);
            let sell_price = contract.sell_price.unwrap_or(0.0);
            let (outcome, payout_usd) = settle_from_contract(order.stake_usd, profit, sell_price);
            info!(
                trace = %order.trace_id,
                account = %self.id,
                contract = %contract_id,
                outcome = %outcome,
                profit,
                payout = payout_usd,
                "contract settled"
            );
            return Ok(TradeSettlement {
                outcome: outcome.to_string(),
                payout_usd,
                contract_id,
            });
        }
    }

}

async fn await_message<S>(stream: &mut S, expected: &str) -> Result<VenueMessage>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => bail!("venue stream closed"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => bail!("venue stream error: {e}"),
        };
        let parsed: VenueMessage = match serde_json::from_str(&msg) {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };
        if let Some(err) = parsed.error {
            bail!("venue error {}: {}", err.code, err.message);
        }
        if parsed.msg_type == expected {
            return Ok(parsed);
        }
    }
}

/// Outcome determination from the sold contract's numbers.
fn settle_from_contract(stake: f64, profit: f64, sell_price: f64) -> (&'static str, f64) {
    if profit > 0.0 || sell_price > stake {
        let payout = if sell_price > 0.0 {
            sell_price
        } else {
            stake + profit
        };
        ("WIN", payout)
    } else if profit >= -PROFIT_EPSILON {
        ("REFUND", stake)
    } else {
        ("LOSS", 0.0)
    }
}
