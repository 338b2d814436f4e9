//! Execution pool: consumes trade orders, routes them to an upstream venue
//! account, the simulator, or the bounce gate, and publishes settlements.

mod bounce;
mod manager;
mod prediction;
mod upstream;

pub use bounce::BounceTracker;
pub use manager::{PoolManager, TradeSettlement};
pub use prediction::{build_proposal, ProposalRequest};
pub use upstream::UpstreamAccount;
