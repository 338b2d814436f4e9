//! Bet pipeline: reserve → enqueue → outcome fan-out, plus the stale sweeper.

mod manager;

pub use manager::{
    BetAcknowledgement, BetError, GameSessionRecord, PlaceBetRequest, SessionManager,
    SubscriberGuard,
};
