//! Double-entry ledger kernel.
//!
//! Owns wallet balances, the append-only entry log and the reservation
//! documents (withdrawals, bets). All five money-mutating operations are
//! idempotent by their reference argument and commit atomically.

mod service;

pub use service::{LedgerEntry, LedgerError, LedgerService, WithdrawalReservation};
