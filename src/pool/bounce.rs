//! Bounce gate.
//!
//! Decides whether an incoming order is intercepted before it reaches the
//! upstream venue, keeping the stake as house profit. Tracks cumulative
//! captured stake and eases off once a configured target is met.

use parking_lot::Mutex;
use rand::Rng;
use tracing::info;

pub struct BounceTracker {
    bounce_rate: f64,
    profit_target_usd: f64,
    accumulated_usd: Mutex<f64>,
}

impl BounceTracker {
    pub fn new(bounce_rate: f64, profit_target_usd: f64) -> Self {
        Self {
            bounce_rate: bounce_rate.clamp(0.0, 1.0),
            profit_target_usd,
            accumulated_usd: Mutex::new(0.0),
        }
    }

    /// True when this order should settle as a forced LOSS locally.
    pub fn should_bounce(&self) -> bool {
        let rate = self.effective_rate();
        if rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < rate
    }

    /// Effective bounce rate: the configured rate until accumulated profit
    /// reaches the target, then half of it. A zero target never activates
    /// the half-rate regime.
    pub fn effective_rate(&self) -> f64 {
        if self.bounce_rate <= 0.0 {
            return 0.0;
        }
        let accumulated = *self.accumulated_usd.lock();
        if self.profit_target_usd > 0.0 && accumulated >= self.profit_target_usd {
            self.bounce_rate * 0.5
        } else {
            self.bounce_rate
        }
    }

    /// Add a captured stake to the house profit accumulator.
    pub fn record_bounce(&self, stake_usd: f64) {
        let total = {
            let mut acc = self.accumulated_usd.lock();
            *acc += stake_usd;
            *acc
        };
        let target_met = self.profit_target_usd > 0.0 && total >= self.profit_target_usd;
        info!(
            stake = stake_usd,
            house_profit = total,
            target_met,
            "bounce captured stake"
        );
    }

    pub fn stats(&self) -> (f64, bool) {
        let accumulated = *self.accumulated_usd.lock();
        let target_met = self.profit_target_usd > 0.0 && accumulated >= self.profit_target_usd;
        (accumulated, target_met)
    }
}
