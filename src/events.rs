//! Reward event sink
//!
//! The engine reports business outcomes through [`RewardEvents`] instead of
//! logging directly. Binaries construct one sink at startup and hand it to
//! the engine; tests can substitute their own.

use tracing::{error, info, warn};

use crate::error::{ErrorKind, LedgerError};
use crate::types::ReferralReward;

pub trait RewardEvents: Send + Sync {
    fn task_completed(&self, user_id: i64, task_id: i64, new_balance: i64);

    fn referral_redeemed(&self, reward: &ReferralReward);

    /// Called for every failed operation. `context` carries the identifiers
    /// the operation was invoked with.
    fn operation_failed(&self, operation: &'static str, context: &str, err: &LedgerError);
}

/// Emits structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl RewardEvents for TracingEvents {
    fn task_completed(&self, user_id: i64, task_id: i64, new_balance: i64) {
        info!(user_id, task_id, new_balance, "task completed");
    }

    fn referral_redeemed(&self, reward: &ReferralReward) {
        info!(
            referrer_id = reward.referrer_id,
            redeemer_id = reward.redeemer_id,
            bonus = reward.bonus,
            "referral redeemed"
        );
    }

    fn operation_failed(&self, operation: &'static str, context: &str, err: &LedgerError) {
        match err.kind() {
            ErrorKind::Internal => {
                error!(operation, context, error = %err, "ledger invariant or storage failure")
            }
            ErrorKind::Transient => {
                warn!(operation, context, error = %err, "transient ledger failure")
            }
            _ => info!(operation, context, error = %err, "request rejected"),
        }
    }
}
