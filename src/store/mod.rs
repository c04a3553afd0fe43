//! Ledger Store
//!
//! Durable state for users, tasks, completion records and referral
//! redemptions. The store is the only authority on balances: nothing above
//! it caches balances or completion state.
//!
//! Two implementations exist:
//! - [`PgLedger`]: PostgreSQL, used by the server
//! - [`SqliteLedger`]: a local SQLite file, used for local runs and tests

use async_trait::async_trait;

use crate::error::LedgerResult;
use crate::types::{FullUser, LeaderboardEntry, NewTask, NewUser, ReferralReward, Task, User};

pub mod pg;
pub mod sqlite;

pub use pg::PgLedger;
pub use sqlite::SqliteLedger;

/// Default deadline applied to every store call
pub const DEFAULT_OP_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    // ========================================================================
    // USERS
    // ========================================================================

    /// Create a user with a zero balance. Fails with `UserAlreadyExists` when
    /// the username is taken.
    async fn create_user(&self, user: &NewUser, referrer_code: &str) -> LedgerResult<i64>;

    async fn get_user_by_username(&self, username: &str) -> LedgerResult<User>;

    async fn get_user_by_referrer_code(&self, code: &str) -> LedgerResult<User>;

    /// User plus the tasks they completed
    async fn get_full_user(&self, user_id: i64) -> LedgerResult<FullUser>;

    /// Unconditional additive credit
    async fn credit_balance(&self, user_id: i64, amount: i64) -> LedgerResult<()>;

    /// Users ordered by balance, highest first
    async fn top_users(&self, limit: u32) -> LedgerResult<Vec<LeaderboardEntry>>;

    // ========================================================================
    // REWARD TRANSACTIONS
    // ========================================================================

    /// Record that `user_id` completed `task_id` and credit the task reward,
    /// atomically. Returns the new balance.
    ///
    /// The user's balance row is locked for the duration of the transaction,
    /// and the unique `(task_id, user_id)` constraint rejects a second
    /// completion with `AlreadyCompleted`. Any failure rolls back both the
    /// completion record and the credit.
    async fn complete_task(&self, task_id: i64, user_id: i64) -> LedgerResult<i64>;

    /// Credit `bonus` to both the owner of `code` and `redeemer_id` in one
    /// transaction and persist the redemption. A redeemer can redeem once.
    async fn redeem_referral(
        &self,
        redeemer_id: i64,
        code: &str,
        bonus: i64,
    ) -> LedgerResult<ReferralReward>;

    // ========================================================================
    // TASK CATALOG
    // ========================================================================

    /// Fails with `TaskAlreadyExists` when the description is taken
    async fn create_task(&self, task: &NewTask) -> LedgerResult<i64>;

    async fn get_task(&self, task_id: i64) -> LedgerResult<Task>;

    async fn list_tasks(&self) -> LedgerResult<Vec<Task>>;

    async fn update_task_reward(&self, task_id: i64, reward: i64) -> LedgerResult<()>;
}

/// Rank leaderboard rows in the order the store returned them
pub(crate) fn ranked(rows: Vec<(i64, String, i64)>) -> Vec<LeaderboardEntry> {
    rows.into_iter()
        .enumerate()
        .map(|(i, (user_id, username, balance))| LeaderboardEntry {
            rank: (i + 1) as u32,
            user_id,
            username,
            balance,
        })
        .collect()
}

/// Order in which a referral transaction touches the two balance rows.
/// Always ascending by id so crossed redemptions cannot deadlock.
pub(crate) fn credit_order(a: i64, b: i64) -> [i64; 2] {
    if a <= b {
        [a, b]
    } else {
        [b, a]
    }
}
