//! Reward Engine
//!
//! Business operations on top of a [`LedgerStore`]. Each reward operation is
//! exactly one store transaction; the engine validates input, reports the
//! outcome to the injected [`RewardEvents`] sink and never retries.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::auth;
use crate::error::{LedgerError, LedgerResult};
use crate::events::RewardEvents;
use crate::store::LedgerStore;
use crate::types::{FullUser, LeaderboardEntry, NewTask, NewUser, ReferralReward, Task, User};

/// Bonus credited to both sides of a referral
pub const DEFAULT_REFERRAL_BONUS: i64 = 100;

pub const DEFAULT_LEADERBOARD_LIMIT: u32 = 10;

/// Stored when a user registers without a name
pub const DEFAULT_FIRST_NAME: &str = "Михал";
pub const DEFAULT_LAST_NAME: &str = "Палыч";

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

pub struct RewardEngine<S> {
    store: Arc<S>,
    events: Arc<dyn RewardEvents>,
    referral_bonus: i64,
    leaderboard_limit: u32,
}

impl<S: LedgerStore> RewardEngine<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn RewardEvents>) -> Self {
        Self {
            store,
            events,
            referral_bonus: DEFAULT_REFERRAL_BONUS,
            leaderboard_limit: DEFAULT_LEADERBOARD_LIMIT,
        }
    }

    pub fn with_referral_bonus(mut self, bonus: i64) -> Self {
        self.referral_bonus = bonus;
        self
    }

    pub fn with_leaderboard_limit(mut self, limit: u32) -> Self {
        self.leaderboard_limit = limit;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn report<T>(
        &self,
        operation: &'static str,
        context: impl FnOnce() -> String,
        result: LedgerResult<T>,
    ) -> LedgerResult<T> {
        if let Err(err) = &result {
            self.events.operation_failed(operation, &context(), err);
        }
        result
    }

    // ========================================================================
    // ACCOUNTS
    // ========================================================================

    /// Create an account with a fresh referrer code. Returns the new user id.
    pub async fn register(&self, request: RegisterRequest) -> LedgerResult<i64> {
        let username = request.username.trim().to_string();
        let result = self.register_inner(&username, request).await;
        self.report("register", || format!("username={}", username), result)
    }

    async fn register_inner(&self, username: &str, request: RegisterRequest) -> LedgerResult<i64> {
        if username.is_empty() || request.password.is_empty() {
            return Err(LedgerError::InvalidInput(
                "username and password are required".to_string(),
            ));
        }

        let password = request.password;
        let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
            .await
            .map_err(|e| LedgerError::InvariantViolation(format!("hashing task failed: {}", e)))??;

        let user = NewUser {
            username: username.to_string(),
            first_name: name_or(request.first_name, DEFAULT_FIRST_NAME),
            last_name: name_or(request.last_name, DEFAULT_LAST_NAME),
            password_hash,
        };
        let referrer_code = Uuid::new_v4().to_string();

        self.store.create_user(&user, &referrer_code).await
    }

    /// Check credentials. Unknown usernames and wrong passwords are
    /// indistinguishable to the caller.
    pub async fn authenticate(&self, username: &str, password: &str) -> LedgerResult<User> {
        let result = self.authenticate_inner(username, password).await;
        self.report("authenticate", || format!("username={}", username), result)
    }

    async fn authenticate_inner(&self, username: &str, password: &str) -> LedgerResult<User> {
        let user = match self.store.get_user_by_username(username).await {
            Ok(user) => user,
            Err(LedgerError::UserNotFound) => return Err(LedgerError::InvalidCredentials),
            Err(e) => return Err(e),
        };

        let password = password.to_string();
        let stored = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || auth::verify_password(&password, &stored))
            .await
            .map_err(|e| LedgerError::InvariantViolation(format!("verify task failed: {}", e)))?;

        if valid {
            Ok(user)
        } else {
            Err(LedgerError::InvalidCredentials)
        }
    }

    pub async fn user_status(&self, user_id: i64) -> LedgerResult<FullUser> {
        let result = self.store.get_full_user(user_id).await;
        self.report("user_status", || format!("user_id={}", user_id), result)
    }

    pub async fn leaderboard(&self) -> LedgerResult<Vec<LeaderboardEntry>> {
        let result = self.store.top_users(self.leaderboard_limit).await;
        self.report(
            "leaderboard",
            || format!("limit={}", self.leaderboard_limit),
            result,
        )
    }

    // ========================================================================
    // REWARDS
    // ========================================================================

    /// Complete a task for a user and return the new balance.
    ///
    /// A second completion of the same task fails with `AlreadyCompleted`
    /// and credits nothing.
    pub async fn complete_task(&self, user_id: i64, task_id: i64) -> LedgerResult<i64> {
        let result = self.store.complete_task(task_id, user_id).await;
        if let Ok(balance) = &result {
            self.events.task_completed(user_id, task_id, *balance);
        }
        self.report(
            "complete_task",
            || format!("user_id={} task_id={}", user_id, task_id),
            result,
        )
    }

    /// Redeem another user's referrer code, crediting both users the
    /// referral bonus. Each user can redeem one code, once.
    pub async fn apply_referral(&self, user_id: i64, code: &str) -> LedgerResult<ReferralReward> {
        let code = code.trim();
        let result = if code.is_empty() {
            Err(LedgerError::InvalidInput("referrer code is required".to_string()))
        } else {
            self.store
                .redeem_referral(user_id, code, self.referral_bonus)
                .await
        };

        if let Ok(reward) = &result {
            self.events.referral_redeemed(reward);
        }
        self.report(
            "apply_referral",
            || format!("user_id={} code={}", user_id, code),
            result,
        )
    }

    // ========================================================================
    // TASK CATALOG
    // ========================================================================

    pub async fn create_task(&self, task: NewTask) -> LedgerResult<i64> {
        let result = match validate_task(&task) {
            Ok(()) => self.store.create_task(&task).await,
            Err(e) => Err(e),
        };
        self.report(
            "create_task",
            || format!("description={:?} reward={}", task.description, task.reward),
            result,
        )
    }

    pub async fn get_task(&self, task_id: i64) -> LedgerResult<Task> {
        let result = self.store.get_task(task_id).await;
        self.report("get_task", || format!("task_id={}", task_id), result)
    }

    pub async fn list_tasks(&self) -> LedgerResult<Vec<Task>> {
        let result = self.store.list_tasks().await;
        self.report("list_tasks", String::new, result)
    }

    /// Change a task's reward. Past completions keep what they were credited.
    pub async fn update_task_reward(&self, task_id: i64, reward: i64) -> LedgerResult<()> {
        let result = if reward <= 0 {
            Err(LedgerError::InvalidInput("reward must be positive".to_string()))
        } else {
            self.store.update_task_reward(task_id, reward).await
        };
        self.report(
            "update_task_reward",
            || format!("task_id={} reward={}", task_id, reward),
            result,
        )
    }
}

fn name_or(name: String, default: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

fn validate_task(task: &NewTask) -> LedgerResult<()> {
    if task.description.trim().is_empty() {
        return Err(LedgerError::InvalidInput(
            "task description is required".to_string(),
        ));
    }
    if task.reward <= 0 {
        return Err(LedgerError::InvalidInput("reward must be positive".to_string()));
    }
    Ok(())
}
