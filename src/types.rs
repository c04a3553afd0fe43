//! Ledger data structures

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub balance: i64,
    pub referrer_code: String,
}

/// User together with every task they have completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullUser {
    #[serde(flatten)]
    pub user: User,
    pub completed_tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub description: String,
    pub reward: i64,
}

/// Profile of a user about to be created; the password is already hashed
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub description: String,
    pub reward: i64,
}

/// Outcome of a successful referral redemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralReward {
    pub referrer_id: i64,
    pub redeemer_id: i64,
    pub bonus: i64,
    pub referrer_balance: i64,
    pub redeemer_balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub user_id: i64,
    pub username: String,
    pub balance: i64,
}
