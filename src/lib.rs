//! Reward Ledger - points for completed tasks and referrals
//!
//! Users earn points by completing tasks from a catalog and by redeeming
//! another user's referrer code. Balances live only in the ledger store and
//! every credit happens inside one store transaction.
//!
//! # How it works
//!
//! 1. A user registers and receives a unique referrer code
//! 2. Completing a task credits its reward once per (task, user) pair
//! 3. Redeeming a referrer code credits both users the referral bonus, once per redeemer
//! 4. The leaderboard ranks users by balance
//!
//! # Guarantees
//!
//! - Completion record and balance credit commit together or not at all
//! - Concurrent completions of the same task by the same user credit at most once
//! - Concurrent credits to one user never lose an update
//! - Every store call is bounded by a deadline

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod server;
pub mod store;
pub mod types;

pub use auth::TokenIssuer;
pub use config::Config;
pub use engine::{RegisterRequest, RewardEngine};
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use events::{RewardEvents, TracingEvents};
pub use store::{LedgerStore, PgLedger, SqliteLedger};
pub use types::{FullUser, LeaderboardEntry, NewTask, ReferralReward, Task, User};
