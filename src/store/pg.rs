//! PostgreSQL Ledger Store
//!
//! Persistent storage for the reward ledger. Connects with DATABASE_URL,
//! applies embedded migrations on startup and runs every reward transaction
//! as a single database transaction.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime, Transaction};
use tokio_postgres::types::ToSql;
use tokio_postgres::{IsolationLevel, NoTls, Row};
use tracing::{debug, info, warn};

use super::{credit_order, ranked, LedgerStore};
use crate::error::{LedgerError, LedgerResult};
use crate::types::{FullUser, LeaderboardEntry, NewTask, NewUser, ReferralReward, Task, User};

/// Pool size when the config does not set one
pub const DEFAULT_POOL_MAX_SIZE: usize = 20;

const MIGRATIONS: &[(i32, &str, &str)] = &[
    (
        1,
        "001_schema",
        include_str!("../../migrations/postgres/001_schema.sql"),
    ),
    (
        2,
        "002_referrals",
        include_str!("../../migrations/postgres/002_referrals.sql"),
    ),
];

const USER_COLUMNS: &str =
    "id, first_name, last_name, username, password_hash, balance, referrer_code";

// ============================================================================
// PG LEDGER
// ============================================================================

#[derive(Clone)]
pub struct PgLedger {
    pool: Pool,
    op_timeout: Duration,
}

impl PgLedger {
    /// Create storage with explicit pool size and per-call deadline, then
    /// apply pending migrations
    pub async fn connect(
        database_url: &str,
        max_pool_size: usize,
        op_timeout: Duration,
    ) -> Result<Self> {
        let storage = Self::connect_without_migrations(database_url, max_pool_size, op_timeout)
            .await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create the pool and check connectivity without touching the schema
    pub async fn connect_without_migrations(
        database_url: &str,
        max_pool_size: usize,
        op_timeout: Duration,
    ) -> Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};

        let mut config = Config::new();
        config.url = Some(database_url.to_string());
        // Server-side guard in addition to the client-side deadline
        config.options = Some(format!(
            "-c statement_timeout={}",
            op_timeout.as_millis()
        ));

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: max_pool_size,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(op_timeout),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client.execute("SELECT 1", &[]).await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, op_timeout: {}ms)",
            max_pool_size,
            op_timeout.as_millis()
        );

        Ok(Self { pool, op_timeout })
    }

    /// Apply embedded migrations that are not yet recorded in
    /// `schema_migrations`. Returns how many were applied.
    pub async fn run_migrations(&self) -> LedgerResult<usize> {
        let mut client = self.pool.get().await?;

        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
            )
            .await?;

        let mut applied = 0;
        for (version, name, sql) in MIGRATIONS {
            let exists: bool = client
                .query_one(
                    "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = $1)",
                    &[version],
                )
                .await?
                .get(0);

            if exists {
                continue;
            }

            let tx = client.transaction().await?;
            tx.batch_execute(sql).await?;
            tx.execute(
                "INSERT INTO schema_migrations (version) VALUES ($1)",
                &[version],
            )
            .await?;
            tx.commit().await?;

            info!("Applied migration {}", name);
            applied += 1;
        }

        Ok(applied)
    }

    async fn with_deadline<T, F>(&self, op: F) -> LedgerResult<T>
    where
        F: Future<Output = LedgerResult<T>>,
    {
        // Dropping an unfinished transaction rolls it back
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout),
        }
    }

    async fn fetch_user(&self, column: &str, value: &(dyn ToSql + Sync)) -> LedgerResult<User> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {} FROM users WHERE {} = $1", USER_COLUMNS, column);
        let row = client.query_opt(sql.as_str(), &[value]).await?;

        row.as_ref().map(user_from_row).ok_or(LedgerError::UserNotFound)
    }

    async fn complete_task_tx(&self, task_id: i64, user_id: i64) -> LedgerResult<i64> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let result = lock_and_complete(&tx, task_id, user_id).await;
        finish(tx, result).await
    }

    async fn redeem_referral_tx(
        &self,
        redeemer_id: i64,
        code: &str,
        bonus: i64,
    ) -> LedgerResult<ReferralReward> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let result = credit_referral(&tx, redeemer_id, code, bonus).await;
        finish(tx, result).await
    }
}

// ============================================================================
// TRANSACTION BODIES
// ============================================================================

/// Commit on success, roll back on failure
async fn finish<T>(tx: Transaction<'_>, result: LedgerResult<T>) -> LedgerResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!("Rollback failed after {}: {}", err, e);
            }
            Err(err)
        }
    }
}

async fn lock_and_complete(tx: &Transaction<'_>, task_id: i64, user_id: i64) -> LedgerResult<i64> {
    // Serializes every completion for this user until commit
    let balance: i64 = tx
        .query_opt(
            "SELECT balance FROM users WHERE id = $1 FOR UPDATE",
            &[&user_id],
        )
        .await?
        .map(|r| r.get(0))
        .ok_or(LedgerError::UserNotFound)?;

    let reward: i64 = tx
        .query_opt("SELECT reward FROM tasks WHERE id = $1", &[&task_id])
        .await?
        .map(|r| r.get(0))
        .ok_or(LedgerError::TaskNotFound)?;

    let inserted = tx
        .query_opt(
            "INSERT INTO tasks_to_users (task_id, user_id) VALUES ($1, $2)
             ON CONFLICT (task_id, user_id) DO NOTHING
             RETURNING id",
            &[&task_id, &user_id],
        )
        .await?;

    if inserted.is_none() {
        debug!("Task {} already completed by user {}", task_id, user_id);
        return Err(LedgerError::AlreadyCompleted { task_id, user_id });
    }

    let new_balance = balance.checked_add(reward).ok_or_else(|| {
        LedgerError::InvariantViolation(format!(
            "balance overflow for user {}: {} + {}",
            user_id, balance, reward
        ))
    })?;

    let updated = tx
        .execute(
            "UPDATE users SET balance = $2 WHERE id = $1",
            &[&user_id, &new_balance],
        )
        .await?;

    if updated != 1 {
        return Err(LedgerError::InvariantViolation(format!(
            "balance update for locked user {} touched {} rows",
            user_id, updated
        )));
    }

    Ok(new_balance)
}

async fn credit_referral(
    tx: &Transaction<'_>,
    redeemer_id: i64,
    code: &str,
    bonus: i64,
) -> LedgerResult<ReferralReward> {
    let referrer_id: i64 = tx
        .query_opt("SELECT id FROM users WHERE referrer_code = $1", &[&code])
        .await?
        .map(|r| r.get(0))
        .ok_or(LedgerError::ReferrerCodeNotFound)?;

    if referrer_id == redeemer_id {
        return Err(LedgerError::SelfReferral);
    }

    let mut referrer_balance = 0;
    let mut redeemer_balance = 0;
    for user_id in credit_order(referrer_id, redeemer_id) {
        let balance: i64 = tx
            .query_opt(
                "UPDATE users SET balance = balance + $2 WHERE id = $1 RETURNING balance",
                &[&user_id, &bonus],
            )
            .await?
            .map(|r| r.get(0))
            .ok_or(LedgerError::UserNotFound)?;

        if user_id == referrer_id {
            referrer_balance = balance;
        } else {
            redeemer_balance = balance;
        }
    }

    let recorded = tx
        .query_opt(
            "INSERT INTO referrals (referrer_id, redeemer_id, bonus) VALUES ($1, $2, $3)
             ON CONFLICT (redeemer_id) DO NOTHING
             RETURNING id",
            &[&referrer_id, &redeemer_id, &bonus],
        )
        .await?;

    if recorded.is_none() {
        return Err(LedgerError::AlreadyRedeemed {
            user_id: redeemer_id,
        });
    }

    Ok(ReferralReward {
        referrer_id,
        redeemer_id,
        bonus,
        referrer_balance,
        redeemer_balance,
    })
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        balance: row.get("balance"),
        referrer_code: row.get("referrer_code"),
    }
}

fn task_from_row(row: &Row) -> Task {
    Task {
        id: row.get("id"),
        description: row.get("description"),
        reward: row.get("reward"),
    }
}

// ============================================================================
// LEDGER STORE
// ============================================================================

#[async_trait]
impl LedgerStore for PgLedger {
    async fn create_user(&self, user: &NewUser, referrer_code: &str) -> LedgerResult<i64> {
        self.with_deadline(async {
            let client = self.pool.get().await?;
            let row = client
                .query_opt(
                    "INSERT INTO users (first_name, last_name, username, password_hash, balance, referrer_code)
                     VALUES ($1, $2, $3, $4, 0, $5)
                     ON CONFLICT (username) DO NOTHING
                     RETURNING id",
                    &[
                        &user.first_name,
                        &user.last_name,
                        &user.username,
                        &user.password_hash,
                        &referrer_code,
                    ],
                )
                .await?;

            match row {
                Some(r) => {
                    let id: i64 = r.get(0);
                    info!("Created user {} ({})", user.username, id);
                    Ok(id)
                }
                None => Err(LedgerError::UserAlreadyExists),
            }
        })
        .await
    }

    async fn get_user_by_username(&self, username: &str) -> LedgerResult<User> {
        self.with_deadline(self.fetch_user("username", &username))
            .await
    }

    async fn get_user_by_referrer_code(&self, code: &str) -> LedgerResult<User> {
        self.with_deadline(self.fetch_user("referrer_code", &code))
            .await
    }

    async fn get_full_user(&self, user_id: i64) -> LedgerResult<FullUser> {
        self.with_deadline(async {
            let mut client = self.pool.get().await?;
            // One snapshot for the balance and the completion list
            let tx = client
                .build_transaction()
                .isolation_level(IsolationLevel::RepeatableRead)
                .read_only(true)
                .start()
                .await?;

            let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
            let user = tx
                .query_opt(sql.as_str(), &[&user_id])
                .await?
                .as_ref()
                .map(user_from_row)
                .ok_or(LedgerError::UserNotFound)?;

            let rows = tx
                .query(
                    "SELECT t.id, t.description, t.reward
                     FROM tasks_to_users c
                     JOIN tasks t ON t.id = c.task_id
                     WHERE c.user_id = $1
                     ORDER BY c.id",
                    &[&user_id],
                )
                .await?;
            tx.commit().await?;

            Ok(FullUser {
                user,
                completed_tasks: rows.iter().map(task_from_row).collect(),
            })
        })
        .await
    }

    async fn credit_balance(&self, user_id: i64, amount: i64) -> LedgerResult<()> {
        self.with_deadline(async {
            let client = self.pool.get().await?;
            let updated = client
                .execute(
                    "UPDATE users SET balance = balance + $2 WHERE id = $1",
                    &[&user_id, &amount],
                )
                .await?;

            if updated == 0 {
                return Err(LedgerError::UserNotFound);
            }
            Ok(())
        })
        .await
    }

    async fn top_users(&self, limit: u32) -> LedgerResult<Vec<LeaderboardEntry>> {
        self.with_deadline(async {
            let client = self.pool.get().await?;
            let rows = client
                .query(
                    "SELECT id, username, balance FROM users
                     ORDER BY balance DESC, id ASC
                     LIMIT $1",
                    &[&i64::from(limit)],
                )
                .await?;

            let entries: Vec<(i64, String, i64)> = rows
                .iter()
                .map(|r| (r.get(0), r.get(1), r.get(2)))
                .collect();

            Ok(ranked(entries))
        })
        .await
    }

    async fn complete_task(&self, task_id: i64, user_id: i64) -> LedgerResult<i64> {
        self.with_deadline(self.complete_task_tx(task_id, user_id))
            .await
    }

    async fn redeem_referral(
        &self,
        redeemer_id: i64,
        code: &str,
        bonus: i64,
    ) -> LedgerResult<ReferralReward> {
        self.with_deadline(self.redeem_referral_tx(redeemer_id, code, bonus))
            .await
    }

    async fn create_task(&self, task: &NewTask) -> LedgerResult<i64> {
        self.with_deadline(async {
            let client = self.pool.get().await?;
            let row = client
                .query_opt(
                    "INSERT INTO tasks (description, reward) VALUES ($1, $2)
                     ON CONFLICT (description) DO NOTHING
                     RETURNING id",
                    &[&task.description, &task.reward],
                )
                .await?;

            row.map(|r| r.get(0)).ok_or(LedgerError::TaskAlreadyExists)
        })
        .await
    }

    async fn get_task(&self, task_id: i64) -> LedgerResult<Task> {
        self.with_deadline(async {
            let client = self.pool.get().await?;
            let row = client
                .query_opt(
                    "SELECT id, description, reward FROM tasks WHERE id = $1",
                    &[&task_id],
                )
                .await?;

            row.as_ref().map(task_from_row).ok_or(LedgerError::TaskNotFound)
        })
        .await
    }

    async fn list_tasks(&self) -> LedgerResult<Vec<Task>> {
        self.with_deadline(async {
            let client = self.pool.get().await?;
            let rows = client
                .query("SELECT id, description, reward FROM tasks ORDER BY id", &[])
                .await?;

            Ok(rows.iter().map(task_from_row).collect())
        })
        .await
    }

    async fn update_task_reward(&self, task_id: i64, reward: i64) -> LedgerResult<()> {
        self.with_deadline(async {
            let client = self.pool.get().await?;
            let updated = client
                .execute(
                    "UPDATE tasks SET reward = $2 WHERE id = $1",
                    &[&task_id, &reward],
                )
                .await?;

            if updated == 0 {
                return Err(LedgerError::TaskNotFound);
            }
            info!("Task {} reward set to {}", task_id, reward);
            Ok(())
        })
        .await
    }
}
