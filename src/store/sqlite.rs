//! Local SQLite Ledger Store
//!
//! Every call opens its own connection to the database file and runs on the
//! blocking pool, so concurrent callers contend on SQLite's own locks rather
//! than on anything in process. Write transactions start with
//! `BEGIN IMMEDIATE`, which takes the write lock before the balance is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{credit_order, ranked, LedgerStore, DEFAULT_OP_TIMEOUT_SECS};
use crate::error::{LedgerError, LedgerResult};
use crate::types::{FullUser, LeaderboardEntry, NewTask, NewUser, ReferralReward, Task, User};

const MIGRATIONS: &[(i32, &str, &str)] = &[
    (
        1,
        "001_schema",
        include_str!("../../migrations/sqlite/001_schema.sql"),
    ),
    (
        2,
        "002_referrals",
        include_str!("../../migrations/sqlite/002_referrals.sql"),
    ),
];

const USER_COLUMNS: &str =
    "id, first_name, last_name, username, password_hash, balance, referrer_code";

pub struct SqliteLedger {
    path: PathBuf,
    op_timeout: Duration,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_secs(DEFAULT_OP_TIMEOUT_SECS))
    }

    pub fn open_with_timeout(path: impl AsRef<Path>, op_timeout: Duration) -> Result<Self> {
        let storage = Self {
            path: path.as_ref().to_path_buf(),
            op_timeout,
        };

        let mut conn = storage.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);

        let applied = run_migrations(&mut conn)?;
        if applied > 0 {
            info!(
                "Opened SQLite ledger at {} ({} migrations applied)",
                storage.path.display(),
                applied
            );
        }

        Ok(storage)
    }

    fn connect(&self) -> LedgerResult<Connection> {
        open_connection(&self.path, self.op_timeout)
    }

    /// Run `op` on its own connection, interrupting it if the deadline passes.
    /// An interrupted transaction is rolled back when it is dropped.
    async fn run<T, F>(&self, op: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> LedgerResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        let op_timeout = self.op_timeout;
        let (handle_tx, mut handle_rx) = oneshot::channel();

        let worker = tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path, op_timeout)?;
            // A closed receiver means the deadline passed while connecting
            if handle_tx.send(conn.get_interrupt_handle()).is_err() {
                return Err(LedgerError::Timeout);
            }
            op(&mut conn)
        });

        match tokio::time::timeout(self.op_timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(LedgerError::InvariantViolation(format!(
                "sqlite worker failed: {}",
                e
            ))),
            Err(_) => {
                handle_rx.close();
                if let Ok(interrupt) = handle_rx.try_recv() {
                    interrupt.interrupt();
                }
                Err(LedgerError::Timeout)
            }
        }
    }
}

fn open_connection(path: &Path, op_timeout: Duration) -> LedgerResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(op_timeout)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

fn run_migrations(conn: &mut Connection) -> LedgerResult<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )?;

    let mut applied = 0;
    for (version, name, sql) in MIGRATIONS {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            params![version],
            |row| row.get(0),
        )?;

        if exists {
            continue;
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            params![version],
        )?;
        tx.commit()?;

        info!("Applied migration {}", name);
        applied += 1;
    }

    Ok(applied)
}

// ============================================================================
// TRANSACTION BODIES
// ============================================================================

/// Commit on success, roll back on failure
fn finish<T>(tx: Transaction<'_>, result: LedgerResult<T>) -> LedgerResult<T> {
    match result {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback() {
                warn!("Rollback failed after {}: {}", err, e);
            }
            Err(err)
        }
    }
}

fn lock_and_complete(tx: &Transaction<'_>, task_id: i64, user_id: i64) -> LedgerResult<i64> {
    let balance: i64 = tx
        .query_row(
            "SELECT balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(LedgerError::UserNotFound)?;

    let reward: i64 = tx
        .query_row(
            "SELECT reward FROM tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(LedgerError::TaskNotFound)?;

    let inserted: Option<i64> = tx
        .query_row(
            "INSERT INTO tasks_to_users (task_id, user_id) VALUES (?1, ?2)
             ON CONFLICT (task_id, user_id) DO NOTHING
             RETURNING id",
            params![task_id, user_id],
            |row| row.get(0),
        )
        .optional()?;

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

    let updated = tx.execute(
        "UPDATE users SET balance = ?2 WHERE id = ?1",
        params![user_id, new_balance],
    )?;

    if updated != 1 {
        return Err(LedgerError::InvariantViolation(format!(
            "balance update for locked user {} touched {} rows",
            user_id, updated
        )));
    }

    Ok(new_balance)
}

fn credit_referral(
    tx: &Transaction<'_>,
    redeemer_id: i64,
    code: &str,
    bonus: i64,
) -> LedgerResult<ReferralReward> {
    let referrer_id: i64 = tx
        .query_row(
            "SELECT id FROM users WHERE referrer_code = ?1",
            params![code],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(LedgerError::ReferrerCodeNotFound)?;

    if referrer_id == redeemer_id {
        return Err(LedgerError::SelfReferral);
    }

    let mut referrer_balance = 0;
    let mut redeemer_balance = 0;
    for user_id in credit_order(referrer_id, redeemer_id) {
        let balance: i64 = tx
            .query_row(
                "UPDATE users SET balance = balance + ?2 WHERE id = ?1 RETURNING balance",
                params![user_id, bonus],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(LedgerError::UserNotFound)?;

        if user_id == referrer_id {
            referrer_balance = balance;
        } else {
            redeemer_balance = balance;
        }
    }

    let recorded: Option<i64> = tx
        .query_row(
            "INSERT INTO referrals (referrer_id, redeemer_id, bonus) VALUES (?1, ?2, ?3)
             ON CONFLICT (redeemer_id) DO NOTHING
             RETURNING id",
            params![referrer_id, redeemer_id, bonus],
            |row| row.get(0),
        )
        .optional()?;

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

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        username: row.get(3)?,
        password_hash: row.get(4)?,
        balance: row.get(5)?,
        referrer_code: row.get(6)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        description: row.get(1)?,
        reward: row.get(2)?,
    })
}

fn fetch_user(conn: &Connection, column: &str, value: &dyn rusqlite::ToSql) -> LedgerResult<User> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    conn.query_row(&sql, [value], user_from_row)
        .optional()?
        .ok_or(LedgerError::UserNotFound)
}

// ============================================================================
// LEDGER STORE
// ============================================================================

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn create_user(&self, user: &NewUser, referrer_code: &str) -> LedgerResult<i64> {
        let user = user.clone();
        let referrer_code = referrer_code.to_string();

        self.run(move |conn| {
            let id: Option<i64> = conn
                .query_row(
                    "INSERT INTO users (first_name, last_name, username, password_hash, balance, referrer_code)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)
                     ON CONFLICT (username) DO NOTHING
                     RETURNING id",
                    params![
                        user.first_name,
                        user.last_name,
                        user.username,
                        user.password_hash,
                        referrer_code
                    ],
                    |row| row.get(0),
                )
                .optional()?;

            match id {
                Some(id) => {
                    info!("Created user {} ({})", user.username, id);
                    Ok(id)
                }
                None => Err(LedgerError::UserAlreadyExists),
            }
        })
        .await
    }

    async fn get_user_by_username(&self, username: &str) -> LedgerResult<User> {
        let username = username.to_string();
        self.run(move |conn| fetch_user(conn, "username", &username))
            .await
    }

    async fn get_user_by_referrer_code(&self, code: &str) -> LedgerResult<User> {
        let code = code.to_string();
        self.run(move |conn| fetch_user(conn, "referrer_code", &code))
            .await
    }

    async fn get_full_user(&self, user_id: i64) -> LedgerResult<FullUser> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let user = fetch_user(&tx, "id", &user_id)?;

            let mut stmt = tx.prepare(
                "SELECT t.id, t.description, t.reward
                 FROM tasks_to_users c
                 JOIN tasks t ON t.id = c.task_id
                 WHERE c.user_id = ?1
                 ORDER BY c.id",
            )?;
            let completed_tasks = stmt
                .query_map(params![user_id], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(FullUser {
                user,
                completed_tasks,
            })
        })
        .await
    }

    async fn credit_balance(&self, user_id: i64, amount: i64) -> LedgerResult<()> {
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET balance = balance + ?2 WHERE id = ?1",
                params![user_id, amount],
            )?;

            if updated == 0 {
                return Err(LedgerError::UserNotFound);
            }
            Ok(())
        })
        .await
    }

    async fn top_users(&self, limit: u32) -> LedgerResult<Vec<LeaderboardEntry>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, balance FROM users
                 ORDER BY balance DESC, id ASC
                 LIMIT ?1",
            )?;
            let rows: Vec<(i64, String, i64)> = stmt
                .query_map(params![limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(ranked(rows))
        })
        .await
    }

    async fn complete_task(&self, task_id: i64, user_id: i64) -> LedgerResult<i64> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = lock_and_complete(&tx, task_id, user_id);
            finish(tx, result)
        })
        .await
    }

    async fn redeem_referral(
        &self,
        redeemer_id: i64,
        code: &str,
        bonus: i64,
    ) -> LedgerResult<ReferralReward> {
        let code = code.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = credit_referral(&tx, redeemer_id, &code, bonus);
            finish(tx, result)
        })
        .await
    }

    async fn create_task(&self, task: &NewTask) -> LedgerResult<i64> {
        let task = task.clone();
        self.run(move |conn| {
            conn.query_row(
                "INSERT INTO tasks (description, reward) VALUES (?1, ?2)
                 ON CONFLICT (description) DO NOTHING
                 RETURNING id",
                params![task.description, task.reward],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(LedgerError::TaskAlreadyExists)
        })
        .await
    }

    async fn get_task(&self, task_id: i64) -> LedgerResult<Task> {
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, description, reward FROM tasks WHERE id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()?
            .ok_or(LedgerError::TaskNotFound)
        })
        .await
    }

    async fn list_tasks(&self) -> LedgerResult<Vec<Task>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT id, description, reward FROM tasks ORDER BY id")?;
            let tasks = stmt
                .query_map([], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn update_task_reward(&self, task_id: i64, reward: i64) -> LedgerResult<()> {
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE tasks SET reward = ?2 WHERE id = ?1",
                params![task_id, reward],
            )?;

            if updated == 0 {
                return Err(LedgerError::TaskNotFound);
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteLedger) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteLedger::open(dir.path().join("ledger.db")).unwrap();
        (dir, storage)
    }

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            password_hash: "hash".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_user() {
        let (_dir, storage) = open_temp();

        let id = storage.create_user(&new_user("alice"), "code-a").await.unwrap();
        let user = storage.get_user_by_username("alice").await.unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.balance, 0);

        let by_code = storage.get_user_by_referrer_code("code-a").await.unwrap();
        assert_eq!(by_code.id, id);

        assert!(matches!(
            storage.create_user(&new_user("alice"), "code-b").await,
            Err(LedgerError::UserAlreadyExists)
        ));
        assert!(matches!(
            storage.get_user_by_username("nobody").await,
            Err(LedgerError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        SqliteLedger::open(&path).unwrap();

        let mut conn = Connection::open(&path).unwrap();
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_complete_task_records_once() {
        let (_dir, storage) = open_temp();
        let user_id = storage.create_user(&new_user("bob"), "code-b").await.unwrap();
        let task_id = storage
            .create_task(&NewTask {
                description: "follow".to_string(),
                reward: 50,
            })
            .await
            .unwrap();

        assert_eq!(storage.complete_task(task_id, user_id).await.unwrap(), 50);
        assert!(matches!(
            storage.complete_task(task_id, user_id).await,
            Err(LedgerError::AlreadyCompleted { .. })
        ));

        let full = storage.get_full_user(user_id).await.unwrap();
        assert_eq!(full.user.balance, 50);
        assert_eq!(full.completed_tasks.len(), 1);
        assert_eq!(full.completed_tasks[0].id, task_id);
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let (_dir, storage) = open_temp();
        assert!(matches!(
            storage.update_task_reward(9999, 10).await,
            Err(LedgerError::TaskNotFound)
        ));
        assert!(matches!(
            storage.credit_balance(9999, 10).await,
            Err(LedgerError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_blocked_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let storage = SqliteLedger::open_with_timeout(&path, Duration::from_millis(200)).unwrap();
        let user_id = storage.create_user(&new_user("carol"), "code-c").await.unwrap();
        let task_id = storage
            .create_task(&NewTask {
                description: "share".to_string(),
                reward: 20,
            })
            .await
            .unwrap();

        // Hold the write lock from another connection
        let mut blocker = Connection::open(&path).unwrap();
        let held = blocker
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();

        let err = storage.complete_task(task_id, user_id).await.unwrap_err();
        assert!(err.is_transient());

        drop(held);
        let full = storage.get_full_user(user_id).await.unwrap();
        assert_eq!(full.user.balance, 0);
        assert!(full.completed_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_interrupts_running_query() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            SqliteLedger::open_with_timeout(dir.path().join("ledger.db"), Duration::from_millis(200))
                .unwrap();

        // Never finishes on its own; only the interrupt handle stops it
        let result = storage
            .run(|conn| {
                let count: i64 = conn.query_row(
                    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c)
                     SELECT count(*) FROM c",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await;
        assert!(matches!(result, Err(LedgerError::Timeout)));

        // The store keeps working after an interrupted call
        assert!(storage.list_tasks().await.unwrap().is_empty());
    }
}
