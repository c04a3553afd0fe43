//! PostgreSQL ledger tests
//!
//! Run only when `TEST_DATABASE_URL` points at a scratch database.
//! Names carry a random suffix so tests can share one database.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reward_ledger::store::LedgerStore;
use reward_ledger::types::NewUser;
use reward_ledger::{LedgerError, NewTask, PgLedger};

async fn test_ledger(op_timeout: Duration) -> Option<PgLedger> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) if !url.is_empty() => url,
        _ => {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return None;
        }
    };
    Some(PgLedger::connect(&url, 20, op_timeout).await.unwrap())
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

async fn seed_user(store: &PgLedger) -> (i64, String) {
    let code = unique("code");
    let user = NewUser {
        username: unique("user"),
        first_name: String::new(),
        last_name: String::new(),
        password_hash: "unused".to_string(),
    };
    (store.create_user(&user, &code).await.unwrap(), code)
}

async fn seed_task(store: &PgLedger, reward: i64) -> i64 {
    store
        .create_task(&NewTask {
            description: unique("task"),
            reward,
        })
        .await
        .unwrap()
}

async fn balance(store: &PgLedger, user_id: i64) -> i64 {
    store.get_full_user(user_id).await.unwrap().user.balance
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let Some(store) = test_ledger(Duration::from_secs(30)).await else {
        return;
    };
    assert_eq!(store.run_migrations().await.unwrap(), 0);
}

#[tokio::test]
async fn test_double_completion_credits_once() {
    let Some(store) = test_ledger(Duration::from_secs(30)).await else {
        return;
    };
    let (user_id, _) = seed_user(&store).await;
    let task_id = seed_task(&store, 15).await;

    assert_eq!(store.complete_task(task_id, user_id).await.unwrap(), 15);
    assert!(matches!(
        store.complete_task(task_id, user_id).await,
        Err(LedgerError::AlreadyCompleted { .. })
    ));
    assert_eq!(balance(&store, user_id).await, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_task_credits_once() {
    let Some(store) = test_ledger(Duration::from_secs(30)).await else {
        return;
    };
    let store = Arc::new(store);
    let (user_id, _) = seed_user(&store).await;
    let task_id = seed_task(&store, 25).await;

    let attempts = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.complete_task(task_id, user_id).await })
    });
    let succeeded = join_all(attempts)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(_))))
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(balance(&store, user_id).await, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_different_tasks_lose_no_update() {
    let Some(store) = test_ledger(Duration::from_secs(30)).await else {
        return;
    };
    let store = Arc::new(store);
    let (user_id, _) = seed_user(&store).await;

    let mut task_ids = Vec::new();
    for reward in 1..=10 {
        task_ids.push(seed_task(&store, reward).await);
    }

    let attempts = task_ids.into_iter().map(|task_id| {
        let store = store.clone();
        tokio::spawn(async move { store.complete_task(task_id, user_id).await })
    });
    for joined in join_all(attempts).await {
        joined.unwrap().unwrap();
    }

    assert_eq!(balance(&store, user_id).await, 55);
}

#[tokio::test]
async fn test_referral_rolls_back_first_credit() {
    let Some(store) = test_ledger(Duration::from_secs(30)).await else {
        return;
    };
    let (owner_id, code) = seed_user(&store).await;

    assert!(matches!(
        store.redeem_referral(i64::MAX, &code, 100).await,
        Err(LedgerError::UserNotFound)
    ));
    assert_eq!(balance(&store, owner_id).await, 0);

    let (user_id, _) = seed_user(&store).await;
    let reward = store.redeem_referral(user_id, &code, 100).await.unwrap();
    assert_eq!(reward.referrer_balance, 100);
    assert_eq!(reward.redeemer_balance, 100);
    assert!(matches!(
        store.redeem_referral(user_id, &code, 100).await,
        Err(LedgerError::AlreadyRedeemed { .. })
    ));
}

#[tokio::test]
async fn test_missing_task_records_nothing() {
    let Some(store) = test_ledger(Duration::from_secs(30)).await else {
        return;
    };
    let (user_id, _) = seed_user(&store).await;

    assert!(matches!(
        store.complete_task(i64::MAX, user_id).await,
        Err(LedgerError::TaskNotFound)
    ));
    let full = store.get_full_user(user_id).await.unwrap();
    assert_eq!(full.user.balance, 0);
    assert!(full.completed_tasks.is_empty());
}

#[tokio::test]
async fn test_deadline_releases_locked_row() {
    let Some(store) = test_ledger(Duration::from_millis(300)).await else {
        return;
    };
    let (user_id, _) = seed_user(&store).await;
    let task_id = seed_task(&store, 20).await;

    // Hold the balance row lock from an unrelated connection
    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let (mut client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls)
        .await
        .unwrap();
    tokio::spawn(connection);
    let blocker = client.transaction().await.unwrap();
    blocker
        .execute("SELECT balance FROM users WHERE id = $1 FOR UPDATE", &[&user_id])
        .await
        .unwrap();

    let err = store.complete_task(task_id, user_id).await.unwrap_err();
    assert!(err.is_transient());

    blocker.rollback().await.unwrap();
    let full = store.get_full_user(user_id).await.unwrap();
    assert_eq!(full.user.balance, 0);
    assert!(full.completed_tasks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_snapshot_is_consistent() {
    let Some(store) = test_ledger(Duration::from_secs(30)).await else {
        return;
    };
    let store = Arc::new(store);
    let (user_id, _) = seed_user(&store).await;

    let mut task_ids = Vec::new();
    for reward in 1..=20 {
        task_ids.push(seed_task(&store, reward).await);
    }

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for task_id in task_ids {
                store.complete_task(task_id, user_id).await.unwrap();
            }
        })
    };

    // Balance and completion list always come from the same snapshot
    while !writer.is_finished() {
        let full = store.get_full_user(user_id).await.unwrap();
        let credited: i64 = full.completed_tasks.iter().map(|t| t.reward).sum();
        assert_eq!(full.user.balance, credited);
    }
    writer.await.unwrap();

    let full = store.get_full_user(user_id).await.unwrap();
    assert_eq!(full.user.balance, 210);
    assert_eq!(full.completed_tasks.len(), 20);
}
