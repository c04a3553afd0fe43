//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use reward_ledger::store::LedgerStore;
use reward_ledger::types::NewUser;
use reward_ledger::{LedgerError, NewTask, ReferralReward, RewardEngine, RewardEvents, SqliteLedger};

/// Event sink that remembers what it was told
#[derive(Default)]
pub struct RecordingEvents {
    pub completed: Mutex<Vec<(i64, i64, i64)>>,
    pub referrals: Mutex<Vec<ReferralReward>>,
    pub failures: Mutex<Vec<(&'static str, String)>>,
}

impl RewardEvents for RecordingEvents {
    fn task_completed(&self, user_id: i64, task_id: i64, new_balance: i64) {
        self.completed
            .lock()
            .unwrap()
            .push((user_id, task_id, new_balance));
    }

    fn referral_redeemed(&self, reward: &ReferralReward) {
        self.referrals.lock().unwrap().push(reward.clone());
    }

    fn operation_failed(&self, operation: &'static str, context: &str, _err: &LedgerError) {
        self.failures
            .lock()
            .unwrap()
            .push((operation, context.to_string()));
    }
}

pub struct Harness {
    pub engine: Arc<RewardEngine<SqliteLedger>>,
    pub events: Arc<RecordingEvents>,
    _dir: tempfile::TempDir,
}

pub fn sqlite_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteLedger::open(dir.path().join("ledger.db")).unwrap();
    let events = Arc::new(RecordingEvents::default());
    let engine = RewardEngine::new(Arc::new(store), events.clone());
    Harness {
        engine: Arc::new(engine),
        events,
        _dir: dir,
    }
}

/// Insert a user directly, skipping password hashing
pub async fn seed_user<S: LedgerStore>(engine: &RewardEngine<S>, username: &str) -> (i64, String) {
    let code = format!("code-{}", username);
    let user = NewUser {
        username: username.to_string(),
        first_name: String::new(),
        last_name: String::new(),
        password_hash: "unused".to_string(),
    };
    let id = engine.store().create_user(&user, &code).await.unwrap();
    (id, code)
}

pub async fn seed_task<S: LedgerStore>(engine: &RewardEngine<S>, description: &str, reward: i64) -> i64 {
    engine
        .create_task(NewTask {
            description: description.to_string(),
            reward,
        })
        .await
        .unwrap()
}

pub async fn balance_of<S: LedgerStore>(engine: &RewardEngine<S>, user_id: i64) -> i64 {
    engine.user_status(user_id).await.unwrap().user.balance
}
