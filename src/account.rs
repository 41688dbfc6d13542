use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

/// Outcome bookkeeping for one account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountState {
    /// Whether the last logical call ended in an error.
    pub last_request_failed: bool,
    /// When the last logical call finished.
    pub last_request_time: Option<DateTime<Utc>>,
}

/// Per-account state, written once per logical call by the orchestrator.
pub trait AccountStore: Send + Sync {
    /// State of `account_id`; default state for unknown accounts.
    fn get(&self, account_id: &str) -> AccountState;

    fn record(&self, account_id: &str, failed: bool);
}

/// In-process [`AccountStore`]. Entries never expire.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, AccountState>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AccountState>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AccountStore for MemoryAccountStore {
    fn get(&self, account_id: &str) -> AccountState {
        self.lock().get(account_id).cloned().unwrap_or_default()
    }

    fn record(&self, account_id: &str, failed: bool) {
        self.lock().insert(
            account_id.to_owned(),
            AccountState {
                last_request_failed: failed,
                last_request_time: Some(Utc::now()),
            },
        );
    }
}
