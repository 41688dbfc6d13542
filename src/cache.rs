use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Method;
use tokio::time::Instant;

use crate::{CallRequest, CallResponse};

/// Identity of a logical call for caching purposes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub account_id: String,
    pub method: Method,
    pub route: String,
    pub base: Option<String>,
    pub query: BTreeMap<String, String>,
    /// Canonical JSON text of the body.
    pub body: Option<String>,
}

impl CacheKey {
    /// Key for `request`, with `base` being the resolved base URL.
    pub fn for_request(request: &CallRequest, base: Option<&str>) -> Self {
        Self {
            account_id: request.account_id.clone(),
            method: request.method.clone(),
            route: request.route.clone(),
            base: base.map(str::to_owned),
            query: request.query.clone(),
            body: request.body.as_ref().map(|body| body.to_string()),
        }
    }
}

/// Response memoizer consulted before the first attempt of a call.
pub trait CacheStore: Send + Sync {
    /// Returns the stored value unless it is at least `ttl` old.
    fn get(&self, key: &CacheKey, ttl: Duration) -> Option<CallResponse>;

    /// Stores `value`; `ttl` is the lifetime the writing call resolved.
    fn put(&self, key: CacheKey, value: CallResponse, ttl: Duration);
}

#[derive(Debug)]
struct CacheEntry {
    value: CallResponse,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) >= ttl
    }
}

/// In-process [`CacheStore`]. Expired entries are swept on every write.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey, ttl: Duration) -> Option<CallResponse> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now(), ttl) {
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, key: CacheKey, value: CallResponse, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| !entry.is_expired(now, entry.ttl));
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                ttl,
            },
        );
    }
}
