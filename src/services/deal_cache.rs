//! Time-windowed deal cache with stale-while-revalidate reads.
//!
//! Entries are kept serialized, the way they would sit in an external
//! key-value store. A read past the entry's ttl still returns the payload,
//! flagged stale; deciding whether and how to refresh is left to the caller.
//! [`RefreshCoalescer`] gives callers at most one in-flight refresh per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::models::{normalize_code, DealRecord, RouteKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Route(RouteKey),
    Origin(String),
    Alert { alert_id: String, origin: String },
}

impl CacheKey {
    pub fn origin(&self) -> &str {
        match self {
            CacheKey::Route(route) => route.origin(),
            CacheKey::Origin(origin) => origin,
            CacheKey::Alert { origin, .. } => origin,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    raw: String,
    written_at: DateTime<Utc>,
    ttl: Duration,
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub payload: Vec<DealRecord>,
    pub stale: bool,
    pub written_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DealCache {
    entries: Arc<DashMap<CacheKey, StoredEntry>>,
    default_ttl: Duration,
}

impl DealCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheRead> {
        self.get_at(key, Utc::now())
    }

    /// Read as of `now`. Malformed entries are dropped and reported as a miss.
    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheRead> {
        let entry = self.entries.get(key)?.clone();

        match serde_json::from_str::<Vec<DealRecord>>(&entry.raw) {
            Ok(payload) => Some(CacheRead {
                payload,
                stale: now - entry.written_at > entry.ttl,
                written_at: entry.written_at,
            }),
            Err(e) => {
                warn!("Discarding corrupt cache entry {:?}: {}", key, e);
                self.entries.remove(key);
                None
            }
        }
    }

    pub fn put(&self, key: CacheKey, payload: &[DealRecord], ttl: Option<Duration>) {
        self.put_at(key, payload, ttl, Utc::now());
    }

    pub fn put_at(&self, key: CacheKey, payload: &[DealRecord], ttl: Option<Duration>, now: DateTime<Utc>) {
        let raw = match serde_json::to_string(payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Not caching {:?}: failed to serialize payload: {}", key, e);
                return;
            }
        };

        self.entries.insert(
            key,
            StoredEntry {
                raw,
                written_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    /// Drop every entry whose route, origin or alert departs from `origin`.
    pub fn invalidate(&self, origin: &str) -> usize {
        let origin = normalize_code(origin);
        let before = self.entries.len();
        self.entries.retain(|key, _| key.origin() != origin);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!("🧹 Invalidated {} cache entries for origin {}", removed, origin);
        }
        removed
    }

    /// Remove entries older than their ttl plus `grace`.
    pub fn purge_expired(&self, grace: Duration, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now - entry.written_at <= entry.ttl + grace);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn put_raw(&self, key: CacheKey, raw: &str) {
        self.entries.insert(
            key,
            StoredEntry {
                raw: raw.to_string(),
                written_at: Utc::now(),
                ttl: self.default_ttl,
            },
        );
    }
}

pub type RefreshResult = Result<Vec<DealRecord>, String>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Joins concurrent refreshes of the same key onto the first in-flight one.
#[derive(Clone, Default)]
pub struct RefreshCoalescer {
    inflight: Arc<Mutex<HashMap<CacheKey, SharedRefresh>>>,
}

impl RefreshCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `refresh` for `key` unless one is already running, in which case
    /// wait for that one instead. `refresh` is only called when no refresh
    /// for the key is in flight.
    pub async fn run<F, Fut>(&self, key: CacheKey, refresh: F) -> RefreshResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshResult> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight refresh for {:?}", key);
                    existing.clone()
                }
                None => {
                    let shared = refresh().boxed().shared();
                    inflight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        let result = shared.clone().await;

        // Whoever finishes first clears the slot, unless a newer refresh took it
        let mut inflight = self.inflight.lock();
        if inflight.get(&key).is_some_and(|current| current.ptr_eq(&shared)) {
            inflight.remove(&key);
        }
        result
    }

    pub fn is_refreshing(&self, key: &CacheKey) -> bool {
        self.inflight.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deal(destination: &str) -> DealRecord {
        let route = RouteKey::new("LHR", destination).unwrap();
        let now = Utc::now();
        let departure_date = NaiveDate::from_ymd_opt(2030, 2, 1).unwrap();
        DealRecord {
            id: DealRecord::derive_id(&route, 99.0, departure_date, "", now),
            route,
            destination_name: destination.to_string(),
            price: 99.0,
            currency: "GBP".into(),
            discount_percent: 30,
            average_price_at_evaluation: 141.0,
            is_last_minute: false,
            provisional: false,
            confidence: 0.8,
            deep_link: String::new(),
            departure_date,
            created_at: now,
            expires_at: now + Duration::hours(48),
        }
    }

    fn route_key(destination: &str) -> CacheKey {
        CacheKey::Route(RouteKey::new("LHR", destination).unwrap())
    }

    #[test]
    fn test_fresh_then_stale_read_returns_same_payload() {
        let cache = DealCache::new(Duration::minutes(10));
        let written = Utc::now();
        let payload = vec![deal("JFK")];
        cache.put_at(route_key("JFK"), &payload, None, written);

        let fresh = cache.get_at(&route_key("JFK"), written + Duration::minutes(5)).unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.payload, payload);

        let stale = cache.get_at(&route_key("JFK"), written + Duration::minutes(11)).unwrap();
        assert!(stale.stale);
        assert_eq!(stale.payload, payload);
    }

    #[test]
    fn test_miss_for_unknown_key() {
        let cache = DealCache::new(Duration::minutes(10));
        assert!(cache.get(&route_key("JFK")).is_none());
    }

    #[test]
    fn test_invalidate_clears_origin_entries_only() {
        let cache = DealCache::new(Duration::minutes(10));
        cache.put(route_key("JFK"), &[deal("JFK")], None);
        cache.put(route_key("CDG"), &[], None);
        cache.put(CacheKey::Origin("LHR".into()), &[], None);
        cache.put(
            CacheKey::Alert { alert_id: "a1".into(), origin: "LHR".into() },
            &[],
            None,
        );
        cache.put(CacheKey::Route(RouteKey::new("MAN", "JFK").unwrap()), &[], None);

        assert_eq!(cache.invalidate("lhr"), 4);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&CacheKey::Route(RouteKey::new("MAN", "JFK").unwrap())).is_some());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let cache = DealCache::new(Duration::minutes(10));
        cache.put_raw(route_key("JFK"), "{not json");
        assert!(cache.get(&route_key("JFK")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = DealCache::new(Duration::minutes(10));
        let now = Utc::now();
        cache.put_at(route_key("JFK"), &[], None, now - Duration::hours(3));
        cache.put_at(route_key("CDG"), &[], None, now);
        assert_eq!(cache.purge_expired(Duration::hours(1), now), 1);
        assert!(cache.get(&route_key("CDG")).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_coalesced() {
        let coalescer = RefreshCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(vec![deal("JFK")])
            }
        };

        let (a, b, c) = tokio::join!(
            coalescer.run(route_key("JFK"), make(calls.clone())),
            coalescer.run(route_key("JFK"), make(calls.clone())),
            coalescer.run(route_key("JFK"), make(calls.clone())),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap(), c.unwrap());
        assert!(!coalescer.is_refreshing(&route_key("JFK")));

        // A later refresh runs again
        coalescer.run(route_key("JFK"), make(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
