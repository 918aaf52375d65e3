use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::db::quota_queries;
use crate::errors::StoreError;
use crate::models::QuotaRecord;

/// Persistence for free-signal counters.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get(&self, identity_id: &str) -> Result<Option<QuotaRecord>, StoreError>;

    /// Count one use atomically. The stored count never exceeds `limit`. When
    /// `reset_before` is set and the current period began before it, a new
    /// period starts at `now`.
    async fn increment(
        &self,
        identity_id: &str,
        limit: u32,
        now: DateTime<Utc>,
        reset_before: Option<DateTime<Utc>>,
    ) -> Result<QuotaRecord, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryQuotaStore {
    records: Arc<DashMap<String, QuotaRecord>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get(&self, identity_id: &str) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.records.get(identity_id).map(|r| r.clone()))
    }

    async fn increment(
        &self,
        identity_id: &str,
        limit: u32,
        now: DateTime<Utc>,
        reset_before: Option<DateTime<Utc>>,
    ) -> Result<QuotaRecord, StoreError> {
        let mut entry = self
            .records
            .entry(identity_id.to_string())
            .or_insert_with(|| QuotaRecord {
                identity_id: identity_id.to_string(),
                period_start: now,
                count: 0,
                limit,
            });

        if reset_before.is_some_and(|cutoff| entry.period_start < cutoff) {
            entry.period_start = now;
            entry.count = 0;
        }
        entry.limit = limit;
        entry.count = (entry.count + 1).min(limit);

        Ok(entry.clone())
    }
}

pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_record(row: quota_queries::QuotaRow, limit: u32) -> QuotaRecord {
    QuotaRecord {
        identity_id: row.identity_id,
        period_start: row.period_start,
        count: row.count.max(0) as u32,
        limit,
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn get(&self, identity_id: &str) -> Result<Option<QuotaRecord>, StoreError> {
        let row = quota_queries::fetch_quota(&self.pool, identity_id).await?;
        // The limit is configuration, not stored state; the tracker fills it in.
        Ok(row.map(|row| to_record(row, 0)))
    }

    async fn increment(
        &self,
        identity_id: &str,
        limit: u32,
        now: DateTime<Utc>,
        reset_before: Option<DateTime<Utc>>,
    ) -> Result<QuotaRecord, StoreError> {
        let limit_i32 = i32::try_from(limit).unwrap_or(i32::MAX);
        let row =
            quota_queries::increment_quota(&self.pool, identity_id, limit_i32, now, reset_before)
                .await?;
        Ok(to_record(row, limit))
    }
}

/// Per-identity free-signal counter.
///
/// Lifetime cap unless a reset window is configured, in which case a period
/// older than the window counts as unused.
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
    limit: u32,
    reset_window: Option<Duration>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>, limit: u32, reset_window: Option<Duration>) -> Self {
        Self {
            store,
            limit,
            reset_window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn reset_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.reset_window.map(|window| now - window)
    }

    pub async fn get_remaining(&self, identity_id: &str) -> Result<u32, StoreError> {
        self.get_remaining_at(identity_id, Utc::now()).await
    }

    pub async fn get_remaining_at(&self, identity_id: &str, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let used = match self.store.get(identity_id).await? {
            Some(record) if self.reset_before(now).is_some_and(|cutoff| record.period_start < cutoff) => 0,
            Some(record) => record.count,
            None => 0,
        };
        Ok(self.limit.saturating_sub(used))
    }

    /// Record one use and return how many have been consumed in the current
    /// period. Never fails on an exhausted quota; the count simply stays at
    /// the limit.
    pub async fn consume(&self, identity_id: &str) -> Result<u32, StoreError> {
        self.consume_at(identity_id, Utc::now()).await
    }

    pub async fn consume_at(&self, identity_id: &str, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let record = self
            .store
            .increment(identity_id, self.limit, now, self.reset_before(now))
            .await?;
        if record.count >= self.limit {
            info!("🔒 Identity {} has used all {} free signals", identity_id, self.limit);
        } else {
            debug!("Identity {} has used {} of {} free signals", identity_id, record.count, self.limit);
        }
        Ok(record.count)
    }
}
