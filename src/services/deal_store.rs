use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::deal_queries;
use crate::errors::StoreError;
use crate::models::{DealRecord, RouteKey};

/// Durable record of surfaced deals.
#[async_trait]
pub trait DealStore: Send + Sync {
    /// Persist a deal. Idempotent on the deal id; returns true if it was new.
    async fn upsert(&self, deal: &DealRecord) -> Result<bool, StoreError>;

    /// Unexpired deals for a route, newest first.
    async fn active_for_route(&self, route: &RouteKey, now: DateTime<Utc>) -> Result<Vec<DealRecord>, StoreError>;

    /// The newest unexpired deal per destination, best discount first.
    async fn active_from_origin(
        &self,
        origin: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DealRecord>, StoreError>;

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Orders deals for origin listings: larger discount first, then cheaper.
pub fn rank_deals(deals: &mut [DealRecord]) {
    deals.sort_by(|a, b| {
        b.discount_percent
            .cmp(&a.discount_percent)
            .then(a.price.total_cmp(&b.price))
    });
}

#[derive(Clone, Default)]
pub struct InMemoryDealStore {
    deals: Arc<DashMap<Uuid, DealRecord>>,
}

impl InMemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }
}

#[async_trait]
impl DealStore for InMemoryDealStore {
    async fn upsert(&self, deal: &DealRecord) -> Result<bool, StoreError> {
        match self.deals.entry(deal.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(deal.clone());
                Ok(true)
            }
        }
    }

    async fn active_for_route(&self, route: &RouteKey, now: DateTime<Utc>) -> Result<Vec<DealRecord>, StoreError> {
        let mut deals: Vec<DealRecord> = self
            .deals
            .iter()
            .filter(|d| &d.route == route && d.is_active(now))
            .map(|d| d.clone())
            .collect();
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deals)
    }

    async fn active_from_origin(
        &self,
        origin: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DealRecord>, StoreError> {
        let mut latest: HashMap<String, DealRecord> = HashMap::new();
        for deal in self.deals.iter() {
            if deal.route.origin() != origin || !deal.is_active(now) {
                continue;
            }
            let destination = deal.route.destination().to_string();
            let newer = latest
                .get(&destination)
                .map_or(true, |current| deal.created_at > current.created_at);
            if newer {
                latest.insert(destination, deal.clone());
            }
        }

        let mut deals: Vec<DealRecord> = latest.into_values().collect();
        rank_deals(&mut deals);
        deals.truncate(limit);
        Ok(deals)
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let count = self.deals.len();
        self.deals.retain(|_, deal| deal.expires_at >= before);
        Ok(count.saturating_sub(self.deals.len()) as u64)
    }
}

pub struct PgDealStore {
    pool: PgPool,
}

impl PgDealStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn upsert(&self, deal: &DealRecord) -> Result<bool, StoreError> {
        Ok(deal_queries::insert_deal(&self.pool, deal).await?)
    }

    async fn active_for_route(&self, route: &RouteKey, now: DateTime<Utc>) -> Result<Vec<DealRecord>, StoreError> {
        deal_queries::fetch_active_for_route(&self.pool, route, now).await
    }

    async fn active_from_origin(
        &self,
        origin: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DealRecord>, StoreError> {
        deal_queries::fetch_active_from_origin(&self.pool, origin, now, limit).await
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(deal_queries::delete_expired(&self.pool, before).await?)
    }
}
