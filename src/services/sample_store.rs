use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;

use crate::db::price_sample_queries;
use crate::errors::StoreError;
use crate::models::{PriceSample, RouteKey};

/// Durable log of observed prices, replayed into the in-memory route
/// histories the first time a route is touched after startup.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn append(&self, route: &RouteKey, sample: PriceSample) -> Result<(), StoreError>;

    async fn load_since(&self, route: &RouteKey, since: DateTime<Utc>) -> Result<Vec<PriceSample>, StoreError>;

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemorySampleStore {
    samples: Arc<DashMap<RouteKey, Vec<PriceSample>>>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn append(&self, route: &RouteKey, sample: PriceSample) -> Result<(), StoreError> {
        let mut samples = self.samples.entry(route.clone()).or_default();
        if !samples.contains(&sample) {
            samples.push(sample);
        }
        Ok(())
    }

    async fn load_since(&self, route: &RouteKey, since: DateTime<Utc>) -> Result<Vec<PriceSample>, StoreError> {
        let mut samples: Vec<PriceSample> = self
            .samples
            .get(route)
            .map(|s| s.iter().filter(|s| s.observed_at >= since).copied().collect())
            .unwrap_or_default();
        samples.sort_by_key(|s| s.observed_at);
        Ok(samples)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0;
        for mut entry in self.samples.iter_mut() {
            let before = entry.len();
            entry.retain(|s| s.observed_at >= cutoff);
            removed += (before - entry.len()) as u64;
        }
        Ok(removed)
    }
}

pub struct PgSampleStore {
    pool: PgPool,
}

impl PgSampleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SampleStore for PgSampleStore {
    async fn append(&self, route: &RouteKey, sample: PriceSample) -> Result<(), StoreError> {
        Ok(price_sample_queries::insert_sample(&self.pool, route, &sample).await?)
    }

    async fn load_since(&self, route: &RouteKey, since: DateTime<Utc>) -> Result<Vec<PriceSample>, StoreError> {
        Ok(price_sample_queries::fetch_samples_since(&self.pool, route, since).await?)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(price_sample_queries::delete_samples_before(&self.pool, cutoff).await?)
    }
}
