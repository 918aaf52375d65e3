use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::models::{PriceSample, RouteHistory, RouteKey};

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Trailing window of retained samples.
    pub window_days: i64,
    /// Hard cap on retained samples per route.
    pub max_samples: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window_days: 90,
            max_samples: 1_000,
        }
    }
}

/// Per-route rolling price statistics.
///
/// Each route has its own mutex, so concurrent updates to one route are
/// serialized while different routes never contend. Readers get snapshots.
#[derive(Clone)]
pub struct PriceHistoryStore {
    routes: Arc<DashMap<RouteKey, Arc<Mutex<RouteHistory>>>>,
    config: HistoryConfig,
}

impl PriceHistoryStore {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    fn slot(&self, route: &RouteKey) -> Arc<Mutex<RouteHistory>> {
        self.routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RouteHistory::empty(route.clone()))))
            .clone()
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.config.window_days)
    }

    /// Append a sample, prune by age and size, and recompute every statistic
    /// from the retained samples.
    pub fn record_price(&self, route: &RouteKey, price: f64, observed_at: DateTime<Utc>) -> RouteHistory {
        let slot = self.slot(route);
        let mut history = slot.lock();

        if !history.insert_sample(PriceSample { price, observed_at }) {
            debug!("Ignoring duplicate sample {} @ {} for {}", price, observed_at, route);
        }
        history.prune(self.cutoff(Utc::now().max(observed_at)), self.config.max_samples);
        history.recompute();
        history.updated_at = Some(Utc::now());

        history.clone()
    }

    /// O(1) update: append the sample and fold it into min/max/sum/count and
    /// the 90/10 weighted average, without pruning. Falls back to a full
    /// recompute when the sample cap is exceeded or the sample is older than
    /// the newest retained one.
    pub fn record_price_light(
        &self,
        route: &RouteKey,
        price: f64,
        observed_at: DateTime<Utc>,
    ) -> RouteHistory {
        let slot = self.slot(route);
        let mut history = slot.lock();

        let sample = PriceSample { price, observed_at };
        let in_order = history
            .samples
            .back()
            .map_or(true, |last| last.observed_at <= observed_at);

        if history.insert_sample(sample) {
            if in_order && history.samples.len() <= self.config.max_samples {
                history.apply_light(price);
            } else {
                history.prune(self.cutoff(Utc::now().max(observed_at)), self.config.max_samples);
                history.recompute();
            }
        } else {
            debug!("Ignoring duplicate sample {} @ {} for {}", price, observed_at, route);
        }
        history.updated_at = Some(Utc::now());

        history.clone()
    }

    /// Bulk-load historical samples (e.g. from the sample store), then prune
    /// and recompute.
    pub fn load_history(&self, route: &RouteKey, samples: &[PriceSample]) -> RouteHistory {
        let slot = self.slot(route);
        let mut history = slot.lock();

        for sample in samples {
            history.insert_sample(*sample);
        }
        history.prune(self.cutoff(Utc::now()), self.config.max_samples);
        history.recompute();
        history.updated_at = Some(Utc::now());

        history.clone()
    }

    pub fn get_history(&self, route: &RouteKey) -> Option<RouteHistory> {
        let slot = self.routes.get(route)?.clone();
        let history = slot.lock();
        Some(history.clone())
    }

    /// Prune every route against `now`. Returns how many routes changed.
    pub fn prune_all(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let slots: Vec<Arc<Mutex<RouteHistory>>> =
            self.routes.iter().map(|entry| entry.value().clone()).collect();

        let mut pruned = 0;
        for slot in slots {
            let mut history = slot.lock();
            if history.prune(cutoff, self.config.max_samples) {
                history.recompute();
                pruned += 1;
            }
        }
        pruned
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
