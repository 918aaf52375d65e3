use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RouteKey;

/// A single observed price for a route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Rolling price statistics for one route.
///
/// `samples` is ordered by `observed_at` (oldest first). `min`, `max`, `sum`
/// and `count` always describe exactly the retained samples. `average` is the
/// arithmetic mean after a full recompute and the 90/10 weighted average after
/// light updates.
#[derive(Debug, Clone, Serialize)]
pub struct RouteHistory {
    pub route: RouteKey,
    pub samples: VecDeque<PriceSample>,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: usize,
    pub average: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RouteHistory {
    pub fn empty(route: RouteKey) -> Self {
        Self {
            route,
            samples: VecDeque::new(),
            min: 0.0,
            max: 0.0,
            sum: 0.0,
            count: 0,
            average: 0.0,
            updated_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Arithmetic mean of the retained samples.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn contains(&self, sample: &PriceSample) -> bool {
        self.samples
            .iter()
            .any(|s| s.observed_at == sample.observed_at && s.price == sample.price)
    }

    /// Insert keeping `samples` sorted by time. Returns false for duplicates.
    pub(crate) fn insert_sample(&mut self, sample: PriceSample) -> bool {
        if self.contains(&sample) {
            return false;
        }
        let at = self
            .samples
            .partition_point(|s| s.observed_at <= sample.observed_at);
        self.samples.insert(at, sample);
        true
    }

    /// Drop samples observed before `cutoff` and any beyond `max_samples`
    /// (oldest first). Returns true when something was removed.
    pub(crate) fn prune(&mut self, cutoff: DateTime<Utc>, max_samples: usize) -> bool {
        let before = self.samples.len();
        while let Some(front) = self.samples.front() {
            if front.observed_at < cutoff || self.samples.len() > max_samples {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.len() != before
    }

    /// Rebuild every statistic from the retained samples.
    pub(crate) fn recompute(&mut self) {
        self.count = self.samples.len();
        self.sum = self.samples.iter().map(|s| s.price).sum();
        self.min = self
            .samples
            .iter()
            .map(|s| s.price)
            .fold(f64::INFINITY, f64::min);
        self.max = self
            .samples
            .iter()
            .map(|s| s.price)
            .fold(f64::NEG_INFINITY, f64::max);
        if self.count == 0 {
            self.min = 0.0;
            self.max = 0.0;
            self.average = 0.0;
        } else {
            self.average = self.sum / self.count as f64;
        }
    }

    /// O(1) statistics update for a sample that was just inserted.
    pub(crate) fn apply_light(&mut self, price: f64) {
        if self.count == 0 {
            self.min = price;
            self.max = price;
            self.average = price;
        } else {
            self.min = self.min.min(price);
            self.max = self.max.max(price);
            self.average = (self.average * 9.0 + price) / 10.0;
        }
        self.count += 1;
        self.sum += price;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn route() -> RouteKey {
        RouteKey::new("LHR", "JFK").unwrap()
    }

    #[test]
    fn test_insert_keeps_time_order_and_rejects_duplicates() {
        let now = Utc::now();
        let mut history = RouteHistory::empty(route());
        assert!(history.insert_sample(PriceSample { price: 100.0, observed_at: now }));
        assert!(history.insert_sample(PriceSample {
            price: 90.0,
            observed_at: now - Duration::days(1),
        }));
        assert!(!history.insert_sample(PriceSample { price: 100.0, observed_at: now }));

        assert_eq!(history.samples.len(), 2);
        assert_eq!(history.samples[0].price, 90.0);
    }

    #[test]
    fn test_prune_then_recompute() {
        let now = Utc::now();
        let mut history = RouteHistory::empty(route());
        history.insert_sample(PriceSample { price: 10.0, observed_at: now - Duration::days(100) });
        history.insert_sample(PriceSample { price: 200.0, observed_at: now - Duration::days(5) });
        history.insert_sample(PriceSample { price: 100.0, observed_at: now });

        assert!(history.prune(now - Duration::days(90), 100));
        history.recompute();

        assert_eq!(history.count, 2);
        assert_eq!(history.min, 100.0);
        assert_eq!(history.max, 200.0);
        assert_eq!(history.average, 150.0);
    }

    #[test]
    fn test_light_update_uses_weighted_average() {
        let mut history = RouteHistory::empty(route());
        history.apply_light(100.0);
        history.apply_light(200.0);
        assert_eq!(history.average, 110.0);
        assert_eq!(history.mean(), Some(150.0));
    }
}
