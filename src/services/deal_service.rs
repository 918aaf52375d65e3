//! Deal lookup and free-signal gating.
//!
//! Ties the upstream scheduler, route histories, evaluator, cache and stores
//! together. Each quote is scored against the route's baseline as it stood
//! before the quote arrived, then recorded into that baseline.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashSet;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::external::flight_search::{DateRange, FlightQuote};
use crate::models::{
    normalize_code, parse_place_code, DealRecord, EvaluationMode, PriceObservation, PriceSample, RouteHistory, RouteKey,
    TrackedRoute,
};
use crate::services::deal_cache::{CacheKey, DealCache, RefreshCoalescer, RefreshResult};
use crate::services::deal_evaluator::DealEvaluator;
use crate::services::deal_store::{rank_deals, DealStore};
use crate::services::price_history_store::PriceHistoryStore;
use crate::services::quota_tracker::QuotaTracker;
use crate::services::request_scheduler::{RequestScheduler, SearchRequest};
use crate::services::sample_store::SampleStore;

#[derive(Debug, Clone)]
pub struct DealServiceConfig {
    /// Most deals an origin listing can return.
    pub origin_listing_max: usize,
    /// How long past their ttl cache entries survive before being purged.
    pub cache_purge_grace: Duration,
}

impl Default for DealServiceConfig {
    fn default() -> Self {
        Self {
            origin_listing_max: 50,
            cache_purge_grace: Duration::hours(1),
        }
    }
}

pub struct DealServiceParts {
    pub history: PriceHistoryStore,
    pub evaluator: DealEvaluator,
    pub scheduler: RequestScheduler,
    pub cache: DealCache,
    pub quota: QuotaTracker,
    pub deals: Arc<dyn DealStore>,
    pub samples: Arc<dyn SampleStore>,
    pub config: DealServiceConfig,
}

/// Result of a quota-gated search.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignalOutcome {
    Deals { deals: Vec<DealRecord>, remaining: u32 },
    QuotaExceeded { limit: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub routes_scanned: usize,
    pub routes_failed: usize,
    pub deals_found: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub expired_deals: u64,
    pub cache_entries_purged: usize,
    pub routes_pruned: usize,
    pub samples_deleted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryUpdate {
    Full,
    Light,
}

#[derive(Clone)]
pub struct DealService {
    history: PriceHistoryStore,
    evaluator: Arc<DealEvaluator>,
    scheduler: RequestScheduler,
    cache: DealCache,
    refreshes: RefreshCoalescer,
    quota: QuotaTracker,
    deals: Arc<dyn DealStore>,
    samples: Arc<dyn SampleStore>,
    hydrated: Arc<DashSet<RouteKey>>,
    config: DealServiceConfig,
}

impl DealService {
    pub fn new(parts: DealServiceParts) -> Self {
        Self {
            history: parts.history,
            evaluator: Arc::new(parts.evaluator),
            scheduler: parts.scheduler,
            cache: parts.cache,
            refreshes: RefreshCoalescer::new(),
            quota: parts.quota,
            deals: parts.deals,
            samples: parts.samples,
            hydrated: Arc::new(DashSet::new()),
            config: parts.config,
        }
    }

    pub fn cache(&self) -> &DealCache {
        &self.cache
    }

    pub fn history(&self) -> &PriceHistoryStore {
        &self.history
    }

    /// Active deals for a route. Serves cached results (stale ones too, with
    /// a background refresh) and searches upstream on a miss. Upstream
    /// failures degrade to whatever is already persisted for the route.
    pub async fn find_deals_for_route(
        &self,
        origin: &str,
        destination: &str,
        dates: DateRange,
    ) -> Result<Vec<DealRecord>, AppError> {
        let route = RouteKey::new(origin, destination)?;
        let key = CacheKey::Route(route.clone());
        let now = Utc::now();

        if let Some(read) = self.cache.get_at(&key, now) {
            if read.stale {
                debug!("Serving stale deals for {} while refreshing", route);
                self.spawn_refresh(route.clone(), dates);
            }
            return Ok(select_for_dates(read.payload, &dates, now));
        }

        match self.refresh_route(route.clone(), dates).await {
            Ok(deals) => Ok(select_for_dates(deals, &dates, now)),
            Err(e) => {
                warn!("✗ Deal search for {} failed, serving stored deals: {}", route, e);
                let stored = self.deals.active_for_route(&route, now).await.unwrap_or_else(|e| {
                    error!("Failed to read stored deals for {}: {}", route, e);
                    Vec::new()
                });
                Ok(select_for_dates(stored, &dates, now))
            }
        }
    }

    /// Best current deal per destination from `origin`.
    pub async fn find_deals_from_origin(&self, origin: &str, limit: usize) -> Result<Vec<DealRecord>, AppError> {
        let origin = parse_place_code(origin)?;
        let limit = limit.clamp(1, self.config.origin_listing_max);
        let key = CacheKey::Origin(origin.clone());
        let now = Utc::now();

        if let Some(read) = self.cache.get_at(&key, now) {
            if !read.stale {
                return Ok(take_active(read.payload, limit, now));
            }
        }

        let deals = self
            .deals
            .active_from_origin(&origin, now, self.config.origin_listing_max)
            .await?;
        self.cache.put_at(key, &deals, None, now);

        Ok(take_active(deals, limit, now))
    }

    /// Record a price seen outside a search (e.g. reported by a client).
    /// Reported prices take the O(1) weighted-average update; the next
    /// search or prune recomputes the route from its retained samples.
    pub async fn record_observed_price(
        &self,
        origin: &str,
        destination: &str,
        price: f64,
        departure_date: NaiveDate,
        currency: &str,
    ) -> Result<RouteHistory, AppError> {
        let route = RouteKey::new(origin, destination)?;
        let observation = PriceObservation::new(route, price, currency, departure_date, Utc::now())?;

        self.ensure_hydrated(&observation.route, observation.observed_at).await;
        let history = self
            .record(&observation.route, observation.price, observation.observed_at, HistoryUpdate::Light)
            .await;

        debug!(
            "Recorded {} {} for {} departing {}",
            observation.price, observation.currency, observation.route, observation.departure_date
        );
        Ok(history)
    }

    pub fn route_history(&self, origin: &str, destination: &str) -> Result<Option<RouteHistory>, AppError> {
        let route = RouteKey::new(origin, destination)?;
        Ok(self.history.get_history(&route))
    }

    pub async fn get_remaining_free_signals(&self, identity_id: &str) -> Result<u32, AppError> {
        let identity_id = validate_identity(identity_id)?;
        Ok(self.quota.get_remaining(identity_id).await?)
    }

    /// Charge one free signal, returning how many have been used so far.
    pub async fn consume_free_signal(&self, identity_id: &str) -> Result<u32, AppError> {
        let identity_id = validate_identity(identity_id)?;
        Ok(self.quota.consume(identity_id).await?)
    }

    /// Fresh upstream search for a route, charged against the caller's free
    /// signals. Exhausted callers get `QuotaExceeded` and no search is made; a
    /// failed search is not charged.
    pub async fn signal_search(
        &self,
        identity_id: &str,
        origin: &str,
        destination: &str,
        dates: DateRange,
    ) -> Result<SignalOutcome, AppError> {
        let identity_id = validate_identity(identity_id)?;
        let route = RouteKey::new(origin, destination)?;

        if self.quota.get_remaining(identity_id).await? == 0 {
            info!("🔒 Signal search for {} refused: quota exhausted", identity_id);
            return Ok(SignalOutcome::QuotaExceeded {
                limit: self.quota.limit(),
            });
        }

        let deals = self
            .refresh_route(route, dates)
            .await
            .map_err(AppError::Upstream)?;
        let consumed = self.quota.consume(identity_id).await?;
        let remaining = self.quota.limit().saturating_sub(consumed);

        Ok(SignalOutcome::Deals {
            deals: select_for_dates(deals, &dates, Utc::now()),
            remaining,
        })
    }

    /// Batch scan of tracked routes sharing one origin: a single upstream
    /// search, batch thresholds, one alert cache entry per tracked route.
    /// A failing route is counted and skipped.
    pub async fn scan_origin(&self, origin: &str, routes: &[TrackedRoute], dates: DateRange) -> ScanSummary {
        let origin = normalize_code(origin);
        let routes: Vec<&TrackedRoute> = routes
            .iter()
            .filter(|tracked| {
                let matches = tracked.route.origin() == origin;
                if !matches {
                    warn!("Skipping {} in scan of origin {}", tracked.route, origin);
                }
                matches
            })
            .collect();

        let requests = routes
            .iter()
            .map(|tracked| SearchRequest::for_route(&tracked.route, dates))
            .collect();
        let results = self.scheduler.search_batch(requests).await;

        let now = Utc::now();
        let mut summary = ScanSummary::default();
        let mut alerts: Vec<(CacheKey, Vec<DealRecord>)> = Vec::new();
        let mut new_deals = 0;

        for (tracked, (_, result)) in routes.iter().zip(results) {
            summary.routes_scanned += 1;
            let quotes = match result {
                Ok(quotes) => quotes,
                Err(e) => {
                    warn!("✗ Scan failed for {} ({}): {}", tracked.route, tracked.alert_id, e);
                    summary.routes_failed += 1;
                    continue;
                }
            };

            let deals = self
                .process_quotes(&tracked.route, &quotes, EvaluationMode::Batch, now)
                .await;
            new_deals += self.persist(&deals).await;
            summary.deals_found += deals.len();
            alerts.push((
                CacheKey::Alert {
                    alert_id: tracked.alert_id.clone(),
                    origin: origin.clone(),
                },
                deals,
            ));
        }

        if new_deals > 0 {
            self.cache.invalidate(&origin);
        }
        for (key, deals) in alerts {
            self.cache.put_at(key, &deals, None, now);
        }

        info!(
            "✓ Scanned {} routes from {}: {} deals, {} failed",
            summary.routes_scanned, origin, summary.deals_found, summary.routes_failed
        );
        summary
    }

    /// Drop expired deals, samples and cache entries older than their windows.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupSummary, AppError> {
        let expired_deals = self.deals.delete_expired(now).await?;
        let cache_entries_purged = self.cache.purge_expired(self.config.cache_purge_grace, now);
        let routes_pruned = self.history.prune_all(now);
        let cutoff = now - Duration::days(self.history.config().window_days);
        let samples_deleted = self.samples.delete_before(cutoff).await?;

        Ok(CleanupSummary {
            expired_deals,
            cache_entries_purged,
            routes_pruned,
            samples_deleted,
        })
    }

    fn spawn_refresh(&self, route: RouteKey, dates: DateRange) {
        if self.refreshes.is_refreshing(&CacheKey::Route(route.clone())) {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.refresh_route(route.clone(), dates).await {
                warn!("✗ Background refresh of {} failed: {}", route, e);
            }
        });
    }

    /// Search upstream for a route and rebuild its cache entry. Concurrent
    /// callers for the same route share one search.
    async fn refresh_route(&self, route: RouteKey, dates: DateRange) -> RefreshResult {
        let service = self.clone();
        let key = CacheKey::Route(route.clone());
        self.refreshes
            .run(key, move || async move {
                service
                    .search_route(route, dates)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
    }

    async fn search_route(&self, route: RouteKey, dates: DateRange) -> Result<Vec<DealRecord>, AppError> {
        let quotes = self
            .scheduler
            .enqueue(SearchRequest::for_route(&route, dates))
            .await?;

        let now = Utc::now();
        let found = self
            .process_quotes(&route, &quotes, EvaluationMode::Interactive, now)
            .await;

        if self.persist(&found).await > 0 {
            self.cache.invalidate(route.origin());
        }

        let active = match self.deals.active_for_route(&route, now).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read stored deals for {}: {}", route, e);
                found
            }
        };
        self.cache.put_at(CacheKey::Route(route.clone()), &active, None, now);

        Ok(active)
    }

    /// Interactive quotes departing inside the last-minute horizon are scored
    /// in last-minute mode, which allows provisional deals.
    fn mode_for(&self, mode: EvaluationMode, departure: NaiveDate, today: NaiveDate) -> EvaluationMode {
        let horizon = self.evaluator.thresholds_for(EvaluationMode::Interactive).last_minute_days;
        if mode == EvaluationMode::Interactive && (departure - today).num_days() <= horizon {
            EvaluationMode::LastMinute
        } else {
            mode
        }
    }

    async fn process_quotes(
        &self,
        route: &RouteKey,
        quotes: &[FlightQuote],
        mode: EvaluationMode,
        now: DateTime<Utc>,
    ) -> Vec<DealRecord> {
        self.ensure_hydrated(route, now).await;

        let mut deals = Vec::new();
        for quote in quotes {
            if !quote.destination.eq_ignore_ascii_case(route.destination()) {
                continue;
            }
            if !quote.price.is_finite() || quote.price <= 0.0 {
                debug!("Skipping unusable quote {} for {}", quote.price, route);
                continue;
            }

            let baseline = self.history.get_history(route);
            let mode = self.mode_for(mode, quote.departure_date, now.date_naive());
            let verdict = self
                .evaluator
                .evaluate(route, quote, baseline.as_ref(), mode, now);
            self.record(route, quote.price, now, HistoryUpdate::Full).await;

            match verdict.into_deal() {
                Some(deal) => {
                    info!("💸 Deal on {}: {} {} ({}% off)", route, deal.price, deal.currency, deal.discount_percent);
                    deals.push(deal);
                }
                None => debug!("No deal on {} at {}", route, quote.price),
            }
        }
        deals
    }

    async fn record(
        &self,
        route: &RouteKey,
        price: f64,
        observed_at: DateTime<Utc>,
        update: HistoryUpdate,
    ) -> RouteHistory {
        let history = match update {
            HistoryUpdate::Full => self.history.record_price(route, price, observed_at),
            HistoryUpdate::Light => self.history.record_price_light(route, price, observed_at),
        };
        if let Err(e) = self.samples.append(route, PriceSample { price, observed_at }).await {
            warn!("Failed to persist price sample for {}: {}", route, e);
        }
        history
    }

    /// Load persisted samples the first time a route is touched.
    async fn ensure_hydrated(&self, route: &RouteKey, now: DateTime<Utc>) {
        if !self.hydrated.insert(route.clone()) {
            return;
        }
        let since = now - Duration::days(self.history.config().window_days);
        match self.samples.load_since(route, since).await {
            Ok(samples) if samples.is_empty() => {}
            Ok(samples) => {
                let history = self.history.load_history(route, &samples);
                debug!("Loaded {} samples for {}", history.count, route);
            }
            Err(e) => {
                warn!("Failed to load price samples for {}: {}", route, e);
                self.hydrated.remove(route);
            }
        }
    }

    /// Persist deals, returning how many were new.
    async fn persist(&self, deals: &[DealRecord]) -> usize {
        let mut inserted = 0;
        for deal in deals {
            match self.deals.upsert(deal).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to store deal {} for {}: {}", deal.id, deal.route, e),
            }
        }
        inserted
    }
}

fn validate_identity(identity_id: &str) -> Result<&str, AppError> {
    let trimmed = identity_id.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Identity must not be empty".to_string()));
    }
    Ok(trimmed)
}

fn select_for_dates(deals: Vec<DealRecord>, dates: &DateRange, now: DateTime<Utc>) -> Vec<DealRecord> {
    deals
        .into_iter()
        .filter(|d| d.is_active(now) && dates.contains(d.departure_date))
        .collect()
}

fn take_active(deals: Vec<DealRecord>, limit: usize, now: DateTime<Utc>) -> Vec<DealRecord> {
    let mut deals: Vec<DealRecord> = deals.into_iter().filter(|d| d.is_active(now)).collect();
    rank_deals(&mut deals);
    deals.truncate(limit);
    deals
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::external::flight_search::{FlightSearchProvider, SearchError};
    use crate::services::deal_evaluator::EvaluatorConfig;
    use crate::services::deal_store::InMemoryDealStore;
    use crate::services::price_history_store::HistoryConfig;
    use crate::services::quota_tracker::InMemoryQuotaStore;
    use crate::services::request_scheduler::SchedulerConfig;
    use crate::services::sample_store::InMemorySampleStore;

    /// Returns queued responses in order, then empty results.
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<Vec<FlightQuote>, SearchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<Vec<FlightQuote>, SearchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FlightSearchProvider for ScriptedProvider {
        async fn search_prices(
            &self,
            _origin: &str,
            _destination: Option<&str>,
            _dates: DateRange,
        ) -> Result<Vec<FlightQuote>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap().pop().unwrap_or(Ok(Vec::new()))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn departure() -> NaiveDate {
        Utc::now().date_naive() + Duration::days(60)
    }

    fn dates() -> DateRange {
        DateRange::starting(departure() - Duration::days(5), 10)
    }

    fn quote(destination: &str, price: f64) -> FlightQuote {
        FlightQuote {
            origin: "LHR".into(),
            destination: destination.into(),
            destination_name: destination.into(),
            price,
            currency: "GBP".into(),
            departure_date: departure(),
            return_date: None,
            airline: "Test Air".into(),
            deep_link: format!("https://book/{}", destination),
        }
    }

    fn service(provider: Arc<ScriptedProvider>, quota_limit: u32) -> DealService {
        let scheduler = RequestScheduler::start(
            provider,
            SchedulerConfig {
                requests_per_second: 1_000,
                max_retries: 0,
                base_delay: std::time::Duration::from_millis(1),
            },
        );
        DealService::new(DealServiceParts {
            history: PriceHistoryStore::new(HistoryConfig::default()),
            evaluator: DealEvaluator::new(EvaluatorConfig::default()),
            scheduler,
            cache: DealCache::new(Duration::minutes(10)),
            quota: QuotaTracker::new(Arc::new(InMemoryQuotaStore::new()), quota_limit, None),
            deals: Arc::new(InMemoryDealStore::new()),
            samples: Arc::new(InMemorySampleStore::new()),
            config: DealServiceConfig::default(),
        })
    }

    async fn seed(service: &DealService, destination: &str, prices: &[f64]) {
        for price in prices {
            service
                .record_observed_price("LHR", destination, *price, departure(), "GBP")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_route_search_finds_deal_and_caches_it() {
        let provider = ScriptedProvider::new(vec![Ok(vec![quote("JFK", 70.0)])]);
        let service = service(provider.clone(), 3);
        seed(&service, "JFK", &[100.0, 100.0, 100.0]).await;

        let deals = service.find_deals_for_route("lhr", "jfk", dates()).await.unwrap();
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].discount_percent, 30);

        // Second call is served from cache
        let again = service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
        assert_eq!(again, deals);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quote_is_scored_before_it_is_recorded() {
        let provider = ScriptedProvider::new(vec![Ok(vec![quote("JFK", 50.0)])]);
        let service = service(provider, 3);
        seed(&service, "JFK", &[100.0, 100.0]).await;

        // Two samples: insufficient history, even though the quote is cheap
        let deals = service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
        assert!(deals.is_empty());

        let history = service.route_history("LHR", "JFK").unwrap().unwrap();
        assert_eq!(history.count, 3);
        assert_eq!(history.min, 50.0);
    }

    #[tokio::test]
    async fn test_cheap_last_minute_quote_without_history_is_provisional() {
        let mut soon = quote("BCN", 120.0);
        soon.departure_date = Utc::now().date_naive() + Duration::days(3);
        let service = service(ScriptedProvider::new(vec![Ok(vec![soon])]), 3);

        let window = DateRange::starting(Utc::now().date_naive(), 7);
        let deals = service.find_deals_for_route("LHR", "BCN", window).await.unwrap();
        assert_eq!(deals.len(), 1);
        assert!(deals[0].provisional);
        assert_eq!(deals[0].discount_percent, 20);
        assert_eq!(deals[0].average_price_at_evaluation, 150.0);
    }

    #[tokio::test]
    async fn test_upstream_failure_degrades_to_no_deals() {
        let provider = ScriptedProvider::new(vec![Err(SearchError::Client {
            status: 400,
            message: "bad request".into(),
        })]);
        let service = service(provider, 3);

        let deals = service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
        assert!(deals.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_route_is_rejected() {
        let service = service(ScriptedProvider::new(vec![]), 3);
        let err = service.find_deals_for_route("LHR", "lhr", dates()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_signal_search_is_quota_gated() {
        let provider = ScriptedProvider::new(vec![]);
        let service = service(provider.clone(), 1);

        let first = service.signal_search("user-1", "LHR", "JFK", dates()).await.unwrap();
        assert_eq!(first, SignalOutcome::Deals { deals: vec![], remaining: 0 });

        let second = service.signal_search("user-1", "LHR", "JFK", dates()).await.unwrap();
        assert_eq!(second, SignalOutcome::QuotaExceeded { limit: 1 });
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_signal_search_is_not_charged() {
        let provider = ScriptedProvider::new(vec![Err(SearchError::Client {
            status: 404,
            message: "unknown airport".into(),
        })]);
        let service = service(provider, 2);

        assert!(service.signal_search("user-1", "LHR", "JFK", dates()).await.is_err());
        assert_eq!(service.get_remaining_free_signals("user-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scan_origin_isolates_routes_and_fills_alert_cache() {
        let provider = ScriptedProvider::new(vec![Ok(vec![quote("JFK", 40.0), quote("CDG", 95.0)])]);
        let service = service(provider.clone(), 3);
        seed(&service, "JFK", &[100.0, 100.0, 100.0]).await;
        seed(&service, "CDG", &[100.0, 100.0, 100.0]).await;

        let tracked = vec![
            TrackedRoute { alert_id: "nyc".into(), route: RouteKey::new("LHR", "JFK").unwrap() },
            TrackedRoute { alert_id: "paris".into(), route: RouteKey::new("LHR", "CDG").unwrap() },
        ];
        let summary = service.scan_origin("LHR", &tracked, dates()).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary, ScanSummary { routes_scanned: 2, routes_failed: 0, deals_found: 1 });

        let nyc = service
            .cache()
            .get(&CacheKey::Alert { alert_id: "nyc".into(), origin: "LHR".into() })
            .unwrap();
        assert_eq!(nyc.payload.len(), 1);

        let listing = service.find_deals_from_origin("LHR", 10).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].route.destination(), "JFK");
    }

    /// Blocks every search until the test releases it.
    struct GatedProvider {
        gate: tokio::sync::Semaphore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FlightSearchProvider for GatedProvider {
        async fn search_prices(
            &self,
            _origin: &str,
            _destination: Option<&str>,
            _dates: DateRange,
        ) -> Result<Vec<FlightQuote>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.map_err(|e| SearchError::Network(e.to_string()))?;
            permit.forget();
            Ok(vec![quote("JFK", 95.0)])
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    fn cached_deal(route: &RouteKey, created_at: DateTime<Utc>) -> DealRecord {
        DealRecord {
            id: DealRecord::derive_id(route, 60.0, departure(), "https://book/cached", created_at),
            route: route.clone(),
            destination_name: "New York".into(),
            price: 60.0,
            currency: "GBP".into(),
            discount_percent: 40,
            average_price_at_evaluation: 100.0,
            is_last_minute: false,
            provisional: false,
            confidence: 0.8,
            deep_link: "https://book/cached".into(),
            departure_date: departure(),
            created_at,
            expires_at: created_at + Duration::hours(72),
        }
    }

    #[tokio::test]
    async fn test_same_price_itineraries_are_all_kept() {
        let mut later = quote("JFK", 70.0);
        later.departure_date = departure() + Duration::days(2);
        let provider = ScriptedProvider::new(vec![Ok(vec![quote("JFK", 70.0), later])]);
        let service = service(provider, 3);
        seed(&service, "JFK", &[100.0, 100.0, 100.0]).await;

        let deals = service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
        assert_eq!(deals.len(), 2);
        assert_ne!(deals[0].id, deals[1].id);

        let listing = service.find_deals_from_origin("LHR", 10).await.unwrap();
        assert_eq!(listing.len(), 1);
    }

    #[tokio::test]
    async fn test_reported_prices_use_weighted_average_until_next_search() {
        let provider = ScriptedProvider::new(vec![Ok(vec![quote("JFK", 150.0)])]);
        let service = service(provider, 3);
        seed(&service, "JFK", &[100.0, 200.0]).await;

        let history = service.route_history("LHR", "JFK").unwrap().unwrap();
        assert_eq!(history.count, 2);
        assert_eq!(history.average, 110.0);
        assert_eq!(history.max, 200.0);

        // A searched quote goes through the full recompute
        service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
        let history = service.route_history("LHR", "JFK").unwrap().unwrap();
        assert_eq!(history.count, 3);
        assert_eq!(history.average, 150.0);
    }

    #[tokio::test]
    async fn test_stale_route_entry_is_served_while_one_refresh_runs() {
        let provider = Arc::new(GatedProvider {
            gate: tokio::sync::Semaphore::new(0),
            calls: AtomicUsize::new(0),
        });
        let scheduler = RequestScheduler::start(
            provider.clone(),
            SchedulerConfig {
                requests_per_second: 1_000,
                max_retries: 0,
                base_delay: std::time::Duration::from_millis(1),
            },
        );
        let service = DealService::new(DealServiceParts {
            history: PriceHistoryStore::new(HistoryConfig::default()),
            evaluator: DealEvaluator::new(EvaluatorConfig::default()),
            scheduler,
            cache: DealCache::new(Duration::minutes(10)),
            quota: QuotaTracker::new(Arc::new(InMemoryQuotaStore::new()), 3, None),
            deals: Arc::new(InMemoryDealStore::new()),
            samples: Arc::new(InMemorySampleStore::new()),
            config: DealServiceConfig::default(),
        });

        let route = RouteKey::new("LHR", "JFK").unwrap();
        let key = CacheKey::Route(route.clone());
        let written = Utc::now() - Duration::minutes(20);
        let stale = cached_deal(&route, written);
        service.cache().put_at(key.clone(), &[stale.clone()], None, written);

        // Every read returns the stale payload straight away
        for _ in 0..5 {
            let deals = service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
            assert_eq!(deals, vec![stale.clone()]);
        }

        while provider.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let deals = service.find_deals_for_route("LHR", "JFK", dates()).await.unwrap();
        assert_eq!(deals, vec![stale]);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(service.refreshes.is_refreshing(&key));

        provider.gate.add_permits(10);
        while service.refreshes.is_refreshing(&key) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let read = service.cache().get(&key).unwrap();
        assert!(!read.stale);
        assert!(read.payload.is_empty());
    }

    #[tokio::test]
    async fn test_quota_operations() {
        let service = service(ScriptedProvider::new(vec![]), 3);
        assert_eq!(service.get_remaining_free_signals("user-9").await.unwrap(), 3);
        assert_eq!(service.consume_free_signal("user-9").await.unwrap(), 1);
        assert_eq!(service.consume_free_signal("user-9").await.unwrap(), 2);
        assert_eq!(service.get_remaining_free_signals("user-9").await.unwrap(), 1);
        assert!(service.consume_free_signal("  ").await.is_err());
    }
}
