//! Rate-limited, retrying dispatcher for upstream price searches.
//!
//! All searches go through a single FIFO queue drained by one worker task, so
//! at most one upstream call is in flight and request starts are spaced by
//! `1000ms / requests_per_second`. Retryable failures (429, 5xx) go back to
//! the tail of the queue after an exponential backoff; everything else is
//! returned to the caller straight away. A failed request never blocks the
//! requests queued behind it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::external::flight_search::{DateRange, FlightQuote, FlightSearchProvider, SearchError};
use crate::models::{normalize_code, RouteKey};
use crate::services::rate_limiter::RateLimiter;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub requests_per_second: u32,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

impl SchedulerConfig {
    /// `base_delay * 2^retries`
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retries))
    }
}

/// What to ask the upstream for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchRequest {
    pub origin: String,
    pub destination: Option<String>,
    pub dates: DateRange,
}

impl SearchRequest {
    pub fn for_route(route: &RouteKey, dates: DateRange) -> Self {
        Self {
            origin: route.origin().to_string(),
            destination: Some(route.destination().to_string()),
            dates,
        }
    }

    /// Requests sharing this key are served by one upstream call.
    pub fn batch_key(&self) -> String {
        normalize_code(&self.origin)
    }

    fn accepts(&self, quote: &FlightQuote) -> bool {
        self.dates.contains(quote.departure_date)
            && self
                .destination
                .as_deref()
                .map_or(true, |d| quote.destination.eq_ignore_ascii_case(d))
    }
}

pub type SearchResult = Result<Vec<FlightQuote>, SearchError>;

struct UpstreamRequest {
    config: SearchRequest,
    retries: u32,
    respond_to: oneshot::Sender<SearchResult>,
}

/// Handle to the scheduler queue. Cheap to clone; the worker stops once every
/// handle is dropped and no retries are waiting.
#[derive(Clone)]
pub struct RequestScheduler {
    tx: mpsc::UnboundedSender<UpstreamRequest>,
}

impl RequestScheduler {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(provider: Arc<dyn FlightSearchProvider>, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SchedulerWorker {
            provider,
            limiter: RateLimiter::new(1, config.requests_per_second),
            requeue: tx.downgrade(),
            config,
            rx,
        };
        tokio::spawn(worker.run());
        Self { tx }
    }

    /// Queue one search and wait for its final outcome (after any retries).
    pub async fn enqueue(&self, config: SearchRequest) -> SearchResult {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(UpstreamRequest {
                config,
                retries: 0,
                respond_to,
            })
            .map_err(|_| SearchError::SchedulerClosed)?;

        response.await.map_err(|_| SearchError::SchedulerClosed)?
    }

    /// Run many searches, issuing one upstream call per distinct origin.
    ///
    /// Requests sharing an origin are merged into an "anywhere" search over the
    /// union of their date ranges; each request then gets the subset of the
    /// shared result matching its own destination and dates. Results come back
    /// in input order within each origin group.
    pub async fn search_batch(&self, requests: Vec<SearchRequest>) -> Vec<(SearchRequest, SearchResult)> {
        let mut groups: Vec<(String, Vec<SearchRequest>)> = Vec::new();
        for request in requests {
            let key = request.batch_key();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(request),
                None => groups.push((key, vec![request])),
            }
        }

        info!("Dispatching {} upstream batch(es)", groups.len());

        let batches = groups
            .into_iter()
            .map(|(origin, members)| self.run_group(origin, members));

        join_all(batches).await.into_iter().flatten().collect()
    }

    async fn run_group(
        &self,
        origin: String,
        members: Vec<SearchRequest>,
    ) -> Vec<(SearchRequest, SearchResult)> {
        if let [only] = members.as_slice() {
            let result = self.enqueue(only.clone()).await;
            return vec![(only.clone(), result)];
        }

        let Some(first) = members.first() else {
            return Vec::new();
        };
        let dates = members
            .iter()
            .fold(first.dates, |acc, request| acc.union(&request.dates));

        debug!("Batching {} requests from {} into one search", members.len(), origin);
        let shared = self
            .enqueue(SearchRequest {
                origin,
                destination: None,
                dates,
            })
            .await;

        members
            .into_iter()
            .map(|request| {
                let result = match &shared {
                    Ok(quotes) => Ok(quotes.iter().filter(|q| request.accepts(q)).cloned().collect()),
                    Err(e) => Err(e.clone()),
                };
                (request, result)
            })
            .collect()
    }
}

struct SchedulerWorker {
    provider: Arc<dyn FlightSearchProvider>,
    limiter: RateLimiter,
    config: SchedulerConfig,
    requeue: mpsc::WeakUnboundedSender<UpstreamRequest>,
    rx: mpsc::UnboundedReceiver<UpstreamRequest>,
}

impl SchedulerWorker {
    async fn run(mut self) {
        info!(
            "🚀 Request scheduler started ({} req/s, max {} retries, provider: {})",
            self.config.requests_per_second,
            self.config.max_retries,
            self.provider.name()
        );

        while let Some(request) = self.rx.recv().await {
            self.dispatch(request).await;
        }

        info!("🛑 Request scheduler stopped");
    }

    async fn dispatch(&self, mut request: UpstreamRequest) {
        if request.respond_to.is_closed() {
            debug!("Dropping search for {}: caller went away", request.config.origin);
            return;
        }

        let _guard = match self.limiter.acquire().await {
            Ok(guard) => guard,
            Err(e) => {
                error!("Rate limiter closed: {}", e);
                let _ = request.respond_to.send(Err(SearchError::SchedulerClosed));
                return;
            }
        };

        let result = self
            .provider
            .search_prices(
                &request.config.origin,
                request.config.destination.as_deref(),
                request.config.dates,
            )
            .await;

        match result {
            Err(e) if e.is_retryable() && request.retries < self.config.max_retries => {
                let delay = self.config.backoff_delay(request.retries);
                request.retries += 1;
                warn!(
                    "Search {} -> {} failed ({}), retrying in {}ms (attempt {}/{})",
                    request.config.origin,
                    request.config.destination.as_deref().unwrap_or("anywhere"),
                    e,
                    delay.as_millis(),
                    request.retries,
                    self.config.max_retries
                );
                self.requeue_after(request, delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    error!(
                        "✗ Search from {} failed after {} retries: {}",
                        request.config.origin, request.retries, e
                    );
                } else {
                    warn!("✗ Search from {} failed: {}", request.config.origin, e);
                }
                let _ = request.respond_to.send(Err(e));
            }
            Ok(quotes) => {
                debug!("✓ {} quotes from {}", quotes.len(), request.config.origin);
                let _ = request.respond_to.send(Ok(quotes));
            }
        }
    }

    /// Put a request back at the tail of the queue once `delay` has passed.
    fn requeue_after(&self, request: UpstreamRequest, delay: Duration) {
        let Some(tx) = self.requeue.upgrade() else {
            let _ = request.respond_to.send(Err(SearchError::SchedulerClosed));
            return;
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(mpsc::error::SendError(request)) = tx.send(request) {
                let _ = request.respond_to.send(Err(SearchError::SchedulerClosed));
            }
        });
    }
}
