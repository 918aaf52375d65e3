use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration, Instant};

/// Rate limiter to control upstream search frequency
///
/// Enforces both a concurrency cap and a minimum spacing between request
/// starts, keeping us inside the search provider's per-second budget.
pub struct RateLimiter {
    /// Semaphore to limit concurrent requests
    semaphore: Arc<Semaphore>,
    /// Start time of the previous request, if any
    last_request: Mutex<Option<Instant>>,
    /// Minimum delay between request starts
    min_delay: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    /// * `max_concurrent` - Maximum number of concurrent upstream requests
    /// * `requests_per_second` - Maximum request starts per second
    ///
    /// # Example
    /// ```
    /// use flight_deals_backend::services::rate_limiter::RateLimiter;
    ///
    /// // One request in flight, 5 per second (200ms apart)
    /// let limiter = RateLimiter::new(1, 5);
    /// assert_eq!(limiter.min_delay().as_millis(), 200);
    /// ```
    pub fn new(max_concurrent: usize, requests_per_second: u32) -> Self {
        let min_delay_ms = 1_000 / requests_per_second.max(1) as u64;
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            last_request: Mutex::new(None),
            min_delay: Duration::from_millis(min_delay_ms),
        }
    }

    /// Acquire permission to make a request
    ///
    /// This will wait until:
    /// 1. A semaphore permit is available (concurrent limit)
    /// 2. Enough time has passed since the last request started (rate limit)
    ///
    /// Returns a guard that releases the permit when dropped.
    pub async fn acquire(&self) -> Result<RateLimitGuard, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;

        let wait_time = {
            let last = self.last_request.lock();
            last.and_then(|at| self.min_delay.checked_sub(at.elapsed()))
        }; // Lock is dropped here

        // Sleep outside the lock if needed
        if let Some(delay) = wait_time {
            sleep(delay).await;
        }

        *self.last_request.lock() = Some(Instant::now());

        Ok(RateLimitGuard { _permit: permit })
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Get the current utilization (for monitoring)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Guard that holds a rate limit permit
/// The permit is automatically released when this is dropped
pub struct RateLimitGuard {
    _permit: OwnedSemaphorePermit,
}
