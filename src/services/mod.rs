pub mod deal_cache;
pub mod deal_evaluator;
pub mod deal_service;
pub mod deal_store;
pub mod job_scheduler_service;
pub mod price_history_store;
pub mod quota_tracker;
pub mod rate_limiter;
pub mod request_scheduler;
pub mod sample_store;
