//! Background Jobs Module
//!
//! Jobs registered with the job scheduler service. Each takes a
//! `JobContext`, returns a `JobResult`, and tolerates per-item failures.
//!
//! - `deal_scan_job` - Scans tracked routes for deals, batched by origin
//! - `cleanup_job` - Removes expired deals, stale cache entries and old samples

pub mod cleanup_job;
pub mod deal_scan_job;
