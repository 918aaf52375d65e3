pub mod deal_queries;
pub mod price_sample_queries;
pub mod quota_queries;
