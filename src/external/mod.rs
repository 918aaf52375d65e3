pub mod flight_search;
pub mod live_pricing;
pub mod mock_provider;
