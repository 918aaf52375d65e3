use crate::services::deal_service::DealService;

#[derive(Clone)]
pub struct AppState {
    pub deal_service: DealService,
    /// Days covered by a search when the caller gives no date range.
    pub search_window_days: u32,
}
