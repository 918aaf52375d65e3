use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-signal usage for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub identity_id: String,
    pub period_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
}

impl QuotaRecord {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}
