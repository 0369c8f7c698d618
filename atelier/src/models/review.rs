use serde::{Deserialize, Serialize};

use super::thread::UserKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub artist_id: String,
    pub user_key: UserKey,
    pub rating: i64,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Aggregated rating counters of one artist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    /// Sum of every stored review rating.
    pub ratings: i64,
    pub reviewers: i64,
}

impl RatingSummary {
    pub fn average(&self) -> Option<f64> {
        if self.reviewers <= 0 {
            None
        } else {
            Some(self.ratings as f64 / self.reviewers as f64)
        }
    }
}
