//! Row models returned by repositories.

use chrono::{DateTime, Utc};

/// One entry of the dedup ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub id: i64,
    pub owner_id: i64,
    pub feed_id: i64,
    pub article_link: String,
    pub delivered_at: DateTime<Utc>,
}
