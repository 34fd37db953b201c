//! Narrow interfaces onto the feed reader's storage.
use async_trait::async_trait;
use thiserror::Error;

use crate::model::FeedCategories;

/// Read-only queries against feed, category and user data.
#[async_trait]
pub trait FeedLookup: Send + Sync {
    async fn feed_title(&self, feed_id: i64) -> anyhow::Result<Option<String>>;

    /// `Ok(None)` if the feed does not exist.
    async fn feed_categories(&self, feed_id: i64) -> anyhow::Result<Option<FeedCategories>>;

    async fn user_login(&self, owner_id: i64) -> anyhow::Result<Option<String>>;

    /// Titles of categories that have no parent.
    async fn root_categories(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The store already holds a record for this (owner, feed, link).
    #[error("article already recorded as notified")]
    Duplicate,
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Record of already-notified articles.
///
/// `insert` must be rejected by the store itself when the triple already
/// exists; `exists` is only a fast path.
#[async_trait]
pub trait DedupLedger: Send + Sync {
    async fn exists(&self, owner_id: i64, feed_id: i64, link: &str) -> Result<bool, LedgerError>;

    async fn insert(&self, owner_id: i64, feed_id: i64, link: &str) -> Result<(), LedgerError>;
}
