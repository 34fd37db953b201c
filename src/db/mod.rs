//! Database module: row models, SQL repositories and the SQLite-backed store.
//!
//! - `model`: rows returned by repositories.
//! - `repo`: SQL-only functions taking a pool.
//!
//! [`SqliteStore`] wires the repository functions into the lookup, ledger and
//! settings interfaces the dispatcher consumes.

pub mod model;
pub mod repo;

pub use model::DedupRecord;
pub use repo::*;

use async_trait::async_trait;

use crate::model::{FeedCategories, NotificationConfig};
use crate::settings::{self, ConfigProvider};
use crate::store::{DedupLedger, FeedLookup, LedgerError};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl FeedLookup for SqliteStore {
    async fn feed_title(&self, feed_id: i64) -> anyhow::Result<Option<String>> {
        repo::feed_title(&self.pool, feed_id).await
    }

    async fn feed_categories(&self, feed_id: i64) -> anyhow::Result<Option<FeedCategories>> {
        repo::feed_categories(&self.pool, feed_id).await
    }

    async fn user_login(&self, owner_id: i64) -> anyhow::Result<Option<String>> {
        repo::user_login(&self.pool, owner_id).await
    }

    async fn root_categories(&self) -> anyhow::Result<Vec<String>> {
        repo::root_categories(&self.pool).await
    }
}

#[async_trait]
impl DedupLedger for SqliteStore {
    async fn exists(&self, owner_id: i64, feed_id: i64, link: &str) -> Result<bool, LedgerError> {
        repo::notification_exists(&self.pool, owner_id, feed_id, link)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    async fn insert(&self, owner_id: i64, feed_id: i64, link: &str) -> Result<(), LedgerError> {
        repo::insert_notification(&self.pool, owner_id, feed_id, link).await
    }
}

#[async_trait]
impl ConfigProvider for SqliteStore {
    async fn notification_config(&self, owner_id: i64) -> anyhow::Result<Option<NotificationConfig>> {
        let raw = repo::load_settings(&self.pool, owner_id).await?;
        Ok(settings::resolve(&raw))
    }
}
