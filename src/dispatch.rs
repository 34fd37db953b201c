//! Per-article notification pipeline.
//!
//! [`Dispatcher::dispatch`] runs a fixed sequence of guards, then formats,
//! delivers and records the notification. Every failure ends processing of
//! that one article: it is logged and the article is handed back untouched.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::channel::{resolve_channel, ChannelError};
use crate::db::SqliteStore;
use crate::message;
use crate::model::ArticleEvent;
use crate::settings::ConfigProvider;
use crate::store::{DedupLedger, FeedLookup, LedgerError};
use crate::webhook::{DeliveryError, WebhookService};

/// Width of the ledger's link column.
pub const MAX_LINK_CHARS: usize = 768;

static LINK_SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^https?://").expect("valid link regex"));

/// Why an article was not notified.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("failed loading notification settings: {0}")]
    ConfigUnavailable(String),
    #[error("webhook URL not configured")]
    NotConfigured,
    #[error("no link found for article")]
    MissingLink,
    #[error("invalid article link: {0}")]
    InvalidLink(String),
    #[error("article link > 768 characters ({chars}), ignoring")]
    LinkTooLong { chars: usize },
    #[error("article has already been notified")]
    AlreadyNotified,
    #[error("dedup ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("article too old: {age}s > {max_age}s")]
    TooOld { age: i64, max_age: i64 },
    #[error("unable to find title of feed with id '{0}'")]
    FeedTitleMissing(i64),
    #[error("feed lookup failed: {0}")]
    LookupFailed(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed sending notification: {0}")]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Delivered. `recorded` is false when the ledger write failed.
    Notified { recorded: bool },
    Skipped(SkipReason),
}

impl DispatchOutcome {
    pub fn is_notified(&self) -> bool {
        matches!(self, DispatchOutcome::Notified { .. })
    }
}

#[derive(Debug, Error)]
pub enum TestNotificationError {
    #[error("webhook URL not configured")]
    NotConfigured,
    #[error("failed loading notification settings: {0}")]
    Settings(#[source] anyhow::Error),
    #[error("user lookup failed: {0}")]
    Lookup(#[source] anyhow::Error),
    #[error("failed sending test message: {0}")]
    Delivery(#[from] DeliveryError),
}

pub struct Dispatcher {
    config: Arc<dyn ConfigProvider>,
    lookup: Arc<dyn FeedLookup>,
    ledger: Arc<dyn DedupLedger>,
    webhook: Arc<dyn WebhookService>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        lookup: Arc<dyn FeedLookup>,
        ledger: Arc<dyn DedupLedger>,
        webhook: Arc<dyn WebhookService>,
    ) -> Self {
        Self { config, lookup, ledger, webhook }
    }

    /// Settings, lookups and ledger all served by one SQLite store.
    pub fn with_store(store: SqliteStore, webhook: Arc<dyn WebhookService>) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store.clone(), store, webhook)
    }

    /// Notify about `article` if it qualifies, and hand it back unchanged.
    pub async fn dispatch(&self, article: ArticleEvent) -> ArticleEvent {
        self.process_at(&article, Utc::now()).await;
        article
    }

    /// Run the pipeline with `now` as the reference time for the age check.
    #[instrument(skip_all, fields(guid = %article.guid))]
    pub async fn process_at(&self, article: &ArticleEvent, now: DateTime<Utc>) -> DispatchOutcome {
        match self.notify(article, now).await {
            Ok(recorded) => {
                info!(
                    owner_id = article.owner_uid,
                    feed_id = article.feed.id,
                    article_link = %article.link,
                    recorded,
                    "article notified"
                );
                DispatchOutcome::Notified { recorded }
            }
            Err(reason) => {
                log_skip(article, &reason);
                DispatchOutcome::Skipped(reason)
            }
        }
    }

    async fn notify(&self, article: &ArticleEvent, now: DateTime<Utc>) -> Result<bool, SkipReason> {
        let cfg = self
            .config
            .notification_config(article.owner_uid)
            .await
            .map_err(|e| SkipReason::ConfigUnavailable(e.to_string()))?
            .filter(|c| !c.webhook_url.is_empty())
            .ok_or(SkipReason::NotConfigured)?;

        let link = article.link.as_str();
        if link.is_empty() {
            return Err(SkipReason::MissingLink);
        }
        if !LINK_SCHEME_RE.is_match(link) {
            return Err(SkipReason::InvalidLink(link.to_string()));
        }
        let chars = link.chars().count();
        if chars > MAX_LINK_CHARS {
            return Err(SkipReason::LinkTooLong { chars });
        }

        let owner_id = article.owner_uid;
        let feed_id = article.feed.id;
        match self.ledger.exists(owner_id, feed_id, link).await {
            Ok(false) => {}
            Ok(true) => return Err(SkipReason::AlreadyNotified),
            Err(e) => return Err(SkipReason::LedgerUnavailable(e.to_string())),
        }

        let age = now.timestamp().saturating_sub(article.timestamp);
        let max_age = cfg.max_announce_age_secs();
        if age > max_age {
            return Err(SkipReason::TooOld { age, max_age });
        }

        let feed_title = self
            .lookup
            .feed_title(feed_id)
            .await
            .map_err(|e| SkipReason::LookupFailed(e.to_string()))?
            .filter(|t| !t.is_empty())
            .ok_or(SkipReason::FeedTitleMissing(feed_id))?;

        let channel = resolve_channel(&cfg, feed_id, self.lookup.as_ref()).await?;

        let title = message::sanitize_title(&article.title);
        let published = message::format_timestamp(article.timestamp, cfg.timezone);
        let text = message::build_article_message(
            &feed_title,
            &article.feed.site_url,
            &published,
            title.as_deref(),
            link,
        );

        self.webhook
            .deliver(&cfg.webhook_url, channel.as_channel(), &text)
            .await?;

        match self.ledger.insert(owner_id, feed_id, link).await {
            Ok(()) => Ok(true),
            Err(LedgerError::Duplicate) => {
                info!(owner_id, feed_id, article_link = %link, "article recorded by a concurrent dispatch");
                Ok(true)
            }
            Err(err) => {
                error!(owner_id, feed_id, article_link = %link, error = %err, "failed marking article as notified");
                Ok(false)
            }
        }
    }

    /// Send a connectivity check to the owner's default channel.
    pub async fn send_test_notification(
        &self,
        owner_id: i64,
        app_name: &str,
    ) -> Result<(), TestNotificationError> {
        let cfg = self
            .config
            .notification_config(owner_id)
            .await
            .map_err(TestNotificationError::Settings)?
            .filter(|c| !c.webhook_url.is_empty())
            .ok_or(TestNotificationError::NotConfigured)?;

        let login = self
            .lookup
            .user_login(owner_id)
            .await
            .map_err(TestNotificationError::Lookup)?
            .unwrap_or_else(|| format!("user {owner_id}"));
        let now = message::format_now(cfg.timezone);
        let text = message::build_test_message(app_name, &login, &now);

        self.webhook.deliver(&cfg.webhook_url, None, &text).await?;
        Ok(())
    }
}

fn log_skip(article: &ArticleEvent, reason: &SkipReason) {
    let owner_id = article.owner_uid;
    let feed_id = article.feed.id;
    let article_link = article.link.as_str();
    match reason {
        SkipReason::ConfigUnavailable(_) | SkipReason::LedgerUnavailable(_) | SkipReason::LookupFailed(_) => {
            error!(owner_id, feed_id, article_link, %reason, "notification skipped");
        }
        SkipReason::Channel(_) | SkipReason::Delivery(_) => {
            warn!(owner_id, feed_id, article_link, %reason, "notification skipped");
        }
        _ => info!(owner_id, feed_id, article_link, %reason, "notification skipped"),
    }
}
