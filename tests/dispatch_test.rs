use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use feed_notifier::channel::ChannelError;
use feed_notifier::db::{self, Pool, SqliteStore};
use feed_notifier::dispatch::{DispatchOutcome, Dispatcher, SkipReason, TestNotificationError};
use feed_notifier::model::{ArticleEvent, FeedRef};
use feed_notifier::store::{DedupLedger, LedgerError};
use feed_notifier::webhook::{DeliveryError, WebhookService};
use tokio::sync::Mutex;

const WEBHOOK: &str = "https://chat.example.com/hooks/abc123";
// 2024-05-01 00:00:00 UTC
const PUBLISHED: i64 = 1_714_521_600;
const DAY: i64 = 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Delivery {
    url: String,
    channel: Option<String>,
    message: String,
}

#[derive(Clone, Default)]
struct RecordingWebhook {
    responses: Arc<Mutex<VecDeque<Result<(), DeliveryError>>>>,
    calls: Arc<Mutex<Vec<Delivery>>>,
}

impl RecordingWebhook {
    fn with_responses(responses: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<Delivery> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl WebhookService for RecordingWebhook {
    async fn deliver(&self, url: &str, channel: Option<&str>, message: &str) -> Result<(), DeliveryError> {
        self.calls.lock().await.push(Delivery {
            url: url.to_string(),
            channel: channel.map(str::to_string),
            message: message.to_string(),
        });
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

/// Ledger whose writes always fail with a storage error.
struct BrokenLedger;

#[async_trait]
impl DedupLedger for BrokenLedger {
    async fn exists(&self, _owner_id: i64, _feed_id: i64, _link: &str) -> Result<bool, LedgerError> {
        Ok(false)
    }

    async fn insert(&self, _owner_id: i64, _feed_id: i64, _link: &str) -> Result<(), LedgerError> {
        Err(LedgerError::Storage("disk I/O error".into()))
    }
}

/// Ledger that always loses the insert race to another dispatch.
struct RacedLedger;

#[async_trait]
impl DedupLedger for RacedLedger {
    async fn exists(&self, _owner_id: i64, _feed_id: i64, _link: &str) -> Result<bool, LedgerError> {
        Ok(false)
    }

    async fn insert(&self, _owner_id: i64, _feed_id: i64, _link: &str) -> Result<(), LedgerError> {
        Err(LedgerError::Duplicate)
    }
}

struct Fixture {
    pool: Pool,
    owner: i64,
    feed: i64,
}

async fn setup() -> Fixture {
    let pool = db::init_memory_pool().await.unwrap();
    let owner = db::upsert_user(&pool, 9, "alice").await.unwrap();
    let feed = db::insert_feed(&pool, owner, "Blog", "https://example.com", None)
        .await
        .unwrap();
    Fixture { pool, owner, feed }
}

async fn configure(pool: &Pool, owner: i64, pairs: &[(&str, &str)]) {
    let values: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    db::save_settings(pool, owner, &values).await.unwrap();
}

fn dispatcher(pool: &Pool, webhook: &RecordingWebhook) -> Dispatcher {
    Dispatcher::with_store(SqliteStore::new(pool.clone()), Arc::new(webhook.clone()))
}

fn article(owner: i64, feed: i64, link: &str, title: &str) -> ArticleEvent {
    ArticleEvent {
        guid: format!("guid-{link}"),
        link: link.to_string(),
        title: title.to_string(),
        timestamp: PUBLISHED,
        owner_uid: owner,
        feed: FeedRef { id: feed, site_url: "https://example.com".into() },
    }
}

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[tokio::test]
async fn untitled_article_is_notified_and_recorded() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK), ("timezone", "UTC")]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let ev = article(fx.owner, fx.feed, "https://example.com/a", "2024-05-01");
    let outcome = d.process_at(&ev, at(PUBLISHED + 3600)).await;
    assert!(matches!(outcome, DispatchOutcome::Notified { recorded: true }));

    let calls = webhook.calls().await;
    assert_eq!(
        calls,
        vec![Delivery {
            url: WEBHOOK.into(),
            channel: None,
            message: "**[Blog](https://example.com)** *2024-05-01 00:00:00 +0000*\n\nhttps://example.com/a".into(),
        }]
    );

    let record = db::dedup_record(&fx.pool, 9, fx.feed, "https://example.com/a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.owner_id, 9);
    assert_eq!(record.feed_id, 1);
    assert_eq!(record.article_link, "https://example.com/a");
}

#[tokio::test]
async fn title_and_timezone_shape_the_message() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK), ("timezone", "Europe/Berlin")]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let ev = article(fx.owner, fx.feed, "https://example.com/b", "<b>Fish &amp; Chips</b>");
    d.process_at(&ev, at(PUBLISHED)).await;

    let calls = webhook.calls().await;
    assert_eq!(
        calls[0].message,
        "**[Blog](https://example.com)** *2024-05-01 02:00:00 +0200*\n\n> Fish & Chips\n\nhttps://example.com/b"
    );
}

#[tokio::test]
async fn second_dispatch_of_same_link_is_skipped() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let ev = article(fx.owner, fx.feed, "https://example.com/a", "Hello");
    assert!(d.process_at(&ev, at(PUBLISHED)).await.is_notified());

    let again = d.process_at(&ev, at(PUBLISHED)).await;
    assert!(matches!(again, DispatchOutcome::Skipped(SkipReason::AlreadyNotified)));
    assert_eq!(webhook.calls().await.len(), 1);
    assert_eq!(db::count_notifications(&fx.pool).await.unwrap(), 1);
}

#[tokio::test]
async fn dispatch_returns_article_unchanged() {
    let fx = setup().await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let ev = article(fx.owner, fx.feed, "https://example.com/a", "Hello");
    let returned = d.dispatch(ev.clone()).await;
    assert_eq!(returned, ev);
    assert!(webhook.calls().await.is_empty());
}

#[tokio::test]
async fn missing_webhook_url_skips_everything() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("timezone", "UTC")]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let outcome = d
        .process_at(&article(fx.owner, fx.feed, "https://example.com/a", "x"), at(PUBLISHED))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Skipped(SkipReason::NotConfigured)));
    assert!(webhook.calls().await.is_empty());
    assert_eq!(db::count_notifications(&fx.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn bad_links_are_rejected() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let empty = d.process_at(&article(fx.owner, fx.feed, "", "x"), at(PUBLISHED)).await;
    assert!(matches!(empty, DispatchOutcome::Skipped(SkipReason::MissingLink)));

    let ftp = d
        .process_at(&article(fx.owner, fx.feed, "ftp://example.com/a", "x"), at(PUBLISHED))
        .await;
    assert!(matches!(ftp, DispatchOutcome::Skipped(SkipReason::InvalidLink(_))));

    let long_link = format!("https://example.com/{}", "a".repeat(800));
    let long = d
        .process_at(&article(fx.owner, fx.feed, &long_link, "x"), at(PUBLISHED))
        .await;
    assert!(matches!(long, DispatchOutcome::Skipped(SkipReason::LinkTooLong { .. })));

    assert!(webhook.calls().await.is_empty());
}

#[tokio::test]
async fn link_of_exactly_768_chars_is_accepted() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let prefix = "https://example.com/";
    let link = format!("{prefix}{}", "a".repeat(768 - prefix.len()));
    let outcome = d.process_at(&article(fx.owner, fx.feed, &link, "x"), at(PUBLISHED)).await;
    assert!(matches!(outcome, DispatchOutcome::Notified { recorded: true }));
}

#[tokio::test]
async fn age_limit_is_inclusive() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK), ("max_announce_age", "2")]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let edge = article(fx.owner, fx.feed, "https://example.com/edge", "x");
    assert!(d.process_at(&edge, at(PUBLISHED + 2 * DAY)).await.is_notified());

    let stale = article(fx.owner, fx.feed, "https://example.com/stale", "x");
    let outcome = d.process_at(&stale, at(PUBLISHED + 2 * DAY + 1)).await;
    match outcome {
        DispatchOutcome::Skipped(SkipReason::TooOld { age, max_age }) => {
            assert_eq!(age, 2 * DAY + 1);
            assert_eq!(max_age, 2 * DAY);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(webhook.calls().await.len(), 1);
}

#[tokio::test]
async fn unknown_feed_is_skipped() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let outcome = d
        .process_at(&article(fx.owner, 4242, "https://example.com/a", "x"), at(PUBLISHED))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Skipped(SkipReason::FeedTitleMissing(4242))));
    assert!(webhook.calls().await.is_empty());
}

#[tokio::test]
async fn category_under_configured_parent_selects_channel() {
    let fx = setup().await;
    let announce = db::insert_category(&fx.pool, fx.owner, "Announce", None).await.unwrap();
    let rust = db::insert_category(&fx.pool, fx.owner, "rust", Some(announce)).await.unwrap();
    let feed = db::insert_feed(&fx.pool, fx.owner, "Rust Blog", "https://blog.rust-lang.org", Some(rust))
        .await
        .unwrap();
    configure(
        &fx.pool,
        fx.owner,
        &[
            ("webhook_url", WEBHOOK),
            ("parent_category_mode", "Enabled"),
            ("parent_category_name", "Announce"),
        ],
    )
    .await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    d.process_at(&article(fx.owner, feed, "https://blog.rust-lang.org/x", "x"), at(PUBLISHED))
        .await;
    let calls = webhook.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].channel.as_deref(), Some("rust"));
}

#[tokio::test]
async fn forced_mode_blocks_feeds_outside_parent() {
    let fx = setup().await;
    db::insert_category(&fx.pool, fx.owner, "Announce", None).await.unwrap();
    let other = db::insert_category(&fx.pool, fx.owner, "Other", None).await.unwrap();
    let misc = db::insert_category(&fx.pool, fx.owner, "misc", Some(other)).await.unwrap();
    let feed = db::insert_feed(&fx.pool, fx.owner, "Misc", "https://misc.example", Some(misc))
        .await
        .unwrap();
    configure(
        &fx.pool,
        fx.owner,
        &[
            ("webhook_url", WEBHOOK),
            ("parent_category_mode", "Forced"),
            ("parent_category_name", "Announce"),
        ],
    )
    .await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let mismatch = d
        .process_at(&article(fx.owner, feed, "https://misc.example/1", "x"), at(PUBLISHED))
        .await;
    assert!(matches!(
        mismatch,
        DispatchOutcome::Skipped(SkipReason::Channel(ChannelError::ParentMismatch { .. }))
    ));

    // The fixture feed has no category at all.
    let orphan = d
        .process_at(&article(fx.owner, fx.feed, "https://example.com/1", "x"), at(PUBLISHED))
        .await;
    assert!(matches!(
        orphan,
        DispatchOutcome::Skipped(SkipReason::Channel(ChannelError::MissingParent { .. }))
    ));

    assert!(webhook.calls().await.is_empty());
    assert_eq!(db::count_notifications(&fx.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_delivery_leaves_no_record() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::with_responses(vec![Err(DeliveryError::Status {
        status: 500,
        body: "boom".into(),
    })]);
    let d = dispatcher(&fx.pool, &webhook);

    let ev = article(fx.owner, fx.feed, "https://example.com/a", "x");
    let outcome = d.process_at(&ev, at(PUBLISHED)).await;
    assert!(matches!(
        outcome,
        DispatchOutcome::Skipped(SkipReason::Delivery(DeliveryError::Status { status: 500, .. }))
    ));
    assert_eq!(db::count_notifications(&fx.pool).await.unwrap(), 0);

    // The next run retries and succeeds.
    assert!(d.process_at(&ev, at(PUBLISHED)).await.is_notified());
    assert_eq!(webhook.calls().await.len(), 2);
}

#[tokio::test]
async fn ledger_write_failure_still_counts_as_notified() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let store = Arc::new(SqliteStore::new(fx.pool.clone()));
    let d = Dispatcher::new(store.clone(), store, Arc::new(BrokenLedger), Arc::new(webhook.clone()));

    let outcome = d
        .process_at(&article(fx.owner, fx.feed, "https://example.com/a", "x"), at(PUBLISHED))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Notified { recorded: false }));
    assert_eq!(webhook.calls().await.len(), 1);
}

#[tokio::test]
async fn duplicate_insert_counts_as_recorded() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let store = Arc::new(SqliteStore::new(fx.pool.clone()));
    let d = Dispatcher::new(store.clone(), store, Arc::new(RacedLedger), Arc::new(webhook.clone()));

    let outcome = d
        .process_at(&article(fx.owner, fx.feed, "https://example.com/a", "x"), at(PUBLISHED))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Notified { recorded: true }));
    assert_eq!(webhook.calls().await.len(), 1);
}

#[tokio::test]
async fn extreme_timestamp_is_too_old_without_overflow() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let ev: ArticleEvent = serde_json::from_str(&format!(
        r#"{{"guid":"g","link":"https://example.com/old","timestamp":{},"owner_uid":{},"feed":{{"id":{}}}}}"#,
        i64::MIN,
        fx.owner,
        fx.feed
    ))
    .unwrap();
    let outcome = d.process_at(&ev, at(PUBLISHED)).await;
    match outcome {
        DispatchOutcome::Skipped(SkipReason::TooOld { age, .. }) => assert_eq!(age, i64::MAX),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(webhook.calls().await.is_empty());
}

#[tokio::test]
async fn concurrent_dispatches_record_once() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK)]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let ev = article(fx.owner, fx.feed, "https://example.com/race", "x");
    let (a, b) = tokio::join!(d.process_at(&ev, at(PUBLISHED)), d.process_at(&ev, at(PUBLISHED)));
    assert!(a.is_notified() || b.is_notified());
    assert_eq!(db::count_notifications(&fx.pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_notification_uses_default_channel() {
    let fx = setup().await;
    configure(&fx.pool, fx.owner, &[("webhook_url", WEBHOOK), ("timezone", "UTC")]).await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    d.send_test_notification(fx.owner, "Feed notifier").await.unwrap();
    let calls = webhook.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].channel, None);
    assert!(calls[0]
        .message
        .starts_with("**Feed notifier**: *alice* tested connectivity at *"));
    assert!(calls[0].message.ends_with(" +0000*."));
    assert_eq!(db::count_notifications(&fx.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_notification_requires_webhook() {
    let fx = setup().await;
    let webhook = RecordingWebhook::default();
    let d = dispatcher(&fx.pool, &webhook);

    let err = d.send_test_notification(fx.owner, "Feed notifier").await.unwrap_err();
    assert!(matches!(err, TestNotificationError::NotConfigured));
    assert!(webhook.calls().await.is_empty());
}
