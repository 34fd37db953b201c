use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::model::DedupRecord;
use crate::model::FeedCategories;
use crate::store::LedgerError;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
pub async fn init_memory_pool() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_user(pool: &Pool, id: i64, login: &str) -> Result<i64> {
    sqlx::query("INSERT INTO users (id, login) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET login = excluded.login")
        .bind(id)
        .bind(login)
        .execute(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn delete_user(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_category(
    pool: &Pool,
    owner_id: i64,
    title: &str,
    parent_id: Option<i64>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO feed_categories (owner_uid, title, parent_cat) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(owner_id)
    .bind(title)
    .bind(parent_id)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn insert_feed(
    pool: &Pool,
    owner_id: i64,
    title: &str,
    site_url: &str,
    category_id: Option<i64>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO feeds (owner_uid, title, site_url, cat_id) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(owner_id)
    .bind(title)
    .bind(site_url)
    .bind(category_id)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn delete_feed(pool: &Pool, feed_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM feeds WHERE id = ?")
        .bind(feed_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn feed_title(pool: &Pool, feed_id: i64) -> Result<Option<String>> {
    let title = sqlx::query_scalar::<_, String>("SELECT title FROM feeds WHERE id = ?")
        .bind(feed_id)
        .fetch_optional(pool)
        .await?;
    Ok(title)
}

/// The feed's category and that category's parent, in one query.
#[instrument(skip_all)]
pub async fn feed_categories(pool: &Pool, feed_id: i64) -> Result<Option<FeedCategories>> {
    let row = sqlx::query(
        "SELECT c1.title AS category, c2.title AS parent_category
         FROM feeds AS f
         LEFT JOIN feed_categories AS c1 ON f.cat_id = c1.id
         LEFT JOIN feed_categories AS c2 ON c1.parent_cat = c2.id
         WHERE f.id = ?",
    )
    .bind(feed_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| FeedCategories {
        category: row.get("category"),
        parent_category: row.get("parent_category"),
    }))
}

#[instrument(skip_all)]
pub async fn root_categories(pool: &Pool) -> Result<Vec<String>> {
    let titles = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT title FROM feed_categories WHERE parent_cat IS NULL ORDER BY title",
    )
    .fetch_all(pool)
    .await?;
    Ok(titles)
}

#[instrument(skip_all)]
pub async fn user_login(pool: &Pool, owner_id: i64) -> Result<Option<String>> {
    let login = sqlx::query_scalar::<_, String>("SELECT login FROM users WHERE id = ?")
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;
    Ok(login.filter(|l| !l.is_empty()))
}

#[instrument(skip_all)]
pub async fn load_settings(pool: &Pool, owner_id: i64) -> Result<HashMap<String, String>> {
    let rows = sqlx::query("SELECT key, value FROM settings WHERE owner_uid = ?")
        .bind(owner_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get::<String, _>("key"), row.get::<String, _>("value")))
        .collect())
}

#[instrument(skip_all)]
pub async fn save_settings(pool: &Pool, owner_id: i64, values: &BTreeMap<String, String>) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (key, value) in values {
        sqlx::query(
            "INSERT INTO settings (owner_uid, key, value) VALUES (?, ?, ?)
             ON CONFLICT(owner_uid, key) DO UPDATE SET value = excluded.value",
        )
        .bind(owner_id)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn reset_settings(pool: &Pool, owner_id: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM settings WHERE owner_uid = ?")
        .bind(owner_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn notification_exists(pool: &Pool, owner_id: i64, feed_id: i64, link: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notifications WHERE owner_id = ? AND feed_id = ? AND article_link = ?",
    )
    .bind(owner_id)
    .bind(feed_id)
    .bind(link)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Insert a ledger record. A unique-constraint rejection maps to
/// [`LedgerError::Duplicate`]; every other failure is `Storage`.
#[instrument(skip_all)]
pub async fn insert_notification(
    pool: &Pool,
    owner_id: i64,
    feed_id: i64,
    link: &str,
) -> std::result::Result<(), LedgerError> {
    let res = sqlx::query(
        "INSERT INTO notifications (owner_id, feed_id, article_link, delivered_at) VALUES (?, ?, ?, ?)",
    )
    .bind(owner_id)
    .bind(feed_id)
    .bind(link)
    .bind(Utc::now())
    .execute(pool)
    .await;
    match res {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(LedgerError::Duplicate),
        Err(err) => Err(LedgerError::Storage(err.to_string())),
    }
}

#[instrument(skip_all)]
pub async fn dedup_record(pool: &Pool, owner_id: i64, feed_id: i64, link: &str) -> Result<Option<DedupRecord>> {
    let row = sqlx::query(
        "SELECT id, owner_id, feed_id, article_link, delivered_at FROM notifications
         WHERE owner_id = ? AND feed_id = ? AND article_link = ?",
    )
    .bind(owner_id)
    .bind(feed_id)
    .bind(link)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| DedupRecord {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        feed_id: row.get("feed_id"),
        article_link: row.get("article_link"),
        delivered_at: row.get::<DateTime<Utc>, _>("delivered_at"),
    }))
}

pub async fn count_notifications(pool: &Pool) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}
