//! Outgoing message text.
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_TITLE_CHARS: usize = 256;
const TITLE_ELLIPSIS: &str = "...";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
// Feed readers substitute the publish date when an article has no title.
static SYNTHETIC_TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{4}-[0-1][0-9]-[0-3][0-9]$").expect("valid date regex"));

/// Strip markup, decode entities and bound the length of an article title.
///
/// Returns `None` when nothing worth quoting is left, including a bare
/// `YYYY-MM-DD` placeholder title.
pub fn sanitize_title(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let stripped = TAG_RE.replace_all(raw, "");
    let decoded = html_escape::decode_html_entities(&stripped);
    let mut title = decoded.trim().to_string();

    if let Some((cut, _)) = title.char_indices().nth(MAX_TITLE_CHARS) {
        title.truncate(cut);
        title.push_str(TITLE_ELLIPSIS);
    }

    if title.is_empty() || SYNTHETIC_TITLE_RE.is_match(&title) {
        return None;
    }
    Some(title)
}

/// `YYYY-MM-DD HH:MM:SS ±HHMM` in the given zone.
pub fn format_timestamp(epoch_secs: i64, tz: Tz) -> String {
    match Utc.timestamp_opt(epoch_secs, 0).single() {
        Some(dt) => dt.with_timezone(&tz).format(TIMESTAMP_FORMAT).to_string(),
        None => epoch_secs.to_string(),
    }
}

pub fn format_now(tz: Tz) -> String {
    Utc::now().with_timezone(&tz).format(TIMESTAMP_FORMAT).to_string()
}

/// Assemble the notification body for one article.
pub fn build_article_message(
    feed_title: &str,
    site_url: &str,
    published: &str,
    title: Option<&str>,
    link: &str,
) -> String {
    let mut lines = vec![format!("**[{feed_title}]({site_url})** *{published}*")];
    if let Some(title) = title {
        lines.push(format!("> {title}"));
    }
    lines.push(link.to_string());
    lines.join("\n\n").trim().to_string()
}

pub fn build_test_message(app_name: &str, login: &str, now: &str) -> String {
    format!("**{app_name}**: *{login}* tested connectivity at *{now}*.")
}

/// Appended when a message is rerouted to the default channel.
pub fn missing_channel_warning(channel: &str) -> String {
    format!("\n\n**WARNING:** This message should have been sent to channel *{channel}*, which could not be found.")
}
