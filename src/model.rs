use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Whether (and how strictly) a feed's category hierarchy selects the channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ParentCategoryMode {
    #[default]
    Disabled,
    Enabled,
    Forced,
}

impl ParentCategoryMode {
    pub const ALL: [ParentCategoryMode; 3] = [
        ParentCategoryMode::Disabled,
        ParentCategoryMode::Enabled,
        ParentCategoryMode::Forced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParentCategoryMode::Disabled => "Disabled",
            ParentCategoryMode::Enabled => "Enabled",
            ParentCategoryMode::Forced => "Forced",
        }
    }

    pub fn parse_mode(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

/// Feed reference carried by an article event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedRef {
    pub id: i64,
    #[serde(default)]
    pub site_url: String,
}

/// One new or updated article, as handed over by the host pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArticleEvent {
    pub guid: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub title: String,
    /// Publish time, epoch seconds.
    pub timestamp: i64,
    pub owner_uid: i64,
    pub feed: FeedRef,
}

/// Resolved notification settings for a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub webhook_url: String,
    pub timezone: Tz,
    pub parent_category_mode: ParentCategoryMode,
    pub parent_category_name: Option<String>,
    pub max_announce_age_days: u32,
}

impl NotificationConfig {
    pub fn max_announce_age_secs(&self) -> i64 {
        i64::from(self.max_announce_age_days) * 24 * 3600
    }
}

/// Where a notification goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelResolution {
    /// The webhook's own default channel.
    Default,
    Named(String),
}

impl ChannelResolution {
    pub fn as_channel(&self) -> Option<&str> {
        match self {
            ChannelResolution::Default => None,
            ChannelResolution::Named(name) => Some(name.as_str()),
        }
    }
}

/// A feed's category and that category's parent, either of which may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedCategories {
    pub category: Option<String>,
    pub parent_category: Option<String>,
}
