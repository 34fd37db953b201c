//! Maps a feed's category hierarchy onto a destination channel.
use thiserror::Error;
use tracing::debug;

use crate::model::{ChannelResolution, NotificationConfig, ParentCategoryMode};
use crate::store::FeedLookup;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("parent category mode is forced, and no parent category found for feed '{feed_title}' with id '{feed_id}'")]
    MissingParent { feed_title: String, feed_id: i64 },
    #[error("parent category mode is forced, and parent category for feed '{feed_title}' with id '{feed_id}' is not matching")]
    ParentMismatch { feed_title: String, feed_id: i64 },
    #[error("category lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),
}

/// Pick the channel for `feed_id`.
///
/// In `Enabled` mode a feed outside the configured parent category goes to
/// the default channel; in `Forced` mode it is an error and nothing is sent.
pub async fn resolve_channel(
    cfg: &NotificationConfig,
    feed_id: i64,
    lookup: &dyn FeedLookup,
) -> Result<ChannelResolution, ChannelError> {
    if cfg.parent_category_mode == ParentCategoryMode::Disabled {
        return Ok(ChannelResolution::Default);
    }
    let Some(wanted_parent) = cfg.parent_category_name.as_deref().filter(|n| !n.is_empty()) else {
        return Ok(ChannelResolution::Default);
    };

    let categories = lookup.feed_categories(feed_id).await?.unwrap_or_default();
    let forced = cfg.parent_category_mode == ParentCategoryMode::Forced;

    let parent = categories.parent_category.as_deref().filter(|p| !p.is_empty());
    match parent {
        None if forced => {
            let feed_title = lookup.feed_title(feed_id).await?.unwrap_or_default();
            Err(ChannelError::MissingParent { feed_title, feed_id })
        }
        None => Ok(ChannelResolution::Default),
        Some(parent) if parent != wanted_parent => {
            if forced {
                let feed_title = lookup.feed_title(feed_id).await?.unwrap_or_default();
                return Err(ChannelError::ParentMismatch { feed_title, feed_id });
            }
            debug!(feed_id, parent, "parent category not matching; using default channel");
            Ok(ChannelResolution::Default)
        }
        Some(_) => Ok(categories
            .category
            .filter(|c| !c.is_empty())
            .map(ChannelResolution::Named)
            .unwrap_or(ChannelResolution::Default)),
    }
}
