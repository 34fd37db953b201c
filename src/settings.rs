//! Per-owner notification settings: schema, defaults and validation.
//!
//! Settings are stored as plain strings keyed by name. [`resolve`] turns a raw
//! map into a [`NotificationConfig`], filling in defaults; [`validate_update`]
//! checks operator input before it is persisted.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::model::{NotificationConfig, ParentCategoryMode};

pub const WEBHOOK_URL: &str = "webhook_url";
pub const TIMEZONE: &str = "timezone";
pub const PARENT_CATEGORY_MODE: &str = "parent_category_mode";
pub const PARENT_CATEGORY_NAME: &str = "parent_category_name";
pub const MAX_ANNOUNCE_AGE: &str = "max_announce_age";

const WEBHOOK_URL_PATTERN: &str = "^https://.*/hooks/[0-9a-z]+$";

static WEBHOOK_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(WEBHOOK_URL_PATTERN).expect("valid webhook regex"));
static POSITIVE_INT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[1-9][0-9]*$").expect("valid spinner regex"));

/// Source of notification settings, consulted once per dispatch.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// `Ok(None)` when a required setting is missing.
    async fn notification_config(&self, owner_id: i64) -> anyhow::Result<Option<NotificationConfig>>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown setting '{0}'")]
    UnknownKey(String),
    #[error("invalid selection for '{0}'")]
    InvalidSelection(&'static str),
    #[error("invalid non-positive number for '{0}'")]
    NotPositive(&'static str),
    #[error("value for '{key}' does not match {pattern}")]
    PatternMismatch { key: &'static str, pattern: &'static str },
    #[error("'parent_category_name' is required when 'parent_category_mode' is {mode}")]
    ParentNameRequired { mode: &'static str },
}

#[derive(Debug, Clone, Copy)]
enum SelectValues {
    TimeZones,
    Modes,
    RootCategories,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Text { regex: &'static Lazy<Regex>, pattern: &'static str },
    Select(SelectValues),
    Spinner,
}

#[derive(Debug, Clone, Copy)]
struct SettingDef {
    key: &'static str,
    kind: Kind,
    default: Option<&'static str>,
    required: bool,
}

static SCHEMA: [SettingDef; 5] = [
    SettingDef {
        key: WEBHOOK_URL,
        kind: Kind::Text { regex: &WEBHOOK_URL_RE, pattern: WEBHOOK_URL_PATTERN },
        default: None,
        required: true,
    },
    SettingDef { key: TIMEZONE, kind: Kind::Select(SelectValues::TimeZones), default: Some("UTC"), required: false },
    SettingDef {
        key: PARENT_CATEGORY_MODE,
        kind: Kind::Select(SelectValues::Modes),
        default: Some("Disabled"),
        required: false,
    },
    SettingDef {
        key: PARENT_CATEGORY_NAME,
        kind: Kind::Select(SelectValues::RootCategories),
        default: None,
        required: false,
    },
    SettingDef { key: MAX_ANNOUNCE_AGE, kind: Kind::Spinner, default: Some("7"), required: false },
];

/// Names of all known settings, in display order.
pub fn keys() -> impl Iterator<Item = &'static str> {
    SCHEMA.iter().map(|s| s.key)
}

fn lookup_def(key: &str) -> Option<&'static SettingDef> {
    SCHEMA.iter().find(|s| s.key == key)
}

/// Apply defaults to stored values. Returns `None` if a required setting is
/// empty. Values that fail to parse fall back to their default.
pub fn resolve(raw: &HashMap<String, String>) -> Option<NotificationConfig> {
    let mut values: HashMap<&'static str, String> = HashMap::new();
    for def in SCHEMA.iter() {
        let stored = raw.get(def.key).map(|v| v.trim()).filter(|v| !v.is_empty());
        match (stored, def.default) {
            (Some(v), _) => {
                values.insert(def.key, v.to_string());
            }
            (None, Some(d)) => {
                values.insert(def.key, d.to_string());
            }
            (None, None) if def.required => return None,
            (None, None) => {}
        }
    }

    let timezone = values
        .get(TIMEZONE)
        .and_then(|tz| match tz.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(timezone = %tz, "unknown time zone; using UTC");
                None
            }
        })
        .unwrap_or(Tz::UTC);
    let parent_category_mode = values
        .get(PARENT_CATEGORY_MODE)
        .and_then(|m| ParentCategoryMode::parse_mode(m))
        .unwrap_or_default();
    let max_announce_age_days = values
        .get(MAX_ANNOUNCE_AGE)
        .filter(|v| POSITIVE_INT_RE.is_match(v))
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(7);

    Some(NotificationConfig {
        webhook_url: values.remove(WEBHOOK_URL)?,
        timezone,
        parent_category_mode,
        parent_category_name: values.remove(PARENT_CATEGORY_NAME),
        max_announce_age_days,
    })
}

/// Validate operator-supplied settings before they are saved.
///
/// Only the submitted keys are checked and returned. `root_categories` is the
/// set of categories allowed as a parent category name.
pub fn validate_update(
    input: &HashMap<String, String>,
    root_categories: &[String],
) -> Result<BTreeMap<String, String>, SettingsError> {
    let mut accepted = BTreeMap::new();

    for (key, value) in input {
        let def = lookup_def(key).ok_or_else(|| SettingsError::UnknownKey(key.clone()))?;
        let value = value.trim();
        match def.kind {
            Kind::Text { regex, pattern } => {
                if !regex.is_match(value) {
                    return Err(SettingsError::PatternMismatch { key: def.key, pattern });
                }
            }
            Kind::Spinner => {
                if !POSITIVE_INT_RE.is_match(value) || value.parse::<u32>().is_err() {
                    return Err(SettingsError::NotPositive(def.key));
                }
            }
            Kind::Select(values) => {
                let ok = match values {
                    SelectValues::TimeZones => value.parse::<Tz>().is_ok(),
                    SelectValues::Modes => ParentCategoryMode::parse_mode(value).is_some(),
                    SelectValues::RootCategories => {
                        value.is_empty() || root_categories.iter().any(|c| c == value)
                    }
                };
                if !ok {
                    return Err(SettingsError::InvalidSelection(def.key));
                }
            }
        }
        accepted.insert(def.key.to_string(), value.to_string());
    }

    if let Some(mode) = accepted
        .get(PARENT_CATEGORY_MODE)
        .and_then(|m| ParentCategoryMode::parse_mode(m))
    {
        let has_name = accepted
            .get(PARENT_CATEGORY_NAME)
            .is_some_and(|n| !n.is_empty());
        if mode != ParentCategoryMode::Disabled && !has_name {
            return Err(SettingsError::ParentNameRequired { mode: mode.as_str() });
        }
    }

    Ok(accepted)
}
