//! Background event handling: sync tags, push messages, notification clicks.

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::notifications::{Notification, NotificationAction, NotificationData};
use crate::{SwResult, SyncError};

/// Action id that opens the content behind a notification.
pub const ACTION_EXPLORE: &str = "explore";
/// Action id that only dismisses a notification.
pub const ACTION_CLOSE: &str = "close";

// ==================== Sync ====================

/// A background sync tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncTag {
    /// Upload posts drafted while offline.
    ContentSync,
    /// Flush queued analytics events.
    AnalyticsSync,
    /// A tag this worker has no task for.
    Other(String),
}

impl SyncTag {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "content-sync" => Self::ContentSync,
            "analytics-sync" => Self::AnalyticsSync,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ContentSync => "content-sync",
            Self::AnalyticsSync => "analytics-sync",
            Self::Other(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Performs the work behind a known sync tag.
///
/// An error tells the platform to redeliver the tag later; the worker itself
/// never retries.
#[async_trait]
pub trait SyncTaskRunner: Send + Sync {
    async fn run(&self, tag: &SyncTag) -> Result<(), SyncError>;
}

/// Runner that logs the tag and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSyncRunner;

#[async_trait]
impl SyncTaskRunner for LoggingSyncRunner {
    async fn run(&self, tag: &SyncTag) -> Result<(), SyncError> {
        info!(tag = %tag, "Sync task completed");
        Ok(())
    }
}

// ==================== Push ====================

/// Fields a push message may carry. All optional.
///
/// Each field is read on its own: a field with an unexpected type is dropped
/// without discarding the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
    pub primary_key: Option<u64>,
}

impl PushPayload {
    /// Decode a push body. Missing or malformed data yields an empty payload.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(data) = data.filter(|d| !d.is_empty()) else {
            return Self::default();
        };
        let value: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Malformed push payload, using defaults");
                return Self::default();
            }
        };
        let Some(fields) = value.as_object() else {
            warn!("Push payload is not an object, using defaults");
            return Self::default();
        };

        let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            title: text("title"),
            body: text("body"),
            url: text("url"),
            primary_key: ["primaryKey", "primary_key", "id"]
                .iter()
                .find_map(|name| fields.get(*name).and_then(primary_key_of)),
        }
    }

    /// Build the notification shown for this payload.
    pub fn to_notification(&self, config: &WorkerConfig) -> Notification {
        let defaults = &config.notifications;
        Notification {
            id: Notification::next_id(),
            title: self
                .title
                .clone()
                .unwrap_or_else(|| defaults.default_title.clone()),
            body: self
                .body
                .clone()
                .unwrap_or_else(|| defaults.default_body.clone()),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            vibrate: defaults.vibrate.clone(),
            data: NotificationData {
                date_of_arrival: Utc::now().timestamp_millis(),
                primary_key: self.primary_key.unwrap_or(1),
                url: self.url.clone(),
            },
            actions: vec![
                NotificationAction::new(ACTION_EXPLORE, "View content"),
                NotificationAction::new(ACTION_CLOSE, "Close"),
            ],
        }
    }
}

/// Numeric ids, or strings holding one.
fn primary_key_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ==================== Notification clicks ====================

/// A click on a notification or one of its actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationClick {
    pub notification_id: u64,
    /// Action id; `None` for a click on the notification body.
    pub action: Option<String>,
}

impl NotificationClick {
    pub fn body(notification_id: u64) -> Self {
        Self {
            notification_id,
            action: None,
        }
    }

    pub fn action(notification_id: u64, action: impl Into<String>) -> Self {
        Self {
            notification_id,
            action: Some(action.into()),
        }
    }

    pub fn is_explore(&self) -> bool {
        self.action.as_deref() == Some(ACTION_EXPLORE)
    }
}

/// Where an `explore` click leads: the payload URL, else the configured default.
pub fn click_target(config: &WorkerConfig, data: Option<&NotificationData>) -> SwResult<Url> {
    match data.and_then(|d| d.url.as_deref()) {
        Some(url) => {
            debug!(url = %url, "Click target from payload");
            config.resolve(url)
        }
        None => config.resolve(&config.notifications.default_url),
    }
}
