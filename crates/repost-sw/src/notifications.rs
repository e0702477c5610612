//! Notifications shown on behalf of the worker.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl NotificationAction {
    pub fn new(action: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            title: title.into(),
            icon: None,
        }
    }
}

/// Data attached to a notification and handed back on click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Milliseconds since the Unix epoch when the push arrived.
    pub date_of_arrival: i64,
    pub primary_key: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A shown notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    /// Allocate a fresh notification id.
    pub fn next_id() -> u64 {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.action == action)
    }
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: HashMap<u64, Notification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notification, replacing one with the same id.
    pub fn show(&mut self, notification: Notification) {
        debug!(id = notification.id, title = %notification.title, "Showing notification");
        self.shown.insert(notification.id, notification);
    }

    /// Dismiss a notification. Returns it if it was shown.
    pub fn close(&mut self, id: u64) -> Option<Notification> {
        self.shown.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// All shown notifications, oldest first.
    pub fn all(&self) -> Vec<&Notification> {
        let mut all: Vec<&Notification> = self.shown.values().collect();
        all.sort_by_key(|n| n.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(title: &str) -> Notification {
        Notification {
            id: Notification::next_id(),
            title: title.to_string(),
            body: String::new(),
            icon: "/icon-192.png".to_string(),
            badge: "/icon-192.png".to_string(),
            vibrate: vec![100, 50, 100],
            data: NotificationData {
                date_of_arrival: 0,
                primary_key: 1,
                url: None,
            },
            actions: vec![NotificationAction::new("close", "Close")],
        }
    }

    #[test]
    fn test_show_and_close() {
        let mut notifications = Notifications::new();
        let first = notification("first");
        let second = notification("second");
        let (first_id, second_id) = (first.id, second.id);

        notifications.show(second);
        notifications.show(first);
        let titles: Vec<&str> = notifications.all().iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second"]);

        assert_eq!(notifications.close(first_id).unwrap().title, "first");
        assert!(notifications.close(first_id).is_none());
        assert!(notifications.get(second_id).is_some());
    }

    #[test]
    fn test_serialized_data_omits_missing_url() {
        let value = serde_json::to_value(notification("x").data).unwrap();
        assert!(value.get("url").is_none());
        assert_eq!(value["primary_key"], 1);
    }
}
