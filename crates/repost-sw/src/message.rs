//! Control messages from the page.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A message the page posts to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
}

/// What the container should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    SkipWaiting,
    None,
}

impl WorkerMessage {
    /// Decode a posted JSON value.
    pub fn decode(data: &serde_json::Value) -> Option<Self> {
        match serde_json::from_value(data.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(error = %e, %data, "Ignoring unrecognized message");
                None
            }
        }
    }

    pub fn action(&self) -> ControlAction {
        match self {
            WorkerMessage::SkipWaiting => ControlAction::SkipWaiting,
        }
    }
}

/// Map a posted value to the action it requests.
pub fn control_action(data: &serde_json::Value) -> ControlAction {
    WorkerMessage::decode(data).map_or(ControlAction::None, |m| m.action())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_skip_waiting() {
        assert_eq!(
            control_action(&json!({ "type": "SKIP_WAITING" })),
            ControlAction::SkipWaiting
        );
        assert_eq!(
            serde_json::to_value(WorkerMessage::SkipWaiting).unwrap(),
            json!({ "type": "SKIP_WAITING" })
        );
    }

    #[test]
    fn test_unknown_messages_do_nothing() {
        for data in [
            json!({ "type": "CLAIM" }),
            json!({ "kind": "SKIP_WAITING" }),
            json!("SKIP_WAITING"),
            json!(null),
        ] {
            assert_eq!(control_action(&data), ControlAction::None, "{data}");
        }
    }
}
