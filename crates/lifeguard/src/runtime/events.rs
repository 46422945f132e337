//! Lifecycle status events published to subscribers

use crate::runtime::supervisor::ServiceState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default capacity of the event broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A single state transition of a service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub name: String,
    pub old_state: ServiceState,
    pub new_state: ServiceState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn new(
        name: impl Into<String>,
        old_state: ServiceState,
        new_state: ServiceState,
        error: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            old_state,
            new_state,
            timestamp: Utc::now(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = StatusEvent::new(
            "db",
            ServiceState::Starting,
            ServiceState::Failed,
            Some("readiness timed out".to_string()),
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["name"], "db");
        assert_eq!(json["oldState"], "starting");
        assert_eq!(json["newState"], "failed");
        assert_eq!(json["error"], "readiness timed out");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_error_omitted_when_absent() {
        let event = StatusEvent::new("api", ServiceState::Stopped, ServiceState::Starting, None);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("error").is_none());
    }
}
