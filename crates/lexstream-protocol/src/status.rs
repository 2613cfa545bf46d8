//! Status and broadcast surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

/// Per-connection bookkeeping kept by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ConnectionMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            connected_at: now,
            last_activity: now,
        }
    }

    /// Advance `last_activity`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connection_id: ConnectionId,
    pub metadata: ConnectionMetadata,
}

/// Response body of the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub active_connections: usize,
    pub connections: Vec<ConnectionStatus>,
}

impl StatusReport {
    pub fn from_connections(connections: Vec<ConnectionStatus>) -> Self {
        Self {
            active_connections: connections.len(),
            connections,
        }
    }
}

/// Request body of the broadcast command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
    #[serde(rename = "type", default = "default_broadcast_type")]
    pub kind: String,
}

fn default_broadcast_type() -> String {
    "info".to_owned()
}

/// Outcome of one broadcast. `attempted` counts every connection a send was
/// tried on, whether or not it succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    #[serde(default)]
    pub failed: Vec<ConnectionId>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    #[test]
    fn touch_never_moves_backwards() {
        let start = Utc::now();
        let mut metadata = ConnectionMetadata::new(start);
        metadata.touch(start - Duration::seconds(5));
        assert_eq!(metadata.last_activity, start);
        metadata.touch(start + Duration::seconds(5));
        assert_eq!(metadata.last_activity, start + Duration::seconds(5));
        assert_eq!(metadata.connected_at, start);
    }

    #[test]
    fn status_report_counts_connections() {
        let now = Utc::now();
        let report = StatusReport::from_connections(vec![ConnectionStatus {
            connection_id: ConnectionId::from_string("c1"),
            metadata: ConnectionMetadata::new(now),
        }]);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["active_connections"], 1);
        assert_eq!(value["connections"][0]["connection_id"], "c1");
        assert!(value["connections"][0]["metadata"]["connected_at"].is_string());
        assert!(value["connections"][0]["metadata"]["last_activity"].is_string());
    }

    #[test]
    fn broadcast_type_defaults_to_info() {
        let request: BroadcastRequest =
            serde_json::from_value(json!({ "message": "down in 5m" })).unwrap();
        assert_eq!(request.kind, "info");
    }
}
