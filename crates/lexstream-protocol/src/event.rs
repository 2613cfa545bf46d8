//! Stream event record and taxonomy.
//!
//! Every outbound frame on a query connection is one [`StreamEvent`] encoded as
//! a flat JSON object with a `"type"` tag. Fields other than `type` and
//! `timestamp` are omitted when absent; which ones are present is determined
//! by the event type.
//!
//! Forward-compatible: unknown `"type"` tags deserialize into
//! [`EventType::Custom`] instead of failing, and serialize back verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::error::ProtocolError;
use crate::ids::{CaseId, ConnectionId};
use crate::message::QueryRequest;

/// Open string-keyed payload. Values are restricted to JSON's closed set of
/// kinds (null, bool, number, string, array, object).
pub type Payload = serde_json::Map<String, Value>;

/// Greeting sent with `connection_established`.
pub const CONNECTED_MESSAGE: &str = "Connected to legal agent streaming service";
/// Text sent with `ready_for_next_query`.
pub const READY_MESSAGE: &str = "Ready for next query";

/// Event class tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventType {
    // ── Connection / query control ──
    ConnectionEstablished,
    QueryReceived,
    QueryRejected,
    ReadyForNextQuery,
    Error,
    Broadcast,

    // ── Execution envelope ──
    AgentExecutionStart,
    AgentExecutionComplete,
    AgentExecutionError,

    // ── Agent lifecycle ──
    AgentStart,
    AgentAction,
    AgentObservation,
    AgentEnd,
    ChainStart,
    ChainEnd,

    // ── Tools and LLM calls ──
    ToolStart,
    ToolEnd,
    LlmStart,
    LlmEnd,
    LlmError,

    // ── Domain pairs ──
    RagQueryStart,
    RagQueryEnd,
    ThinkingStart,
    ThinkingEnd,

    // ── Queue diagnostics ──
    EventsDropped,

    /// Any tag not known to this build.
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionEstablished => "connection_established",
            Self::QueryReceived => "query_received",
            Self::QueryRejected => "query_rejected",
            Self::ReadyForNextQuery => "ready_for_next_query",
            Self::Error => "error",
            Self::Broadcast => "broadcast",
            Self::AgentExecutionStart => "agent_execution_start",
            Self::AgentExecutionComplete => "agent_execution_complete",
            Self::AgentExecutionError => "agent_execution_error",
            Self::AgentStart => "agent_start",
            Self::AgentAction => "agent_action",
            Self::AgentObservation => "agent_observation",
            Self::AgentEnd => "agent_end",
            Self::ChainStart => "chain_start",
            Self::ChainEnd => "chain_end",
            Self::ToolStart => "tool_start",
            Self::ToolEnd => "tool_end",
            Self::LlmStart => "llm_start",
            Self::LlmEnd => "llm_end",
            Self::LlmError => "llm_error",
            Self::RagQueryStart => "rag_query_start",
            Self::RagQueryEnd => "rag_query_end",
            Self::ThinkingStart => "thinking_start",
            Self::ThinkingEnd => "thinking_end",
            Self::EventsDropped => "events_dropped",
            Self::Custom(tag) => tag,
        }
    }

    /// Parse a wire tag. Never fails: unknown tags become `Custom`.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "connection_established" => Self::ConnectionEstablished,
            "query_received" => Self::QueryReceived,
            "query_rejected" => Self::QueryRejected,
            "ready_for_next_query" => Self::ReadyForNextQuery,
            "error" => Self::Error,
            "broadcast" => Self::Broadcast,
            "agent_execution_start" => Self::AgentExecutionStart,
            "agent_execution_complete" => Self::AgentExecutionComplete,
            "agent_execution_error" => Self::AgentExecutionError,
            "agent_start" => Self::AgentStart,
            "agent_action" => Self::AgentAction,
            "agent_observation" => Self::AgentObservation,
            "agent_end" => Self::AgentEnd,
            "chain_start" => Self::ChainStart,
            "chain_end" => Self::ChainEnd,
            "tool_start" => Self::ToolStart,
            "tool_end" => Self::ToolEnd,
            "llm_start" => Self::LlmStart,
            "llm_end" => Self::LlmEnd,
            "llm_error" => Self::LlmError,
            "rag_query_start" => Self::RagQueryStart,
            "rag_query_end" => Self::RagQueryEnd,
            "thinking_start" => Self::ThinkingStart,
            "thinking_end" => Self::ThinkingEnd,
            "events_dropped" => Self::EventsDropped,
            other => Self::Custom(other.to_owned()),
        }
    }

    /// No further event follows a terminal event within the same session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AgentExecutionComplete | Self::AgentExecutionError
        )
    }

    /// Thinking-trace events, suppressed when the client did not ask for them.
    pub fn is_thinking(&self) -> bool {
        matches!(self, Self::ThinkingStart | Self::ThinkingEnd)
    }

    /// Failure classes: the execution error, LLM errors, and any `*_error` tag.
    pub fn is_error(&self) -> bool {
        match self {
            Self::AgentExecutionError | Self::LlmError | Self::Error => true,
            Self::Custom(tag) => tag.ends_with("_error"),
            _ => false,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

/// One occurrence in an agent's execution lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Seconds since UNIX epoch on the wire.
    #[serde(with = "epoch_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StreamEvent {
    /// Create an event of the given type stamped with the current time.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            agent_name: None,
            task: None,
            action: None,
            tool_name: None,
            input_data: None,
            output_data: None,
            error: None,
            metadata: None,
            connection_id: None,
            message: None,
        }
    }

    pub fn with_agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input_data = Some(input);
        self
    }

    pub fn with_output(mut self, output: Payload) -> Self {
        self.output_data = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    // ── Named constructors for events the streaming core itself produces ──

    pub fn connection_established(connection_id: ConnectionId) -> Self {
        let mut event = Self::new(EventType::ConnectionEstablished).with_message(CONNECTED_MESSAGE);
        event.connection_id = Some(connection_id);
        event
    }

    pub fn query_received(request: &QueryRequest) -> Self {
        Self::new(EventType::QueryReceived).with_input(payload(json!({
            "query": request.query,
            "case_id": request.case_id,
            "stream_thinking": request.stream_thinking,
        })))
    }

    pub fn execution_start(request: &QueryRequest) -> Self {
        Self::new(EventType::AgentExecutionStart).with_input(query_payload(
            &request.query,
            request.case_id,
        ))
    }

    pub fn execution_complete(output: Payload) -> Self {
        Self::new(EventType::AgentExecutionComplete).with_output(output)
    }

    pub fn execution_error(
        error: impl Into<String>,
        query: &str,
        case_id: Option<CaseId>,
    ) -> Self {
        Self::new(EventType::AgentExecutionError)
            .with_error(error)
            .with_metadata(query_payload(query, case_id))
    }

    pub fn validation_error(error: &ProtocolError) -> Self {
        let event = Self::new(EventType::Error).with_error(error.to_string());
        match error.field() {
            Some(field) => event.with_metadata(payload(json!({ "field": field }))),
            None => event,
        }
    }

    pub fn query_rejected(request: &QueryRequest, reason: &str, error: impl Into<String>) -> Self {
        let mut metadata = query_payload(&request.query, request.case_id);
        metadata.insert("reason".to_owned(), Value::from(reason));
        Self::new(EventType::QueryRejected)
            .with_error(error)
            .with_metadata(metadata)
    }

    pub fn ready_for_next_query() -> Self {
        Self::new(EventType::ReadyForNextQuery).with_message(READY_MESSAGE)
    }

    pub fn broadcast(message: &str, kind: &str) -> Self {
        Self::new(EventType::Broadcast)
            .with_message(message)
            .with_input(payload(json!({ "message": message, "type": kind })))
    }

    pub fn events_dropped(dropped: u64) -> Self {
        Self::new(EventType::EventsDropped)
            .with_error(format!("{dropped} events dropped: session queue overflow"))
            .with_metadata(payload(json!({ "dropped": dropped })))
    }
}

/// Build a payload from a JSON object literal. Non-object values are wrapped
/// under a `"value"` key.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".to_owned(), other);
            map
        }
    }
}

fn query_payload(query: &str, case_id: Option<CaseId>) -> Payload {
    payload(json!({ "query": query, "case_id": case_id }))
}

mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_back_to_the_same_variant() {
        for tag in [
            "connection_established",
            "agent_execution_complete",
            "rag_query_start",
            "thinking_end",
            "events_dropped",
        ] {
            assert_eq!(EventType::parse(tag).as_str(), tag);
            assert!(!matches!(EventType::parse(tag), EventType::Custom(_)));
        }
    }

    #[test]
    fn unknown_tag_becomes_custom() {
        let json = r#"{"type":"citation_verified","timestamp":1700000000.5}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, EventType::Custom("citation_verified".into()));
        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["type"], "citation_verified");
    }

    #[test]
    fn only_execution_complete_and_error_are_terminal() {
        assert!(EventType::AgentExecutionComplete.is_terminal());
        assert!(EventType::AgentExecutionError.is_terminal());
        assert!(!EventType::LlmError.is_terminal());
        assert!(!EventType::AgentEnd.is_terminal());
        assert!(!EventType::Custom("agent_execution_done".into()).is_terminal());
    }

    #[test]
    fn error_classification_covers_custom_error_tags() {
        assert!(EventType::LlmError.is_error());
        assert!(EventType::Custom("rag_query_error".into()).is_error());
        assert!(!EventType::ToolEnd.is_error());
    }

    #[test]
    fn absent_fields_are_omitted_from_the_wire() {
        let event = StreamEvent::new(EventType::ToolStart).with_tool_name("rag_search");
        let value = serde_json::to_value(&event).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object["type"], "tool_start");
        assert_eq!(object["tool_name"], "rag_search");
        assert!(object["timestamp"].is_f64());
        assert!(!object.contains_key("error"));
        assert!(!object.contains_key("input_data"));
        assert!(!object.contains_key("connection_id"));
    }

    #[test]
    fn timestamp_is_epoch_seconds() {
        let json = r#"{"type":"agent_start","timestamp":1700000000.25,"agent_name":"Legal"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(event.timestamp.timestamp_subsec_millis(), 250);
        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["timestamp"].as_f64(), Some(1_700_000_000.25));
    }

    #[test]
    fn connection_established_carries_id_and_greeting() {
        let id = ConnectionId::from_string("conn-1");
        let value = serde_json::to_value(StreamEvent::connection_established(id)).unwrap();
        assert_eq!(value["type"], "connection_established");
        assert_eq!(value["connection_id"], "conn-1");
        assert_eq!(value["message"], CONNECTED_MESSAGE);
    }

    #[test]
    fn execution_error_records_query_and_case() {
        let event = StreamEvent::execution_error("engine crashed", "who signed?", Some(7));
        assert_eq!(event.error.as_deref(), Some("engine crashed"));
        let metadata = event.metadata.unwrap();
        assert_eq!(metadata["query"], "who signed?");
        assert_eq!(metadata["case_id"], 7);
    }

    #[test]
    fn query_rejected_is_error_shaped_but_not_terminal() {
        let request = QueryRequest::new("second question");
        let event = StreamEvent::query_rejected(&request, "session_in_flight", "busy");
        assert!(!event.is_terminal());
        assert_eq!(event.error.as_deref(), Some("busy"));
        let metadata = event.metadata.unwrap();
        assert_eq!(metadata["reason"], "session_in_flight");
        assert_eq!(metadata["query"], "second question");
        assert!(metadata["case_id"].is_null());
    }

    #[test]
    fn broadcast_carries_message_and_type() {
        let value = serde_json::to_value(StreamEvent::broadcast("down in 5m", "maintenance")).unwrap();
        assert_eq!(value["type"], "broadcast");
        assert_eq!(value["message"], "down in 5m");
        assert_eq!(value["input_data"]["type"], "maintenance");
    }

    #[test]
    fn payload_wraps_scalars() {
        let wrapped = payload(json!(3));
        assert_eq!(wrapped["value"], 3);
    }
}
