//! Human-readable rendering of stream events.

use chrono::Local;
use indexmap::IndexMap;
use lexstream_protocol::{EventType, Payload, StreamEvent};
use serde_json::Value;

const DETAIL_CHARS: usize = 100;
const ANSWER_CHARS: usize = 200;

fn icon(event_type: &EventType) -> &'static str {
    match event_type {
        EventType::ConnectionEstablished => "🔌",
        EventType::QueryReceived => "📨",
        EventType::AgentExecutionStart => "🚀",
        EventType::AgentExecutionComplete => "✅",
        EventType::AgentExecutionError | EventType::Error | EventType::LlmError => "❌",
        EventType::QueryRejected => "⛔",
        EventType::AgentStart | EventType::AgentEnd => "🟢",
        EventType::AgentAction => "🔵",
        EventType::AgentObservation => "👁",
        EventType::ToolStart => "🟡",
        EventType::ToolEnd => "🟠",
        EventType::LlmStart | EventType::LlmEnd => "🟣",
        EventType::RagQueryStart => "🔍",
        EventType::RagQueryEnd => "📄",
        EventType::ThinkingStart => "🧠",
        EventType::ThinkingEnd => "💭",
        EventType::Broadcast => "📢",
        EventType::EventsDropped => "⚠️",
        EventType::ReadyForNextQuery => "⏭",
        _ => "📝",
    }
}

/// Truncate to `max` characters, marking the cut.
pub fn excerpt(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn field<'a>(data: Option<&'a Payload>, key: &str) -> Option<&'a Value> {
    data?.get(key)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Header line plus indented detail lines for one event.
pub fn describe(event: &StreamEvent) -> Vec<String> {
    let time = event.timestamp.with_timezone(&Local).format("%H:%M:%S");
    let mut lines = vec![format!(
        "{} [{time}] {}",
        icon(&event.event_type),
        event.event_type
    )];
    let mut detail = |label: &str, value: String| lines.push(format!("   {label}: {value}"));

    match &event.event_type {
        EventType::ConnectionEstablished => {
            if let Some(id) = &event.connection_id {
                detail("Connection", id.to_string());
            }
        }
        EventType::AgentStart => {
            detail("Agent", event.agent_name.clone().unwrap_or_default());
            detail("Task", excerpt(event.task.as_deref().unwrap_or_default(), DETAIL_CHARS));
        }
        EventType::AgentAction => {
            detail("Agent", event.agent_name.clone().unwrap_or_default());
            detail("Action", event.action.clone().unwrap_or_default());
        }
        EventType::ToolStart | EventType::ToolEnd => {
            detail("Tool", event.tool_name.clone().unwrap_or_default());
            let value = field(event.input_data.as_ref(), "input")
                .or_else(|| field(event.output_data.as_ref(), "output"));
            if let Some(value) = value {
                detail("Data", excerpt(&text_of(value), DETAIL_CHARS));
            }
        }
        EventType::LlmEnd => {
            if let Some(response) = field(event.output_data.as_ref(), "response") {
                detail("Response", excerpt(&text_of(response), DETAIL_CHARS));
            }
        }
        EventType::RagQueryEnd => {
            if let Some(chunks) = field(event.output_data.as_ref(), "retrieved_chunks") {
                detail("Retrieved chunks", text_of(chunks));
            }
        }
        EventType::AgentExecutionComplete => {
            let output = event.output_data.as_ref();
            let answer = field(output, "answer").map(text_of).unwrap_or_default();
            detail("Answer", excerpt(&answer, ANSWER_CHARS));
            let citations = field(output, "citations")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            detail("Citations", citations.to_string());
        }
        EventType::Broadcast | EventType::ReadyForNextQuery => {
            if let Some(message) = &event.message {
                detail("Message", message.clone());
            }
        }
        _ => {
            if let Some(error) = &event.error {
                detail("Error", error.clone());
            }
        }
    }
    lines
}

/// Per-type event counts, in first-seen order.
#[derive(Debug, Default)]
pub struct Tally {
    counts: IndexMap<String, usize>,
    total: usize,
}

impl Tally {
    pub fn record(&mut self, event: &StreamEvent) {
        *self.counts.entry(event.event_type.to_string()).or_default() += 1;
        self.total += 1;
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.counts.get(event_type).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!("Total events received: {}", self.total)];
        lines.extend(
            self.counts
                .iter()
                .map(|(event_type, count)| format!("  {event_type}: {count}")),
        );
        lines
    }
}
