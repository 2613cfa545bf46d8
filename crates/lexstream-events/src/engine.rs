//! Boundary to the agent execution engine.
//!
//! The engine's retrieval and reasoning are opaque here. It receives the query,
//! a sink to report lifecycle events into, and a cancellation token; it returns
//! the final answer or fails.

use anyhow::Result;
use async_trait::async_trait;
use lexstream_protocol::{CaseId, Payload, QueryRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::sink::EventSink;

/// Retrieved excerpts are cut to this many characters.
pub const CITATION_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub query: String,
    pub case_id: Option<CaseId>,
    pub stream_thinking: bool,
}

impl AgentRequest {
    /// The text handed to the agent. Case-scoped queries are prefixed with
    /// `[CASE <id>]`.
    pub fn prompt(&self) -> String {
        match self.case_id {
            Some(case_id) => format!("[CASE {case_id}] {}", self.query),
            None => self.query.clone(),
        }
    }
}

impl From<&QueryRequest> for AgentRequest {
    fn from(request: &QueryRequest) -> Self {
        Self {
            query: request.query.clone(),
            case_id: request.case_id,
            stream_thinking: request.stream_thinking,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub text: String,
}

impl Citation {
    pub fn new(source: impl Into<String>, text: &str) -> Self {
        Self {
            source: source.into(),
            text: text.chars().take(CITATION_EXCERPT_CHARS).collect(),
        }
    }
}

/// What a successful invocation returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub retrieved_chunks: usize,
    #[serde(default)]
    pub case_id_filter: Option<CaseId>,
}

impl AgentOutcome {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..Self::default()
        }
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.retrieved_chunks = self.retrieved_chunks.max(citations.len());
        self.citations = citations;
        self
    }

    pub fn with_case_filter(mut self, case_id: Option<CaseId>) -> Self {
        self.case_id_filter = case_id;
        self
    }

    /// `output_data` of the synthesized `agent_execution_complete` event.
    pub fn to_output(&self) -> Payload {
        let mut output = Payload::new();
        output.insert("answer".to_owned(), Value::from(self.answer.clone()));
        output.insert(
            "citations".to_owned(),
            serde_json::to_value(&self.citations).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        output.insert(
            "retrieved_chunks".to_owned(),
            Value::from(self.retrieved_chunks as u64),
        );
        output.insert(
            "case_id_filter".to_owned(),
            self.case_id_filter.map_or(Value::Null, Value::from),
        );
        output
    }
}

/// An agent execution engine.
///
/// Implementations push lifecycle events into `events` as they occur. They may
/// push their own `agent_execution_complete`/`agent_execution_error`; if they
/// do not, the session synthesizes one from the returned result. `cancel` fires
/// when the requesting client has gone; the invocation future may also be
/// dropped at any await point.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        request: AgentRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome>;
}
